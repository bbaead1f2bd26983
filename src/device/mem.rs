//! In-memory [`BlockDevice`] used by this crate's own tests and available
//! to embedders who want to exercise the file system / VM layers without a
//! real disk image.

use std::sync::Mutex;

use super::{BlockDevice, DeviceKind};
use crate::config::SECTOR_SIZE;

pub struct MemBlockDevice {
    name: String,
    kind: DeviceKind,
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemBlockDevice {
    pub fn new(name: impl Into<String>, kind: DeviceKind, sector_count: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector as usize].copy_from_slice(buf);
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let dev = MemBlockDevice::new("test0", DeviceKind::Filesys, 4);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 7;
        buf[511] = 9;
        dev.write(2, &buf);
        let mut out = [0u8; SECTOR_SIZE];
        dev.read(2, &mut out);
        assert_eq!(buf, out);
    }

    #[test]
    fn fresh_sectors_are_zeroed() {
        let dev = MemBlockDevice::new("test0", DeviceKind::Filesys, 4);
        let mut out = [1u8; SECTOR_SIZE];
        dev.read(0, &mut out);
        assert_eq!(out, [0u8; SECTOR_SIZE]);
    }
}
