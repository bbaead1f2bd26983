//! Swap table: a bitmap over fixed-size slots of a `Swap`-role block
//! device, each slot holding exactly one page, the Pintos-style
//! counterpart to the free-sector bitmap with pages instead of
//! sectors as the allocation unit.

use std::sync::{Arc, Mutex};

use crate::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::device::BlockDevice;

pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    bitmap: Mutex<Vec<u8>>,
    slot_count: u32,
}

impl SwapTable {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = device.sector_count() / SECTORS_PER_PAGE as u32;
        let bytes = ((slot_count as usize) + 7) / 8;
        Self {
            device,
            bitmap: Mutex::new(vec![0u8; bytes]),
            slot_count,
        }
    }

    fn bit(buf: &[u8], i: u32) -> bool {
        buf[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    fn set_bit(buf: &mut [u8], i: u32, value: bool) {
        let byte = &mut buf[(i / 8) as usize];
        let mask = 1u8 << (i % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    /// Picks the lowest free slot, writes `page` as
    /// [`SECTORS_PER_PAGE`] consecutive sectors, marks it occupied, and
    /// returns the slot index. Exhaustion is fatal: a full swap device
    /// mid-eviction is not a condition callers are expected to recover
    /// from.
    pub fn store(&self, page: &[u8; PAGE_SIZE]) -> u32 {
        let mut bitmap = self.bitmap.lock().unwrap();
        for slot in 0..self.slot_count {
            if !Self::bit(&bitmap, slot) {
                Self::set_bit(&mut bitmap, slot, true);
                drop(bitmap);
                self.write_slot(slot, page);
                return slot;
            }
        }
        crate::bug!("swap table exhausted: no free slot for a {} byte page", PAGE_SIZE);
    }

    /// Reads `slot` back into `out` and clears its bit. Passing `None`
    /// for `out` just releases the slot without reading it.
    pub fn load(&self, slot: u32, out: Option<&mut [u8; PAGE_SIZE]>) {
        if let Some(out) = out {
            self.read_slot(slot, out);
        }
        let mut bitmap = self.bitmap.lock().unwrap();
        if !Self::bit(&bitmap, slot) {
            crate::bug!("loading swap slot {slot} that was never stored");
        }
        Self::set_bit(&mut bitmap, slot, false);
    }

    fn write_slot(&self, slot: u32, page: &[u8; PAGE_SIZE]) {
        let base = slot * SECTORS_PER_PAGE as u32;
        for i in 0..SECTORS_PER_PAGE {
            let mut chunk = [0u8; SECTOR_SIZE];
            chunk.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device.write(base + i as u32, &chunk);
        }
    }

    fn read_slot(&self, slot: u32, page: &mut [u8; PAGE_SIZE]) {
        let base = slot * SECTORS_PER_PAGE as u32;
        for i in 0..SECTORS_PER_PAGE {
            let mut chunk = [0u8; SECTOR_SIZE];
            self.device.read(base + i as u32, &mut chunk);
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, MemBlockDevice};

    fn fixture(slots: u32) -> SwapTable {
        let dev = Arc::new(MemBlockDevice::new(
            "swap",
            DeviceKind::Swap,
            slots * SECTORS_PER_PAGE as u32,
        ));
        SwapTable::new(dev)
    }

    #[test]
    fn store_then_load_round_trips() {
        let swap = fixture(4);
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        let slot = swap.store(&page);
        let mut out = [0u8; PAGE_SIZE];
        swap.load(slot, Some(&mut out));
        assert_eq!(page, out);
    }

    #[test]
    fn released_slot_is_reused() {
        let swap = fixture(1);
        let page = [7u8; PAGE_SIZE];
        let slot = swap.store(&page);
        swap.load(slot, None);
        let slot2 = swap.store(&page);
        assert_eq!(slot, slot2);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn exhaustion_is_fatal() {
        let swap = fixture(1);
        let page = [0u8; PAGE_SIZE];
        swap.store(&page);
        swap.store(&page);
    }
}
