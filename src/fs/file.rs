//! Open-file handles: a cursor over an [`Inode`] plus the deny-write
//! toggle a running executable uses on its own image, grounded on the
//! teacher's `file.rs` `Inode`-backed file variant and its
//! `readi`/`writei` cursor-based read/write functions, supplemented
//! with the `tell`/`seek`/`length` accessors a Pintos-style file handle
//! exposes.

use std::sync::Arc;

use crate::cache::SectorCache;
use crate::freemap::FreeMap;
use crate::fs::inode::{Inode, InodeTable};

/// One open instance of a file. Multiple `File`s may wrap the same
/// underlying [`Inode`]; each tracks its own cursor independently, the
/// same way two file descriptors pointing at one inode do in a
/// POSIX-like system.
pub struct File {
    inode: Arc<Inode>,
    pos: usize,
    deny_write: bool,
}

impl File {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self { inode, pos: 0, deny_write: false }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn length(&self, cache: &SectorCache) -> usize {
        self.inode.length(cache)
    }

    /// Reads from the current cursor, advancing it by the number of
    /// bytes actually read.
    pub fn read(&mut self, cache: &SectorCache, freemap: &FreeMap<'_>, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(cache, freemap, buf, self.pos);
        self.pos += n;
        n
    }

    /// Writes at the current cursor, advancing it by the number of
    /// bytes actually written. Returns `0` without advancing if writes
    /// are currently denied (e.g. this file backs a running executable).
    pub fn write(
        &mut self,
        cache: &SectorCache,
        freemap: &FreeMap<'_>,
        buf: &[u8],
    ) -> crate::error::Result<usize> {
        let n = self.inode.write_at(cache, freemap, buf, self.pos)?;
        self.pos += n;
        Ok(n)
    }

    /// Disallows writes to the backing inode for as long as an
    /// executable image is mapped from it. Nested calls stack;
    /// `allow_write` must be called once per `deny_write`.
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.inode.deny_write();
            self.deny_write = true;
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.inode.allow_write();
            self.deny_write = false;
        }
    }

    pub fn close(self, table: &InodeTable, cache: &SectorCache, freemap: &FreeMap<'_>) {
        if self.deny_write {
            self.inode.allow_write();
        }
        table.close(&self.inode, cache, freemap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{DeviceKind, MemBlockDevice};
    use crate::freemap::bitmap_byte_len;
    use crate::fs::inode::InodeTable;

    fn fixture() -> (Arc<SectorCache>, u32) {
        let sectors = 64u32;
        let dev = Arc::new(MemBlockDevice::new("test", DeviceKind::Filesys, sectors));
        let bytes = bitmap_byte_len(sectors);
        let fm_sectors = 1..(1 + ((bytes + 511) / 512) as u32);
        let cache = SectorCache::new(dev, &Config::default(), fm_sectors.clone(), bytes);
        FreeMap::new(&cache, sectors).reserve(fm_sectors.end);
        (cache, sectors)
    }

    #[test]
    fn write_then_read_advances_cursor() {
        let (cache, sectors) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let table = InodeTable::new();
        let inode = table.open(10);
        inode.format(&cache, 0);
        let mut f = File::new(inode);
        let written = f.write(&cache, &freemap, b"hello").unwrap();
        assert_eq!(written, 5);
        assert_eq!(f.tell(), 5);
        f.seek(0);
        let mut buf = [0u8; 5];
        let n = f.read(&cache, &freemap, &mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        cache.shutdown();
    }

    #[test]
    fn deny_write_blocks_writes() {
        let (cache, sectors) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let table = InodeTable::new();
        let inode = table.open(11);
        inode.format(&cache, 0);
        let mut f = File::new(inode);
        f.deny_write();
        let n = f.write(&cache, &freemap, b"nope").unwrap();
        assert_eq!(n, 0);
        f.allow_write();
        let n = f.write(&cache, &freemap, b"yes").unwrap();
        assert_eq!(n, 3);
        cache.shutdown();
    }
}
