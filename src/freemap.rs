//! Free-sector bitmap allocator, grounded on `kalloc.rs`'s free-list
//! allocator but backed by an on-disk bitmap instead of an in-memory
//! list, per Pintos-style filesystems.
//!
//! One bit per sector of the file-system device. Bit 0 is reserved for
//! the root inode; the next `ceil(bitmap_bytes / SECTOR_SIZE)` bits are
//! reserved for the bitmap itself. All mutation goes through the cache's
//! dedicated free-map buffer (`acquire_freemap`/`release_freemap`), which
//! sits outside the slot-counted region the clock hand sweeps.

use crate::cache::SectorCache;
use crate::error::{Error, Result};

/// Number of bytes needed to hold one bit per sector of a `sector_count`
/// sector device.
pub fn bitmap_byte_len(sector_count: u32) -> usize {
    ((sector_count as usize) + 7) / 8
}

pub struct FreeMap<'a> {
    cache: &'a SectorCache,
    sector_count: u32,
}

impl<'a> FreeMap<'a> {
    pub fn new(cache: &'a SectorCache, sector_count: u32) -> Self {
        Self { cache, sector_count }
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

    /// Marks the reserved region (root inode sector plus the bitmap's
    /// own sectors) as allocated. Called once at format time.
    pub fn reserve(&self, count: u32) {
        let mut buf = self.cache.acquire_freemap();
        for i in 0..count {
            Self::set_bit(&mut buf, i, true);
        }
        self.cache.release_freemap(buf);
    }

    /// Finds the lowest clear bit, sets it, and returns its index.
    pub fn get(&self) -> Result<u32> {
        let mut buf = self.cache.acquire_freemap();
        for i in 0..self.sector_count {
            if !Self::bit(&buf, i) {
                Self::set_bit(&mut buf, i, true);
                self.cache.release_freemap(buf);
                return Ok(i);
            }
        }
        self.cache.release_freemap(buf);
        Err(Error::NoSpace)
    }

    /// Finds `count` consecutive clear bits and sets them all, returning
    /// the first index of the run.
    pub fn allocate(&self, count: u32) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        let mut buf = self.cache.acquire_freemap();
        let mut run_start = None;
        let mut run_len = 0u32;
        for i in 0..self.sector_count {
            if !Self::bit(&buf, i) {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for j in start..start + count {
                        Self::set_bit(&mut buf, j, true);
                    }
                    self.cache.release_freemap(buf);
                    return Ok(start);
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }
        self.cache.release_freemap(buf);
        Err(Error::NoSpace)
    }

    /// Releases `count` sectors starting at `start`. Every bit in the
    /// range must already be set; violating that is a corruption bug,
    /// not a user-recoverable error.
    pub fn release(&self, start: u32, count: u32) {
        let mut buf = self.cache.acquire_freemap();
        for i in start..start + count {
            if !Self::bit(&buf, i) {
                crate::bug!("freeing already-free sector {i}");
            }
            Self::set_bit(&mut buf, i, false);
        }
        self.cache.release_freemap(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{DeviceKind, MemBlockDevice};
    use std::sync::Arc;

    fn fixture(sectors: u32) -> (Arc<SectorCache>, u32) {
        let dev = Arc::new(MemBlockDevice::new("test", DeviceKind::Filesys, sectors));
        let bytes = bitmap_byte_len(sectors);
        let fm_sectors = 1..(1 + ((bytes + 511) / 512) as u32);
        let cache = SectorCache::new(dev, &Config::default(), fm_sectors, bytes);
        (cache, sectors)
    }

    #[test]
    fn allocate_then_release_round_trips() {
        let (cache, sectors) = fixture(64);
        let fm = FreeMap::new(&cache, sectors);
        let start = fm.allocate(4).unwrap();
        fm.release(start, 4);
        // The same run should be available again.
        let start2 = fm.allocate(4).unwrap();
        assert_eq!(start, start2);
        cache.shutdown();
    }

    #[test]
    fn exhaustion_returns_no_space() {
        let (cache, sectors) = fixture(8);
        let fm = FreeMap::new(&cache, sectors);
        assert!(fm.allocate(9).is_err());
        cache.shutdown();
    }

    #[test]
    fn get_returns_lowest_free_bit() {
        let (cache, sectors) = fixture(8);
        let fm = FreeMap::new(&cache, sectors);
        let a = fm.get().unwrap();
        let b = fm.get().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        cache.shutdown();
    }
}
