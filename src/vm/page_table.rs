//! Supplemental page table: per-process map from page-aligned virtual
//! address to a mapping record, the Pintos-style side table a
//! page-fault handler consults instead of raw page table entries.
//!
//! The real hardware page table and the fault handler that drives
//! `load_page`/`evict_page` are outside this crate's scope; a
//! [`Mapping`]'s `accessed`/`dirty` bits stand in for what a fault
//! handler would otherwise read off the MMU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;

use crate::cache::SectorCache;
use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::freemap::FreeMap;
use crate::fs::inode::Inode;
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapTable;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u8 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const HASFILE    = 1 << 2;
        const FWRITE     = 1 << 3;
        const MAP_START  = 1 << 4;
        const ORPHANED   = 1 << 5;
        const SWAPPED    = 1 << 6;
        const ISSTACK    = 1 << 7;
    }
}

enum Payload {
    Anonymous,
    File {
        inode: Arc<Inode>,
        cache: Arc<SectorCache>,
        sector_count: u32,
        offset: u32,
        size: u32,
    },
    Swap {
        slot: u32,
    },
}

struct MappingState {
    flags: MappingFlags,
    frame: Option<usize>,
    payload: Payload,
}

/// One page-aligned virtual address's mapping record.
pub struct Mapping {
    addr: usize,
    owner: Weak<PageTable>,
    state: Mutex<MappingState>,
    accessed: AtomicBool,
    dirty: AtomicBool,
}

impl Mapping {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub(crate) fn owner_page_table(&self) -> Option<Arc<PageTable>> {
        self.owner.upgrade()
    }

    /// Marks the page as touched/written, the way a fault handler would
    /// after consulting the hardware accessed/dirty bits.
    pub fn mark_accessed(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn try_reset_accessed(&self) -> bool {
        self.accessed.swap(false, Ordering::AcqRel)
    }
}

/// Per-process supplemental page table.
pub struct PageTable {
    table: Mutex<HashMap<usize, Arc<Mapping>>>,
}

impl PageTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { table: Mutex::new(HashMap::new()) })
    }

    fn get(&self, addr: usize) -> Option<Arc<Mapping>> {
        self.table.lock().unwrap().get(&addr).cloned()
    }

    /// Installs a fresh anonymous mapping at `addr`. The record must
    /// not already exist.
    pub fn set_page(self: &Arc<Self>, addr: usize, flags: MappingFlags, is_stack: bool) -> Result<()> {
        self.insert(addr, flags, is_stack, Payload::Anonymous)
    }

    /// Installs a file-backed mapping at `addr`, read lazily by
    /// [`PageTable::load_page`] from `inode` starting at
    /// `offset * PAGE_SIZE`, for `size` bytes (zero-padded beyond
    /// that).
    pub fn set_file_page(
        self: &Arc<Self>,
        addr: usize,
        flags: MappingFlags,
        inode: Arc<Inode>,
        cache: Arc<SectorCache>,
        sector_count: u32,
        offset: u32,
        size: u32,
    ) -> Result<()> {
        self.insert(
            addr,
            flags | MappingFlags::HASFILE,
            false,
            Payload::File { inode, cache, sector_count, offset, size },
        )
    }

    fn insert(self: &Arc<Self>, addr: usize, flags: MappingFlags, is_stack: bool, payload: Payload) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        if table.contains_key(&addr) {
            crate::bug!("set_page: mapping already exists for {addr:#x}");
        }
        let mut flags = flags & !MappingFlags::PRESENT;
        if is_stack {
            flags |= MappingFlags::ISSTACK;
        }
        let mapping = Arc::new(Mapping {
            addr,
            owner: Arc::downgrade(self),
            state: Mutex::new(MappingState { flags, frame: None, payload }),
            accessed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        });
        table.insert(addr, mapping);
        Ok(())
    }

    /// Materializes `addr`'s page into a fresh pinned frame: file-backed
    /// mappings are read from their backing inode, swapped-out mappings
    /// are read back from swap, and anything else is a zero-filled
    /// anonymous page.
    pub fn load_page(&self, addr: usize, frames: &FrameTable, swap: &SwapTable) -> Result<usize> {
        let mapping = self.get(addr).ok_or(Error::NotFound)?;
        let frame_idx = frames.get_frame(swap);

        let mut state = mapping.state.lock().unwrap();
        let mut became_anonymous = false;
        {
            let mut buf = frames.data(frame_idx);
            match &state.payload {
                Payload::File { inode, cache, sector_count, offset, size } => {
                    let freemap = FreeMap::new(cache, *sector_count);
                    buf.fill(0);
                    let byte_offset = *offset as usize * PAGE_SIZE;
                    let n = (*size as usize).min(PAGE_SIZE);
                    inode.read_at(cache, &freemap, &mut buf[..n], byte_offset);
                }
                Payload::Swap { slot } => {
                    swap.load(*slot, Some(&mut buf));
                    became_anonymous = true;
                }
                Payload::Anonymous => {
                    buf.fill(0);
                }
            }
        }
        if became_anonymous {
            state.payload = Payload::Anonymous;
        }
        state.frame = Some(frame_idx);
        state.flags.insert(MappingFlags::PRESENT);
        state.flags.remove(MappingFlags::SWAPPED);
        drop(state);

        frames.install(frame_idx, mapping);
        Ok(frame_idx)
    }

    /// Called by the frame table when `mapping` is chosen as an
    /// eviction victim. Clears its `present` bit; if the page was never
    /// dirtied and is not already swap-backed, the frame is simply
    /// released. Otherwise the content is written back to its file (if
    /// `fwrite`) or to swap: a dirty file-backed page without `fwrite`
    /// is promoted to swap-backed rather than corrupting its file.
    pub(crate) fn evict_page(&self, mapping: &Arc<Mapping>, frames: &FrameTable, swap: &SwapTable) {
        let mut state = mapping.state.lock().unwrap();
        let frame_idx = match state.frame.take() {
            Some(f) => f,
            None => return,
        };
        state.flags.remove(MappingFlags::PRESENT);
        let dirty = mapping.dirty.swap(false, Ordering::AcqRel);

        if !dirty && !state.flags.contains(MappingFlags::SWAPPED) {
            drop(state);
            return;
        }

        let buf = frames.data(frame_idx);
        if state.flags.contains(MappingFlags::HASFILE) && state.flags.contains(MappingFlags::FWRITE) {
            if let Payload::File { inode, cache, sector_count, offset, size } = &state.payload {
                let freemap = FreeMap::new(cache, *sector_count);
                let byte_offset = *offset as usize * PAGE_SIZE;
                let n = (*size as usize).min(PAGE_SIZE);
                let _ = inode.write_at(cache, &freemap, &buf[..n], byte_offset);
            }
        } else {
            let slot = swap.store(&buf);
            drop(buf);
            state.payload = Payload::Swap { slot };
            state.flags.insert(MappingFlags::SWAPPED);
            state.flags.remove(MappingFlags::HASFILE | MappingFlags::FWRITE);
        }
        drop(state);

        if mapping.state.lock().unwrap().flags.contains(MappingFlags::ORPHANED) {
            self.table.lock().unwrap().remove(&mapping.addr);
        }
    }

    /// Removes `addr`'s mapping, flushing it to its file first if it is
    /// dirty and file-writable. If the mapping is currently resident and
    /// pinned elsewhere, it is instead marked orphaned and freed the
    /// next time the frame table evicts it.
    pub fn clear_page(&self, addr: usize, frames: &FrameTable, swap: &SwapTable) {
        let mapping = match self.get(addr) {
            Some(m) => m,
            None => return,
        };
        let frame_idx = mapping.state.lock().unwrap().frame;
        if let Some(frame_idx) = frame_idx {
            if frames.try_pin(frame_idx) {
                self.evict_page(&mapping, frames, swap);
                frames.empty(frame_idx);
                frames.unpin(frame_idx);
                self.table.lock().unwrap().remove(&addr);
                return;
            }
        }
        mapping.state.lock().unwrap().flags.insert(MappingFlags::ORPHANED);
    }

    pub fn reset_accessed(&self, addr: usize) -> bool {
        self.get(addr)
            .map(|m| m.accessed.swap(false, Ordering::AcqRel))
            .unwrap_or(false)
    }

    pub fn try_reset_accessed(&self, addr: usize) -> Option<bool> {
        self.get(addr).map(|m| m.try_reset_accessed())
    }

    /// Ensures every page in `[start, end)` is resident and pinned, for
    /// the duration of kernel I/O performed on a user's behalf.
    pub fn pin_pages(&self, start: usize, end: usize, frames: &FrameTable, swap: &SwapTable) -> Result<Vec<usize>> {
        let mut pinned = Vec::new();
        for addr in (start..end).step_by(PAGE_SIZE) {
            let mapping = self.get(addr).ok_or(Error::NotFound)?;
            let frame_idx = {
                let state = mapping.state.lock().unwrap();
                state.frame
            };
            let frame_idx = match frame_idx {
                Some(f) if frames.try_pin(f) => f,
                Some(_) | None => self.load_page(addr, frames, swap)?,
            };
            pinned.push(frame_idx);
        }
        Ok(pinned)
    }

    pub fn unpin_pages(&self, frames: &FrameTable, frame_indices: &[usize]) {
        for &idx in frame_indices {
            frames.unpin(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, MemBlockDevice};

    fn swap_fixture() -> SwapTable {
        let dev = Arc::new(MemBlockDevice::new(
            "swap",
            DeviceKind::Swap,
            4 * crate::config::SECTORS_PER_PAGE as u32,
        ));
        SwapTable::new(dev)
    }

    #[test]
    fn anonymous_page_loads_zero_filled() {
        let pt = PageTable::new();
        let frames = FrameTable::new(2);
        let swap = swap_fixture();
        pt.set_page(0x1000, MappingFlags::WRITABLE, false).unwrap();
        let frame = pt.load_page(0x1000, &frames, &swap).unwrap();
        assert!(frames.data(frame).iter().all(|&b| b == 0));
    }

    #[test]
    fn eviction_promotes_dirty_readonly_file_page_to_swap() {
        let pt = PageTable::new();
        let frames = FrameTable::new(1);
        let swap = swap_fixture();
        let dev = Arc::new(MemBlockDevice::new("fs", DeviceKind::Filesys, 64));
        let bytes = crate::freemap::bitmap_byte_len(64);
        let cache = SectorCache::new(dev, &crate::config::Config::default(), 1..2, bytes);
        FreeMap::new(&cache, 64).reserve(2);
        let table = crate::fs::inode::InodeTable::new();
        let inode = table.open(2);
        inode.format(&cache, 0);

        pt.set_file_page(0x2000, MappingFlags::empty(), Arc::clone(&inode), Arc::clone(&cache), 64, 0, 4096)
            .unwrap();
        let frame = pt.load_page(0x2000, &frames, &swap).unwrap();
        let mapping = pt.get(0x2000).unwrap();
        mapping.mark_dirty();

        pt.evict_page(&mapping, &frames, &swap);
        let state = mapping.state.lock().unwrap();
        assert!(state.flags.contains(MappingFlags::SWAPPED));
        assert!(!state.flags.contains(MappingFlags::HASFILE));
        drop(state);
        frames.empty(frame);
        cache.shutdown();
    }

    #[test]
    #[cfg(feature = "slow-tests")]
    fn mapped_file_write_persists_after_unmap() {
        let dev = Arc::new(MemBlockDevice::new("fs", DeviceKind::Filesys, 64));
        let bytes = crate::freemap::bitmap_byte_len(64);
        let cache = SectorCache::new(dev, &crate::config::Config::default(), 1..2, bytes);
        FreeMap::new(&cache, 64).reserve(2);
        let freemap = FreeMap::new(&cache, 64);
        let table = crate::fs::inode::InodeTable::new();
        let inode = table.open(2);
        inode.format(&cache, PAGE_SIZE);

        let pt = PageTable::new();
        let frames = FrameTable::new(1);
        let swap = swap_fixture();

        let addr = 0x5000_0000usize;
        pt.set_file_page(
            addr,
            MappingFlags::WRITABLE | MappingFlags::FWRITE,
            Arc::clone(&inode),
            Arc::clone(&cache),
            64,
            0,
            PAGE_SIZE as u32,
        )
        .unwrap();

        let frame = pt.load_page(addr, &frames, &swap).unwrap();
        {
            let mut buf = frames.data(frame);
            buf[0] = 0xAA;
        }
        pt.get(addr).unwrap().mark_dirty();
        frames.unpin(frame);

        pt.clear_page(addr, &frames, &swap);

        let mut readback = [0u8; PAGE_SIZE];
        inode.read_at(&cache, &freemap, &mut readback, 0);
        assert_eq!(readback[0], 0xAA);

        table.close(&inode, &cache, &freemap);
        cache.shutdown();
    }

    #[test]
    #[cfg(feature = "slow-tests")]
    fn evicted_anonymous_page_round_trips_through_swap() {
        let pt = PageTable::new();
        let frames = FrameTable::new(1);
        let swap = swap_fixture();

        let addr_a = 0x6000_0000usize;
        let addr_b = 0x6000_1000usize;
        pt.set_page(addr_a, MappingFlags::WRITABLE, false).unwrap();
        pt.set_page(addr_b, MappingFlags::WRITABLE, false).unwrap();

        let frame_a = pt.load_page(addr_a, &frames, &swap).unwrap();
        {
            let mut buf = frames.data(frame_a);
            buf[0] = 0x42;
        }
        pt.get(addr_a).unwrap().mark_dirty();
        frames.unpin(frame_a);

        // Only one frame exists; loading addr_b forces addr_a's eviction.
        let frame_b = pt.load_page(addr_b, &frames, &swap).unwrap();
        assert!(pt.get(addr_a).unwrap().state.lock().unwrap().flags.contains(MappingFlags::SWAPPED));
        frames.unpin(frame_b);

        let frame_a_again = pt.load_page(addr_a, &frames, &swap).unwrap();
        assert_eq!(frames.data(frame_a_again)[0], 0x42);
    }
}
