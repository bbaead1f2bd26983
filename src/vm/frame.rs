//! Frame table: a fixed array of physical-page-sized buffers, each
//! either free or owned by one supplemental-page-table mapping,
//! grounded on the teacher's `kalloc.rs` free-frame allocator with a
//! clock-algorithm eviction scan layered on top, the way
//! `frametbl.c`'s `frame_to_evict` does in a Pintos-style virtual
//! memory subsystem.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::PAGE_SIZE;
use crate::vm::page_table::Mapping;
use crate::vm::swap::SwapTable;

struct Frame {
    data: Mutex<[u8; PAGE_SIZE]>,
    owner: Mutex<Option<Arc<Mapping>>>,
    /// Binary pin semaphore. Wake order is whatever
    /// [`std::sync::Condvar`] gives us, not the reference's strict LIFO
    /// — documented deviation, since the standard library does not
    /// expose a LIFO-ordered primitive.
    pinned: Mutex<bool>,
    pin_cv: std::sync::Condvar,
    age: AtomicU8,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Mutex::new([0u8; PAGE_SIZE]),
            owner: Mutex::new(None),
            pinned: Mutex::new(false),
            pin_cv: std::sync::Condvar::new(),
            age: AtomicU8::new(0),
        }
    }
}

/// Fixed-size pool of physical frames shared by every process's
/// supplemental page table. Eviction calls back into a victim's owning
/// page table through [`Mapping::owner`].
pub struct FrameTable {
    frames: Vec<Frame>,
    free: Mutex<Vec<usize>>,
    clock_hand: Mutex<usize>,
}

impl FrameTable {
    pub fn new(count: usize) -> Self {
        let frames = (0..count).map(|_| Frame::new()).collect();
        Self {
            frames,
            free: Mutex::new((0..count).collect()),
            clock_hand: Mutex::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.frames.len()
    }

    pub fn data(&self, frame: usize) -> MutexGuard<'_, [u8; PAGE_SIZE]> {
        self.frames[frame].data.lock().unwrap()
    }

    pub fn owner(&self, frame: usize) -> Option<Arc<Mapping>> {
        self.frames[frame].owner.lock().unwrap().clone()
    }

    /// Records `mapping` as `frame`'s owner.
    pub fn install(&self, frame: usize, mapping: Arc<Mapping>) {
        *self.frames[frame].owner.lock().unwrap() = Some(mapping);
    }

    /// Unbinds `frame`'s owner and returns it to the free list.
    pub fn empty(&self, frame: usize) {
        *self.frames[frame].owner.lock().unwrap() = None;
        self.frames[frame].age.store(0, Ordering::Relaxed);
        self.free.lock().unwrap().push(frame);
    }

    pub fn try_pin(&self, frame: usize) -> bool {
        let mut pinned = self.frames[frame].pinned.lock().unwrap();
        if *pinned {
            false
        } else {
            *pinned = true;
            true
        }
    }

    pub fn unpin(&self, frame: usize) {
        let f = &self.frames[frame];
        *f.pinned.lock().unwrap() = false;
        f.pin_cv.notify_one();
    }

    /// Blocks until `frame` can be pinned.
    pub fn pin_wait(&self, frame: usize) {
        let f = &self.frames[frame];
        let mut pinned = f.pinned.lock().unwrap();
        while *pinned {
            pinned = f.pin_cv.wait(pinned).unwrap();
        }
        *pinned = true;
    }

    /// Returns a pinned frame: one from the free list if available,
    /// otherwise a clock-selected victim evicted through its owning
    /// page table.
    pub fn get_frame(&self, swap: &SwapTable) -> usize {
        if let Some(frame) = self.free.lock().unwrap().pop() {
            self.pin_wait(frame);
            return frame;
        }
        self.evict_one(swap)
    }

    /// Scans every frame once starting at the rotating clock hand and
    /// pins the one with the lowest age byte, short-circuiting the
    /// instant an age-0 candidate turns up. Ties keep the
    /// first-encountered (closest to the hand) candidate. A frame that
    /// turns out to have no owner once pinned is evicted immediately —
    /// it's already free, just not yet on the free list.
    fn evict_one(&self, swap: &SwapTable) -> usize {
        let n = self.frames.len();
        if n == 0 {
            crate::bug!("frame table has zero frames");
        }
        let start = {
            let mut hand = self.clock_hand.lock().unwrap();
            let start = *hand;
            *hand = (*hand + 1) % n;
            start
        };

        let mut best: Option<(usize, u8)> = None;
        let mut pinned_here = Vec::new();
        let mut freed_here = None;
        'scan: for step in 0..n {
            let idx = (start + step) % n;
            if !self.try_pin(idx) {
                continue;
            }
            if self.owner(idx).is_none() {
                // Already free, just not on the free list yet.
                freed_here = Some(idx);
                break 'scan;
            }
            let age = self.frames[idx].age.load(Ordering::Relaxed);
            pinned_here.push(idx);
            if best.map_or(true, |(_, best_age)| age < best_age) {
                best = Some((idx, age));
            }
            if age == 0 {
                break 'scan;
            }
        }

        if let Some(idx) = freed_here {
            for other in pinned_here {
                self.unpin(other);
            }
            self.free.lock().unwrap().retain(|&f| f != idx);
            return idx;
        }

        let victim = match best {
            Some((idx, _)) => idx,
            None => crate::bug!("frame table exhausted: no evictable frame"),
        };

        for idx in pinned_here {
            if idx != victim {
                self.unpin(idx);
            }
        }

        let mapping = self
            .owner(victim)
            .unwrap_or_else(|| crate::bug!("victim frame lost its owner while pinned"));
        match mapping.owner_page_table() {
            Some(page_table) => {
                page_table.evict_page(&mapping, self, swap);
                // `victim` is already pinned from the scan above; clear its
                // owner/age without the free-list push `empty` would also
                // do, since we're handing it to the caller pinned, not
                // returning it to the pool.
                *self.frames[victim].owner.lock().unwrap() = None;
                self.frames[victim].age.store(0, Ordering::Relaxed);
                victim
            }
            None => crate::bug!("victim frame's mapping has no owning page table"),
        }
    }

    /// Called on each timer tick for one `block`-th of all frames:
    /// shift the age byte right by one and OR the accessed bit into the
    /// top, skipping frames currently pinned.
    pub fn tick(&self, block: usize, block_count: usize) {
        let n = self.frames.len();
        if block_count == 0 || n == 0 {
            return;
        }
        let chunk = (n + block_count - 1) / block_count;
        let start = block * chunk;
        let end = (start + chunk).min(n);
        for idx in start..end {
            let frame = &self.frames[idx];
            if *frame.pinned.lock().unwrap() {
                continue;
            }
            let owner = self.owner(idx);
            let accessed = owner
                .as_ref()
                .map(|m| m.try_reset_accessed())
                .unwrap_or(false);
            let prev = frame.age.load(Ordering::Relaxed);
            let mut next = prev >> 1;
            if accessed {
                next |= 0x80;
            }
            frame.age.store(next, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_frames_are_handed_out_before_eviction() {
        let table = FrameTable::new(2);
        let dev = std::sync::Arc::new(crate::device::MemBlockDevice::new(
            "swap",
            crate::device::DeviceKind::Swap,
            crate::config::SECTORS_PER_PAGE as u32,
        ));
        let swap = SwapTable::new(dev);
        let a = table.get_frame(&swap);
        let b = table.get_frame(&swap);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_returns_frame_to_free_list() {
        let table = FrameTable::new(1);
        let dev = std::sync::Arc::new(crate::device::MemBlockDevice::new(
            "swap",
            crate::device::DeviceKind::Swap,
            crate::config::SECTORS_PER_PAGE as u32,
        ));
        let swap = SwapTable::new(dev);
        let a = table.get_frame(&swap);
        table.unpin(a);
        table.empty(a);
        let b = table.get_frame(&swap);
        assert_eq!(a, b);
    }

    #[test]
    fn evict_one_picks_the_lowest_age_frame() {
        use crate::vm::page_table::{MappingFlags, PageTable};

        let table = FrameTable::new(3);
        let dev = Arc::new(crate::device::MemBlockDevice::new(
            "swap",
            crate::device::DeviceKind::Swap,
            3 * crate::config::SECTORS_PER_PAGE as u32,
        ));
        let swap = SwapTable::new(dev);
        let pt = PageTable::new();

        pt.set_page(0, MappingFlags::WRITABLE, false).unwrap();
        pt.set_page(PAGE_SIZE, MappingFlags::WRITABLE, false).unwrap();
        pt.set_page(2 * PAGE_SIZE, MappingFlags::WRITABLE, false).unwrap();
        let f0 = pt.load_page(0, &table, &swap).unwrap();
        table.unpin(f0);
        let f1 = pt.load_page(PAGE_SIZE, &table, &swap).unwrap();
        table.unpin(f1);
        let f2 = pt.load_page(2 * PAGE_SIZE, &table, &swap).unwrap();
        table.unpin(f2);

        // f1 is the aged-out candidate; the other two look recently used.
        table.frames[f0].age.store(200, Ordering::Relaxed);
        table.frames[f1].age.store(5, Ordering::Relaxed);
        table.frames[f2].age.store(100, Ordering::Relaxed);

        let victim = table.evict_one(&swap);
        assert_eq!(victim, f1);
    }
}
