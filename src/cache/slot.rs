//! One cache slot: a 512-byte buffer plus the locks required around it,
//! grounded on the teacher's `bio.rs` buffer and `sleeplock.rs`'s
//! scoped-guard release idiom.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::config::SECTOR_SIZE;

/// A slot is in exactly one of these states. `Evicting` is a transient
/// state: the evictor has chosen this slot and is writing its dirty
/// contents back to disk, without holding the cache-wide index lock. A
/// lookup that finds a slot `Evicting` must wait for it to leave that
/// state and then retry its lookup from scratch, since the slot may end
/// up caching a different sector by the time it becomes available again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    Evictable,
    InUse(u32),
    Evicting,
}

pub(crate) struct Slot {
    /// Sector currently cached here, or `None` if the slot is free. Set
    /// under `state`'s mutex at install time.
    pub(crate) sector: Mutex<Option<u32>>,
    pub(crate) content: RwLock<[u8; SECTOR_SIZE]>,
    pub(crate) state: Mutex<SlotState>,
    pub(crate) state_cv: Condvar,
    /// Guards duplicate disk reads: set once the buffer reflects disk
    /// contents for the currently-installed sector.
    pub(crate) loaded: Mutex<bool>,
    pub(crate) dirty: AtomicBool,
    /// `None` represents a slot that has never been touched since
    /// install, so the clock scan accepts it unconditionally.
    pub(crate) last_accessed: Mutex<Option<Instant>>,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            sector: Mutex::new(None),
            content: RwLock::new([0u8; SECTOR_SIZE]),
            state: Mutex::new(SlotState::Free),
            state_cv: Condvar::new(),
            loaded: Mutex::new(false),
            dirty: AtomicBool::new(false),
            last_accessed: Mutex::new(None),
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        *self.last_accessed.lock().unwrap() = Some(Instant::now());
    }

    /// Blocks until this slot is not [`SlotState::Evicting`], returning
    /// the held state-lock guard. Used by lookup before deciding whether
    /// the slot can be pinned.
    pub(crate) fn wait_while_evicting<'a>(
        &'a self,
        guard: std::sync::MutexGuard<'a, SlotState>,
    ) -> std::sync::MutexGuard<'a, SlotState> {
        self.state_cv
            .wait_while(guard, |s| *s == SlotState::Evicting)
            .unwrap()
    }
}

/// Mode a [`super::SectorCache::acquire`] call locks the buffer under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

bitflags::bitflags! {
    /// Flags modifying an [`super::SectorCache::acquire`] call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AcquireFlags: u8 {
        /// Elide the disk read that would normally populate a
        /// newly-installed or not-yet-loaded slot; contents are
        /// undefined until the caller writes them. Used when the
        /// caller is about to overwrite the whole sector anyway.
        const NOLOAD = 1 << 0;
    }
}

enum ContentGuard<'a> {
    Read(RwLockReadGuard<'a, [u8; SECTOR_SIZE]>),
    Write(RwLockWriteGuard<'a, [u8; SECTOR_SIZE]>),
}

/// A pinned, locked view of one slot's buffer. Dropping it releases the
/// content lock, decrements the pin count (restoring `Evictable` when it
/// reaches zero), and updates `last_accessed` — the teacher's "scoped
/// release" idiom from `sleeplock.rs`, made explicit here (rather than
/// left purely to `Drop`) because release also has to touch the
/// eviction state machine, not just unlock a mutex.
pub struct SlotGuard<'a> {
    pub(crate) slot: &'a Slot,
    content: ContentGuard<'a>,
}

impl<'a> SlotGuard<'a> {
    pub(crate) fn new_read(slot: &'a Slot) -> Self {
        let content = ContentGuard::Read(slot.content.read().unwrap());
        Self { slot, content }
    }

    pub(crate) fn new_write(slot: &'a Slot) -> Self {
        slot.mark_dirty();
        let content = ContentGuard::Write(slot.content.write().unwrap());
        Self { slot, content }
    }

    pub fn data(&self) -> &[u8; SECTOR_SIZE] {
        match &self.content {
            ContentGuard::Read(g) => g,
            ContentGuard::Write(g) => g,
        }
    }

    /// Panics (via the caller's own logic, not here) if this guard was
    /// acquired under [`Mode::Read`]; callers should acquire with
    /// [`Mode::Write`] to use this.
    pub fn data_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        match &mut self.content {
            ContentGuard::Write(g) => g,
            ContentGuard::Read(_) => {
                crate::bug!("data_mut() called on a read-mode SlotGuard")
            }
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.touch();
        let mut state = self.slot.state.lock().unwrap();
        *state = match *state {
            SlotState::InUse(1) => SlotState::Evictable,
            SlotState::InUse(n) if n > 1 => SlotState::InUse(n - 1),
            other => crate::bug!("releasing a slot that was not in-use: {:?}", other),
        };
        self.slot.state_cv.notify_all();
    }
}
