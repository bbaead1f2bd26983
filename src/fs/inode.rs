//! Inodes: the 512-byte on-disk header and the shared in-core handle
//! built on top of it, grounded on the teacher's `fs.rs` inode
//! structures and the open-count/deny-write bookkeeping in `file.rs`.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::cache::{AcquireFlags, Mode, SectorCache};
use crate::config::{INDIRECT_PER_BLOCK, NO_SECTOR, NUM_DIRECT, NUM_INDIRECT, SECTOR_SIZE};
use crate::error::Result;
use crate::freemap::FreeMap;

pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Exactly 512 bytes on disk. One inode occupies one whole sector; data
/// sectors are addressed separately through `direct`/`indirect`.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InodeDisk {
    pub length: i32,
    pub magic: u32,
    pub counter: i32,
    pub direct: [u16; NUM_DIRECT],
    pub indirect: [u16; NUM_INDIRECT],
}

static_assertions::const_assert_eq!(std::mem::size_of::<InodeDisk>(), SECTOR_SIZE);

impl InodeDisk {
    pub fn new() -> Self {
        Self::with_length(0)
    }

    /// Builds a freshly allocated header with `length` bytes already
    /// recorded. Sectors for those bytes are not allocated here; they
    /// are allocated lazily by `byte_to_sector` the first time each one
    /// is actually read or written, so a file can be created at its
    /// final size with no data sectors touched yet.
    pub fn with_length(length: usize) -> Self {
        Self {
            length: length as i32,
            magic: INODE_MAGIC,
            counter: 0,
            direct: [NO_SECTOR; NUM_DIRECT],
            indirect: [NO_SECTOR; NUM_INDIRECT],
        }
    }

    fn from_sector(buf: &[u8; SECTOR_SIZE]) -> Self {
        Self::read_from_bytes(buf).expect("sector-sized buffer always parses")
    }

    fn to_sector(self) -> [u8; SECTOR_SIZE] {
        let mut out = [0u8; SECTOR_SIZE];
        self.write_to(&mut out[..]).expect("sector-sized buffer always fits");
        out
    }
}

impl Default for InodeDisk {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared in-core handle. The uniqueness invariant (at most one in-core
/// inode per disk sector) is enforced by [`super::FileSystem`]'s
/// registry, not by this type itself.
pub struct Inode {
    pub sector: u32,
    open_cnt: AtomicU32,
    removed: AtomicBool,
    deny_write_cnt: AtomicI32,
    /// Advisory rwlock exposed to directory/file-system code. Orthogonal
    /// to the cache's own per-sector content lock: this one guards
    /// multi-sector logical invariants such as directory entry
    /// insertion.
    lock: RwLock<()>,
}

impl Inode {
    fn new(sector: u32) -> Self {
        Self {
            sector,
            open_cnt: AtomicU32::new(0),
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicI32::new(0),
            lock: RwLock::new(()),
        }
    }

    pub fn open_count(&self) -> u32 {
        self.open_cnt.load(Ordering::Acquire)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn deny_write(&self) {
        self.deny_write_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn allow_write(&self) {
        let prev = self.deny_write_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allow_write without matching deny_write");
    }

    pub fn writes_denied(&self) -> bool {
        self.deny_write_cnt.load(Ordering::Acquire) > 0
    }

    pub fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap()
    }

    pub fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap()
    }

    fn read_disk(&self, cache: &SectorCache) -> InodeDisk {
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(self.sector, &mut buf);
        InodeDisk::from_sector(&buf)
    }

    fn write_disk(&self, cache: &SectorCache, disk: InodeDisk) {
        cache.write(self.sector, &disk.to_sector());
    }

    pub fn length(&self, cache: &SectorCache) -> usize {
        self.read_disk(cache).length.max(0) as usize
    }

    /// 32-bit signed counter mutated via read-modify-write under a cache
    /// write-lock. Used by directories to track live child entries.
    pub fn counter(&self, cache: &SectorCache) -> i32 {
        self.read_disk(cache).counter
    }

    pub fn add_counter(&self, cache: &SectorCache, delta: i32) {
        let mut guard = cache.acquire(self.sector, Mode::Write, AcquireFlags::empty());
        let mut disk = InodeDisk::from_sector(guard.data());
        disk.counter += delta;
        *guard.data_mut() = disk.to_sector();
    }

    /// Initializes a freshly allocated inode's on-disk header with
    /// `length` bytes already recorded (data sectors are still
    /// allocated lazily on first access).
    pub fn format(&self, cache: &SectorCache, length: usize) {
        let disk = InodeDisk::with_length(length);
        let mut guard = cache.acquire(self.sector, Mode::Write, AcquireFlags::NOLOAD);
        *guard.data_mut() = disk.to_sector();
    }

    /// Translates a byte offset into a data sector index. Allocates on
    /// demand when `create` is true. Any value read from a cached
    /// indirect-block buffer is copied out *before* that buffer's guard
    /// is dropped, closing a stale-read window an earlier draft left
    /// open (see DESIGN.md).
    fn byte_to_sector(
        &self,
        cache: &SectorCache,
        freemap: &FreeMap<'_>,
        sector_idx: usize,
        create: bool,
    ) -> Result<Option<u32>> {
        let mut disk = self.read_disk(cache);

        if sector_idx < NUM_DIRECT {
            let mut s = disk.direct[sector_idx];
            if s == NO_SECTOR {
                if !create {
                    return Ok(None);
                }
                let new = freemap.get()?;
                cache.write(new, &[0u8; SECTOR_SIZE]);
                disk.direct[sector_idx] = new as u16;
                self.write_disk(cache, disk);
                s = new as u16;
            }
            return Ok(Some(s as u32));
        }

        let rel = sector_idx - NUM_DIRECT;
        let ind_idx = rel / INDIRECT_PER_BLOCK;
        let within = rel % INDIRECT_PER_BLOCK;
        if ind_idx >= NUM_INDIRECT {
            crate::bug!("sector index {sector_idx} exceeds maximum file size");
        }

        let mut ind_sector = disk.indirect[ind_idx];
        if ind_sector == NO_SECTOR {
            if !create {
                return Ok(None);
            }
            let new_ind = freemap.get()?;
            {
                let mut guard = cache.acquire(new_ind, Mode::Write, AcquireFlags::NOLOAD);
                let buf = guard.data_mut();
                for i in 0..INDIRECT_PER_BLOCK {
                    buf[i * 2..i * 2 + 2].copy_from_slice(&NO_SECTOR.to_le_bytes());
                }
            }
            disk.indirect[ind_idx] = new_ind as u16;
            self.write_disk(cache, disk);
            ind_sector = new_ind as u16;
        }

        let data_sector = {
            let mut buf = [0u8; SECTOR_SIZE];
            cache.read(ind_sector as u32, &mut buf);
            u16::from_le_bytes([buf[within * 2], buf[within * 2 + 1]])
        };

        if data_sector != NO_SECTOR {
            return Ok(Some(data_sector as u32));
        }
        if !create {
            return Ok(None);
        }
        let new_data = freemap.get()?;
        cache.write(new_data, &[0u8; SECTOR_SIZE]);
        {
            let mut guard = cache.acquire(ind_sector as u32, Mode::Write, AcquireFlags::empty());
            let buf = guard.data_mut();
            buf[within * 2..within * 2 + 2].copy_from_slice(&(new_data as u16).to_le_bytes());
        }
        Ok(Some(new_data))
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Reads past
    /// `length` return fewer bytes than requested (possibly zero); holes
    /// in an otherwise-mapped range (which cannot arise through this
    /// crate's own `write_at`, but could in a hand-crafted image) read
    /// as zero.
    pub fn read_at(
        &self,
        cache: &SectorCache,
        freemap: &FreeMap<'_>,
        buf: &mut [u8],
        offset: usize,
    ) -> usize {
        let length = self.length(cache);
        let mut total = 0usize;
        let mut off = offset;
        while total < buf.len() && off < length {
            let sector_idx = off / SECTOR_SIZE;
            let sector_off = off % SECTOR_SIZE;
            let remaining_in_file = length - off;
            let chunk = (SECTOR_SIZE - sector_off)
                .min(buf.len() - total)
                .min(remaining_in_file);

            match self
                .byte_to_sector(cache, freemap, sector_idx, false)
                .expect("read_at never allocates")
            {
                None => {
                    buf[total..total + chunk].fill(0);
                }
                Some(sector) => {
                    if sector_off == 0 && chunk == SECTOR_SIZE {
                        let mut sector_buf = [0u8; SECTOR_SIZE];
                        cache.read(sector, &mut sector_buf);
                        buf[total..total + chunk].copy_from_slice(&sector_buf);
                    } else {
                        let guard = cache.acquire(sector, Mode::Read, AcquireFlags::empty());
                        buf[total..total + chunk]
                            .copy_from_slice(&guard.data()[sector_off..sector_off + chunk]);
                    }
                    let more_remaining = off + chunk < length;
                    if more_remaining {
                        if let Ok(Some(next)) =
                            self.byte_to_sector(cache, freemap, sector_idx + 1, false)
                        {
                            cache.request_readahead(next);
                        }
                    }
                }
            }
            total += chunk;
            off += chunk;
        }
        total
    }

    /// Writes `buf` at `offset`, growing the inode if `offset +
    /// buf.len()` exceeds the current length. Returns `0` immediately,
    /// without touching any sector, if writes are currently denied.
    pub fn write_at(
        &self,
        cache: &SectorCache,
        freemap: &FreeMap<'_>,
        buf: &[u8],
        offset: usize,
    ) -> Result<usize> {
        if self.writes_denied() {
            return Ok(0);
        }
        let mut total = 0usize;
        let mut off = offset;
        while total < buf.len() {
            let sector_idx = off / SECTOR_SIZE;
            let sector_off = off % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_off).min(buf.len() - total);

            if sector_idx >= NUM_DIRECT + NUM_INDIRECT * INDIRECT_PER_BLOCK {
                break;
            }
            let sector = match self.byte_to_sector(cache, freemap, sector_idx, true)? {
                Some(s) => s,
                None => crate::bug!("byte_to_sector(create=true) returned no sector"),
            };
            if sector_off == 0 && chunk == SECTOR_SIZE {
                let mut sector_buf = [0u8; SECTOR_SIZE];
                sector_buf.copy_from_slice(&buf[total..total + chunk]);
                cache.write(sector, &sector_buf);
            } else {
                let mut guard = cache.acquire(sector, Mode::Write, AcquireFlags::empty());
                guard.data_mut()[sector_off..sector_off + chunk]
                    .copy_from_slice(&buf[total..total + chunk]);
            }
            total += chunk;
            off += chunk;
        }

        let new_len = offset + total;
        if new_len > self.length(cache) {
            let mut guard = cache.acquire(self.sector, Mode::Write, AcquireFlags::empty());
            let mut disk = InodeDisk::from_sector(guard.data());
            disk.length = new_len as i32;
            *guard.data_mut() = disk.to_sector();
        }
        Ok(total)
    }

    /// Releases every sector this inode owns: direct data sectors,
    /// indirect-of-direct data sectors, the indirect sectors themselves,
    /// and finally the inode's own sector. Called by
    /// [`InodeTable::close`] when the last reference to a `removed`
    /// inode goes away.
    pub(crate) fn free_all_sectors(&self, cache: &SectorCache, freemap: &FreeMap<'_>) {
        let disk = self.read_disk(cache);
        for &d in disk.direct.iter() {
            if d != NO_SECTOR {
                freemap.release(d as u32, 1);
            }
        }
        for &ind in disk.indirect.iter() {
            if ind == NO_SECTOR {
                continue;
            }
            let mut buf = [0u8; SECTOR_SIZE];
            cache.read(ind as u32, &mut buf);
            for i in 0..INDIRECT_PER_BLOCK {
                let s = u16::from_le_bytes([buf[i * 2], buf[i * 2 + 1]]);
                if s != NO_SECTOR {
                    freemap.release(s as u32, 1);
                }
            }
            freemap.release(ind as u32, 1);
        }
        freemap.release(self.sector, 1);
    }
}

/// The shared in-core inode registry: at most one `Inode` per disk
/// sector exists at any time, mirroring the teacher's in-kernel inode
/// cache. `open` increments the
/// caller-visible open count atomically; `close` decrements it and, on
/// reaching zero, removes the handle from the registry and — if it had
/// been marked `removed` — frees its sectors.
pub struct InodeTable {
    registry: Mutex<std::collections::HashMap<u32, std::sync::Arc<Inode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn open(&self, sector: u32) -> std::sync::Arc<Inode> {
        let mut reg = self.registry.lock().unwrap();
        if let Some(inode) = reg.get(&sector) {
            inode.open_cnt.fetch_add(1, Ordering::AcqRel);
            return std::sync::Arc::clone(inode);
        }
        let inode = std::sync::Arc::new(Inode::new(sector));
        inode.open_cnt.store(1, Ordering::Release);
        reg.insert(sector, std::sync::Arc::clone(&inode));
        inode
    }

    pub fn close(
        &self,
        inode: &std::sync::Arc<Inode>,
        cache: &SectorCache,
        freemap: &FreeMap<'_>,
    ) {
        let prev = inode.open_cnt.fetch_sub(1, Ordering::AcqRel);
        if prev != 1 {
            return;
        }
        let mut reg = self.registry.lock().unwrap();
        reg.remove(&inode.sector);
        drop(reg);
        if inode.is_removed() {
            inode.free_all_sectors(cache, freemap);
        }
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates that `magic` matches [`INODE_MAGIC`]; mismatches are
/// on-disk corruption, a fatal class of error.
pub fn check_magic(disk: &InodeDisk) -> Result<()> {
    if disk.magic != INODE_MAGIC {
        crate::bug!("inode magic mismatch: {:#x}", disk.magic);
    }
    Ok(())
}
