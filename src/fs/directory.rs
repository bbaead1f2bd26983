//! Directories: a directory is a file whose contents are an array of
//! 16-byte entries, grounded on the teacher's `fs.rs` `Dirent` layout and
//! `sysfile.rs`'s directory-entry scanning loops.

use std::sync::Arc;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::cache::SectorCache;
use crate::config::{DEFAULT_ENTRY_CNT, DIRENT_SIZE, DIR_NAME_LEN, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::freemap::FreeMap;
use crate::fs::inode::{Inode, InodeTable};
use crate::fs::path::FileName;

const FLAG_IN_USE: u16 = 1 << 14;
const FLAG_IS_DIR: u16 = 1 << 15;
const SECTOR_MASK: u16 = (1 << 14) - 1;

/// Exactly 16 bytes on disk: a 14-byte name, a 14-bit inode sector
/// number, and the `in_use`/`is_dir` flag bits.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawEntry {
    name: [u8; DIR_NAME_LEN],
    packed: u16,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawEntry>(), DIRENT_SIZE);

impl RawEntry {
    fn empty() -> Self {
        Self {
            name: [0; DIR_NAME_LEN],
            packed: 0,
        }
    }

    fn in_use(&self) -> bool {
        self.packed & FLAG_IN_USE != 0
    }

    fn is_dir(&self) -> bool {
        self.packed & FLAG_IS_DIR != 0
    }

    fn sector(&self) -> u32 {
        (self.packed & SECTOR_MASK) as u32
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        &self.name[..len]
    }

    fn matches(&self, name: &[u8]) -> bool {
        self.in_use() && self.name_bytes() == name
    }

    fn set(name: &[u8], sector: u32, is_dir: bool) -> Self {
        debug_assert!(sector <= SECTOR_MASK as u32);
        let mut buf = [0u8; DIR_NAME_LEN];
        buf[..name.len()].copy_from_slice(name);
        let mut packed = (sector as u16) | FLAG_IN_USE;
        if is_dir {
            packed |= FLAG_IS_DIR;
        }
        Self { name: buf, packed }
    }

    fn from_bytes(buf: &[u8; DIRENT_SIZE]) -> Self {
        Self::read_from_bytes(buf).expect("16-byte buffer always parses")
    }

    fn to_bytes(self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        self.write_to(&mut out[..]).expect("16-byte buffer always fits");
        out
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > DIR_NAME_LEN || name.contains(&b'/') {
        return Err(Error::InvalidName);
    }
    Ok(())
}

/// One directory, backed by `inode`. Every operation here is made atomic
/// against concurrent writers on the same inode by holding its advisory
/// rwlock for the duration.
pub struct Directory<'a> {
    pub inode: Arc<Inode>,
    cache: &'a SectorCache,
    freemap: &'a FreeMap<'a>,
}

impl<'a> Directory<'a> {
    pub fn new(inode: Arc<Inode>, cache: &'a SectorCache, freemap: &'a FreeMap<'a>) -> Self {
        Self { inode, cache, freemap }
    }

    fn entry_at(&self, offset: usize) -> Option<RawEntry> {
        let mut buf = [0u8; DIRENT_SIZE];
        let n = self.inode.read_at(self.cache, self.freemap, &mut buf, offset);
        if n < DIRENT_SIZE {
            return None;
        }
        Some(RawEntry::from_bytes(&buf))
    }

    fn entry_count(&self) -> usize {
        self.inode.length(self.cache) / DIRENT_SIZE
    }

    /// Formats a freshly allocated directory inode: `DEFAULT_ENTRY_CNT`
    /// free slots, with `.` and `..` inserted. The two synthetic entries
    /// do not count toward the counter; the caller is expected to have
    /// already incremented it twice via `add`'s bookkeeping and then
    /// decrement by 2.
    pub fn format(&self, self_sector: u32, parent_sector: u32) -> Result<()> {
        let empty = RawEntry::empty().to_bytes();
        for i in 0..DEFAULT_ENTRY_CNT {
            self.inode
                .write_at(self.cache, self.freemap, &empty, i * DIRENT_SIZE)?;
        }
        let _guard = self.inode.write_lock();
        self.add_raw(b".", self_sector, true)?;
        self.add_raw(b"..", parent_sector, true)?;
        self.inode.add_counter(self.cache, -2);
        Ok(())
    }

    /// Linear scan for the first in-use entry matching `name`. Returns
    /// the entry's inode sector, whether it is a directory, and its byte
    /// offset within the directory file.
    pub fn lookup(&self, name: &[u8]) -> Option<(u32, bool, usize)> {
        let _guard = self.inode.read_lock();
        for i in 0..self.entry_count() {
            let offset = i * DIRENT_SIZE;
            if let Some(entry) = self.entry_at(offset) {
                if entry.matches(name) {
                    return Some((entry.sector(), entry.is_dir(), offset));
                }
            }
        }
        None
    }

    fn add_raw(&self, name: &[u8], sector: u32, is_dir: bool) -> Result<()> {
        let count = self.entry_count();
        let mut target_offset = None;
        for i in 0..count {
            let offset = i * DIRENT_SIZE;
            if let Some(entry) = self.entry_at(offset) {
                if !entry.in_use() {
                    target_offset = Some(offset);
                    break;
                }
            }
        }
        let offset = target_offset.unwrap_or(count * DIRENT_SIZE);
        let raw = RawEntry::set(name, sector, is_dir).to_bytes();
        self.inode.write_at(self.cache, self.freemap, &raw, offset)?;
        Ok(())
    }

    /// Validates `name`, rejects duplicates, writes into the first free
    /// slot (appending a new slot if none is free), and increments the
    /// parent's counter.
    pub fn add(&self, name: &[u8], sector: u32, is_dir: bool) -> Result<()> {
        validate_name(name)?;
        let _guard = self.inode.write_lock();
        if self.lookup_locked(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        self.add_raw(name, sector, is_dir)?;
        self.inode.add_counter(self.cache, 1);
        Ok(())
    }

    /// Like [`Directory::lookup`] but assumes the caller already holds
    /// the inode's write lock (used internally by `add` to avoid
    /// recursive locking).
    fn lookup_locked(&self, name: &[u8]) -> Option<(u32, bool, usize)> {
        for i in 0..self.entry_count() {
            let offset = i * DIRENT_SIZE;
            if let Some(entry) = self.entry_at(offset) {
                if entry.matches(name) {
                    return Some((entry.sector(), entry.is_dir(), offset));
                }
            }
        }
        None
    }

    /// Removes `name`: refuses `.`/`..`, marks the entry free, removes
    /// the child inode (freeing its sectors once its last reference
    /// closes), and decrements this directory's counter.
    ///
    /// A directory child may only be removed when its in-core inode's
    /// open count is `<= 1` and its own counter is `0` (no live
    /// children). That check is race-prone against a concurrent `open`
    /// of the same child; this is a known, accepted gap, preserved
    /// rather than strengthened (see DESIGN.md).
    pub fn remove(&self, name: &[u8], table: &InodeTable) -> Result<()> {
        if name == b"." || name == b".." {
            return Err(Error::InvalidName);
        }
        let _guard = self.inode.write_lock();
        let (child_sector, is_dir, offset) =
            self.lookup_locked(name).ok_or(Error::NotFound)?;

        let child = table.open(child_sector);
        if is_dir {
            let child_dir = Directory::new(Arc::clone(&child), self.cache, self.freemap);
            let removable = {
                let _child_guard = child.write_lock();
                child.open_count() <= 1 && child_dir.counter() == 0
            };
            if !removable {
                table.close(&child, self.cache, self.freemap);
                return Err(Error::NotFound);
            }
        }

        let empty = RawEntry::empty().to_bytes();
        self.inode.write_at(self.cache, self.freemap, &empty, offset)?;
        child.mark_removed();
        table.close(&child, self.cache, self.freemap);
        self.inode.add_counter(self.cache, -1);
        Ok(())
    }

    /// Returns this directory's live-child counter, equal to the number
    /// of non-`.`/non-`..` entries in use.
    pub fn counter(&self) -> i32 {
        self.inode.counter(self.cache)
    }

    /// Returns the next in-use, non-`.`/`..` entry at or after `cursor`
    /// (a byte offset), along with the offset to resume from on the next
    /// call. Returns `None` once the directory is exhausted.
    pub fn readdir(&self, cursor: usize) -> Option<(Vec<u8>, u32, bool, usize)> {
        let _guard = self.inode.read_lock();
        let mut offset = cursor;
        let count = self.entry_count();
        while offset / DIRENT_SIZE < count {
            if let Some(entry) = self.entry_at(offset) {
                let next = offset + DIRENT_SIZE;
                if entry.in_use() && entry.name_bytes() != b"." && entry.name_bytes() != b".." {
                    return Some((entry.name_bytes().to_vec(), entry.sector(), entry.is_dir(), next));
                }
            }
            offset += DIRENT_SIZE;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{DeviceKind, MemBlockDevice};
    use crate::freemap::bitmap_byte_len;

    fn fixture() -> (Arc<SectorCache>, u32, InodeTable, u32) {
        let sectors = 64u32;
        let dev = Arc::new(MemBlockDevice::new("test", DeviceKind::Filesys, sectors));
        let bytes = bitmap_byte_len(sectors);
        let fm_sectors = 1..(1 + ((bytes + 511) / 512) as u32);
        let cache = SectorCache::new(dev, &Config::default(), fm_sectors.clone(), bytes);
        FreeMap::new(&cache, sectors).reserve(fm_sectors.end);
        let table = InodeTable::new();
        let root_sector = 0u32;
        (cache, sectors, table, root_sector)
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let (cache, sectors, table, root_sector) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let root = table.open(root_sector);
        root.format(&cache, 0);
        let dir = Directory::new(root, &cache, &freemap);
        dir.format(root_sector, root_sector).unwrap();
        dir.add(b"a", 5, false).unwrap();
        let (sector, is_dir, _) = dir.lookup(b"a").unwrap();
        assert_eq!(sector, 5);
        assert!(!is_dir);
        cache.shutdown();
    }

    #[test]
    fn duplicate_add_rejected() {
        let (cache, sectors, table, root_sector) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let root = table.open(root_sector);
        root.format(&cache, 0);
        let dir = Directory::new(root, &cache, &freemap);
        dir.format(root_sector, root_sector).unwrap();
        dir.add(b"a", 5, false).unwrap();
        assert_eq!(dir.add(b"a", 6, false), Err(Error::AlreadyExists));
        cache.shutdown();
    }

    #[test]
    fn remove_then_lookup_not_found() {
        let (cache, sectors, table, root_sector) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let root = table.open(root_sector);
        root.format(&cache, 0);
        let dir = Directory::new(root, &cache, &freemap);
        dir.format(root_sector, root_sector).unwrap();
        dir.add(b"a", 5, false).unwrap();
        dir.remove(b"a", &table).unwrap();
        assert!(dir.lookup(b"a").is_none());
        cache.shutdown();
    }

    #[test]
    fn cannot_remove_dot_or_dotdot() {
        let (cache, sectors, table, root_sector) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let root = table.open(root_sector);
        root.format(&cache, 0);
        let dir = Directory::new(root, &cache, &freemap);
        dir.format(root_sector, root_sector).unwrap();
        assert_eq!(dir.remove(b".", &table), Err(Error::InvalidName));
        assert_eq!(dir.remove(b"..", &table), Err(Error::InvalidName));
        cache.shutdown();
    }

    #[test]
    fn counter_tracks_live_children() {
        let (cache, sectors, table, root_sector) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let root = table.open(root_sector);
        root.format(&cache, 0);
        let dir = Directory::new(root, &cache, &freemap);
        dir.format(root_sector, root_sector).unwrap();
        assert_eq!(dir.counter(), 0);
        dir.add(b"a", 5, false).unwrap();
        dir.add(b"b", 6, false).unwrap();
        assert_eq!(dir.counter(), 2);
        dir.remove(b"a", &table).unwrap();
        assert_eq!(dir.counter(), 1);
        cache.shutdown();
    }

    #[test]
    fn full_directory_appends_new_slot() {
        let (cache, sectors, table, root_sector) = fixture();
        let freemap = FreeMap::new(&cache, sectors);
        let root = table.open(root_sector);
        root.format(&cache, 0);
        let dir = Directory::new(root, &cache, &freemap);
        dir.format(root_sector, root_sector).unwrap();
        // Fill every pre-allocated slot (two of DEFAULT_ENTRY_CNT are
        // already taken by the synthetic `.`/`..` entries).
        for i in 0..(DEFAULT_ENTRY_CNT - 2) {
            let name = [b'x', b'0' + (i % 10) as u8];
            dir.add(&name, 10 + i as u32, false).unwrap();
        }
        let before = dir.inode.length(&cache) / DIRENT_SIZE;
        dir.add(b"overflow", 999, false).unwrap();
        let after = dir.inode.length(&cache) / DIRENT_SIZE;
        assert_eq!(after, before + 1);
        cache.shutdown();
    }
}
