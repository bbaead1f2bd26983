//! File-system facade: formatting, mounting, path resolution, and the
//! create/open/remove surface consumed by a syscall layer, grounded on
//! the teacher's `sysfile.rs` syscall-level operations (`sys_open`,
//! `sys_mkdir`, `sys_unlink`) and `fs.rs`'s `create`.
//!
//! On-disk layout: sector 0 is the root directory's inode; sectors
//! `1..1+free_map_sectors` hold the free-sector bitmap; everything
//! after that is allocatable data.

pub mod directory;
pub mod file;
pub mod inode;
pub mod path;

pub use directory::Directory;
pub use file::File;
pub use inode::{Inode, InodeTable};
pub use path::{FileName, Path};

use std::sync::Arc;

use crate::cache::SectorCache;
use crate::config::{Config, ROOT_SECTOR};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::freemap::{bitmap_byte_len, FreeMap};

/// An open directory handle, returned by [`FileSystem::open_dir`] and
/// [`FileSystem::open`].
pub struct OpenDir {
    pub inode: Arc<inode::Inode>,
}

/// A mounted file system over one [`BlockDevice`] of `role ==
/// filesys`. Owns the sector cache, the free-sector
/// allocator, and the in-core inode registry; every directory/file
/// operation borrows these for the duration of the call rather than
/// holding them across syscalls.
pub struct FileSystem {
    cache: Arc<SectorCache>,
    sector_count: u32,
    table: InodeTable,
}

impl FileSystem {
    fn freemap(&self) -> FreeMap<'_> {
        FreeMap::new(&self.cache, self.sector_count)
    }

    /// Builds a fresh, empty file system on `device`: zeroes the free
    /// map, reserves the root inode and bitmap sectors, and formats the
    /// root directory as `.`/`..` pointing to itself.
    pub fn format(device: Arc<dyn BlockDevice>, config: &Config) -> Result<Self> {
        let sector_count = device.sector_count();
        let bitmap_bytes = bitmap_byte_len(sector_count);
        let freemap_sectors_len = ((bitmap_bytes + 511) / 512) as u32;
        let freemap_sectors = (ROOT_SECTOR + 1)..(ROOT_SECTOR + 1 + freemap_sectors_len);

        let cache = SectorCache::new(device, config, freemap_sectors.clone(), bitmap_bytes);
        let table = InodeTable::new();
        let fs = Self { cache, sector_count, table };

        let freemap = fs.freemap();
        freemap.reserve(freemap_sectors.end);

        let root = fs.table.open(ROOT_SECTOR);
        root.format(&fs.cache, 0);
        let root_dir = Directory::new(Arc::clone(&root), &fs.cache, &freemap);
        root_dir.format(ROOT_SECTOR, ROOT_SECTOR)?;
        fs.table.close(&root, &fs.cache, &freemap);

        Ok(fs)
    }

    /// Mounts an already-formatted device. Does not re-read the root
    /// inode's magic eagerly; that check happens lazily the first time
    /// any inode is read — corruption is fatal wherever it is first
    /// observed, not necessarily at mount time.
    pub fn mount(device: Arc<dyn BlockDevice>, config: &Config) -> Self {
        let sector_count = device.sector_count();
        let bitmap_bytes = bitmap_byte_len(sector_count);
        let freemap_sectors_len = ((bitmap_bytes + 511) / 512) as u32;
        let freemap_sectors = (ROOT_SECTOR + 1)..(ROOT_SECTOR + 1 + freemap_sectors_len);
        let cache = SectorCache::new(device, config, freemap_sectors, bitmap_bytes);
        Self { cache, sector_count, table: InodeTable::new() }
    }

    pub fn shutdown(&self) {
        self.cache.shutdown();
    }

    fn root(&self) -> Arc<inode::Inode> {
        self.table.open(ROOT_SECTOR)
    }

    /// Walks `path` from `wd` (or the root, if `wd` is `None` and the
    /// path is absolute) to the directory it names, consuming every
    /// component including a trailing one.
    pub fn locate_dir(&self, path: &Path<'_>, wd: Option<Arc<inode::Inode>>) -> Result<Arc<inode::Inode>> {
        let mut current = if path.is_absolute() || wd.is_none() {
            self.root()
        } else {
            Arc::clone(wd.as_ref().unwrap())
        };
        let mut rest = *path;
        while let Some((next_rest, name)) = rest.skipelem() {
            let freemap = self.freemap();
            let dir = Directory::new(Arc::clone(&current), &self.cache, &freemap);
            let (child_sector, is_dir, _) = dir.lookup(name.as_bytes()).ok_or(Error::NotFound)?;
            if !is_dir {
                self.table.close(&current, &self.cache, &freemap);
                return Err(Error::NotDir);
            }
            let child = self.table.open(child_sector);
            self.table.close(&current, &self.cache, &freemap);
            current = child;
            rest = next_rest;
        }
        Ok(current)
    }

    /// Splits `path` into the directory containing its last component
    /// and that component's own name. Rejects paths that end in `/`
    /// since that leaves the last component empty.
    pub fn locate_parent<'p>(
        &self,
        path: &Path<'p>,
        wd: Option<Arc<inode::Inode>>,
    ) -> Result<(Arc<inode::Inode>, FileName<'p>)> {
        if path.ends_in_slash() {
            return Err(Error::InvalidName);
        }
        let mut current = if path.is_absolute() || wd.is_none() {
            self.root()
        } else {
            Arc::clone(wd.as_ref().unwrap())
        };
        let mut rest = *path;
        loop {
            let (next_rest, name) = rest.skipelem().ok_or(Error::InvalidName)?;
            if next_rest.skipelem().is_none() {
                return Ok((current, name));
            }
            let freemap = self.freemap();
            let dir = Directory::new(Arc::clone(&current), &self.cache, &freemap);
            let (child_sector, is_dir, _) = dir.lookup(name.as_bytes()).ok_or(Error::NotFound)?;
            if !is_dir {
                self.table.close(&current, &self.cache, &freemap);
                return Err(Error::NotDir);
            }
            let child = self.table.open(child_sector);
            self.table.close(&current, &self.cache, &freemap);
            current = child;
            rest = next_rest;
        }
    }

    /// Creates a regular file of `size` bytes at `path`. Allocates an
    /// inode sector and adds the directory entry; if the entry
    /// insertion fails, the allocated inode is unwound (marked removed
    /// and closed, freeing its sector) rather than leaked. `size` is
    /// recorded in the inode header immediately; data sectors for it
    /// are still allocated lazily on first access (see
    /// [`inode::Inode::format`]).
    pub fn create_file(&self, path: &str, size: usize, wd: Option<Arc<inode::Inode>>) -> Result<()> {
        let path = Path::new(path)?;
        let parent = scopeguard::guard(self.locate_parent(&path, wd)?, |(parent, _)| {
            self.table.close(&parent, &self.cache, &self.freemap());
        });
        let (parent_inode, name) = &*parent;
        let freemap = self.freemap();

        let sector = freemap.get()?;
        let inode = scopeguard::guard(self.table.open(sector), |inode| {
            inode.mark_removed();
            self.table.close(&inode, &self.cache, &freemap);
        });
        inode.format(&self.cache, size);

        let parent_dir = Directory::new(Arc::clone(parent_inode), &self.cache, &freemap);
        parent_dir.add(name.as_bytes(), sector, false)?;

        let inode = scopeguard::ScopeGuard::into_inner(inode);
        self.table.close(&inode, &self.cache, &freemap);
        Ok(())
    }

    /// Creates a directory at `path`, formatted with `.`/`..` pointing
    /// at itself/its parent. Unwinds the same way as
    /// [`FileSystem::create_file`] if formatting or linking fails.
    pub fn create_dir(&self, path: &str, wd: Option<Arc<inode::Inode>>) -> Result<()> {
        let path = Path::new(path)?;
        let parent = scopeguard::guard(self.locate_parent(&path, wd)?, |(parent, _)| {
            self.table.close(&parent, &self.cache, &self.freemap());
        });
        let (parent_inode, name) = &*parent;
        let freemap = self.freemap();

        let sector = freemap.get()?;
        let inode = scopeguard::guard(self.table.open(sector), |inode| {
            inode.mark_removed();
            self.table.close(&inode, &self.cache, &freemap);
        });
        inode.format(&self.cache, 0);
        let new_dir = Directory::new(Arc::clone(&inode), &self.cache, &freemap);
        new_dir.format(sector, parent_inode.sector)?;

        let parent_dir = Directory::new(Arc::clone(parent_inode), &self.cache, &freemap);
        parent_dir.add(name.as_bytes(), sector, true)?;

        let inode = scopeguard::ScopeGuard::into_inner(inode);
        self.table.close(&inode, &self.cache, &freemap);
        Ok(())
    }

    /// Resolves `path` and reports whether it names a directory,
    /// without committing to either an `open_file` or `open_dir`
    /// result.
    pub fn open(&self, path: &str, wd: Option<Arc<inode::Inode>>) -> Result<(Arc<inode::Inode>, bool)> {
        let path = Path::new(path)?;
        if path.is_absolute() && path.as_bytes() == b"/" {
            return Ok((self.root(), true));
        }
        let (parent, name) = self.locate_parent(&path, wd)?;
        let freemap = self.freemap();
        let dir = Directory::new(Arc::clone(&parent), &self.cache, &freemap);
        let result = dir.lookup(name.as_bytes());
        self.table.close(&parent, &self.cache, &freemap);
        let (sector, is_dir, _) = result.ok_or(Error::NotFound)?;
        Ok((self.table.open(sector), is_dir))
    }

    pub fn open_file(&self, path: &str, wd: Option<Arc<inode::Inode>>) -> Result<File> {
        let (inode, is_dir) = self.open(path, wd)?;
        if is_dir {
            self.table.close(&inode, &self.cache, &self.freemap());
            return Err(Error::IsDir);
        }
        Ok(File::new(inode))
    }

    pub fn open_dir(&self, path: &str, wd: Option<Arc<inode::Inode>>) -> Result<OpenDir> {
        let (inode, is_dir) = self.open(path, wd)?;
        if !is_dir {
            self.table.close(&inode, &self.cache, &self.freemap());
            return Err(Error::NotDir);
        }
        Ok(OpenDir { inode })
    }

    /// Removes the entry named by `path`'s last component. A directory
    /// may only be removed empty, including its known race against a
    /// concurrent open of the same child — see DESIGN.md.
    pub fn remove(&self, path: &str, wd: Option<Arc<inode::Inode>>) -> Result<()> {
        let path = Path::new(path)?;
        let (parent, name) = self.locate_parent(&path, wd)?;
        let freemap = self.freemap();
        let dir = Directory::new(Arc::clone(&parent), &self.cache, &freemap);
        let result = dir.remove(name.as_bytes(), &self.table);
        self.table.close(&parent, &self.cache, &freemap);
        result
    }

    pub fn close_inode(&self, inode: &Arc<inode::Inode>) {
        self.table.close(inode, &self.cache, &self.freemap());
    }

    pub fn readdir(&self, dir: &OpenDir, cursor: usize) -> Option<(Vec<u8>, u32, bool, usize)> {
        let freemap = self.freemap();
        let directory = Directory::new(Arc::clone(&dir.inode), &self.cache, &freemap);
        directory.readdir(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, MemBlockDevice};

    fn fixture() -> FileSystem {
        let dev = Arc::new(MemBlockDevice::new("test", DeviceKind::Filesys, 512));
        FileSystem::format(dev, &Config::default()).unwrap()
    }

    #[test]
    fn create_file_then_open_round_trips() {
        let fs = fixture();
        fs.create_file("/foo.txt", 0, None).unwrap();
        let (inode, is_dir) = fs.open("/foo.txt", None).unwrap();
        assert!(!is_dir);
        fs.close_inode(&inode);
        fs.shutdown();
    }

    #[test]
    fn create_file_records_initial_size() {
        let fs = fixture();
        fs.create_file("/a.txt", 10, None).unwrap();
        let freemap = fs.freemap();
        let file = fs.open_file("/a.txt", None).unwrap();
        assert_eq!(file.length(&fs.cache), 10);
        file.close(&fs.table, &fs.cache, &freemap);
        fs.shutdown();
    }

    #[test]
    fn create_dir_then_nested_file() {
        let fs = fixture();
        fs.create_dir("/sub", None).unwrap();
        let (sub, is_dir) = fs.open("/sub", None).unwrap();
        assert!(is_dir);
        fs.create_file("/sub/inner.txt", 0, None).unwrap();
        let (inner, is_dir2) = fs.open("/sub/inner.txt", None).unwrap();
        assert!(!is_dir2);
        fs.close_inode(&sub);
        fs.close_inode(&inner);
        fs.shutdown();
    }

    #[test]
    fn create_file_in_missing_dir_fails() {
        let fs = fixture();
        assert_eq!(fs.create_file("/missing/file.txt", 0, None), Err(Error::NotFound));
        fs.shutdown();
    }

    #[test]
    fn remove_file_then_lookup_fails() {
        let fs = fixture();
        fs.create_file("/a.txt", 0, None).unwrap();
        fs.remove("/a.txt", None).unwrap();
        assert_eq!(fs.open("/a.txt", None).err(), Some(Error::NotFound));
        fs.shutdown();
    }

    #[test]
    fn trailing_slash_rejected_for_create() {
        let fs = fixture();
        assert_eq!(fs.create_file("/a/", 0, None), Err(Error::InvalidName));
        fs.shutdown();
    }

    #[test]
    fn open_root_returns_directory() {
        let fs = fixture();
        let (root, is_dir) = fs.open("/", None).unwrap();
        assert!(is_dir);
        fs.close_inode(&root);
        fs.shutdown();
    }

    #[test]
    #[cfg(feature = "slow-tests")]
    fn large_sequential_write_reads_back_exactly() {
        let dev = Arc::new(MemBlockDevice::new("big", DeviceKind::Filesys, 20_000));
        let fs = FileSystem::format(dev, &Config::default()).unwrap();
        let size = 8 * 1024 * 1024;
        fs.create_file("/big.bin", size, None).unwrap();
        let mut file = fs.open_file("/big.bin", None).unwrap();
        let freemap = fs.freemap();

        let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let written = file.write(&fs.cache, &freemap, &pattern).unwrap();
        assert_eq!(written, size);
        assert_eq!(file.length(&fs.cache), size);

        file.seek(0);
        let mut readback = vec![0u8; size];
        let read = file.read(&fs.cache, &freemap, &mut readback);
        assert_eq!(read, size);
        assert_eq!(readback, pattern);

        file.close(&fs.table, &fs.cache, &freemap);
        fs.shutdown();
    }
}
