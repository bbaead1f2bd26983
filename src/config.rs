//! Tunables the teacher kernel hard-codes in `param.rs`. Collected here as
//! constructor arguments so an embedder can size the cache and swap area
//! without editing crate source.

/// Sector size in bytes, matching the teacher's `BSIZE`; not configurable.
pub const SECTOR_SIZE: usize = 512;

/// Page size in bytes, used by the VM layer. A page spans [`SECTORS_PER_PAGE`]
/// sectors.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page (4096 / 512).
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Sentinel stored in an inode index to mean "no data sector mapped yet".
pub const NO_SECTOR: u16 = 0xFFFF;

/// Single-indirect block pointers per inode.
pub const NUM_INDIRECT: usize = 64;

/// Sector indices held in one indirect block (512 bytes / 2-byte index).
pub const INDIRECT_PER_BLOCK: usize = SECTOR_SIZE / 2;

/// Fixed, non-index fields of an on-disk inode header: `length` (i32),
/// `magic` (u32), `counter` (i32).
const INODE_FIXED_FIELDS_SIZE: usize = 4 + 4 + 4;

/// Direct block pointers per inode, derived so the on-disk header
/// exactly fills one sector with [`NUM_INDIRECT`] indirect pointers and
/// no slack: `(SECTOR_SIZE - fixed_fields) / 2 - NUM_INDIRECT`.
pub const NUM_DIRECT: usize =
    (SECTOR_SIZE - INODE_FIXED_FIELDS_SIZE) / 2 - NUM_INDIRECT;

/// Maximum addressable file size in bytes.
pub const MAX_FILE_SECTORS: usize = NUM_DIRECT + NUM_INDIRECT * INDIRECT_PER_BLOCK;

/// Byte width of one directory entry on disk.
pub const DIRENT_SIZE: usize = 16;

/// Byte width of the name field inside a directory entry.
pub const DIR_NAME_LEN: usize = 14;

/// Entry count of a freshly created directory.
pub const DEFAULT_ENTRY_CNT: usize = 16;

/// Sector index of the root directory's inode.
pub const ROOT_SECTOR: u32 = 0;

/// Invalid-sector sentinel accepted by [`crate::cache::SectorCache::read`]
/// and read-only [`crate::cache::SectorCache::acquire`], yielding a
/// zero-filled buffer without consuming a slot.
pub const INVALID_SECTOR: u32 = 0xFFFF_FFFF;

/// Runtime-tunable sizing for a [`crate::cache::SectorCache`] and the VM
/// subsystem. Defaults mirror the teacher's `param.rs` reference values.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Number of slots in the sector cache (reference: 64).
    pub cache_slots: usize,
    /// Depth of the bounded read-ahead request queue (reference: 16).
    pub readahead_queue_depth: usize,
    /// Write-behind flush cadence (reference: 10 Hz, i.e. 100ms).
    pub writebehind_interval: std::time::Duration,
    /// Number of physical frames backing user pages.
    pub frame_count: usize,
    /// Number of slots in the swap area.
    pub swap_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_slots: 64,
            readahead_queue_depth: 16,
            writebehind_interval: std::time::Duration::from_millis(100),
            frame_count: 256,
            swap_slots: 256,
        }
    }
}
