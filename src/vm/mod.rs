//! Virtual memory: the frame table, the per-process supplemental page
//! table, and the swap table.
//!
//! The fault handler and hardware page table that would normally drive
//! these types are outside this crate's scope; what's here is the
//! bookkeeping a fault handler calls into.

pub mod frame;
pub mod page_table;
pub mod swap;

pub use frame::FrameTable;
pub use page_table::{Mapping, MappingFlags, PageTable};
pub use swap::SwapTable;
