//! Read-ahead worker: a single consumer of the bounded request queue.
//! An independent task with no result channel, cancelled at shutdown by
//! checking a shared closed flag between items — the same
//! background-thread-plus-shared-flag shape the write-behind flusher
//! uses.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use super::{AcquireFlags, Mode, SectorCache};

pub(super) fn spawn(cache: Arc<SectorCache>, rx: Receiver<u32>) {
    std::thread::Builder::new()
        .name("sector-cache-readahead".into())
        .spawn(move || {
            while let Ok(sector) = rx.recv() {
                if cache.closed.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                log::trace!("read-ahead: loading sector {sector}");
                // Opening read-only forces the load; dropping the guard
                // releases it immediately.
                let _ = cache.acquire(sector, Mode::Read, AcquireFlags::empty());
            }
        })
        .expect("failed to spawn read-ahead worker");
}
