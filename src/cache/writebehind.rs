//! Write-behind worker: flushes dirty slots non-blocking at a fixed
//! cadence (reference: 10 Hz). Cancelled at shutdown via a shared
//! `closed` flag checked between cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::SectorCache;

pub(super) fn spawn(cache: Arc<SectorCache>, interval: Duration, closed: Arc<AtomicBool>) {
    std::thread::Builder::new()
        .name("sector-cache-writebehind".into())
        .spawn(move || {
            while !closed.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                if closed.load(Ordering::Acquire) {
                    break;
                }
                log::trace!("write-behind: non-blocking flush cycle");
                cache.flush(false);
            }
        })
        .expect("failed to spawn write-behind worker");
}
