//! The native file contract consumed by journals and cursors.
//!
//! A [`NativeFile`] is an append-oriented byte store with positioned reads,
//! a non-advancing `peek`, and change notification via watch callbacks. Two
//! implementations exist: [`crate::memory::MemoryFile`] buffers bytes in
//! memory and fires watchers inline after each write, and
//! [`crate::disk::DiskFile`] wraps a pooled OS descriptor with a block read
//! cache and a polling watcher.
//!
//! Watchers are best-effort and may fire spuriously; consumers re-check
//! whatever condition they were waiting on.

use std::io::IoSlice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::JournalResult;

/// Subset of file metadata the journal needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Current length in bytes.
    pub len: u64,
}

/// Change notification callback.
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

/// Append-oriented file surface.
pub trait NativeFile: Send + Sync {
    /// Gathered append of every buffer, in order, as one write. Returns the
    /// total bytes written.
    fn writev_sync(&self, bufs: &[IoSlice<'_>]) -> JournalResult<usize>;

    /// Append one buffer. Returns the bytes written.
    fn write_sync(&self, buf: &[u8]) -> JournalResult<usize>;

    /// Positioned read into `buf`; returns bytes read (short at EOF).
    fn read_sync(&self, buf: &mut [u8], position: u64) -> JournalResult<usize>;

    /// Up to `len` bytes at `position` without advancing anything.
    fn peek(&self, len: usize, position: u64) -> JournalResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read_sync(&mut buf, position)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn stat_sync(&self) -> JournalResult<FileStat>;

    /// Register a change watcher; dropping the guard unsubscribes.
    fn watch(&self, callback: WatchCallback) -> WatchGuard;

    /// Release underlying resources. Further calls may fail.
    fn close_sync(&self) -> JournalResult<()>;
}

/// Shared watcher list used by both native file implementations.
#[derive(Default)]
pub(crate) struct WatchHub {
    watchers: Mutex<Vec<(u64, WatchCallback)>>,
    next_id: AtomicU64,
}

impl WatchHub {
    pub(crate) fn subscribe(hub: &Arc<WatchHub>, callback: WatchCallback) -> WatchGuard {
        let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
        hub.watchers
            .lock()
            .expect("watcher list poisoned")
            .push((id, callback));
        trace!(id, "registered watcher");
        WatchGuard {
            hub: Arc::downgrade(hub),
            id,
        }
    }

    /// Invoke every watcher. Callbacks run on the calling thread and must
    /// not re-enter the file they observe while it holds locks, so the
    /// list is snapshotted first.
    pub(crate) fn fire(&self) {
        let snapshot: Vec<WatchCallback> = self
            .watchers
            .lock()
            .expect("watcher list poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback();
        }
    }

    pub(crate) fn has_watchers(&self) -> bool {
        !self.watchers.lock().expect("watcher list poisoned").is_empty()
    }

    fn unsubscribe(&self, id: u64) {
        self.watchers
            .lock()
            .expect("watcher list poisoned")
            .retain(|(wid, _)| *wid != id);
        trace!(id, "unregistered watcher");
    }
}

/// Unsubscribes its watcher on drop.
pub struct WatchGuard {
    hub: std::sync::Weak<WatchHub>,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGuard").field("id", &self.id).finish()
    }
}
