//! In-memory native file.
//!
//! Buffers every byte in a `Vec` and fires watchers synchronously after
//! each write, on the writing thread. Used for tests, replay fixtures, and
//! as the target of [`crate::journal::Journal::copy_to`] when a journal is
//! being snapshotted into memory.

use std::io::IoSlice;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::JournalResult;
use crate::native::{FileStat, NativeFile, WatchCallback, WatchGuard, WatchHub};

/// A native file backed by process memory.
#[derive(Default)]
pub struct MemoryFile {
    bytes: Mutex<Vec<u8>>,
    hub: Arc<WatchHub>,
}

impl MemoryFile {
    pub fn new() -> Arc<MemoryFile> {
        Arc::new(MemoryFile::default())
    }

    /// Seed a file with existing content (no watchers fire).
    pub fn with_bytes(bytes: Vec<u8>) -> Arc<MemoryFile> {
        Arc::new(MemoryFile {
            bytes: Mutex::new(bytes),
            hub: Arc::default(),
        })
    }

    /// Snapshot of the full content.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().expect("memory file poisoned").clone()
    }
}

impl NativeFile for MemoryFile {
    fn writev_sync(&self, bufs: &[IoSlice<'_>]) -> JournalResult<usize> {
        let total = {
            let mut bytes = self.bytes.lock().expect("memory file poisoned");
            let mut total = 0usize;
            for buf in bufs {
                bytes.extend_from_slice(buf);
                total += buf.len();
            }
            total
        };
        trace!(total, "memory writev");
        // Watchers run outside the buffer lock so they may read back
        self.hub.fire();
        Ok(total)
    }

    fn write_sync(&self, buf: &[u8]) -> JournalResult<usize> {
        self.writev_sync(&[IoSlice::new(buf)])
    }

    fn read_sync(&self, buf: &mut [u8], position: u64) -> JournalResult<usize> {
        let bytes = self.bytes.lock().expect("memory file poisoned");
        let position = position.min(bytes.len() as u64) as usize;
        let n = buf.len().min(bytes.len() - position);
        buf[..n].copy_from_slice(&bytes[position..position + n]);
        Ok(n)
    }

    fn stat_sync(&self) -> JournalResult<FileStat> {
        Ok(FileStat {
            len: self.bytes.lock().expect("memory file poisoned").len() as u64,
        })
    }

    fn watch(&self, callback: WatchCallback) -> WatchGuard {
        WatchHub::subscribe(&self.hub, callback)
    }

    fn close_sync(&self) -> JournalResult<()> {
        Ok(())
    }
}
