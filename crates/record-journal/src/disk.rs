//! Disk-backed native file.
//!
//! Wraps an OS file in the [`NativeFile`] contract:
//!
//! - Descriptors are pooled per `(path, flags)` and LRU-evicted once the
//!   pool exceeds `max(1, 1024 / cpu_count)` entries, so a process juggling
//!   many journals does not exhaust its descriptor table.
//! - Reads go through a single-window block cache (default 256 KiB,
//!   caller-sized). Any write invalidates the cached range it touches.
//! - Writes open with `O_APPEND`; a gathered `writev` lands at the end of
//!   the file in one syscall.
//! - Watchers are driven by a lazy polling thread that observes file length
//!   changes; same-process writers additionally fire watchers inline.

use std::fs::{File, Metadata, OpenOptions};
use std::io::{self, IoSlice, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::JournalResult;
use crate::native::{FileStat, NativeFile, WatchCallback, WatchGuard, WatchHub};

/// Default block cache size.
pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024;

/// Cache window alignment.
const BLOCK_ALIGN: u64 = 4096;

/// Poll interval of the watch thread.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

// Descriptor pool, shared process-wide and keyed by (path, flags).

struct PoolEntry {
    key: (PathBuf, &'static str),
    file: Arc<File>,
    stamp: u64,
}

#[derive(Default)]
struct FdPool {
    entries: Mutex<(Vec<PoolEntry>, u64)>,
}

fn pool_cap() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (1024 / cpus).max(1)
}

impl FdPool {
    fn checkout(
        &self,
        path: &Path,
        flags: &'static str,
        open: impl FnOnce() -> io::Result<File>,
    ) -> io::Result<Arc<File>> {
        let mut guard = self.entries.lock().expect("fd pool poisoned");
        let (entries, clock) = &mut *guard;
        *clock += 1;

        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.key.0 == path && e.key.1 == flags)
        {
            entry.stamp = *clock;
            return Ok(entry.file.clone());
        }

        let file = Arc::new(open()?);
        entries.push(PoolEntry {
            key: (path.to_path_buf(), flags),
            file: file.clone(),
            stamp: *clock,
        });

        // LRU eviction past the cap; handles still checked out stay open
        // until their last user drops them.
        let cap = pool_cap();
        while entries.len() > cap {
            let oldest = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(i, _)| i)
                .expect("pool is non-empty");
            let evicted = entries.swap_remove(oldest);
            debug!(path = %evicted.key.0.display(), "evicted pooled descriptor");
        }
        Ok(file)
    }
}

fn pooled_open(path: &Path) -> io::Result<Arc<File>> {
    static POOL: OnceLock<FdPool> = OnceLock::new();
    POOL.get_or_init(FdPool::default).checkout(path, "ar", || {
        OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
    })
}

/// Single-window read cache in front of a descriptor.
struct BlockCache {
    capacity: usize,
    start: u64,
    data: Vec<u8>,
}

impl BlockCache {
    fn new(capacity: usize) -> BlockCache {
        BlockCache {
            capacity: capacity.max(BLOCK_ALIGN as usize),
            start: 0,
            data: Vec::new(),
        }
    }

    fn read(&mut self, file: &File, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        let wanted = buf.len();
        let hit = position >= self.start
            && position + wanted as u64 <= self.start + self.data.len() as u64;
        if !hit {
            let aligned = position - position % BLOCK_ALIGN;
            let mut window = vec![0u8; self.capacity];
            let filled = read_full_at(file, &mut window, aligned)?;
            window.truncate(filled);
            self.start = aligned;
            self.data = window;
            trace!(start = aligned, len = filled, "refilled block cache");
        }
        let offset = (position.saturating_sub(self.start)) as usize;
        let available = self.data.len().saturating_sub(offset);
        let n = wanted.min(available);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    /// Drop cached bytes at or past `from` (the start of a modification).
    fn invalidate_from(&mut self, from: u64) {
        let end = self.start + self.data.len() as u64;
        if end <= from {
            return;
        }
        if from <= self.start {
            self.data.clear();
        } else {
            self.data.truncate((from - self.start) as usize);
        }
    }
}

/// Positioned read that retries partial reads until EOF or the buffer fills.
fn read_full_at(file: &File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], position + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

struct Poller {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A native file over a pooled OS descriptor.
pub struct DiskFile {
    path: PathBuf,
    file: Arc<File>,
    cache: Mutex<BlockCache>,
    hub: Arc<WatchHub>,
    poller: Mutex<Option<Poller>>,
}

impl DiskFile {
    /// Open (creating if missing) with the default cache size.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Arc<DiskFile>> {
        Self::with_cache_bytes(path, DEFAULT_CACHE_BYTES)
    }

    /// Open with a caller-sized block cache.
    pub fn with_cache_bytes(path: impl AsRef<Path>, cache_bytes: usize) -> JournalResult<Arc<DiskFile>> {
        let path = path.as_ref().to_path_buf();
        let file = pooled_open(&path)?;
        debug!(path = %path.display(), cache_bytes, "opened disk file");
        Ok(Arc::new(DiskFile {
            path,
            file,
            cache: Mutex::new(BlockCache::new(cache_bytes)),
            hub: Arc::default(),
            poller: Mutex::new(None),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn metadata(&self) -> io::Result<Metadata> {
        self.file.metadata()
    }

    /// Start the polling watcher once the first subscriber appears.
    fn ensure_poller(&self) {
        let mut slot = self.poller.lock().expect("poller slot poisoned");
        if slot.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let hub = self.hub.clone();
        let path = self.path.clone();
        let thread = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut last_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(POLL_INTERVAL);
                    if !hub.has_watchers() {
                        continue;
                    }
                    let len = match std::fs::metadata(&path) {
                        Ok(m) => m.len(),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "watch stat failed");
                            continue;
                        }
                    };
                    if len != last_len {
                        last_len = len;
                        hub.fire();
                    }
                }
            })
        };
        *slot = Some(Poller {
            stop,
            thread: Some(thread),
        });
    }
}

impl NativeFile for DiskFile {
    fn writev_sync(&self, bufs: &[IoSlice<'_>]) -> JournalResult<usize> {
        let appended_at = self.metadata()?.len();
        let wrote = (&*self.file).write_vectored(bufs)?;
        self.cache
            .lock()
            .expect("block cache poisoned")
            .invalidate_from(appended_at);
        trace!(wrote, appended_at, "disk writev");
        // Same-process observers learn immediately; cross-process ones via
        // the polling thread
        self.hub.fire();
        Ok(wrote)
    }

    fn write_sync(&self, buf: &[u8]) -> JournalResult<usize> {
        let appended_at = self.metadata()?.len();
        let wrote = (&*self.file).write(buf)?;
        self.cache
            .lock()
            .expect("block cache poisoned")
            .invalidate_from(appended_at);
        self.hub.fire();
        Ok(wrote)
    }

    fn read_sync(&self, buf: &mut [u8], position: u64) -> JournalResult<usize> {
        let mut cache = self.cache.lock().expect("block cache poisoned");
        if buf.len() > cache.capacity {
            // Oversized reads bypass the window
            return Ok(read_full_at(&self.file, buf, position)?);
        }
        Ok(cache.read(&self.file, position, buf)?)
    }

    fn stat_sync(&self) -> JournalResult<FileStat> {
        Ok(FileStat {
            len: self.metadata()?.len(),
        })
    }

    fn watch(&self, callback: WatchCallback) -> WatchGuard {
        self.ensure_poller();
        WatchHub::subscribe(&self.hub, callback)
    }

    fn close_sync(&self) -> JournalResult<()> {
        // Stops the poller; the pooled descriptor closes once its last
        // holder drops.
        self.poller.lock().expect("poller slot poisoned").take();
        Ok(())
    }
}

impl Drop for DiskFile {
    fn drop(&mut self) {
        let _ = self.close_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[test]
    fn test_append_then_positioned_read() {
        let dir = tempdir().unwrap();
        let file = DiskFile::open(dir.path().join("log.bin")).unwrap();

        assert_eq!(file.write_sync(b"alpha").unwrap(), 5);
        assert_eq!(file.write_sync(b"beta").unwrap(), 4);
        assert_eq!(file.stat_sync().unwrap().len, 9);

        let mut buf = [0u8; 4];
        assert_eq!(file.read_sync(&mut buf, 5).unwrap(), 4);
        assert_eq!(&buf, b"beta");
        assert_eq!(file.peek(16, 0).unwrap(), b"alphabeta");
    }

    #[test]
    fn test_writev_lands_as_one_contiguous_frame() {
        let dir = tempdir().unwrap();
        let file = DiskFile::open(dir.path().join("log.bin")).unwrap();

        let n = file
            .writev_sync(&[IoSlice::new(b"head"), IoSlice::new(b"|"), IoSlice::new(b"body")])
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(file.peek(9, 0).unwrap(), b"head|body");
    }

    #[test]
    fn test_cached_reads_see_later_appends() {
        let dir = tempdir().unwrap();
        let file = DiskFile::with_cache_bytes(dir.path().join("log.bin"), 8192).unwrap();

        file.write_sync(b"one").unwrap();
        let mut buf = [0u8; 3];
        // Warm the cache at offset 0
        assert_eq!(file.read_sync(&mut buf, 0).unwrap(), 3);
        assert_eq!(&buf, b"one");

        file.write_sync(b"two").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(file.read_sync(&mut buf, 3).unwrap(), 3);
        assert_eq!(&buf, b"two");
    }

    #[test]
    fn test_pooled_descriptor_shared_across_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        let a = DiskFile::open(&path).unwrap();
        let b = DiskFile::open(&path).unwrap();

        a.write_sync(b"from-a").unwrap();
        assert_eq!(b.peek(6, 0).unwrap(), b"from-a");
        b.write_sync(b"+b").unwrap();
        assert_eq!(a.stat_sync().unwrap().len, 8);
    }

    #[test]
    fn test_watch_observes_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watched.bin");
        let file = DiskFile::open(&path).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = {
            let hits = hits.clone();
            file.watch(Arc::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }))
        };

        file.write_sync(b"grow").unwrap();
        // Inline fire on the writing side
        assert!(hits.load(Ordering::Relaxed) >= 1);

        // Growth from outside this handle is caught by the poller
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"more")
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::Relaxed) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(hits.load(Ordering::Relaxed) >= 2);
    }
}
