//! Lock-free byte ring buffer over a shared memory region.
//!
//! # Memory layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ meta[0] head         read cursor       (LE u32, atomic)  │
//! │ meta[1] tail         write cursor      (LE u32, atomic)  │
//! │ meta[2] writer_flag  advisory claim    (LE u32, atomic)  │
//! ├──────────────────────────────────────────────────────────┤
//! │ data[N]              N = region_len - 12, N ≥ 4, N even  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! One slot stays reserved so a full ring is distinguishable from an empty
//! one: at most `N - 1` bytes are buffered at once, and for every state
//! `capacity + size + 1 == N`.
//!
//! # Protocol
//!
//! Writers claim the advisory `writer_flag` with a fetch-add; a non-zero
//! prior value means another writer is mid-flight and the attempt returns 0
//! (multi-writer throughput degrades to single-writer under contention).
//! The payload is copied, splitting at the wrap point, before the release
//! store of `tail` publishes it; a reader that acquires the new `tail` sees
//! complete bytes. Readers copy first and then race a compare-exchange on
//! `head`; the loser returns 0 and retries.
//!
//! Blocking variants park on the opposite cursor's condition variable:
//! writers wait for `head` to move (readers notify it after consuming),
//! readers wait for `tail` (writers notify it after producing). Timeouts
//! return 0 bytes transferred, never an error.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::condvar::ConditionVariable;
use crate::error::{ShmError, ShmResult};
use crate::region::SharedRegion;

/// Size of the atomic control block at the start of the ring's range.
pub const META_BYTES: usize = 12;

const HEAD: usize = 0;
const TAIL: usize = 1;
const WRITER_FLAG: usize = 2;

/// Cap on one blocked park, so flag-contention losses and missed edges
/// resolve on the next attempt instead of stalling a full timeout.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// A byte ring buffer over borrowed shared memory.
///
/// The ring holds its region through an `Arc` but does not manage the
/// region's lifecycle: dropping a ring never unmaps or unlinks.
pub struct RingBuffer {
    _region: Arc<SharedRegion>,
    meta: NonNull<AtomicU32>,
    data: NonNull<u8>,
    data_len: usize,
    /// Signaled after writes (lives on `tail`); readers park here.
    readable: ConditionVariable,
    /// Signaled after reads (lives on `head`); writers park here.
    writable: ConditionVariable,
}

// SAFETY: every operation goes through the atomic control block; payload
// ranges touched by a writer are unreachable to readers until the release
// store of `tail`, and vice versa for `head`.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Attach to a ring at `offset` bytes into `region`.
    ///
    /// The data area is whatever remains after the 12-byte control block;
    /// it must be at least 4 bytes and even. Freshly mapped regions are
    /// zero-filled, which is a valid empty ring; call [`RingBuffer::reset`]
    /// to re-initialize a reused range.
    pub fn new(region: Arc<SharedRegion>, offset: usize) -> ShmResult<RingBuffer> {
        if offset % 4 != 0 {
            return Err(ShmError::InvalidLayout(format!(
                "ring offset {offset} must be 4-byte aligned"
            )));
        }
        let available = region.len().saturating_sub(offset);
        if available < META_BYTES + 4 {
            return Err(ShmError::InvalidLayout(format!(
                "region too small: {available} bytes at offset {offset}, need {}",
                META_BYTES + 4
            )));
        }
        let data_len = available - META_BYTES;
        if data_len % 2 != 0 {
            return Err(ShmError::InvalidLayout(format!(
                "data area of {data_len} bytes is not divisible by 2"
            )));
        }

        // SAFETY: offsets stay inside the mapping, checked above; the base
        // is page-aligned and offset is a multiple of 4.
        let (meta, data) = unsafe {
            let base = region.as_ptr().add(offset);
            (
                NonNull::new_unchecked(base.cast::<AtomicU32>()),
                NonNull::new_unchecked(base.add(META_BYTES)),
            )
        };
        // SAFETY: meta words stay mapped for the ring's lifetime via the
        // held Arc.
        let (readable, writable) = unsafe {
            (
                ConditionVariable::from_word(NonNull::new_unchecked(meta.as_ptr().add(TAIL))),
                ConditionVariable::from_word(NonNull::new_unchecked(meta.as_ptr().add(HEAD))),
            )
        };

        debug!(offset, data_len, "attached ring buffer");
        Ok(RingBuffer {
            _region: region,
            meta,
            data,
            data_len,
            readable,
            writable,
        })
    }

    fn word(&self, index: usize) -> &AtomicU32 {
        // SAFETY: index is one of the three control words inside the mapping.
        unsafe { &*self.meta.as_ptr().add(index) }
    }

    fn snapshot(&self) -> (u32, u32) {
        (
            self.word(HEAD).load(Ordering::Acquire),
            self.word(TAIL).load(Ordering::Acquire),
        )
    }

    fn size_of(&self, head: u32, tail: u32) -> usize {
        if head == tail {
            0
        } else if tail < head {
            self.data_len - head as usize + tail as usize
        } else {
            (tail - head) as usize
        }
    }

    /// Length of the data area.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Bytes currently buffered.
    pub fn size(&self) -> usize {
        let (h, t) = self.snapshot();
        self.size_of(h, t)
    }

    /// Bytes writable right now.
    pub fn capacity(&self) -> usize {
        self.data_len - self.size() - 1
    }

    /// Largest payload that can ever fit.
    pub fn max_payload(&self) -> usize {
        self.data_len - 1
    }

    pub fn is_empty(&self) -> bool {
        let (h, t) = self.snapshot();
        h == t
    }

    /// Zero the control block (empty ring). Only safe protocol-wise while
    /// no peer is attached.
    pub fn reset(&self) {
        self.word(HEAD).store(0, Ordering::Release);
        self.word(TAIL).store(0, Ordering::Release);
        self.word(WRITER_FLAG).store(0, Ordering::Release);
    }

    /// Condition variable on `tail`, signaled after every write.
    pub fn readable_cv(&self) -> &ConditionVariable {
        &self.readable
    }

    /// Condition variable on `head`, signaled after every read.
    pub fn writable_cv(&self) -> &ConditionVariable {
        &self.writable
    }

    /// Write all of `data` or nothing. Returns bytes written (0 on a full
    /// ring, an empty payload, or writer contention).
    pub fn try_write(&self, data: &[u8]) -> usize {
        let len = data.len();
        let (h, t) = self.snapshot();
        if len == 0 || len > self.data_len - self.size_of(h, t) - 1 {
            return 0;
        }

        if self.word(WRITER_FLAG).fetch_add(1, Ordering::AcqRel) != 0 {
            // Another writer is mid-flight; its final store clears the flag
            // for everyone, so the loser just reports no progress.
            return 0;
        }

        // Cursors may have moved before the claim landed; re-read under it
        let (h, t) = self.snapshot();
        if len > self.data_len - self.size_of(h, t) - 1 {
            self.word(WRITER_FLAG).store(0, Ordering::Release);
            return 0;
        }

        let start = t as usize;
        let first = len.min(self.data_len - start);
        // SAFETY: [start, start+first) and [0, len-first) lie in the data
        // area and are unpublished until the tail store below.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.data.as_ptr().add(start), first);
            if first < len {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), self.data.as_ptr(), len - first);
            }
        }

        let next = ((start + len) % self.data_len) as u32;
        self.word(TAIL).store(next, Ordering::Release);
        self.word(WRITER_FLAG).store(0, Ordering::Release);
        self.readable.notify_all();
        len
    }

    /// Fill all of `dest` or nothing. Returns bytes read (0 when fewer than
    /// `dest.len()` bytes are buffered, on an empty `dest`, or when another
    /// reader won the head race).
    pub fn try_read(&self, dest: &mut [u8]) -> usize {
        let len = dest.len();
        let (h, t) = self.snapshot();
        if len == 0 || self.size_of(h, t) < len {
            return 0;
        }

        let start = h as usize;
        let first = len.min(self.data_len - start);
        // SAFETY: the bytes are published (between head and tail) and stay
        // valid until some reader advances head, which only happens below.
        unsafe {
            ptr::copy_nonoverlapping(self.data.as_ptr().add(start), dest.as_mut_ptr(), first);
            if first < len {
                ptr::copy_nonoverlapping(self.data.as_ptr(), dest.as_mut_ptr().add(first), len - first);
            }
        }

        let next = ((start + len) % self.data_len) as u32;
        match self
            .word(HEAD)
            .compare_exchange(h, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => {
                self.writable.notify_all();
                len
            }
            // Another reader advanced head first; the copy is discarded
            Err(_) => 0,
        }
    }

    /// Byte at logical position `pos` past the read cursor, if buffered.
    pub fn peek(&self, pos: usize) -> Option<u8> {
        let (h, t) = self.snapshot();
        if pos >= self.size_of(h, t) {
            return None;
        }
        let at = (h as usize + pos) % self.data_len;
        // SAFETY: `at` lies in the published range.
        Some(unsafe { self.data.as_ptr().add(at).read() })
    }

    /// Copy up to `n` buffered bytes without advancing the read cursor.
    pub fn scan(&self, n: usize) -> Vec<u8> {
        let (h, t) = self.snapshot();
        let take = n.min(self.size_of(h, t));
        let mut out = vec![0u8; take];
        let start = h as usize;
        let first = take.min(self.data_len - start);
        // SAFETY: the range is published and head only moves via try_read.
        unsafe {
            ptr::copy_nonoverlapping(self.data.as_ptr().add(start), out.as_mut_ptr(), first);
            if first < take {
                ptr::copy_nonoverlapping(self.data.as_ptr(), out.as_mut_ptr().add(first), take - first);
            }
        }
        out
    }

    /// Blocking [`RingBuffer::try_write`]. A zero timeout tries once;
    /// elapsing returns 0 bytes transferred.
    pub fn write(&self, data: &[u8], timeout: Duration) -> usize {
        if data.is_empty() || data.len() > self.max_payload() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.writable.value();
            let n = self.try_write(data);
            if n > 0 {
                return n;
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return 0;
            };
            self.writable.wait(expect, remaining.min(WAIT_SLICE));
        }
    }

    /// Blocking [`RingBuffer::try_read`] with the same timeout contract.
    pub fn read(&self, dest: &mut [u8], timeout: Duration) -> usize {
        if dest.is_empty() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.readable.value();
            let n = self.try_read(dest);
            if n > 0 {
                return n;
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return 0;
            };
            self.readable.wait(expect, remaining.min(WAIT_SLICE));
        }
    }

    /// Block until at least `n` bytes are visible or `timeout` elapses.
    pub fn sleep_until_readable(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.readable.value();
            if self.size() >= n {
                return true;
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return false;
            };
            self.readable.wait(expect, remaining.min(WAIT_SLICE));
        }
    }

    /// Async mirror of [`RingBuffer::write`].
    pub async fn write_async(&self, data: &[u8], timeout: Duration) -> usize {
        if data.is_empty() || data.len() > self.max_payload() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.writable.value();
            let n = self.try_write(data);
            if n > 0 {
                return n;
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return 0;
            };
            self.writable.wait_async(expect, remaining.min(WAIT_SLICE)).await;
        }
    }

    /// Async mirror of [`RingBuffer::read`].
    pub async fn read_async(&self, dest: &mut [u8], timeout: Duration) -> usize {
        if dest.is_empty() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.readable.value();
            let n = self.try_read(dest);
            if n > 0 {
                return n;
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return 0;
            };
            self.readable.wait_async(expect, remaining.min(WAIT_SLICE)).await;
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (h, t) = self.snapshot();
        f.debug_struct("RingBuffer")
            .field("data_len", &self.data_len)
            .field("head", &h)
            .field("tail", &t)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(data_len: usize) -> RingBuffer {
        let region = SharedRegion::anonymous(META_BYTES + data_len).unwrap();
        RingBuffer::new(region, 0).unwrap()
    }

    #[test]
    fn test_layout_validation() {
        let region = SharedRegion::anonymous(64).unwrap();
        assert!(RingBuffer::new(region.clone(), 2).is_err()); // misaligned
        assert!(RingBuffer::new(region.clone(), 60).is_err()); // too small
        assert!(RingBuffer::new(region.clone(), 0).is_ok());

        // Odd data area is rejected
        let odd = SharedRegion::anonymous(META_BYTES + 7).unwrap();
        assert!(matches!(
            RingBuffer::new(odd, 0),
            Err(ShmError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_state_invariant_holds() {
        let ring = ring(16);
        assert!(ring.is_empty());
        assert_eq!(ring.capacity() + ring.size() + 1, ring.data_len());

        assert_eq!(ring.try_write(&[1, 2, 3]), 3);
        assert_eq!(ring.size(), 3);
        assert_eq!(ring.capacity() + ring.size() + 1, ring.data_len());
        assert!(!ring.is_empty());

        let mut out = [0u8; 3];
        assert_eq!(ring.try_read(&mut out), 3);
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), ring.max_payload());
    }

    #[test]
    fn test_rejects_oversize_and_empty_writes() {
        let ring = ring(16);
        assert_eq!(ring.try_write(&[]), 0);
        // Capacity is data_len - 1
        assert_eq!(ring.try_write(&[0u8; 16]), 0);
        assert_eq!(ring.try_write(&[0u8; 15]), 15);
        assert_eq!(ring.try_write(&[1]), 0); // now full
    }

    #[test]
    fn test_short_reads_return_zero() {
        let ring = ring(16);
        assert_eq!(ring.try_write(&[1, 2]), 2);
        let mut big = [0u8; 5];
        assert_eq!(ring.try_read(&mut big), 0);
        let mut exact = [0u8; 2];
        assert_eq!(ring.try_read(&mut exact), 2);
        assert_eq!(exact, [1, 2]);
    }

    #[test]
    fn test_wrap_split_write_and_read() {
        // 16-byte data area: write 10, read 8, write 10 (splits at the
        // wrap), then one 10-byte read reassembles both halves.
        let ring = ring(16);
        let first: Vec<u8> = (0..10).collect();
        assert_eq!(ring.try_write(&first), 10);

        let mut sink = [0u8; 8];
        assert_eq!(ring.try_read(&mut sink), 8);
        assert_eq!(&sink[..], &first[..8]);

        let second: Vec<u8> = (100..110).collect();
        assert_eq!(ring.try_write(&second), 10);

        let mut out = [0u8; 10];
        assert_eq!(ring.try_read(&mut out), 10);
        assert_eq!(&out[..2], &first[8..]);
        assert_eq!(&out[2..], &second[..8]);

        let mut rest = [0u8; 2];
        assert_eq!(ring.try_read(&mut rest), 2);
        assert_eq!(&rest[..], &second[8..]);
    }

    #[test]
    fn test_peek_and_scan_do_not_advance() {
        let ring = ring(16);
        ring.try_write(&[9, 8, 7]);
        assert_eq!(ring.peek(0), Some(9));
        assert_eq!(ring.peek(2), Some(7));
        assert_eq!(ring.peek(3), None);
        assert_eq!(ring.scan(2), vec![9, 8]);
        assert_eq!(ring.scan(10), vec![9, 8, 7]);
        assert_eq!(ring.size(), 3);
    }

    #[test]
    fn test_blocking_timeouts_return_zero() {
        let ring = ring(16);
        let mut out = [0u8; 1];
        assert_eq!(ring.read(&mut out, Duration::from_millis(30)), 0);

        assert_eq!(ring.try_write(&[0u8; 15]), 15);
        assert_eq!(ring.write(&[1], Duration::from_millis(30)), 0);
        // A payload that can never fit fails fast
        assert_eq!(ring.write(&[0u8; 40], Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_sleep_until_readable() {
        let ring = Arc::new(ring(64));
        assert!(!ring.sleep_until_readable(1, Duration::from_millis(20)));

        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                assert_eq!(ring.try_write(&[1, 2, 3, 4]), 4);
            })
        };
        assert!(ring.sleep_until_readable(4, Duration::from_secs(5)));
        producer.join().unwrap();
    }

    #[test]
    fn test_spsc_threads_preserve_byte_order() {
        let region = SharedRegion::anonymous(META_BYTES + 256).unwrap();
        let ring = Arc::new(RingBuffer::new(region, 0).unwrap());
        const ROUNDS: usize = 2000;

        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..ROUNDS {
                    let chunk = [(i % 251) as u8; 5];
                    while ring.try_write(&chunk) == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut chunk = [0u8; 5];
        for i in 0..ROUNDS {
            while ring.try_read(&mut chunk) == 0 {
                std::thread::yield_now();
            }
            assert_eq!(chunk, [(i % 251) as u8; 5], "round {i}");
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_write_read_pair() {
        let ring = Arc::new(ring(32));
        let writer = {
            let ring = ring.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ring.write_async(b"ping", Duration::from_secs(1)).await
            })
        };

        let mut out = [0u8; 4];
        let n = ring.read_async(&mut out, Duration::from_secs(1)).await;
        assert_eq!(n, 4);
        assert_eq!(&out, b"ping");
        assert_eq!(writer.await.unwrap(), 4);
    }
}
