//! Fixed-length circular queue of `u32` slots in shared memory.
//!
//! Same head/tail discipline as the byte ring, but element-granular:
//!
//! ```text
//! [4: head][4: tail][4 × L: slots]    capacity = L - 1
//! ```
//!
//! Writers store the value into `slots[tail]` first and then race a
//! compare-exchange on `tail`; a failed CAS simply abandons the store (the
//! slot is rewritten by whoever claims it next). Readers load `slots[head]`
//! and CAS `head` afterwards, so a value is only consumed once. A reader
//! that acquires `tail == t + 1` is guaranteed to observe the writer's
//! store in `slots[t]`.
//!
//! Non-blocking calls signal full/empty through their return value; only
//! the blocking calls raise [`ShmError::QueueFull`] / [`ShmError::QueueEmpty`],
//! and only after their timeout lapses.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::condvar::ConditionVariable;
use crate::error::{ShmError, ShmResult};
use crate::region::SharedRegion;

/// Size of the queue's atomic control block.
pub const QUEUE_META_BYTES: usize = 8;

const HEAD: usize = 0;
const TAIL: usize = 1;

/// Cap on one blocked park between attempts.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// A lock-free circular queue of `u32` values over borrowed shared memory.
pub struct SlotQueue {
    _region: Arc<SharedRegion>,
    meta: NonNull<AtomicU32>,
    slots: NonNull<AtomicU32>,
    slot_count: usize,
    /// Signaled after pushes (lives on `tail`); shifters park here.
    readable: ConditionVariable,
    /// Signaled after shifts (lives on `head`); pushers park here.
    writable: ConditionVariable,
}

// SAFETY: all shared state is atomic; slot contents are published by the
// tail CAS and consumed before the head CAS, so no slot is read and
// rewritten concurrently.
unsafe impl Send for SlotQueue {}
unsafe impl Sync for SlotQueue {}

impl SlotQueue {
    /// Attach to a queue at `offset` bytes into `region`. Every whole
    /// 4-byte slot after the control block is used; at least two slots are
    /// required (one stays reserved to tell full from empty).
    pub fn new(region: Arc<SharedRegion>, offset: usize) -> ShmResult<SlotQueue> {
        if offset % 4 != 0 {
            return Err(ShmError::InvalidLayout(format!(
                "queue offset {offset} must be 4-byte aligned"
            )));
        }
        let available = region.len().saturating_sub(offset + QUEUE_META_BYTES);
        let slot_count = available / 4;
        if slot_count < 2 {
            return Err(ShmError::InvalidLayout(format!(
                "region provides {slot_count} slots, need at least 2"
            )));
        }

        // SAFETY: the checked ranges lie inside the mapping; base and
        // offset are 4-aligned.
        let (meta, slots) = unsafe {
            let base = region.as_ptr().add(offset).cast::<AtomicU32>();
            (
                NonNull::new_unchecked(base),
                NonNull::new_unchecked(base.add(2)),
            )
        };
        // SAFETY: the words stay mapped for the queue's lifetime.
        let (readable, writable) = unsafe {
            (
                ConditionVariable::from_word(NonNull::new_unchecked(meta.as_ptr().add(TAIL))),
                ConditionVariable::from_word(NonNull::new_unchecked(meta.as_ptr().add(HEAD))),
            )
        };

        debug!(offset, slot_count, "attached slot queue");
        Ok(SlotQueue {
            _region: region,
            meta,
            slots,
            slot_count,
            readable,
            writable,
        })
    }

    fn word(&self, index: usize) -> &AtomicU32 {
        // SAFETY: head/tail words inside the mapping.
        unsafe { &*self.meta.as_ptr().add(index) }
    }

    fn slot(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index < self.slot_count);
        // SAFETY: index is reduced modulo slot_count by every caller.
        unsafe { &*self.slots.as_ptr().add(index) }
    }

    /// Slots that can hold values at once.
    pub fn capacity(&self) -> usize {
        self.slot_count - 1
    }

    /// Values currently queued.
    pub fn len(&self) -> usize {
        let h = self.word(HEAD).load(Ordering::Acquire) as usize;
        let t = self.word(TAIL).load(Ordering::Acquire) as usize;
        (t + self.slot_count - h) % self.slot_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push without blocking; `false` when full or a racing pusher won.
    pub fn try_push(&self, value: u32) -> bool {
        let t = self.word(TAIL).load(Ordering::Acquire);
        let h = self.word(HEAD).load(Ordering::Acquire);
        let next = (t + 1) % self.slot_count as u32;
        if next == h {
            return false;
        }
        // Store first; a lost CAS abandons the slot for the next claimant
        self.slot(t as usize).store(value, Ordering::Release);
        match self
            .word(TAIL)
            .compare_exchange(t, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => {
                self.readable.notify_all();
                true
            }
            Err(_) => false,
        }
    }

    /// Pop without blocking; `None` when empty or a racing reader won.
    pub fn try_shift(&self) -> Option<u32> {
        let h = self.word(HEAD).load(Ordering::Acquire);
        let t = self.word(TAIL).load(Ordering::Acquire);
        if h == t {
            return None;
        }
        let value = self.slot(h as usize).load(Ordering::Acquire);
        let next = (h + 1) % self.slot_count as u32;
        match self
            .word(HEAD)
            .compare_exchange(h, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => {
                self.writable.notify_all();
                Some(value)
            }
            Err(_) => None,
        }
    }

    /// Value `index` positions past the read cursor, without advancing.
    pub fn peek(&self, index: usize) -> Option<u32> {
        let h = self.word(HEAD).load(Ordering::Acquire) as usize;
        if index >= self.len() {
            return None;
        }
        Some(self.slot((h + index) % self.slot_count).load(Ordering::Acquire))
    }

    /// Blocking push; raises [`ShmError::QueueFull`] once `timeout` lapses.
    pub fn push(&self, value: u32, timeout: Duration) -> ShmResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.writable.value();
            if self.try_push(value) {
                return Ok(());
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return Err(ShmError::QueueFull);
            };
            self.writable.wait(expect, remaining.min(WAIT_SLICE));
        }
    }

    /// Blocking pop; raises [`ShmError::QueueEmpty`] once `timeout` lapses.
    pub fn shift(&self, timeout: Duration) -> ShmResult<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.readable.value();
            if let Some(value) = self.try_shift() {
                return Ok(value);
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return Err(ShmError::QueueEmpty);
            };
            self.readable.wait(expect, remaining.min(WAIT_SLICE));
        }
    }

    /// Async mirror of [`SlotQueue::push`].
    pub async fn push_async(&self, value: u32, timeout: Duration) -> ShmResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.writable.value();
            if self.try_push(value) {
                return Ok(());
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return Err(ShmError::QueueFull);
            };
            self.writable.wait_async(expect, remaining.min(WAIT_SLICE)).await;
        }
    }

    /// Async mirror of [`SlotQueue::shift`].
    pub async fn shift_async(&self, timeout: Duration) -> ShmResult<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.readable.value();
            if let Some(value) = self.try_shift() {
                return Ok(value);
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return Err(ShmError::QueueEmpty);
            };
            self.readable.wait_async(expect, remaining.min(WAIT_SLICE)).await;
        }
    }
}

impl std::fmt::Debug for SlotQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotQueue")
            .field("slot_count", &self.slot_count)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(slots: usize) -> SlotQueue {
        let region = SharedRegion::anonymous(QUEUE_META_BYTES + slots * 4).unwrap();
        SlotQueue::new(region, 0).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(8);
        for v in [3u32, 1, 4, 1, 5] {
            assert!(q.try_push(v));
        }
        assert_eq!(q.len(), 5);
        for expected in [3u32, 1, 4, 1, 5] {
            assert_eq!(q.try_shift(), Some(expected));
        }
        assert_eq!(q.try_shift(), None);
    }

    #[test]
    fn test_capacity_reserves_one_slot() {
        let q = queue(4);
        assert_eq!(q.capacity(), 3);
        assert!(q.try_push(1));
        assert!(q.try_push(2));
        assert!(q.try_push(3));
        assert!(!q.try_push(4));
        assert_eq!(q.try_shift(), Some(1));
        assert!(q.try_push(4));
    }

    #[test]
    fn test_peek_does_not_advance() {
        let q = queue(8);
        q.try_push(10);
        q.try_push(20);
        assert_eq!(q.peek(0), Some(10));
        assert_eq!(q.peek(1), Some(20));
        assert_eq!(q.peek(2), None);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_blocking_timeouts_raise() {
        let q = queue(2);
        assert!(matches!(
            q.shift(Duration::from_millis(20)),
            Err(ShmError::QueueEmpty)
        ));
        q.try_push(1);
        assert!(matches!(
            q.push(2, Duration::from_millis(20)),
            Err(ShmError::QueueFull)
        ));
    }

    #[test]
    fn test_wraparound_many_times() {
        let q = queue(4);
        for round in 0..50u32 {
            assert!(q.try_push(round));
            assert_eq!(q.try_shift(), Some(round));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_spsc_stress_preserves_sequence() {
        // One producer cycling 1..=254, one consumer; the popped sequence
        // must match exactly: no reorder, no duplicate, no gap.
        let region = SharedRegion::anonymous(1 << 20).unwrap();
        let q = Arc::new(SlotQueue::new(region, 0).unwrap());
        const ITEMS: u32 = 200_000;

        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..ITEMS {
                    let value = i % 254 + 1;
                    q.push(value, Duration::from_secs(10)).unwrap();
                }
            })
        };

        for i in 0..ITEMS {
            let value = q.shift(Duration::from_secs(10)).unwrap();
            assert_eq!(value, i % 254 + 1, "item {i}");
        }
        producer.join().unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_push_shift() {
        let q = Arc::new(queue(4));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..8 {
                    got.push(q.shift_async(Duration::from_secs(5)).await.unwrap());
                }
                got
            })
        };
        for v in 0..8u32 {
            q.push_async(v, Duration::from_secs(5)).await.unwrap();
        }
        assert_eq!(consumer.await.unwrap(), (0..8).collect::<Vec<_>>());
    }
}
