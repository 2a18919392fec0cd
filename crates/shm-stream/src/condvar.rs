//! Futex-style condition variable over a 32-bit word in shared memory.
//!
//! The word is one of a transport's atomic cursors; waiting parks until the
//! word's value moves away from an expected snapshot. On Linux this is the
//! `futex` syscall (wait/wake). Elsewhere on unix it degrades to polling
//! with a capped backoff, the same strategy the async variants use.
//!
//! Wakeups are best-effort and may be spurious; callers re-validate their
//! condition after every return.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Poll interval for the non-futex fallbacks.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A wait/notify handle over an atomic 32-bit word it does not own.
///
/// The word lives inside a shared memory region; the transport that created
/// this handle keeps that region alive for at least the handle's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ConditionVariable {
    word: NonNull<AtomicU32>,
}

// SAFETY: the handle only performs atomic operations on the word, and the
// futex syscall is itself thread-safe. Region lifetime is the creator's
// contract (see `ConditionVariable::from_word`).
unsafe impl Send for ConditionVariable {}
unsafe impl Sync for ConditionVariable {}

impl ConditionVariable {
    /// Wrap a word in shared memory.
    ///
    /// # Safety
    ///
    /// `word` must point to a 4-aligned, mapped `AtomicU32` that stays
    /// mapped for the lifetime of the returned handle.
    pub unsafe fn from_word(word: NonNull<AtomicU32>) -> ConditionVariable {
        ConditionVariable { word }
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: valid for the handle's lifetime per `from_word`.
        unsafe { self.word.as_ref() }
    }

    /// Current value of the word.
    pub fn value(&self) -> u32 {
        self.word().load(Ordering::Acquire)
    }

    /// Park until the word's value differs from `expect`, a notification
    /// arrives, or `timeout` elapses. Returns the value observed on exit;
    /// callers re-validate their own condition.
    pub fn wait(&self, expect: u32, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.value();
            if current != expect {
                return current;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return current;
            };
            park(self.word(), expect, remaining);
        }
    }

    /// Async mirror of [`ConditionVariable::wait`]: yields to the runtime
    /// between polls instead of parking the thread.
    pub async fn wait_async(&self, expect: u32, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.value();
            if current != expect {
                return current;
            }
            if Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        wake(self.word(), 1);
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        wake(self.word(), i32::MAX);
    }
}

#[cfg(target_os = "linux")]
fn park(word: &AtomicU32, expect: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: the word is a valid mapped AtomicU32; FUTEX_WAIT re-checks
    // the expected value atomically before sleeping.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const libc::c_int,
            libc::FUTEX_WAIT,
            expect as libc::c_int,
            &ts as *const libc::timespec,
            std::ptr::null::<libc::c_int>(),
            0,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn park(word: &AtomicU32, expect: u32, timeout: Duration) {
    // No futex; sleep-poll with a capped interval
    let _ = (word, expect);
    std::thread::sleep(timeout.min(POLL_INTERVAL));
}

#[cfg(target_os = "linux")]
fn wake(word: &AtomicU32, waiters: i32) {
    // SAFETY: waking is valid on any mapped word; extra wakes are benign.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const libc::c_int,
            libc::FUTEX_WAKE,
            waiters,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<libc::c_int>(),
            0,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn wake(_word: &AtomicU32, _waiters: i32) {
    // Pollers notice the value change on their next tick
}
