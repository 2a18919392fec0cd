//! Resumable, filterable iteration over a journal's frames.
//!
//! A cursor walks frames from a byte position, decoding each record whose
//! shape passes every filter. When fewer bytes than a complete frame are
//! visible the cursor reports [`CursorStep::Pending`] instead of blocking;
//! suspension only ever happens at frame boundaries. The blocking and async
//! drivers park on the native file's watch callbacks and re-check on
//! spurious wakeups.
//!
//! Schema blobs encountered in-frame are interned and recorded in the
//! journal's shared registry before the frame is decoded; a frame whose id
//! is neither established in-file nor pre-registered raises
//! [`JournalError::UnknownSchema`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use record_codec::{registry as shapes, Record, Shape};
use tracing::trace;

use crate::error::{JournalError, JournalResult};
use crate::frame::{FrameHeader, FRAME_HEADER_BYTES};
use crate::native::{NativeFile, WatchGuard};

/// Schema ids established for one journal file, shared with its cursors.
pub(crate) type SharedRegistry = Arc<Mutex<HashMap<u64, Arc<Shape>>>>;

/// Cap on one blocked park between attempts; bounds how long a lost wakeup
/// or a cancellation can go unnoticed.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// One step of cursor iteration.
#[derive(Debug)]
pub enum CursorStep<T> {
    /// A decoded frame: `[start, end)` are its file positions.
    Ready { start: u64, item: T, end: u64 },
    /// Not enough data for the next frame; wait for growth and retry.
    Pending,
    /// The cancellation token fired; iteration stopped at a boundary.
    Cancelled,
}

/// Cooperative cancellation for cursors, observed at frame boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Wake channel between watch callbacks and parked cursor drivers.
#[derive(Default)]
struct Wake {
    seq: Mutex<u64>,
    cv: Condvar,
    notify: tokio::sync::Notify,
}

impl Wake {
    fn signal(&self) {
        *self.seq.lock().expect("wake state poisoned") += 1;
        self.cv.notify_all();
        self.notify.notify_waiters();
    }

    fn wait(&self, timeout: Duration) {
        let guard = self.seq.lock().expect("wake state poisoned");
        let _ = self
            .cv
            .wait_timeout(guard, timeout)
            .expect("wake state poisoned");
    }
}

type FilterFn = Box<dyn FnMut(&Arc<Shape>, u64, u64) -> bool + Send>;

/// A resumable iterator over frames, yielding mapped records.
pub struct Cursor<T = Record> {
    native: Arc<dyn NativeFile>,
    registry: SharedRegistry,
    pos: u64,
    filters: Vec<FilterFn>,
    mapper: Box<dyn FnMut(Record) -> T + Send>,
    cancel: CancelToken,
    wake: Arc<Wake>,
    watch: Option<WatchGuard>,
}

impl Cursor<Record> {
    pub(crate) fn new(
        native: Arc<dyn NativeFile>,
        registry: SharedRegistry,
        position: u64,
        cancel: Option<CancelToken>,
    ) -> Cursor<Record> {
        Cursor {
            native,
            registry,
            pos: position,
            filters: Vec::new(),
            mapper: Box::new(|record| record),
            cancel: cancel.unwrap_or_default(),
            wake: Arc::default(),
            watch: None,
        }
    }
}

impl<T: 'static> Cursor<T> {
    /// Byte position of the next frame boundary.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Add a frame predicate; frames any filter rejects are skipped without
    /// decoding.
    pub fn filter(
        mut self,
        pred: impl FnMut(&Arc<Shape>, u64, u64) -> bool + Send + 'static,
    ) -> Cursor<T> {
        self.filters.push(Box::new(pred));
        self
    }

    /// Transform yielded items; composes with earlier maps.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U + Send + 'static) -> Cursor<U> {
        let mut mapper = self.mapper;
        Cursor {
            native: self.native,
            registry: self.registry,
            pos: self.pos,
            filters: self.filters,
            mapper: Box::new(move |record| f(mapper(record))),
            cancel: self.cancel,
            wake: self.wake,
            watch: self.watch,
        }
    }

    /// Advance one step without blocking.
    pub fn next(&mut self) -> JournalResult<CursorStep<T>> {
        self.next_with(&mut |_, _, _| true)
    }

    /// Advance one step, consulting `extra` alongside the cursor's own
    /// filters. Used by journal replay to drive the projection's `matches`
    /// while still tracking every frame boundary.
    pub(crate) fn next_with(
        &mut self,
        extra: &mut dyn FnMut(&Arc<Shape>, u64, u64) -> bool,
    ) -> JournalResult<CursorStep<T>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(CursorStep::Cancelled);
            }

            let header_bytes = self.native.peek(FRAME_HEADER_BYTES, self.pos)?;
            let Some(header) = FrameHeader::decode(&header_bytes) else {
                return Ok(CursorStep::Pending);
            };

            let start = self.pos;
            let schema_len = header.schema_len as usize;
            let body_len = header.body_len as usize;
            let body_at = start + FRAME_HEADER_BYTES as u64 + schema_len as u64;
            let end = body_at + body_len as u64;

            let mut shape = self.lookup(header.schema_id);
            if schema_len > 0 {
                if shape.is_none() {
                    let blob = self.native.peek(schema_len, start + FRAME_HEADER_BYTES as u64)?;
                    if blob.len() < schema_len {
                        return Ok(CursorStep::Pending);
                    }
                    let json = std::str::from_utf8(&blob).map_err(|e| {
                        JournalError::Codec(record_codec::CodecError::MalformedSchema(
                            e.to_string(),
                        ))
                    })?;
                    let interned = shapes::intern_json(json)?;
                    self.registry
                        .lock()
                        .expect("schema registry poisoned")
                        .insert(header.schema_id, interned.clone());
                    trace!(
                        schema_id = format_args!("{:016x}", header.schema_id),
                        position = start,
                        "registered in-file schema"
                    );
                    shape = Some(interned);
                }
                // A repeated blob for a known id is skipped unread
            }

            let Some(shape) = shape else {
                return Err(JournalError::UnknownSchema {
                    schema_id: header.schema_id,
                    position: start,
                });
            };

            let keep = self.filters.iter_mut().all(|f| f(&shape, start, end))
                && extra(&shape, start, end);
            if !keep {
                self.pos = end;
                continue;
            }

            let body = self.native.peek(body_len, body_at)?;
            if body.len() < body_len {
                // Torn tail frame; resume here once the rest lands
                return Ok(CursorStep::Pending);
            }
            let record = Record::from_vec(shape, body)?;
            self.pos = end;
            let item = (self.mapper)(record);
            return Ok(CursorStep::Ready { start, item, end });
        }
    }

    fn lookup(&self, schema_id: u64) -> Option<Arc<Shape>> {
        if let Some(shape) = self
            .registry
            .lock()
            .expect("schema registry poisoned")
            .get(&schema_id)
        {
            return Some(shape.clone());
        }
        // Fall back to shapes pre-registered process-wide
        shapes::lookup(schema_id)
    }

    fn ensure_watch(&mut self) {
        if self.watch.is_none() {
            let wake = self.wake.clone();
            self.watch = Some(self.native.watch(Arc::new(move || wake.signal())));
        }
    }

    /// Drive until the next frame, the timeout, or cancellation. Timeouts
    /// and cancellation both yield `Ok(None)`.
    pub fn next_blocking(&mut self, timeout: Duration) -> JournalResult<Option<(u64, T, u64)>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.next()? {
                CursorStep::Ready { start, item, end } => return Ok(Some((start, item, end))),
                CursorStep::Cancelled => return Ok(None),
                CursorStep::Pending => {
                    self.ensure_watch();
                    let Some(remaining) = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|d| !d.is_zero())
                    else {
                        return Ok(None);
                    };
                    self.wake.wait(remaining.min(WAIT_SLICE));
                }
            }
        }
    }

    /// Async mirror of [`Cursor::next_blocking`].
    pub async fn next_async(&mut self, timeout: Duration) -> JournalResult<Option<(u64, T, u64)>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.next()? {
                CursorStep::Ready { start, item, end } => return Ok(Some((start, item, end))),
                CursorStep::Cancelled => return Ok(None),
                CursorStep::Pending => {
                    self.ensure_watch();
                    let Some(remaining) = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|d| !d.is_zero())
                    else {
                        return Ok(None);
                    };
                    let _ = tokio::time::timeout(
                        remaining.min(WAIT_SLICE),
                        self.wake.notify.notified(),
                    )
                    .await;
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("pos", &self.pos)
            .field("filters", &self.filters.len())
            .finish()
    }
}
