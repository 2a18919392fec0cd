//! Append-only record journal.
//!
//! A [`Journal`] owns one native file and writes records as frames
//! (`header | schema blob? | body`, see [`crate::frame`]). Opening replays
//! existing content once: every frame advances the recovered write
//! position, and frames the projection claims are decoded and fed to
//! `handle` in file order. After open, writes are gathered into a single
//! `writev` per batch; a batch either lands whole or fails with
//! [`JournalError::ShortWrite`] without advancing the write position.
//!
//! The journal is single-threaded per instance. Any number of independent
//! cursors may walk the same file concurrently, each over its own native
//! handle or a clone of this one.

use std::collections::HashMap;
use std::io::IoSlice;
use std::sync::{Arc, Mutex};

use record_codec::{Record, Shape};
use tracing::{debug, info};

use crate::cursor::{CancelToken, Cursor, CursorStep, SharedRegistry};
use crate::error::{JournalError, JournalResult};
use crate::frame::FrameHeader;
use crate::native::NativeFile;

/// Chunk size for [`Journal::copy_to`].
const COPY_CHUNK: usize = 64 * 1024;

/// Application state rebuilt from the journal.
///
/// `matches` decides which frames are worth decoding; `handle` folds a
/// decoded record into the projection. Handlers run on the writing (or
/// replaying) thread, must be cheap, and must not call back into the
/// journal.
pub trait Projection: Send {
    fn matches(&self, shape: &Arc<Shape>, start: u64, end: u64) -> bool;
    fn handle(&mut self, record: &Record, start: u64, end: u64);
}

/// An append-only log of records over a native file.
pub struct Journal {
    native: Arc<dyn NativeFile>,
    registry: SharedRegistry,
    projection: Option<Box<dyn Projection>>,
    write_pos: u64,
}

impl Journal {
    /// Open without a projection.
    pub fn open(native: Arc<dyn NativeFile>) -> JournalResult<Journal> {
        Self::with_projection(native, None)
    }

    /// Open and replay the file once, feeding matched frames to
    /// `projection` before any live write happens.
    pub fn with_projection(
        native: Arc<dyn NativeFile>,
        mut projection: Option<Box<dyn Projection>>,
    ) -> JournalResult<Journal> {
        let registry: SharedRegistry = Arc::new(Mutex::new(HashMap::new()));
        let mut cursor = Cursor::new(native.clone(), registry.clone(), 0, None);
        let mut write_pos = 0u64;
        let mut replayed = 0usize;

        loop {
            // Track every frame boundary, matched or not, so the recovered
            // write position covers skipped frames too.
            let mut observed_end = write_pos;
            let step = {
                let proj = projection.as_deref();
                cursor.next_with(&mut |shape, start, end| {
                    observed_end = observed_end.max(end);
                    proj.map_or(false, |p| p.matches(shape, start, end))
                })?
            };
            write_pos = write_pos.max(observed_end);
            match step {
                CursorStep::Ready { start, item, end } => {
                    write_pos = write_pos.max(end);
                    replayed += 1;
                    if let Some(p) = projection.as_deref_mut() {
                        p.handle(&item, start, end);
                    }
                }
                CursorStep::Pending | CursorStep::Cancelled => break,
            }
        }

        info!(write_pos, replayed, "journal opened");
        Ok(Journal {
            native,
            registry,
            projection,
            write_pos,
        })
    }

    /// Byte position the next frame will start at.
    pub fn write_position(&self) -> u64 {
        self.write_pos
    }

    pub fn native(&self) -> &Arc<dyn NativeFile> {
        &self.native
    }

    /// Persist one record.
    pub fn write_one_sync(&mut self, record: &Record) -> JournalResult<()> {
        self.write_many_sync(std::slice::from_ref(record))
    }

    /// Persist a batch of records as one gathered write.
    ///
    /// Unknown schemas are serialized into their first frame and recorded
    /// in the journal's registry before the write commits. A short write
    /// fails the whole batch: the position does not advance and none of the
    /// batch's records count as persisted.
    pub fn write_many_sync(&mut self, records: &[Record]) -> JournalResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut headers = Vec::with_capacity(records.len());
        let mut blobs: Vec<Option<Vec<u8>>> = Vec::with_capacity(records.len());
        let mut spans = Vec::with_capacity(records.len());
        let mut pos = self.write_pos;
        {
            let mut registry = self.registry.lock().expect("schema registry poisoned");
            for record in records {
                let shape = record.shape();
                let id = shape.schema_id();
                let blob = if registry.contains_key(&id) {
                    None
                } else {
                    registry.insert(id, shape.clone());
                    Some(shape.canonical_json().as_bytes().to_vec())
                };
                let header = FrameHeader {
                    schema_id: id,
                    body_len: record.bytes().len() as u32,
                    schema_len: blob.as_ref().map_or(0, |b| b.len() as u32),
                };
                let frame_len = header.frame_len();
                headers.push(header.encode());
                blobs.push(blob);
                spans.push((pos, pos + frame_len));
                pos += frame_len;
            }
        }

        let expected = (pos - self.write_pos) as usize;
        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(records.len() * 3);
        for ((header, blob), record) in headers.iter().zip(blobs.iter()).zip(records.iter()) {
            slices.push(IoSlice::new(header));
            if let Some(blob) = blob {
                slices.push(IoSlice::new(blob));
            }
            slices.push(IoSlice::new(record.bytes()));
        }

        let wrote = self.native.writev_sync(&slices)?;
        if wrote != expected {
            return Err(JournalError::ShortWrite { wrote, expected });
        }
        self.write_pos = pos;
        debug!(count = records.len(), bytes = expected, "committed frames");

        if let Some(projection) = self.projection.as_deref_mut() {
            for (record, (start, end)) in records.iter().zip(spans.iter()) {
                if projection.matches(record.shape(), *start, *end) {
                    projection.handle(record, *start, *end);
                }
            }
        }
        Ok(())
    }

    /// Cursor over this journal's file starting at `position`.
    pub fn cursor(&self, position: u64) -> Cursor<Record> {
        Cursor::new(self.native.clone(), self.registry.clone(), position, None)
    }

    /// Cursor with a cancellation token.
    pub fn cursor_with_cancel(&self, position: u64, cancel: CancelToken) -> Cursor<Record> {
        Cursor::new(
            self.native.clone(),
            self.registry.clone(),
            position,
            Some(cancel),
        )
    }

    /// Stream the raw file into `target` from offset 0, stopping at the
    /// first pending signal. Returns total bytes transferred.
    pub fn copy_to(&self, target: &dyn NativeFile) -> JournalResult<u64> {
        let mut pos = 0u64;
        loop {
            let chunk = self.native.peek(COPY_CHUNK, pos)?;
            if chunk.is_empty() {
                break;
            }
            let wrote = target.write_sync(&chunk)?;
            if wrote != chunk.len() {
                return Err(JournalError::ShortWrite {
                    wrote,
                    expected: chunk.len(),
                });
            }
            pos += chunk.len() as u64;
        }
        debug!(bytes = pos, "copied journal");
        Ok(pos)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("write_pos", &self.write_pos)
            .field("has_projection", &self.projection.is_some())
            .finish()
    }
}
