//! Append-only record journal with projection replay and resumable cursors.
//!
//! Records (see `record-codec`) persist as length-framed entries on a
//! native file handle. Opening a [`Journal`] replays the existing frames
//! once to recover the write position and rebuild a caller-supplied
//! [`Projection`]; afterwards each batch commits as a single gathered
//! write. A [`Cursor`] walks frames from any position, suspends at frame
//! boundaries when data runs out, and resumes off the file's watch
//! callbacks — including tailing a file another handle is still appending
//! to.
//!
//! ```
//! use record_codec::{registry, FieldSpec, Primitive, Record, Value};
//! use record_journal::{CursorStep, Journal, MemoryFile};
//!
//! let shape = registry::intern(
//!     Some("event"),
//!     vec![FieldSpec::new("seq", Primitive::BigUint64)],
//! )?;
//! let mut journal = Journal::open(MemoryFile::new())?;
//! journal.write_one_sync(&Record::with_values(
//!     shape,
//!     [("seq", Value::from(1u64))],
//! )?)?;
//!
//! let mut cursor = journal.cursor(0);
//! if let CursorStep::Ready { item, .. } = cursor.next()? {
//!     assert_eq!(item.get("seq")?, Value::from(1u64));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Two native file implementations ship with the crate:
//! [`MemoryFile`] (in-process buffer, inline watchers) and [`DiskFile`]
//! (pooled descriptors, block read cache, polling watcher).

pub mod cursor;
pub mod disk;
pub mod error;
pub mod frame;
pub mod journal;
pub mod memory;
pub mod native;

pub use cursor::{CancelToken, Cursor, CursorStep};
pub use disk::{DiskFile, DEFAULT_CACHE_BYTES};
pub use error::{JournalError, JournalResult};
pub use frame::{FrameHeader, FRAME_HEADER_BYTES};
pub use journal::{Journal, Projection};
pub use memory::MemoryFile;
pub use native::{FileStat, NativeFile, WatchCallback, WatchGuard};
