//! Lock-free shared-memory transports.
//!
//! This crate moves bytes between threads and processes over a caller-
//! supplied shared memory region using only atomic loads/stores and
//! futex-style wait/wake; no transport here ever takes a lock.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │     PacketStream     │   │      SlotQueue       │
//! │ length-prefixed      │   │ u32 slots,           │
//! │ frames               │   │ store-then-CAS       │
//! ├──────────────────────┤   ├──────────────────────┤
//! │      RingBuffer      │   │                      │
//! │ byte ring, advisory  │   │                      │
//! │ writer flag, CAS     │   │                      │
//! │ read side            │   │                      │
//! ├──────────────────────┴───┴──────────────────────┤
//! │                  SharedRegion                   │
//! │ POSIX shm / anonymous MAP_SHARED mapping        │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Blocking operations take a timeout and report it as zero progress (or a
//! typed full/empty error for the queue), never as a panic or an abort.
//! Async mirrors of every blocking wait poll cooperatively with a capped
//! backoff.
//!
//! The region is a single owning handle shared by producer and consumer;
//! transports borrow it through an `Arc` and never unlink it themselves.

pub mod condvar;
pub mod error;
pub mod packet;
pub mod queue;
pub mod region;
pub mod ring;

pub use condvar::ConditionVariable;
pub use error::{ShmError, ShmResult};
pub use packet::{PacketStream, PACKET_HEADER_BYTES};
pub use queue::{SlotQueue, QUEUE_META_BYTES};
pub use region::{region_name, SharedRegion};
pub use ring::{RingBuffer, META_BYTES};
