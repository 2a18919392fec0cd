//! Length-prefixed packet framing over the byte ring.
//!
//! Wire format, little-endian:
//!
//! ```text
//! [4: size][4: reserved][size - 8: payload]
//! ```
//!
//! `size` counts from the first header byte, so an empty payload frames as
//! exactly 8 bytes. A packet is committed with a single ring write, which
//! makes the whole frame visible atomically: once the size word can be
//! scanned, the rest of the packet is guaranteed present.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{ShmError, ShmResult};
use crate::ring::RingBuffer;

/// Fixed packet header size.
pub const PACKET_HEADER_BYTES: usize = 8;

/// Cap on one blocked park between attempts.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Packet reader/writer over a shared ring.
///
/// The stream owns a reusable frame buffer, so steady-state reads and
/// writes do not allocate. Clone-free: each side of the transport holds its
/// own `PacketStream` over the shared [`RingBuffer`].
pub struct PacketStream {
    ring: Arc<RingBuffer>,
    scratch: Vec<u8>,
    frame_len: usize,
}

impl PacketStream {
    pub fn new(ring: Arc<RingBuffer>) -> PacketStream {
        PacketStream {
            ring,
            scratch: Vec::new(),
            frame_len: 0,
        }
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Frame `payload` and write it in one shot.
    ///
    /// `Ok(true)` once the whole packet is in the ring, `Ok(false)` when it
    /// does not fit right now (or a concurrent writer held the claim), and
    /// `PayloadTooLarge` when it can never fit.
    pub fn try_write(&mut self, payload: &[u8]) -> ShmResult<bool> {
        let total = PACKET_HEADER_BYTES + payload.len();
        if total > self.ring.max_payload() {
            return Err(ShmError::PayloadTooLarge {
                size: total,
                max: self.ring.max_payload(),
            });
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(&(total as u32).to_le_bytes());
        self.scratch.extend_from_slice(&[0u8; 4]);
        self.scratch.extend_from_slice(payload);

        let written = self.ring.try_write(&self.scratch) == total;
        if written {
            trace!(total, "wrote packet");
        }
        Ok(written)
    }

    /// Pop the next packet without blocking; `None` when no complete packet
    /// is buffered or another reader won the race.
    pub fn try_read(&mut self) -> Option<&[u8]> {
        if self.fill_next() {
            Some(&self.scratch[PACKET_HEADER_BYTES..self.frame_len])
        } else {
            None
        }
    }

    /// Read the size word and consume one whole frame into the scratch.
    fn fill_next(&mut self) -> bool {
        let head = self.ring.scan(4);
        if head.len() < 4 {
            return false;
        }
        let total = u32::from_le_bytes(head[..4].try_into().expect("4-byte scan")) as usize;
        debug_assert!(total >= PACKET_HEADER_BYTES);

        self.scratch.resize(total, 0);
        if self.ring.try_read(&mut self.scratch[..total]) == 0 {
            return false;
        }
        self.frame_len = total;
        trace!(total, "read packet");
        true
    }

    /// Blocking [`PacketStream::try_write`]; a timeout returns `Ok(false)`.
    pub fn write(&mut self, payload: &[u8], timeout: Duration) -> ShmResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.ring.writable_cv().value();
            if self.try_write(payload)? {
                return Ok(true);
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return Ok(false);
            };
            self.ring.writable_cv().wait(expect, remaining.min(WAIT_SLICE));
        }
    }

    /// Blocking [`PacketStream::try_read`]; a timeout returns `None`.
    pub fn read(&mut self, timeout: Duration) -> Option<&[u8]> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.ring.readable_cv().value();
            if self.fill_next() {
                break;
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())?;
            self.ring.readable_cv().wait(expect, remaining.min(WAIT_SLICE));
        }
        Some(&self.scratch[PACKET_HEADER_BYTES..self.frame_len])
    }

    /// Async mirror of [`PacketStream::write`].
    pub async fn write_async(&mut self, payload: &[u8], timeout: Duration) -> ShmResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.ring.writable_cv().value();
            if self.try_write(payload)? {
                return Ok(true);
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return Ok(false);
            };
            self.ring
                .writable_cv()
                .wait_async(expect, remaining.min(WAIT_SLICE))
                .await;
        }
    }

    /// Async mirror of [`PacketStream::read`].
    pub async fn read_async(&mut self, timeout: Duration) -> Option<&[u8]> {
        let deadline = Instant::now() + timeout;
        loop {
            let expect = self.ring.readable_cv().value();
            if self.fill_next() {
                break;
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())?;
            self.ring
                .readable_cv()
                .wait_async(expect, remaining.min(WAIT_SLICE))
                .await;
        }
        Some(&self.scratch[PACKET_HEADER_BYTES..self.frame_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedRegion;
    use crate::ring::META_BYTES;

    fn stream_pair(data_len: usize) -> (PacketStream, PacketStream) {
        let region = SharedRegion::anonymous(META_BYTES + data_len).unwrap();
        let ring = Arc::new(RingBuffer::new(region, 0).unwrap());
        (PacketStream::new(ring.clone()), PacketStream::new(ring))
    }

    #[test]
    fn test_packet_roundtrip() {
        let (mut tx, mut rx) = stream_pair(256);
        assert!(tx.try_write(b"hello packet").unwrap());
        assert_eq!(rx.try_read().unwrap(), b"hello packet");
        assert!(rx.try_read().is_none());
    }

    #[test]
    fn test_empty_payload_frames_as_header_only() {
        let (mut tx, mut rx) = stream_pair(64);
        assert!(tx.try_write(b"").unwrap());
        assert_eq!(tx.ring().size(), PACKET_HEADER_BYTES);
        assert_eq!(rx.try_read().unwrap(), b"");
    }

    #[test]
    fn test_packets_preserve_boundaries() {
        let (mut tx, mut rx) = stream_pair(256);
        for payload in [&b"one"[..], b"two-2", b"three-33"] {
            assert!(tx.try_write(payload).unwrap());
        }
        assert_eq!(rx.try_read().unwrap(), b"one");
        assert_eq!(rx.try_read().unwrap(), b"two-2");
        assert_eq!(rx.try_read().unwrap(), b"three-33");
    }

    #[test]
    fn test_oversize_payload_is_an_error() {
        let (mut tx, _rx) = stream_pair(32);
        let huge = vec![0u8; 64];
        assert!(matches!(
            tx.try_write(&huge),
            Err(ShmError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_full_ring_returns_false_not_error() {
        let (mut tx, mut rx) = stream_pair(32);
        assert!(tx.try_write(&[7u8; 16]).unwrap());
        // Second packet of the same size cannot fit in the remaining space
        assert!(!tx.try_write(&[8u8; 16]).unwrap());

        assert_eq!(rx.try_read().unwrap(), &[7u8; 16][..]);
        assert!(tx.try_write(&[8u8; 16]).unwrap());
    }

    #[test]
    fn test_blocking_read_wakes_on_write() {
        let region = SharedRegion::anonymous(META_BYTES + 128).unwrap();
        let ring = Arc::new(RingBuffer::new(region, 0).unwrap());
        let mut rx = PacketStream::new(ring.clone());

        let producer = std::thread::spawn(move || {
            let mut tx = PacketStream::new(ring);
            std::thread::sleep(Duration::from_millis(20));
            tx.write(b"late", Duration::from_secs(1)).unwrap()
        });

        assert_eq!(rx.read(Duration::from_secs(5)).unwrap(), b"late");
        assert!(producer.join().unwrap());
        assert!(rx.read(Duration::from_millis(20)).is_none());
    }
}
