//! Network interface abstraction.

use crate::error::SnapResult;
use crate::frame::{CONTENT_SIZE_OFFSET, FRAME_HEADER_SIZE};
use crate::snap::Snap;
use iotkit_core::MacAddr;
use std::sync::Weak;
use tracing::warn;

/// How a medium delivers bytes to the receive sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Every delivery is exactly one frame
    #[default]
    Datagram,
    /// Deliveries are arbitrary slices of a byte stream
    Stream,
}

/// One transport medium.
pub trait NetIf: Send + Sync {
    /// Start receiving; frames go to `sink`
    fn init(&self, sink: RxSink) -> SnapResult<()>;

    fn deinit(&self) -> SnapResult<()>;

    /// Send one frame. Blocks until the medium accepted all of it.
    fn tx(&self, data: &[u8]) -> SnapResult<()>;

    fn mac_addr(&self) -> MacAddr;

    fn framing(&self) -> Framing {
        Framing::Datagram
    }
}

/// Receive entry point handed to a netif on init.
///
/// Holds a weak reference so a netif never keeps its owner alive.
#[derive(Debug, Clone)]
pub struct RxSink {
    snap: Weak<Snap>,
    index: usize,
}

impl RxSink {
    pub(crate) fn new(snap: Weak<Snap>, index: usize) -> Self {
        Self { snap, index }
    }

    /// Index of the netif inside its owner
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hand received bytes to the protocol stack; runs dispatch synchronously
    pub fn deliver(&self, data: &[u8]) {
        match self.snap.upgrade() {
            Some(snap) => snap.receive(self.index, data),
            None => warn!(netif = self.index, "frame received after shutdown"),
        }
    }
}

/// Reassembles frames from a byte stream.
#[derive(Debug, Default)]
pub(crate) struct StreamBuffer {
    buf: Vec<u8>,
}

impl StreamBuffer {
    /// Append `data` and return every complete frame
    pub(crate) fn push(&mut self, data: &[u8], max_packet_size: usize) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.buf.len() >= FRAME_HEADER_SIZE {
            let content_size = u16::from_be_bytes([
                self.buf[CONTENT_SIZE_OFFSET],
                self.buf[CONTENT_SIZE_OFFSET + 1],
            ]) as usize;
            let total = FRAME_HEADER_SIZE + content_size;
            if total > max_packet_size {
                warn!(total, max_packet_size, "stream frame too large, buffer reset");
                self.buf.clear();
                break;
            }
            if self.buf.len() < total {
                break;
            }
            frames.push(self.buf.drain(..total).collect());
        }
        frames
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Flags, Frame};

    fn frame(payload: usize) -> Vec<u8> {
        Frame::new(MacAddr::BROADCAST, MacAddr::default(), 7, *b"INFO", *b"ENUM", Flags::REQUEST, vec![0x5A; payload])
            .unwrap()
            .encode(1024)
            .unwrap()
    }

    #[test]
    fn test_reassembles_split_frames() {
        let mut stream = StreamBuffer::default();
        let mut bytes = frame(10);
        bytes.extend(frame(3));
        assert!(stream.push(&bytes[..20], 1024).is_empty());
        let frames = stream.push(&bytes[20..45], 1024);
        assert_eq!(frames, vec![frame(10)]);
        assert_eq!(stream.len(), 5);
        assert_eq!(stream.push(&bytes[45..], 1024), vec![frame(3)]);
        assert_eq!(stream.len(), 0);
    }

    #[test]
    fn test_oversized_length_resets() {
        let mut stream = StreamBuffer::default();
        let bytes = frame(100);
        assert!(stream.push(&bytes, 64).is_empty());
        assert_eq!(stream.len(), 0);
    }
}
