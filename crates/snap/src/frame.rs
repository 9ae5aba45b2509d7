//! SNAP frame layout.
//!
//! ```text
//! [dst_mac(6) src_mac(6) type(2)]
//! [transaction_id(2) service_id(4) element_id(4) flags(2) content_size(2)]
//! [payload]
//! ```

use crate::error::{SnapError, SnapResult};
use iotkit_core::wire::len_u16;
use iotkit_core::{CoreError, MacAddr, WireReader, WireWriter};
use std::fmt;

/// Ethernet-like type carried by every SNAP frame
pub const SNAP_ETHER_TYPE: u16 = 0xABCD;
/// dst + src + type
pub const ETHER_HEADER_SIZE: usize = 14;
/// transaction_id + service_id + element_id + flags + content_size
pub const SNAP_HEADER_SIZE: usize = 16;
pub const FRAME_HEADER_SIZE: usize = ETHER_HEADER_SIZE + SNAP_HEADER_SIZE;
/// Offset of content_size inside the frame header
pub(crate) const CONTENT_SIZE_OFFSET: usize = FRAME_HEADER_SIZE - 2;

/// 4-character service or element id
pub type Tag = [u8; 4];

/// Printable form of a service or element tag.
pub fn tag_str(tag: &Tag) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

/// Response flags; no flag means request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u16);

impl Flags {
    pub const REQUEST: Flags = Flags(0);
    pub const ACK: Flags = Flags(0x0001);
    pub const NACK: Flags = Flags(0x0002);

    pub fn is_request(&self) -> bool {
        self.0 & (Self::ACK.0 | Self::NACK.0) == 0
    }

    pub fn is_ack(&self) -> bool {
        self.0 & Self::ACK.0 != 0
    }

    pub fn is_nack(&self) -> bool {
        self.0 & Self::NACK.0 != 0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nack() {
            write!(f, "NACK")
        } else if self.is_ack() {
            write!(f, "ACK")
        } else {
            write!(f, "REQ")
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub transaction_id: u16,
    pub service_id: Tag,
    pub element_id: Tag,
    pub flags: Flags,
    pub content_size: u16,
}

impl FrameHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        self.dst.encode(w);
        self.src.encode(w);
        w.u16(SNAP_ETHER_TYPE)
            .u16(self.transaction_id)
            .bytes(&self.service_id)
            .bytes(&self.element_id)
            .u16(self.flags.0)
            .u16(self.content_size);
    }

    pub fn decode(r: &mut WireReader<'_>) -> SnapResult<Self> {
        let dst = MacAddr::decode(r)?;
        let src = MacAddr::decode(r)?;
        let ether_type = r.u16()?;
        if ether_type != SNAP_ETHER_TYPE {
            return Err(CoreError::InvalidValue {
                field: "ether type",
                value: u64::from(ether_type),
            }
            .into());
        }
        Ok(Self {
            dst,
            src,
            transaction_id: r.u16()?,
            service_id: r.array()?,
            element_id: r.array()?,
            flags: Flags(r.u16()?),
            content_size: r.u16()?,
        })
    }
}

/// Frame ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(
        dst: MacAddr,
        src: MacAddr,
        transaction_id: u16,
        service_id: Tag,
        element_id: Tag,
        flags: Flags,
        payload: Vec<u8>,
    ) -> SnapResult<Self> {
        let content_size = len_u16(payload.len(), "content_size")?;
        Ok(Self {
            header: FrameHeader {
                dst,
                src,
                transaction_id,
                service_id,
                element_id,
                flags,
                content_size,
            },
            payload,
        })
    }

    /// Encode, rejecting frames larger than `max_packet_size`
    pub fn encode(&self, max_packet_size: usize) -> SnapResult<Vec<u8>> {
        let needed = FRAME_HEADER_SIZE + self.payload.len();
        if needed > max_packet_size {
            return Err(SnapError::BufferTooSmall {
                needed,
                limit: max_packet_size,
            });
        }
        let mut w = WireWriter::with_capacity(needed);
        self.header.encode(&mut w);
        w.bytes(&self.payload);
        Ok(w.into_vec())
    }

    /// Split a received buffer into header and payload.
    ///
    /// Fails when the declared content size exceeds the bytes received;
    /// trailing bytes beyond the content are ignored.
    pub fn parse(data: &[u8]) -> SnapResult<(FrameHeader, &[u8])> {
        let mut r = WireReader::new(data);
        let header = FrameHeader::decode(&mut r)?;
        let payload = r.bytes(header.content_size as usize)?;
        Ok((header, payload))
    }
}
