//! Service trait implemented by every SNAP service.

use crate::error::SnapResult;
use crate::frame::{tag_str, Flags, Tag};
use crate::snap::Snap;
use iotkit_core::MacAddr;

/// Received frame as seen by a service.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a> {
    /// Netif the frame arrived on
    pub netif: usize,
    pub src: MacAddr,
    pub dst: MacAddr,
    pub transaction_id: u16,
    pub element: Tag,
    pub flags: Flags,
    pub payload: &'a [u8],
}

impl Incoming<'_> {
    pub fn element_str(&self) -> String {
        tag_str(&self.element)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.is_ack() && !self.flags.is_nack()
    }
}

/// Outcome of a request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer with ACK carrying this payload
    Data(Vec<u8>),
    /// Send nothing
    NoResponse,
}

impl Reply {
    pub fn empty() -> Self {
        Reply::Data(Vec::new())
    }
}

/// A SNAP service. Handlers run on the receive path and must not block.
pub trait Service: Send + Sync {
    fn id(&self) -> Tag;

    /// Handle a request. An error is answered with an empty NACK.
    fn request_process(&self, snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply>;

    /// Handle an ACK or NACK for a request this device sent
    fn response_process(&self, _snap: &Snap, _response: &Incoming<'_>) -> SnapResult<()> {
        Ok(())
    }

    /// Called once per scheduler tick
    fn periodic_process(&self, _snap: &Snap) {}
}
