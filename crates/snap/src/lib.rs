//! SNAP: the device-to-device protocol of the kit.
//!
//! A [`Snap`] context owns the attached network interfaces and the
//! registered services. Frames arriving on a [`NetIf`] are decoded,
//! dispatched to the [`Service`] named in the header and answered with an
//! ACK or NACK carrying the request's transaction id.

pub mod error;
pub mod frame;
pub mod netif;
pub mod service;
pub mod services;
pub mod snap;
pub mod wait;

pub use error::{SnapError, SnapResult};
pub use frame::{tag_str, Flags, Frame, FrameHeader, Tag, FRAME_HEADER_SIZE, SNAP_ETHER_TYPE};
pub use netif::{Framing, NetIf, RxSink};
pub use service::{Incoming, Reply, Service};
pub use snap::{Snap, SnapStats};
pub use wait::{ClientWait, Collector, WaitOutcome};
