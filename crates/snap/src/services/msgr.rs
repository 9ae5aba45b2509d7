//! MSGR: opaque application data between devices and a messenger bridge.

use crate::error::{SnapError, SnapResult};
use crate::frame::{tag_str, Tag, FRAME_HEADER_SIZE};
use crate::service::{Incoming, Reply, Service};
use crate::snap::Snap;
use crate::wait::Collector;
use iotkit_core::{MacAddr, WireReader, WireWriter};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const MSGR_SERVICE_ID: Tag = *b"MSGR";

pub const MSGR_SNOT: Tag = *b"SNOT";
pub const MSGR_ENUM: Tag = *b"ENUM";
pub const MSGR_GETD: Tag = *b"GETD";
pub const MSGR_SETD: Tag = *b"SETD";
pub const MSGR_STAT: Tag = *b"STAT";
pub const MSGR_POLL: Tag = *b"POLL";

/// Data payload shared by GETD, SETD and STAT: size u32 + data
pub fn encode_data(data: &[u8]) -> SnapResult<Vec<u8>> {
    let size = u32::try_from(data.len())
        .map_err(|_| SnapError::InvalidArgument("data too large".to_string()))?;
    let mut w = WireWriter::with_capacity(4 + data.len());
    w.u32(size).bytes(data);
    Ok(w.into_vec())
}

pub fn decode_data(payload: &[u8]) -> SnapResult<Vec<u8>> {
    let mut r = WireReader::new(payload);
    let size = r.u32()? as usize;
    let data = r.bytes(size)?.to_vec();
    r.finish()?;
    Ok(data)
}

fn decode_mac(payload: &[u8]) -> SnapResult<MacAddr> {
    let mut r = WireReader::new(payload);
    let mac = MacAddr::decode(&mut r)?;
    r.finish()?;
    Ok(mac)
}

/// POLL request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgrPoll {
    pub enable: bool,
    pub period: u16,
    pub recipient: MacAddr,
}

impl MsgrPoll {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(9);
        w.u8(u8::from(self.enable)).u16(self.period);
        self.recipient.encode(&mut w);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let poll = Self {
            enable: r.u8()? != 0,
            period: r.u16()?,
            recipient: MacAddr::decode(&mut r)?,
        };
        r.finish()?;
        Ok(poll)
    }
}

/// Broadcast MSGR SNOT
pub fn msgr_start_notification(snap: &Snap) -> SnapResult<()> {
    let mut w = WireWriter::with_capacity(6);
    snap.mac_addr().encode(&mut w);
    snap.broadcast_request(MSGR_SERVICE_ID, MSGR_SNOT, &w.into_vec())?;
    Ok(())
}

/// Device data source and sink.
pub trait MsgrServerHandler: Send + Sync {
    /// Current data, at most `max` bytes
    fn get_data(&self, max: usize) -> SnapResult<Vec<u8>>;

    fn set_data(&self, data: &[u8]) -> SnapResult<()>;
}

#[derive(Debug, Default)]
struct MsgrPollState {
    enable: bool,
    period: u16,
    counter: u16,
    recipient: MacAddr,
}

/// Device side of MSGR.
pub struct MsgrServer {
    handler: Arc<dyn MsgrServerHandler>,
    poll: Mutex<MsgrPollState>,
}

impl std::fmt::Debug for MsgrServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgrServer").finish_non_exhaustive()
    }
}

impl MsgrServer {
    pub fn new(handler: Arc<dyn MsgrServerHandler>) -> Self {
        Self {
            handler,
            poll: Mutex::new(MsgrPollState::default()),
        }
    }

    fn data_payload(&self, snap: &Snap) -> SnapResult<Vec<u8>> {
        let max = snap
            .config()
            .max_packet_size
            .saturating_sub(FRAME_HEADER_SIZE + 4);
        let data = self.handler.get_data(max)?;
        if data.len() > max {
            return Err(SnapError::BufferTooSmall {
                needed: data.len(),
                limit: max,
            });
        }
        encode_data(&data)
    }

    fn on_poll(&self, payload: &[u8]) -> SnapResult<Reply> {
        let request = MsgrPoll::decode(payload)?;
        let mut poll = self
            .poll
            .lock()
            .map_err(|_| SnapError::LockPoisoned("msgr poll"))?;
        *poll = MsgrPollState {
            enable: request.enable,
            period: request.period,
            counter: 0,
            recipient: request.recipient,
        };
        info!(enable = request.enable, period = request.period, recipient = %request.recipient, "MSGR polling changed");
        Ok(Reply::empty())
    }

    fn poll_due(&self) -> Option<MacAddr> {
        let mut poll = self.poll.lock().ok()?;
        if !poll.enable {
            return None;
        }
        poll.counter = poll.counter.saturating_add(1);
        if poll.counter < poll.period {
            return None;
        }
        poll.counter = 0;
        Some(poll.recipient)
    }
}

impl Service for MsgrServer {
    fn id(&self) -> Tag {
        MSGR_SERVICE_ID
    }

    fn request_process(&self, snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        match request.element {
            MSGR_SNOT | MSGR_STAT => Ok(Reply::NoResponse),
            MSGR_ENUM => {
                let mut w = WireWriter::with_capacity(6);
                snap.netif_mac(request.netif)?.encode(&mut w);
                Ok(Reply::Data(w.into_vec()))
            }
            MSGR_GETD => Ok(Reply::Data(self.data_payload(snap)?)),
            MSGR_SETD => {
                let data = decode_data(request.payload)?;
                self.handler.set_data(&data)?;
                debug!(size = data.len(), src = %request.src, "MSGR data set");
                Ok(Reply::empty())
            }
            MSGR_POLL => self.on_poll(request.payload),
            element => Err(SnapError::UnsupportedElement {
                service: tag_str(&MSGR_SERVICE_ID),
                element: tag_str(&element),
            }),
        }
    }

    fn periodic_process(&self, snap: &Snap) {
        let Some(recipient) = self.poll_due() else {
            return;
        };
        let sent = self
            .data_payload(snap)
            .and_then(|payload| snap.send_request(None, recipient, MSGR_SERVICE_ID, MSGR_STAT, &payload));
        if let Err(e) = sent {
            warn!(error = %e, "MSGR STAT push failed");
        }
    }
}

/// Receives MSGR reports on the bridge.
pub trait MsgrClientHandler: Send + Sync {
    fn device_started(&self, _mac: MacAddr) {}

    fn device_data(&self, _mac: MacAddr, _data: &[u8]) {}
}

/// Bridge side of MSGR.
pub struct MsgrClient {
    handler: Option<Arc<dyn MsgrClientHandler>>,
    devices: Collector<MacAddr>,
}

impl std::fmt::Debug for MsgrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgrClient")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl MsgrClient {
    pub fn new(handler: Option<Arc<dyn MsgrClientHandler>>, max_devices: usize) -> Self {
        Self {
            handler,
            devices: Collector::new(max_devices),
        }
    }

    pub fn enum_devices(&self, snap: &Snap, wait_ms: u64) -> SnapResult<Vec<MacAddr>> {
        self.devices.start()?;
        if let Err(e) = snap.broadcast_request(MSGR_SERVICE_ID, MSGR_ENUM, &[]) {
            self.devices.cancel();
            return Err(e);
        }
        self.devices.finish(wait_ms)
    }

    /// Ask for data; the answer reaches the handler
    pub fn get_data(&self, snap: &Snap, mac: MacAddr) -> SnapResult<()> {
        snap.send_request(None, mac, MSGR_SERVICE_ID, MSGR_GETD, &[])?;
        Ok(())
    }

    pub fn set_data(&self, snap: &Snap, mac: MacAddr, data: &[u8]) -> SnapResult<()> {
        snap.send_request(None, mac, MSGR_SERVICE_ID, MSGR_SETD, &encode_data(data)?)?;
        Ok(())
    }

    pub fn set_polling(
        &self,
        snap: &Snap,
        mac: MacAddr,
        enable: bool,
        period: u16,
        recipient: MacAddr,
    ) -> SnapResult<()> {
        let poll = MsgrPoll {
            enable,
            period,
            recipient,
        };
        snap.send_request(None, mac, MSGR_SERVICE_ID, MSGR_POLL, &poll.encode())?;
        Ok(())
    }
}

impl Service for MsgrClient {
    fn id(&self) -> Tag {
        MSGR_SERVICE_ID
    }

    fn request_process(&self, _snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        if let Some(handler) = &self.handler {
            match request.element {
                MSGR_SNOT => handler.device_started(decode_mac(request.payload)?),
                MSGR_STAT => handler.device_data(request.src, &decode_data(request.payload)?),
                _ => {}
            }
        }
        Ok(Reply::NoResponse)
    }

    fn response_process(&self, _snap: &Snap, response: &Incoming<'_>) -> SnapResult<()> {
        if !response.is_ack() {
            debug!(element = %response.element_str(), src = %response.src, "MSGR request rejected");
            return Ok(());
        }
        match response.element {
            MSGR_ENUM => self.devices.push(decode_mac(response.payload)?),
            MSGR_GETD => {
                let data = decode_data(response.payload)?;
                if let Some(handler) = &self.handler {
                    handler.device_data(response.src, &data);
                }
            }
            _ => {}
        }
        Ok(())
    }
}
