//! INFO: device discovery, general information and statistics.

use crate::error::{SnapError, SnapResult};
use crate::frame::{tag_str, Tag};
use crate::service::{Incoming, Reply, Service};
use crate::services::fldt::FldtClient;
use crate::snap::Snap;
use crate::wait::Collector;
use iotkit_core::{
    DeviceRoles, FileVersion, MacAddr, WireReader, WireWriter, DEVICE_TYPE_SIZE,
    MANUFACTURE_ID_SIZE,
};
use iotkit_provision::{TrustListManager, UpdateFileType, UpdateInterface};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const INFO_SERVICE_ID: Tag = *b"INFO";

pub const INFO_SNOT: Tag = *b"SNOT";
pub const INFO_ENUM: Tag = *b"ENUM";
pub const INFO_GINF: Tag = *b"GINF";
pub const INFO_STAT: Tag = *b"STAT";
pub const INFO_POLL: Tag = *b"POLL";

/// POLL element bits
pub const INFO_GENERAL: u32 = 0x0001;
pub const INFO_STATISTICS: u32 = 0x0002;

/// ENUM answer and SNOT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumElement {
    pub roles: DeviceRoles,
    pub mac: MacAddr,
}

impl EnumElement {
    fn local(snap: &Snap) -> Self {
        Self {
            roles: snap.identity().roles,
            mac: snap.mac_addr(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(10);
        w.u32(self.roles.bits());
        self.mac.encode(&mut w);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let element = Self {
            roles: DeviceRoles(r.u32()?),
            mac: MacAddr::decode(&mut r)?,
        };
        r.finish()?;
        Ok(element)
    }
}

/// GINF payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralInfo {
    pub manufacture_id: [u8; MANUFACTURE_ID_SIZE],
    pub device_type: [u8; DEVICE_TYPE_SIZE],
    pub mac: MacAddr,
    pub fw_version: FileVersion,
    pub tl_version: FileVersion,
    pub roles: DeviceRoles,
}

impl GeneralInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.bytes(&self.manufacture_id).bytes(&self.device_type);
        self.mac.encode(&mut w);
        self.fw_version.encode(&mut w);
        self.tl_version.encode(&mut w);
        w.u32(self.roles.bits());
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let info = Self {
            manufacture_id: r.array()?,
            device_type: r.array()?,
            mac: MacAddr::decode(&mut r)?,
            fw_version: FileVersion::decode(&mut r)?,
            tl_version: FileVersion::decode(&mut r)?,
            roles: DeviceRoles(r.u32()?),
        };
        r.finish()?;
        Ok(info)
    }
}

/// STAT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatInfo {
    pub sent: u32,
    pub received: u32,
    pub mac: MacAddr,
}

impl StatInfo {
    fn local(snap: &Snap) -> Self {
        let stats = snap.stats();
        Self {
            sent: stats.sent,
            received: stats.received,
            mac: snap.mac_addr(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(14);
        w.u32(self.sent).u32(self.received);
        self.mac.encode(&mut w);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let stat = Self {
            sent: r.u32()?,
            received: r.u32()?,
            mac: MacAddr::decode(&mut r)?,
        };
        r.finish()?;
        Ok(stat)
    }
}

/// POLL request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    pub elements: u32,
    pub enable: bool,
    pub period: u16,
    pub recipient: MacAddr,
}

impl PollRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(13);
        w.u32(self.elements).u8(u8::from(self.enable)).u16(self.period);
        self.recipient.encode(&mut w);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let poll = Self {
            elements: r.u32()?,
            enable: r.u8()? != 0,
            period: r.u16()?,
            recipient: MacAddr::decode(&mut r)?,
        };
        r.finish()?;
        Ok(poll)
    }
}

/// Broadcast SNOT so listeners learn this device started
pub fn start_notification(snap: &Snap) -> SnapResult<()> {
    snap.broadcast_request(INFO_SERVICE_ID, INFO_SNOT, &EnumElement::local(snap).encode())?;
    debug!(mac = %snap.mac_addr(), "SNOT broadcast");
    Ok(())
}

pub type StartNotificationCallback = Arc<dyn Fn(&EnumElement) + Send + Sync>;

#[derive(Debug, Default)]
struct PollState {
    elements: u32,
    period: u16,
    counter: u16,
    recipient: MacAddr,
}

/// Device side of INFO.
pub struct InfoServer {
    firmware: Option<(UpdateFileType, Arc<dyn UpdateInterface>)>,
    trust_list: Option<Arc<TrustListManager>>,
    fldt_client: Option<Arc<FldtClient>>,
    on_start: Option<StartNotificationCallback>,
    poll: Mutex<PollState>,
    started: AtomicBool,
}

impl std::fmt::Debug for InfoServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoServer")
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InfoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InfoServer {
    pub fn new() -> Self {
        Self {
            firmware: None,
            trust_list: None,
            fldt_client: None,
            on_start: None,
            poll: Mutex::new(PollState::default()),
            started: AtomicBool::new(false),
        }
    }

    /// Report the installed firmware version in GINF
    pub fn with_firmware(mut self, file_type: UpdateFileType, source: Arc<dyn UpdateInterface>) -> Self {
        self.firmware = Some((file_type, source));
        self
    }

    /// Report the trust list version in GINF
    pub fn with_trust_list(mut self, trust_list: Arc<TrustListManager>) -> Self {
        self.trust_list = Some(trust_list);
        self
    }

    /// Ask for every file again when a gateway announces itself
    pub fn with_fldt_client(mut self, client: Arc<FldtClient>) -> Self {
        self.fldt_client = Some(client);
        self
    }

    pub fn with_start_callback(mut self, callback: StartNotificationCallback) -> Self {
        self.on_start = Some(callback);
        self
    }

    fn general_info(&self, snap: &Snap) -> GeneralInfo {
        let identity = snap.identity();
        GeneralInfo {
            manufacture_id: identity.manufacture_id,
            device_type: identity.device_type,
            mac: snap.mac_addr(),
            fw_version: self
                .firmware
                .as_ref()
                .map(|(ft, source)| source.current_version(ft))
                .unwrap_or_default(),
            tl_version: self
                .trust_list
                .as_ref()
                .and_then(|tl| tl.version())
                .unwrap_or_default(),
            roles: identity.roles,
        }
    }

    fn on_snot(&self, snap: &Snap, payload: &[u8]) -> SnapResult<Reply> {
        let sender = EnumElement::decode(payload)?;
        debug!(mac = %sender.mac, roles = sender.roles.bits(), "SNOT received");
        if sender.mac != snap.mac_addr()
            && snap.identity().roles.contains(DeviceRoles::THING)
            && sender.roles.contains(DeviceRoles::GATEWAY)
        {
            if let Some(client) = &self.fldt_client {
                if let Err(e) = client.request_all_files(snap) {
                    warn!(error = %e, "unable to request file updates");
                }
            }
        }
        if let Some(callback) = &self.on_start {
            callback(&sender);
        }
        Ok(Reply::NoResponse)
    }

    fn on_poll(&self, payload: &[u8]) -> SnapResult<Reply> {
        let request = PollRequest::decode(payload)?;
        let mut poll = self
            .poll
            .lock()
            .map_err(|_| SnapError::LockPoisoned("info poll"))?;
        if request.enable {
            poll.elements |= request.elements;
            poll.period = request.period;
            poll.counter = 0;
            poll.recipient = request.recipient;
        } else {
            poll.elements &= !request.elements;
        }
        info!(
            elements = poll.elements,
            period = poll.period,
            recipient = %poll.recipient,
            "INFO polling changed"
        );
        Ok(Reply::empty())
    }

    /// Elements due this tick and their recipient
    fn poll_due(&self) -> Option<(u32, MacAddr)> {
        let mut poll = self.poll.lock().ok()?;
        if poll.elements == 0 {
            return None;
        }
        poll.counter = poll.counter.saturating_add(1);
        if poll.counter < poll.period {
            return None;
        }
        poll.counter = 0;
        Some((poll.elements, poll.recipient))
    }
}

impl Service for InfoServer {
    fn id(&self) -> Tag {
        INFO_SERVICE_ID
    }

    fn request_process(&self, snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        match request.element {
            INFO_SNOT => self.on_snot(snap, request.payload),
            INFO_ENUM => Ok(Reply::Data(EnumElement::local(snap).encode())),
            INFO_GINF => Ok(Reply::Data(self.general_info(snap).encode())),
            INFO_STAT => Ok(Reply::Data(StatInfo::local(snap).encode())),
            INFO_POLL => self.on_poll(request.payload),
            element => Err(SnapError::UnsupportedElement {
                service: tag_str(&INFO_SERVICE_ID),
                element: tag_str(&element),
            }),
        }
    }

    fn periodic_process(&self, snap: &Snap) {
        if !self.started.swap(true, Ordering::Relaxed) {
            if let Err(e) = start_notification(snap) {
                warn!(error = %e, "SNOT not sent");
            }
        }
        let Some((elements, recipient)) = self.poll_due() else {
            return;
        };
        if elements & INFO_GENERAL != 0 {
            let payload = self.general_info(snap).encode();
            if let Err(e) = snap.send_request(None, recipient, INFO_SERVICE_ID, INFO_GINF, &payload) {
                warn!(error = %e, "GINF push failed");
            }
        }
        if elements & INFO_STATISTICS != 0 {
            let payload = StatInfo::local(snap).encode();
            if let Err(e) = snap.send_request(None, recipient, INFO_SERVICE_ID, INFO_STAT, &payload) {
                warn!(error = %e, "STAT push failed");
            }
        }
    }
}

/// Receives INFO reports on a gateway or monitoring station.
pub trait InfoHandler: Send + Sync {
    fn device_started(&self, _device: &EnumElement) {}

    fn general_info(&self, _info: &GeneralInfo) {}

    fn statistics(&self, _stat: &StatInfo) {}
}

/// Gateway side of INFO.
pub struct InfoClient {
    handler: Option<Arc<dyn InfoHandler>>,
    devices: Collector<EnumElement>,
}

impl std::fmt::Debug for InfoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoClient")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl InfoClient {
    pub fn new(handler: Option<Arc<dyn InfoHandler>>, max_devices: usize) -> Self {
        Self {
            handler,
            devices: Collector::new(max_devices),
        }
    }

    /// Broadcast ENUM and collect answers for `wait_ms`
    pub fn enum_devices(&self, snap: &Snap, wait_ms: u64) -> SnapResult<Vec<EnumElement>> {
        self.devices.start()?;
        if let Err(e) = snap.broadcast_request(INFO_SERVICE_ID, INFO_ENUM, &[]) {
            self.devices.cancel();
            return Err(e);
        }
        self.devices.finish(wait_ms)
    }

    /// Ask `mac` (or every device) to push `elements` every `period` ticks
    /// to `recipient`
    pub fn set_polling(
        &self,
        snap: &Snap,
        mac: MacAddr,
        elements: u32,
        enable: bool,
        period: u16,
        recipient: MacAddr,
    ) -> SnapResult<()> {
        let request = PollRequest {
            elements,
            enable,
            period,
            recipient,
        };
        snap.send_request(None, mac, INFO_SERVICE_ID, INFO_POLL, &request.encode())?;
        Ok(())
    }

    fn report(&self, element: Tag, payload: &[u8]) -> SnapResult<()> {
        let Some(handler) = &self.handler else {
            return Ok(());
        };
        match element {
            INFO_SNOT => handler.device_started(&EnumElement::decode(payload)?),
            INFO_GINF => handler.general_info(&GeneralInfo::decode(payload)?),
            INFO_STAT => handler.statistics(&StatInfo::decode(payload)?),
            _ => {}
        }
        Ok(())
    }
}

impl Service for InfoClient {
    fn id(&self) -> Tag {
        INFO_SERVICE_ID
    }

    fn request_process(&self, _snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        self.report(request.element, request.payload)?;
        Ok(Reply::NoResponse)
    }

    fn response_process(&self, _snap: &Snap, response: &Incoming<'_>) -> SnapResult<()> {
        if !response.is_ack() {
            debug!(element = %response.element_str(), src = %response.src, "INFO request rejected");
            return Ok(());
        }
        match response.element {
            INFO_ENUM => {
                self.devices.push(EnumElement::decode(response.payload)?);
                Ok(())
            }
            element => self.report(element, response.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ginf_layout() {
        let info = GeneralInfo {
            manufacture_id: iotkit_core::fixed(b"ACME"),
            device_type: iotkit_core::fixed(b"LAMP"),
            mac: MacAddr::new([1, 2, 3, 4, 5, 6]),
            fw_version: FileVersion::new(1, 0, 0, 3),
            tl_version: FileVersion::new(0, 1, 0, 0),
            roles: DeviceRoles::THING,
        };
        let bytes = info.encode();
        assert_eq!(bytes.len(), 16 + 4 + 6 + 11 + 11 + 4);
        assert_eq!(&bytes[20..26], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(GeneralInfo::decode(&bytes).unwrap(), info);
    }

    #[test]
    fn test_enum_puts_roles_first() {
        let element = EnumElement {
            roles: DeviceRoles::GATEWAY,
            mac: MacAddr::new([9; 6]),
        };
        assert_eq!(element.encode(), vec![0, 0, 0, 1, 9, 9, 9, 9, 9, 9]);
    }

    #[test]
    fn test_poll_schedule() {
        let server = InfoServer::new();
        assert!(server.poll_due().is_none());
        let enable = PollRequest {
            elements: INFO_STATISTICS,
            enable: true,
            period: 3,
            recipient: MacAddr::new([4; 6]),
        };
        server.on_poll(&enable.encode()).unwrap();
        assert!(server.poll_due().is_none());
        assert!(server.poll_due().is_none());
        assert_eq!(server.poll_due(), Some((INFO_STATISTICS, MacAddr::new([4; 6]))));

        let disable = PollRequest {
            enable: false,
            ..enable
        };
        server.on_poll(&disable.encode()).unwrap();
        for _ in 0..5 {
            assert!(server.poll_due().is_none());
        }
        assert!(server.on_poll(&[0; 3]).is_err());
    }
}
