//! PRVS: factory provisioning.
//!
//! The server runs on the device and accepts key pushes, trust list parts
//! and the final save. The client drives a device from a factory station
//! with blocking calls.

use crate::error::{SnapError, SnapResult};
use crate::frame::{tag_str, Tag};
use crate::service::{Incoming, Reply, Service};
use crate::snap::Snap;
use crate::wait::{ClientWait, Collector, WaitOutcome};
use iotkit_core::config::PrvsConfig;
use iotkit_core::{
    DeviceRoles, MacAddr, WireReader, WireWriter, DEVICE_SERIAL_SIZE, DEVICE_TYPE_SIZE,
    MANUFACTURE_ID_SIZE,
};
use iotkit_provision::{
    HashType, HlSlot, Provision, PubkeyRecord, SignRecord, TlArea, TlPart, TrustListManager,
};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const PRVS_SERVICE_ID: Tag = *b"PRVS";

pub const PRVS_DNID: Tag = *b"DNID";
pub const PRVS_SGNP: Tag = *b"SGNP";
pub const PRVS_TLH: Tag = *b"_TLH";
pub const PRVS_TLC: Tag = *b"_TLC";
pub const PRVS_TLF: Tag = *b"_TLF";
pub const PRVS_ASAV: Tag = *b"ASAV";
pub const PRVS_ASGN: Tag = *b"ASGN";
pub const PRVS_DEVI: Tag = *b"DEVI";

/// Encoded size of a DNID answer
pub const DNID_ELEMENT_SIZE: usize = 6 + 4;

/// Device found by DNID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnidElement {
    pub mac: MacAddr,
    pub roles: DeviceRoles,
}

impl DnidElement {
    fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(DNID_ELEMENT_SIZE);
        self.mac.encode(&mut w);
        w.u32(self.roles.bits());
        w.into_vec()
    }

    fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let element = Self {
            mac: MacAddr::decode(&mut r)?,
            roles: DeviceRoles(r.u32()?),
        };
        r.finish()?;
        Ok(element)
    }
}

/// DEVI answer: identity plus the device key, self-signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrvsDeviceInfo {
    pub manufacture_id: [u8; MANUFACTURE_ID_SIZE],
    pub device_type: [u8; DEVICE_TYPE_SIZE],
    pub serial: [u8; DEVICE_SERIAL_SIZE],
    pub mac: MacAddr,
    pub own_key: PubkeyRecord,
    pub sign: SignRecord,
    /// Bytes covered by `sign`
    pub signed: Vec<u8>,
}

impl PrvsDeviceInfo {
    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let manufacture_id = r.array()?;
        let device_type = r.array()?;
        let serial = r.array()?;
        let mac = MacAddr::decode(&mut r)?;
        let fixed_len = r.position();
        let data_size = r.u16()? as usize;
        let body_bytes = r.bytes(data_size)?;
        r.finish()?;
        let mut body = WireReader::new(body_bytes);
        let own_key = PubkeyRecord::decode(&mut body)?;
        let mut signed = data[..fixed_len].to_vec();
        signed.extend_from_slice(&body_bytes[..body.position()]);
        let sign = SignRecord::decode(&mut body)?;
        body.finish()?;
        Ok(Self {
            manufacture_id,
            device_type,
            serial,
            mac,
            own_key,
            sign,
            signed,
        })
    }
}

/// Pubkey record plus the device's signature over it, as returned by ASAV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPubkey {
    pub pubkey: PubkeyRecord,
    pub sign: SignRecord,
}

impl SignedPubkey {
    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let pubkey = PubkeyRecord::decode(&mut r)?;
        let sign = SignRecord::decode(&mut r)?;
        r.finish()?;
        Ok(Self { pubkey, sign })
    }
}

fn decode_hash_type(value: u8) -> SnapResult<HashType> {
    HashType::from_u8(value)
        .ok_or_else(|| SnapError::InvalidArgument(format!("unknown hash type {value}")))
}

/// Device side of PRVS.
pub struct PrvsServer {
    provision: Arc<Provision>,
    trust_list: Arc<TrustListManager>,
    last_request_id: Mutex<Option<u16>>,
}

impl std::fmt::Debug for PrvsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrvsServer")
            .field("initialized", &self.provision.is_initialized())
            .finish()
    }
}

impl PrvsServer {
    pub fn new(provision: Arc<Provision>, trust_list: Arc<TrustListManager>) -> Self {
        Self {
            provision,
            trust_list,
            last_request_id: Mutex::new(None),
        }
    }

    /// Apply a set request once per request id
    fn apply_set(
        &self,
        payload: &[u8],
        apply: impl FnOnce(&[u8]) -> SnapResult<()>,
    ) -> SnapResult<Reply> {
        let mut r = WireReader::new(payload);
        let request_id = r.u16()?;
        let data = r.rest();
        let mut last = self
            .last_request_id
            .lock()
            .map_err(|_| SnapError::LockPoisoned("prvs request id"))?;
        if *last == Some(request_id) {
            debug!(request_id, "repeated set request acknowledged");
            return Ok(Reply::empty());
        }
        apply(data)?;
        *last = Some(request_id);
        Ok(Reply::empty())
    }

    fn sign_reply(&self, payload: &[u8], own_key_default: bool) -> SnapResult<Reply> {
        let mut r = WireReader::new(payload);
        let hash_type = decode_hash_type(r.u8()?)?;
        let data = r.rest();
        let sign = if data.is_empty() && own_key_default {
            let own = self.provision.ensure_own_keypair()?;
            self.provision.sign(hash_type, &own.to_bytes()?)?
        } else if data.is_empty() {
            return Err(SnapError::InvalidArgument("nothing to sign".to_string()));
        } else {
            self.provision.sign(hash_type, data)?
        };
        Ok(Reply::Data(sign.to_bytes()?))
    }

    fn save_provision(&self) -> SnapResult<Reply> {
        // The factory's list replaces the installed one whatever its version
        if let Some(installed) = self.trust_list.version() {
            debug!(%installed, "replacing installed trust list unconditionally");
        }
        let version = self.trust_list.promote(TlArea::Dynamic)?;
        let own = self.provision.ensure_own_keypair()?;
        let own_bytes = own.to_bytes()?;
        let sign = self.provision.sign(HashType::Sha256, &own_bytes)?;
        info!(%version, key = %own.fingerprint(), "device provisioned");
        let mut out = own_bytes;
        out.extend_from_slice(&sign.to_bytes()?);
        Ok(Reply::Data(out))
    }

    fn device_info(&self, snap: &Snap, netif: usize) -> SnapResult<Reply> {
        let identity = snap.identity();
        let own = self.provision.ensure_own_keypair()?;
        let own_bytes = own.to_bytes()?;

        let mut w = WireWriter::new();
        w.bytes(&identity.manufacture_id)
            .bytes(&identity.device_type)
            .bytes(&identity.serial);
        snap.netif_mac(netif)?.encode(&mut w);
        let mut signed = w.into_vec();
        signed.extend_from_slice(&own_bytes);
        let sign = self.provision.sign(HashType::Sha256, &signed)?.to_bytes()?;

        let fixed = signed.len() - own_bytes.len();
        let data_size = iotkit_core::wire::len_u16(own_bytes.len() + sign.len(), "data_size")?;
        let mut out = WireWriter::with_capacity(signed.len() + 2 + sign.len());
        out.bytes(&signed[..fixed])
            .u16(data_size)
            .bytes(&own_bytes)
            .bytes(&sign);
        Ok(Reply::Data(out.into_vec()))
    }
}

impl Service for PrvsServer {
    fn id(&self) -> Tag {
        PRVS_SERVICE_ID
    }

    fn request_process(&self, snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        match &request.element {
            &PRVS_DNID => {
                if self.provision.is_initialized() {
                    return Ok(Reply::NoResponse);
                }
                let element = DnidElement {
                    mac: snap.netif_mac(request.netif)?,
                    roles: snap.identity().roles,
                };
                Ok(Reply::Data(element.encode()))
            }
            &PRVS_SGNP => self.sign_reply(request.payload, true),
            &PRVS_ASGN => self.sign_reply(request.payload, false),
            &PRVS_TLH => self.apply_set(request.payload, |data| {
                Ok(self.trust_list.save_part(TlArea::Dynamic, TlPart::Header, data)?)
            }),
            &PRVS_TLC => self.apply_set(request.payload, |data| {
                Ok(self.trust_list.save_part(TlArea::Dynamic, TlPart::Chunk, data)?)
            }),
            &PRVS_TLF => self.apply_set(request.payload, |data| {
                Ok(self.trust_list.save_part(TlArea::Dynamic, TlPart::Footer, data)?)
            }),
            &PRVS_ASAV => self.save_provision(),
            &PRVS_DEVI => self.device_info(snap, request.netif),
            element => match HlSlot::from_element(element) {
                Some(slot) => self.apply_set(request.payload, |data| {
                    Ok(self.provision.save_hl_key(slot, data)?)
                }),
                None => Err(SnapError::UnsupportedElement {
                    service: tag_str(&PRVS_SERVICE_ID),
                    element: tag_str(element),
                }),
            },
        }
    }
}

/// Factory side of PRVS. Calls block the caller thread; only one call may
/// be in flight at a time.
pub struct PrvsClient {
    wait: ClientWait,
    devices: Collector<DnidElement>,
    retry_limit: u32,
    next_request_id: AtomicU16,
}

impl std::fmt::Debug for PrvsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrvsClient")
            .field("retry_limit", &self.retry_limit)
            .finish()
    }
}

impl PrvsClient {
    pub fn new(config: &PrvsConfig) -> Self {
        Self {
            wait: ClientWait::new(),
            devices: Collector::new(config.dnid_list_max),
            retry_limit: config.retry_limit.max(1),
            next_request_id: AtomicU16::new(1),
        }
    }

    /// Broadcast DNID and collect uninitialized devices for `wait_ms`
    pub fn enum_devices(&self, snap: &Snap, wait_ms: u64) -> SnapResult<Vec<DnidElement>> {
        self.devices.start()?;
        if let Err(e) = snap.broadcast_request(PRVS_SERVICE_ID, PRVS_DNID, &[]) {
            self.devices.cancel();
            return Err(e);
        }
        let devices = self.devices.finish(wait_ms)?;
        info!(count = devices.len(), "DNID finished");
        Ok(devices)
    }

    /// One request, one response
    fn call(&self, snap: &Snap, mac: MacAddr, element: Tag, payload: &[u8], wait_ms: u64) -> SnapResult<Vec<u8>> {
        let transaction_id = snap.issue_transaction_id()?;
        self.wait.arm(element, transaction_id)?;
        if let Err(e) = snap.send_request_as(None, mac, transaction_id, PRVS_SERVICE_ID, element, payload) {
            self.wait.disarm();
            return Err(e);
        }
        match self.wait.wait(wait_ms)? {
            WaitOutcome::Ack(data) => Ok(data),
            WaitOutcome::Nack => Err(SnapError::Nack {
                element: tag_str(&element),
            }),
        }
    }

    /// [`PrvsClient::call`] retried on timeout up to the retry limit
    fn call_retry(&self, snap: &Snap, mac: MacAddr, element: Tag, payload: &[u8], wait_ms: u64) -> SnapResult<Vec<u8>> {
        let mut attempt = 1;
        loop {
            match self.call(snap, mac, element, payload, wait_ms) {
                Err(SnapError::Timeout { .. }) if attempt < self.retry_limit => {
                    warn!(element = %tag_str(&element), attempt, "PRVS timeout, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Set request: `request_id` + data, answered with an empty ACK
    pub fn set(&self, snap: &Snap, mac: MacAddr, element: Tag, data: &[u8], wait_ms: u64) -> SnapResult<()> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut w = WireWriter::with_capacity(2 + data.len());
        w.u16(request_id).bytes(data);
        self.call_retry(snap, mac, element, &w.into_vec(), wait_ms)?;
        debug!(element = %tag_str(&element), %mac, "PRVS set done");
        Ok(())
    }

    /// Request without side effects, returning the response payload
    pub fn get(&self, snap: &Snap, mac: MacAddr, element: Tag, payload: &[u8], wait_ms: u64) -> SnapResult<Vec<u8>> {
        self.call_retry(snap, mac, element, payload, wait_ms)
    }

    pub fn device_info(&self, snap: &Snap, mac: MacAddr, wait_ms: u64) -> SnapResult<PrvsDeviceInfo> {
        PrvsDeviceInfo::decode(&self.get(snap, mac, PRVS_DEVI, &[], wait_ms)?)
    }

    pub fn push_hl_key(&self, snap: &Snap, mac: MacAddr, slot: HlSlot, record: &[u8], wait_ms: u64) -> SnapResult<()> {
        self.set(snap, mac, slot.element(), record, wait_ms)
    }

    pub fn set_tl_header(&self, snap: &Snap, mac: MacAddr, header: &[u8], wait_ms: u64) -> SnapResult<()> {
        self.set(snap, mac, PRVS_TLH, header, wait_ms)
    }

    pub fn set_tl_chunk(&self, snap: &Snap, mac: MacAddr, chunk: &[u8], wait_ms: u64) -> SnapResult<()> {
        self.set(snap, mac, PRVS_TLC, chunk, wait_ms)
    }

    pub fn set_tl_footer(&self, snap: &Snap, mac: MacAddr, footer: &[u8], wait_ms: u64) -> SnapResult<()> {
        self.set(snap, mac, PRVS_TLF, footer, wait_ms)
    }

    /// Finalize provisioning. Not retried: a repeated save has nothing
    /// staged left to promote.
    pub fn save_provision(&self, snap: &Snap, mac: MacAddr, wait_ms: u64) -> SnapResult<SignedPubkey> {
        SignedPubkey::decode(&self.call(snap, mac, PRVS_ASAV, &[], wait_ms)?)
    }

    /// Ask the device to sign `key`, or its own key when `key` is empty
    pub fn sign_pubkey(&self, snap: &Snap, mac: MacAddr, hash_type: HashType, key: &[u8], wait_ms: u64) -> SnapResult<SignRecord> {
        self.sign_request(snap, mac, PRVS_SGNP, hash_type, key, wait_ms)
    }

    pub fn sign_data(&self, snap: &Snap, mac: MacAddr, hash_type: HashType, data: &[u8], wait_ms: u64) -> SnapResult<SignRecord> {
        self.sign_request(snap, mac, PRVS_ASGN, hash_type, data, wait_ms)
    }

    fn sign_request(
        &self,
        snap: &Snap,
        mac: MacAddr,
        element: Tag,
        hash_type: HashType,
        data: &[u8],
        wait_ms: u64,
    ) -> SnapResult<SignRecord> {
        let mut w = WireWriter::with_capacity(1 + data.len());
        w.u8(hash_type.as_u8()).bytes(data);
        let response = self.get(snap, mac, element, &w.into_vec(), wait_ms)?;
        let mut r = WireReader::new(&response);
        let sign = SignRecord::decode(&mut r)?;
        r.finish()?;
        Ok(sign)
    }
}

impl Service for PrvsClient {
    fn id(&self) -> Tag {
        PRVS_SERVICE_ID
    }

    fn request_process(&self, _snap: &Snap, _request: &Incoming<'_>) -> SnapResult<Reply> {
        Ok(Reply::NoResponse)
    }

    fn response_process(&self, _snap: &Snap, response: &Incoming<'_>) -> SnapResult<()> {
        if response.element == PRVS_DNID {
            if response.is_ack() {
                let device = DnidElement::decode(response.payload)?;
                debug!(mac = %device.mac, roles = device.roles.bits(), "DNID answer");
                self.devices.push(device);
            }
            return Ok(());
        }
        let outcome = if response.is_ack() {
            WaitOutcome::Ack(response.payload.to_vec())
        } else {
            WaitOutcome::Nack
        };
        self.wait
            .stop_wait(response.element, response.transaction_id, outcome);
        Ok(())
    }
}
