//! CFG: pushes network and messenger configuration to devices.

use crate::error::{SnapError, SnapResult};
use crate::frame::{tag_str, Tag};
use crate::service::{Incoming, Reply, Service};
use crate::snap::Snap;
use iotkit_core::wire::unpad;
use iotkit_core::{MacAddr, WireReader, WireWriter};
use std::sync::Arc;
use tracing::{debug, info};

pub const CFG_SERVICE_ID: Tag = *b"_CFG";

pub const CFG_WIFI: Tag = *b"WIFI";
pub const CFG_MSCR: Tag = *b"MSCR";
pub const CFG_MSCH: Tag = *b"MSCH";
pub const CFG_USER: Tag = *b"USER";

pub const CFG_STR_MAX: usize = 64;
pub const HOST_NAME_MAX: usize = 128;
pub const CHANNEL_NAME_MAX: usize = 32;
pub const CHANNELS_MAX: usize = 1;

fn text(field: &[u8]) -> String {
    String::from_utf8_lossy(unpad(field)).into_owned()
}

fn put_text(w: &mut WireWriter, value: &str, width: usize, field: &str) -> SnapResult<()> {
    if value.len() > width {
        return Err(SnapError::InvalidArgument(format!(
            "{field} is {} bytes, limit {width}",
            value.len()
        )));
    }
    w.padded(value.as_bytes(), width);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WifiConfig {
    pub ssid: String,
    pub pass: String,
    pub account: String,
}

impl WifiConfig {
    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        let mut w = WireWriter::with_capacity(3 * CFG_STR_MAX);
        put_text(&mut w, &self.ssid, CFG_STR_MAX, "ssid")?;
        put_text(&mut w, &self.pass, CFG_STR_MAX, "pass")?;
        put_text(&mut w, &self.account, CFG_STR_MAX, "account")?;
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let config = Self {
            ssid: text(r.bytes(CFG_STR_MAX)?),
            pass: text(r.bytes(CFG_STR_MAX)?),
            account: text(r.bytes(CFG_STR_MAX)?),
        };
        r.finish()?;
        Ok(config)
    }
}

/// Messenger server credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessengerConfig {
    pub version: u8,
    pub host: String,
    pub port: u16,
    pub base_url: String,
}

impl MessengerConfig {
    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        let mut w = WireWriter::with_capacity(1 + 2 * HOST_NAME_MAX + 2);
        w.u8(self.version);
        put_text(&mut w, &self.host, HOST_NAME_MAX, "host")?;
        w.u16(self.port);
        put_text(&mut w, &self.base_url, HOST_NAME_MAX, "base_url")?;
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let config = Self {
            version: r.u8()?,
            host: text(r.bytes(HOST_NAME_MAX)?),
            port: r.u16()?,
            base_url: text(r.bytes(HOST_NAME_MAX)?),
        };
        r.finish()?;
        Ok(config)
    }
}

/// Messenger channels to join.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessengerChannels {
    pub channels: Vec<String>,
}

impl MessengerChannels {
    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        if self.channels.len() > CHANNELS_MAX {
            return Err(SnapError::InvalidArgument(format!(
                "{} channels, limit {CHANNELS_MAX}",
                self.channels.len()
            )));
        }
        let mut w = WireWriter::with_capacity(1 + CHANNELS_MAX * CHANNEL_NAME_MAX);
        w.u8(self.channels.len() as u8);
        for index in 0..CHANNELS_MAX {
            let name = self.channels.get(index).map(String::as_str).unwrap_or("");
            put_text(&mut w, name, CHANNEL_NAME_MAX, "channel")?;
        }
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let count = r.u8()? as usize;
        if count > CHANNELS_MAX {
            return Err(SnapError::InvalidArgument(format!(
                "{count} channels, limit {CHANNELS_MAX}"
            )));
        }
        let mut channels = Vec::with_capacity(count);
        for index in 0..CHANNELS_MAX {
            let name = text(r.bytes(CHANNEL_NAME_MAX)?);
            if index < count {
                channels.push(name);
            }
        }
        r.finish()?;
        Ok(Self { channels })
    }
}

/// Application-defined configuration blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserConfig {
    pub data_type: u8,
    pub data: Vec<u8>,
}

impl UserConfig {
    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        let size = u32::try_from(self.data.len())
            .map_err(|_| SnapError::InvalidArgument("user data too large".to_string()))?;
        let mut w = WireWriter::with_capacity(5 + self.data.len());
        w.u8(self.data_type).u32(size).bytes(&self.data);
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let data_type = r.u8()?;
        let size = r.u32()? as usize;
        let data = r.bytes(size)?.to_vec();
        r.finish()?;
        Ok(Self { data_type, data })
    }
}

/// Applies received configuration. Each method returns whether the
/// configuration was taken; a device without the feature leaves the
/// default.
pub trait CfgHandler: Send + Sync {
    fn wifi(&self, _config: &WifiConfig) -> SnapResult<bool> {
        Ok(false)
    }

    fn messenger(&self, _config: &MessengerConfig) -> SnapResult<bool> {
        Ok(false)
    }

    fn channels(&self, _channels: &MessengerChannels) -> SnapResult<bool> {
        Ok(false)
    }

    fn user(&self, _config: &UserConfig) -> SnapResult<bool> {
        Ok(false)
    }
}

/// Device side of CFG.
pub struct CfgServer {
    handler: Arc<dyn CfgHandler>,
}

impl std::fmt::Debug for CfgServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfgServer").finish_non_exhaustive()
    }
}

impl CfgServer {
    pub fn new(handler: Arc<dyn CfgHandler>) -> Self {
        Self { handler }
    }
}

impl Service for CfgServer {
    fn id(&self) -> Tag {
        CFG_SERVICE_ID
    }

    fn request_process(&self, _snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        let handled = match request.element {
            CFG_WIFI => {
                let config = WifiConfig::decode(request.payload)?;
                info!(ssid = %config.ssid, "WiFi configuration received");
                self.handler.wifi(&config)?
            }
            CFG_MSCR => {
                let config = MessengerConfig::decode(request.payload)?;
                info!(host = %config.host, port = config.port, "messenger credentials received");
                self.handler.messenger(&config)?
            }
            CFG_MSCH => {
                let channels = MessengerChannels::decode(request.payload)?;
                info!(channels = ?channels.channels, "messenger channels received");
                self.handler.channels(&channels)?
            }
            CFG_USER => {
                let config = UserConfig::decode(request.payload)?;
                info!(data_type = config.data_type, size = config.data.len(), "user configuration received");
                self.handler.user(&config)?
            }
            element => {
                return Err(SnapError::UnsupportedElement {
                    service: tag_str(&CFG_SERVICE_ID),
                    element: tag_str(&element),
                })
            }
        };
        if handled {
            Ok(Reply::empty())
        } else {
            debug!(element = %request.element_str(), "configuration not handled");
            Ok(Reply::NoResponse)
        }
    }
}

/// Sends configuration to one device or to every device.
#[derive(Debug, Default)]
pub struct CfgClient;

impl CfgClient {
    pub fn new() -> Self {
        Self
    }

    fn send(&self, snap: &Snap, mac: MacAddr, element: Tag, payload: &[u8]) -> SnapResult<()> {
        snap.send_request(None, mac, CFG_SERVICE_ID, element, payload)?;
        debug!(%mac, element = %tag_str(&element), "configuration sent");
        Ok(())
    }

    pub fn configure_wifi(&self, snap: &Snap, mac: MacAddr, config: &WifiConfig) -> SnapResult<()> {
        self.send(snap, mac, CFG_WIFI, &config.encode()?)
    }

    pub fn configure_messenger(&self, snap: &Snap, mac: MacAddr, config: &MessengerConfig) -> SnapResult<()> {
        self.send(snap, mac, CFG_MSCR, &config.encode()?)
    }

    pub fn configure_channels(&self, snap: &Snap, mac: MacAddr, channels: &MessengerChannels) -> SnapResult<()> {
        self.send(snap, mac, CFG_MSCH, &channels.encode()?)
    }

    pub fn configure_user(&self, snap: &Snap, mac: MacAddr, config: &UserConfig) -> SnapResult<()> {
        self.send(snap, mac, CFG_USER, &config.encode()?)
    }
}

impl Service for CfgClient {
    fn id(&self) -> Tag {
        CFG_SERVICE_ID
    }

    fn request_process(&self, _snap: &Snap, _request: &Incoming<'_>) -> SnapResult<Reply> {
        Ok(Reply::NoResponse)
    }

    fn response_process(&self, _snap: &Snap, response: &Incoming<'_>) -> SnapResult<()> {
        if response.is_ack() {
            debug!(src = %response.src, element = %response.element_str(), "configuration applied");
        } else {
            debug!(src = %response.src, element = %response.element_str(), "configuration rejected");
        }
        Ok(())
    }
}
