//! Device identity types shared by every layer.

use crate::error::{CoreError, CoreResult};
use crate::wire::{WireReader, WireWriter};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a MAC address on the medium
pub const MAC_ADDR_LEN: usize = 6;
/// Length of the manufacturer identifier
pub const MANUFACTURE_ID_SIZE: usize = 16;
/// Length of the device type identifier
pub const DEVICE_TYPE_SIZE: usize = 4;
/// Length of the device serial number
pub const DEVICE_SERIAL_SIZE: usize = 32;

/// Device address on the broadcast medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; MAC_ADDR_LEN]);

impl MacAddr {
    /// All-ones broadcast address
    pub const BROADCAST: MacAddr = MacAddr([0xFF; MAC_ADDR_LEN]);

    pub fn new(bytes: [u8; MAC_ADDR_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn as_bytes(&self) -> &[u8; MAC_ADDR_LEN] {
        &self.0
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.bytes(&self.0);
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self(r.array()?))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| hex::encode([*b])).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl std::str::FromStr for MacAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; MAC_ADDR_LEN];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != MAC_ADDR_LEN {
            return Err(CoreError::InvalidArgument(format!("bad MAC address: {s}")));
        }
        for (slot, part) in out.iter_mut().zip(parts) {
            let byte = hex::decode(part)
                .map_err(|e| CoreError::InvalidArgument(format!("bad MAC address {s}: {e}")))?;
            if byte.len() != 1 {
                return Err(CoreError::InvalidArgument(format!("bad MAC address: {s}")));
            }
            *slot = byte[0];
        }
        Ok(Self(out))
    }
}

/// Device role bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceRoles(pub u32);

impl DeviceRoles {
    pub const NONE: DeviceRoles = DeviceRoles(0);
    pub const GATEWAY: DeviceRoles = DeviceRoles(0x0001);
    pub const THING: DeviceRoles = DeviceRoles(0x0002);
    pub const CONTROL: DeviceRoles = DeviceRoles(0x0004);
    pub const LOGGER: DeviceRoles = DeviceRoles(0x0008);
    pub const SNIFFER: DeviceRoles = DeviceRoles(0x0010);
    pub const DEBUGGER: DeviceRoles = DeviceRoles(0x0020);
    pub const INITIALIZER: DeviceRoles = DeviceRoles(0x0040);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: DeviceRoles) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DeviceRoles {
    type Output = DeviceRoles;

    fn bitor(self, rhs: Self) -> Self::Output {
        DeviceRoles(self.0 | rhs.0)
    }
}

/// Static identity of the local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Manufacturer identifier, NUL padded
    pub manufacture_id: [u8; MANUFACTURE_ID_SIZE],
    /// Device type, NUL padded
    pub device_type: [u8; DEVICE_TYPE_SIZE],
    /// Serial number, NUL padded
    #[serde(with = "serial_hex")]
    pub serial: [u8; DEVICE_SERIAL_SIZE],
    /// Roles advertised on discovery
    pub roles: DeviceRoles,
}

impl DeviceIdentity {
    /// Build an identity from human-readable strings, padding each field.
    /// A string longer than its field is rejected.
    pub fn new(
        manufacturer: &str,
        device_type: &str,
        serial: &str,
        roles: DeviceRoles,
    ) -> CoreResult<Self> {
        Ok(Self {
            manufacture_id: padded_field(manufacturer, "manufacture_id")?,
            device_type: padded_field(device_type, "device_type")?,
            serial: padded_field(serial, "serial")?,
            roles,
        })
    }
}

fn padded_field<const N: usize>(text: &str, field: &'static str) -> CoreResult<[u8; N]> {
    if text.len() > N {
        return Err(CoreError::InvalidValue {
            field,
            value: text.len() as u64,
        });
    }
    Ok(fixed(text.as_bytes()))
}

/// Copy `src` into a zero-filled fixed-width array, truncating if needed.
pub fn fixed<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let take = src.len().min(N);
    out[..take].copy_from_slice(&src[..take]);
    out
}

mod serial_hex {
    use super::DEVICE_SERIAL_SIZE;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; DEVICE_SERIAL_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; DEVICE_SERIAL_SIZE], D::Error> {
        let text = String::deserialize(d)?;
        let raw = hex::decode(&text).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("serial must be 32 bytes"))
    }
}
