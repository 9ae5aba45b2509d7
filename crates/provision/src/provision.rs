//! Key-slot mapping and high-level key provisioning.
//!
//! Four high-level key roles each own two redundant secmodule slots. Keys
//! are pushed once at factory time; after the device is initialized the
//! slots are read-only and only used to confirm that a signer's public key
//! was provisioned.

use crate::error::{ProvisionError, ProvisionResult};
use crate::quorum::{verify_sign, KeyAuthority};
use crate::records::{HlKeyRecord, KeyType, PubkeyRecord, SignRecord};
use crate::secmodule::{HashType, KeypairType, Secmodule, SecmoduleError, SlotId};
use iotkit_core::WireReader;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Slot holding the device's own private key
pub const PRIVATE_KEY_SLOT: SlotId = SlotId::Otp(1);

/// Logical high-level key role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HlRole {
    Recovery,
    Auth,
    TrustList,
    Firmware,
}

impl HlRole {
    pub const ALL: [HlRole; 4] = [HlRole::Recovery, HlRole::Auth, HlRole::TrustList, HlRole::Firmware];

    /// The two physical slots reserved for this role
    pub fn slots(&self) -> [SlotId; 2] {
        match self {
            HlRole::Recovery => [SlotId::Otp(2), SlotId::Otp(3)],
            HlRole::Auth => [SlotId::Mtp(2), SlotId::Mtp(3)],
            HlRole::TrustList => [SlotId::Mtp(4), SlotId::Mtp(5)],
            HlRole::Firmware => [SlotId::Mtp(6), SlotId::Mtp(7)],
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            HlRole::Recovery => KeyType::Recovery,
            HlRole::Auth => KeyType::Auth,
            HlRole::TrustList => KeyType::TrustList,
            HlRole::Firmware => KeyType::Firmware,
        }
    }

    pub fn from_key_type(key_type: KeyType) -> Option<Self> {
        match key_type {
            KeyType::Recovery => Some(HlRole::Recovery),
            KeyType::Auth => Some(HlRole::Auth),
            KeyType::TrustList => Some(HlRole::TrustList),
            KeyType::Firmware => Some(HlRole::Firmware),
            _ => None,
        }
    }

    fn letter(&self) -> u8 {
        match self {
            HlRole::Recovery => b'R',
            HlRole::Auth => b'A',
            HlRole::TrustList => b'T',
            HlRole::Firmware => b'F',
        }
    }
}

/// One of the eight high-level key slots, addressed as role plus index 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HlSlot {
    pub role: HlRole,
    pub index: u8,
}

impl HlSlot {
    pub fn new(role: HlRole, index: u8) -> ProvisionResult<Self> {
        if index != 1 && index != 2 {
            return Err(ProvisionError::InvalidArgument(format!(
                "slot index {index}, expected 1 or 2"
            )));
        }
        Ok(Self { role, index })
    }

    /// Map a PRVS push element (`PBR1` .. `PBF2`) to its slot
    pub fn from_element(element: &[u8; 4]) -> Option<Self> {
        if &element[..2] != b"PB" {
            return None;
        }
        let role = HlRole::ALL
            .into_iter()
            .find(|role| role.letter() == element[2])?;
        let index = match element[3] {
            b'1' => 1,
            b'2' => 2,
            _ => return None,
        };
        Some(Self { role, index })
    }

    /// PRVS element that pushes this slot
    pub fn element(&self) -> [u8; 4] {
        [b'P', b'B', self.role.letter(), b'0' + self.index]
    }

    pub fn slot_id(&self) -> SlotId {
        self.role.slots()[usize::from(self.index - 1)]
    }
}

impl fmt::Display for HlSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{} ({})", self.role, self.index, self.slot_id())
    }
}

/// Device key provisioning state.
pub struct Provision {
    secmodule: Arc<dyn Secmodule>,
    own_keypair_type: KeypairType,
    initialized: AtomicBool,
}

impl fmt::Debug for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provision")
            .field("own_keypair_type", &self.own_keypair_type)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Provision {
    pub fn new(secmodule: Arc<dyn Secmodule>) -> Self {
        Self {
            secmodule,
            own_keypair_type: KeypairType::Secp256r1,
            initialized: AtomicBool::new(false),
        }
    }

    /// Algorithm used when the device key pair is generated
    pub fn with_keypair_type(mut self, keypair_type: KeypairType) -> Self {
        self.own_keypair_type = keypair_type;
        self
    }

    pub fn secmodule(&self) -> &dyn Secmodule {
        self.secmodule.as_ref()
    }

    /// True once a trust list has been accepted into STATIC
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    /// Read and decode a high-level key slot; an empty slot yields `None`
    pub fn load_hl_key(&self, slot: HlSlot) -> ProvisionResult<Option<HlKeyRecord>> {
        match self.secmodule.slot_load(slot.slot_id()) {
            Ok(data) => {
                let (record, _) = HlKeyRecord::decode(&mut WireReader::new(&data))?;
                Ok(Some(record))
            }
            Err(SecmoduleError::EmptySlot(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// True when one of the two slots of `key_type` holds exactly this key.
    pub fn search_hl_pubkey(&self, key_type: KeyType, ec_type: KeypairType, key: &[u8]) -> bool {
        let Some(role) = HlRole::from_key_type(key_type) else {
            debug!(?key_type, "key type has no provisioned slots");
            return false;
        };
        for index in [1, 2] {
            let slot = HlSlot { role, index };
            match self.load_hl_key(slot) {
                Ok(Some(record)) => {
                    let pubkey = &record.dated.pubkey;
                    if pubkey.key_type == key_type && pubkey.ec_type == ec_type && pubkey.key == key {
                        debug!(%slot, "provisioned key matched");
                        return true;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%slot, error = %e, "unreadable key slot skipped"),
            }
        }
        false
    }

    /// Decode a high-level key record and check its RECOVERY signature.
    pub fn verify_hl_key(&self, data: &[u8]) -> ProvisionResult<HlKeyRecord> {
        let mut r = WireReader::new(data);
        let (record, signed_len) = HlKeyRecord::decode(&mut r)?;
        r.finish()?;
        if let Some(sign) = &record.sign {
            if !self.search_hl_pubkey(KeyType::Recovery, sign.ec_type, &sign.signer_key) {
                return Err(ProvisionError::Verification(
                    "high-level key is not signed by a provisioned recovery key".to_string(),
                ));
            }
            verify_sign(self.secmodule(), sign, &data[..signed_len]).map_err(|e| {
                ProvisionError::Verification(format!("high-level key signature: {e}"))
            })?;
        }
        Ok(record)
    }

    /// Store a pushed high-level key. Rejected once the device is initialized.
    pub fn save_hl_key(&self, slot: HlSlot, data: &[u8]) -> ProvisionResult<()> {
        if self.is_initialized() {
            warn!(%slot, "key push rejected, device already initialized");
            return Err(ProvisionError::AlreadyInitialized);
        }
        let record = self.verify_hl_key(data)?;
        let key_type = record.dated.pubkey.key_type;
        if key_type != slot.role.key_type() {
            return Err(ProvisionError::InvalidArgument(format!(
                "{key_type:?} key pushed to {slot}"
            )));
        }
        self.secmodule.slot_save(slot.slot_id(), data)?;
        info!(%slot, key = %record.dated.pubkey.fingerprint(), "high-level key saved");
        Ok(())
    }

    /// The device's own public key record
    pub fn own_pubkey(&self) -> ProvisionResult<PubkeyRecord> {
        let (ec_type, key) = self.secmodule.keypair_get_pubkey(PRIVATE_KEY_SLOT)?;
        Ok(PubkeyRecord::new(KeyType::IotDevice, ec_type, key))
    }

    /// Return the own public key, generating the key pair on first use
    pub fn ensure_own_keypair(&self) -> ProvisionResult<PubkeyRecord> {
        match self.own_pubkey() {
            Err(ProvisionError::Secmodule(SecmoduleError::EmptySlot(_))) => {
                info!(keypair_type = ?self.own_keypair_type, "generating device key pair");
                self.secmodule
                    .keypair_create(PRIVATE_KEY_SLOT, self.own_keypair_type)?;
                self.own_pubkey()
            }
            other => other,
        }
    }

    /// Sign `data` with the device key
    pub fn sign(&self, hash_type: HashType, data: &[u8]) -> ProvisionResult<SignRecord> {
        let pubkey = self.own_pubkey()?;
        let hash = self.secmodule.hash_create(hash_type, data)?;
        let signature = self.secmodule.ecdsa_sign(PRIVATE_KEY_SLOT, hash_type, &hash)?;
        Ok(SignRecord {
            signer_type: KeyType::IotDevice,
            ec_type: pubkey.ec_type,
            hash_type,
            signature,
            signer_key: pubkey.key,
        })
    }
}

impl KeyAuthority for Provision {
    fn is_provisioned(&self, key_type: KeyType, ec_type: KeypairType, key: &[u8]) -> bool {
        self.search_hl_pubkey(key_type, ec_type, key)
    }
}
