//! Device provisioning and signed file handling.
//!
//! This crate owns everything that decides whether a device trusts a key or
//! a file:
//!
//! - **Secmodule**: hashing, key pairs and signatures behind a trait, with a
//!   software implementation for PC builds (`soft-secmodule` feature)
//! - **Provisioning**: high-level key slots (RECOVERY, AUTH, TRUST_LIST,
//!   FIRMWARE) and the device's own key pair
//! - **Trust list**: staged, quorum-verified and atomically promoted lists of
//!   trusted public keys
//! - **Firmware**: signed images stored in A/B banks
//! - **Update interface**: the per-file-type hooks used by the file
//!   distribution service

pub mod banks;
pub mod error;
pub mod firmware;
pub mod provision;
pub mod quorum;
pub mod records;
pub mod secmodule;
#[cfg(feature = "soft-secmodule")]
pub mod soft;
pub mod storage;
pub mod trust_list;
pub mod update;

pub use banks::{Bank, BankedStore};
pub use error::{ProvisionError, ProvisionResult};
pub use firmware::{
    FirmwareDescriptor, FirmwareFooter, FirmwareHeader, FirmwareImage, FirmwareManager,
    FirmwareVersion,
};
pub use provision::{HlRole, HlSlot, Provision, PRIVATE_KEY_SLOT};
pub use quorum::{verify_sign, KeyAuthority, QuorumError, QuorumPolicy};
pub use records::{
    DatedPubkey, HlKeyRecord, KeyType, PubkeyRecord, SignRecord, TrustList, TrustListFooter,
    TrustListHeader, TL_HEADER_SIZE,
};
pub use secmodule::{HashType, KeypairType, Secmodule, SecmoduleError, SecmoduleResult, SlotId};
#[cfg(feature = "soft-secmodule")]
pub use soft::SoftSecmodule;
pub use storage::{MemoryStorage, Storage, StorageError, StorageId, StorageResult};
pub use trust_list::{TlArea, TlPart, TrustListManager, TrustListUpdate};
pub use update::{UpdateFileType, UpdateInterface, UPDATE_FILE_TYPE_SIZE};
