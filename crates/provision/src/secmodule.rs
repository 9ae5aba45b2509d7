//! Security module boundary.
//!
//! The kit never performs raw cryptography itself. Hashing, signing,
//! verification, key generation and key-slot persistence are delegated to an
//! implementation of [`Secmodule`] supplied by the platform (hardware secure
//! element, TPM or a software fallback).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors reported by a security module
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecmoduleError {
    /// Slot holds no data
    #[error("Slot {0} is empty")]
    EmptySlot(SlotId),

    /// Algorithm or key type is not implemented by this module
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Key material could not be parsed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signature did not verify
    #[error("Signature verification failed")]
    VerificationFailed,

    /// Hardware or backing store failure
    #[error("Secmodule failure: {0}")]
    Device(String),
}

/// Result type for security module operations
pub type SecmoduleResult<T> = Result<T, SecmoduleError>;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashType {
    Sha256,
    Sha384,
    Sha512,
}

impl HashType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(HashType::Sha256),
            1 => Some(HashType::Sha384),
            2 => Some(HashType::Sha512),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            HashType::Sha256 => 0,
            HashType::Sha384 => 1,
            HashType::Sha512 => 2,
        }
    }

    /// Digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashType::Sha256 => 32,
            HashType::Sha384 => 48,
            HashType::Sha512 => 64,
        }
    }
}

/// Key pair algorithms a record may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeypairType {
    Secp192r1,
    Secp224r1,
    Secp256r1,
    Secp384r1,
    Secp521r1,
    Secp192k1,
    Secp224k1,
    Secp256k1,
    Curve25519,
    Ed25519,
}

impl KeypairType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use KeypairType::*;
        Some(match v {
            1 => Secp192r1,
            2 => Secp224r1,
            3 => Secp256r1,
            4 => Secp384r1,
            5 => Secp521r1,
            6 => Secp192k1,
            7 => Secp224k1,
            8 => Secp256k1,
            9 => Curve25519,
            10 => Ed25519,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        use KeypairType::*;
        match self {
            Secp192r1 => 1,
            Secp224r1 => 2,
            Secp256r1 => 3,
            Secp384r1 => 4,
            Secp521r1 => 5,
            Secp192k1 => 6,
            Secp224k1 => 7,
            Secp256k1 => 8,
            Curve25519 => 9,
            Ed25519 => 10,
        }
    }

    /// Raw public key length (uncompressed SEC1 for Weierstrass curves)
    pub fn pubkey_len(&self) -> usize {
        use KeypairType::*;
        match self {
            Secp192r1 | Secp192k1 => 49,
            Secp224r1 | Secp224k1 => 57,
            Secp256r1 | Secp256k1 => 65,
            Secp384r1 => 97,
            Secp521r1 => 133,
            Curve25519 | Ed25519 => 32,
        }
    }

    /// Raw signature length (r || s for ECDSA)
    pub fn signature_len(&self) -> usize {
        use KeypairType::*;
        match self {
            Secp192r1 | Secp192k1 => 48,
            Secp224r1 | Secp224k1 => 56,
            Secp256r1 | Secp256k1 => 64,
            Secp384r1 => 96,
            Secp521r1 => 132,
            Curve25519 | Ed25519 => 64,
        }
    }
}

/// Logical key slot inside the security module.
///
/// OTP slots are one-time programmable, MTP slots rewritable, TMP slots
/// volatile scratch space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotId {
    Otp(u8),
    Mtp(u8),
    Tmp(u8),
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::Otp(n) => write!(f, "OTP_{n}"),
            SlotId::Mtp(n) => write!(f, "MTP_{n}"),
            SlotId::Tmp(n) => write!(f, "TMP_{n}"),
        }
    }
}

/// Cryptographic and key-storage operations consumed by the kit.
///
/// Implementations use interior mutability so a single instance can be
/// shared between the receive path and background update threads.
pub trait Secmodule: Send + Sync {
    /// Digest `data` with `hash_type`
    fn hash_create(&self, hash_type: HashType, data: &[u8]) -> SecmoduleResult<Vec<u8>>;

    /// Generate a fresh key pair in `slot`, replacing its contents
    fn keypair_create(&self, slot: SlotId, keypair_type: KeypairType) -> SecmoduleResult<()>;

    /// Public half of the key pair stored in `slot`
    fn keypair_get_pubkey(&self, slot: SlotId) -> SecmoduleResult<(KeypairType, Vec<u8>)>;

    /// Sign a precomputed digest with the private key in `slot`
    fn ecdsa_sign(&self, slot: SlotId, hash_type: HashType, hash: &[u8]) -> SecmoduleResult<Vec<u8>>;

    /// Verify a raw signature over a precomputed digest.
    ///
    /// Returns `Err(SecmoduleError::VerificationFailed)` on mismatch.
    fn ecdsa_verify(
        &self,
        keypair_type: KeypairType,
        public_key: &[u8],
        hash_type: HashType,
        hash: &[u8],
        signature: &[u8],
    ) -> SecmoduleResult<()>;

    fn slot_save(&self, slot: SlotId, data: &[u8]) -> SecmoduleResult<()>;

    fn slot_load(&self, slot: SlotId) -> SecmoduleResult<Vec<u8>>;

    fn slot_delete(&self, slot: SlotId) -> SecmoduleResult<()>;
}
