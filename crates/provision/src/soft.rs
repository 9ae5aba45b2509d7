//! Software security module for PC builds and tests.
//!
//! Supports SECP256R1 (ECDSA over a precomputed digest) and Ed25519 (digest
//! signed as the message). Slot contents are wiped on delete and drop.

use crate::secmodule::{HashType, KeypairType, Secmodule, SecmoduleError, SecmoduleResult, SlotId};
use ed25519_dalek::{Signer as _, Verifier as _};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

/// In-memory [`Secmodule`] backed by `p256`, `ed25519-dalek` and `sha2`.
///
/// A key pair slot holds `[keypair_type u8][private key bytes]`.
#[derive(Default)]
pub struct SoftSecmodule {
    slots: Mutex<HashMap<SlotId, Zeroizing<Vec<u8>>>>,
}

impl std::fmt::Debug for SoftSecmodule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.slots.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("SoftSecmodule")
            .field("slots", &count)
            .finish()
    }
}

fn poisoned<T>(_: T) -> SecmoduleError {
    SecmoduleError::Device("slot table lock poisoned".to_string())
}

impl SoftSecmodule {
    pub fn new() -> Self {
        Self::default()
    }

    fn private_key(&self, slot: SlotId) -> SecmoduleResult<(KeypairType, Zeroizing<Vec<u8>>)> {
        let data = Zeroizing::new(self.slot_load(slot)?);
        let (code, private) = data
            .split_first()
            .ok_or_else(|| SecmoduleError::InvalidKey(format!("slot {slot} holds no key pair")))?;
        let keypair_type = KeypairType::from_u8(*code)
            .ok_or_else(|| SecmoduleError::InvalidKey(format!("slot {slot} key type {code}")))?;
        Ok((keypair_type, Zeroizing::new(private.to_vec())))
    }
}

fn p256_signing_key(private: &[u8]) -> SecmoduleResult<p256::ecdsa::SigningKey> {
    p256::ecdsa::SigningKey::from_slice(private)
        .map_err(|e| SecmoduleError::InvalidKey(format!("secp256r1 private key: {e}")))
}

fn ed25519_signing_key(private: &[u8]) -> SecmoduleResult<ed25519_dalek::SigningKey> {
    let bytes: [u8; 32] = private
        .try_into()
        .map_err(|_| SecmoduleError::InvalidKey("ed25519 private key length".to_string()))?;
    Ok(ed25519_dalek::SigningKey::from_bytes(&bytes))
}

impl Secmodule for SoftSecmodule {
    fn hash_create(&self, hash_type: HashType, data: &[u8]) -> SecmoduleResult<Vec<u8>> {
        Ok(match hash_type {
            HashType::Sha256 => Sha256::digest(data).to_vec(),
            HashType::Sha384 => Sha384::digest(data).to_vec(),
            HashType::Sha512 => Sha512::digest(data).to_vec(),
        })
    }

    fn keypair_create(&self, slot: SlotId, keypair_type: KeypairType) -> SecmoduleResult<()> {
        let mut data = Zeroizing::new(vec![keypair_type.as_u8()]);
        match keypair_type {
            KeypairType::Secp256r1 => {
                let key = p256::ecdsa::SigningKey::random(&mut OsRng);
                data.extend_from_slice(&key.to_bytes());
            }
            KeypairType::Ed25519 => {
                let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
                data.extend_from_slice(&key.to_bytes());
            }
            other => {
                return Err(SecmoduleError::Unsupported(format!(
                    "key generation for {other:?}"
                )))
            }
        }
        debug!(%slot, ?keypair_type, "key pair created");
        self.slot_save(slot, &data)
    }

    fn keypair_get_pubkey(&self, slot: SlotId) -> SecmoduleResult<(KeypairType, Vec<u8>)> {
        let (keypair_type, private) = self.private_key(slot)?;
        let public = match keypair_type {
            KeypairType::Secp256r1 => p256_signing_key(&private)?
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            KeypairType::Ed25519 => ed25519_signing_key(&private)?
                .verifying_key()
                .to_bytes()
                .to_vec(),
            other => return Err(SecmoduleError::Unsupported(format!("{other:?} key pair"))),
        };
        Ok((keypair_type, public))
    }

    fn ecdsa_sign(&self, slot: SlotId, hash_type: HashType, hash: &[u8]) -> SecmoduleResult<Vec<u8>> {
        if hash.len() != hash_type.digest_len() {
            return Err(SecmoduleError::InvalidKey(format!(
                "digest length {} for {hash_type:?}",
                hash.len()
            )));
        }
        let (keypair_type, private) = self.private_key(slot)?;
        match keypair_type {
            KeypairType::Secp256r1 => {
                let signature: p256::ecdsa::Signature = p256_signing_key(&private)?
                    .sign_prehash(hash)
                    .map_err(|e| SecmoduleError::Device(format!("ecdsa sign: {e}")))?;
                Ok(signature.to_bytes().to_vec())
            }
            KeypairType::Ed25519 => Ok(ed25519_signing_key(&private)?.sign(hash).to_bytes().to_vec()),
            other => Err(SecmoduleError::Unsupported(format!("signing with {other:?}"))),
        }
    }

    fn ecdsa_verify(
        &self,
        keypair_type: KeypairType,
        public_key: &[u8],
        hash_type: HashType,
        hash: &[u8],
        signature: &[u8],
    ) -> SecmoduleResult<()> {
        if hash.len() != hash_type.digest_len() {
            return Err(SecmoduleError::VerificationFailed);
        }
        match keypair_type {
            KeypairType::Secp256r1 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                    .map_err(|e| SecmoduleError::InvalidKey(format!("secp256r1 public key: {e}")))?;
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| SecmoduleError::VerificationFailed)?;
                key.verify_prehash(hash, &signature)
                    .map_err(|_| SecmoduleError::VerificationFailed)
            }
            KeypairType::Ed25519 => {
                let bytes: [u8; 32] = public_key
                    .try_into()
                    .map_err(|_| SecmoduleError::InvalidKey("ed25519 public key length".to_string()))?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| SecmoduleError::InvalidKey(format!("ed25519 public key: {e}")))?;
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| SecmoduleError::VerificationFailed)?;
                key.verify(hash, &signature)
                    .map_err(|_| SecmoduleError::VerificationFailed)
            }
            other => Err(SecmoduleError::Unsupported(format!("verification with {other:?}"))),
        }
    }

    fn slot_save(&self, slot: SlotId, data: &[u8]) -> SecmoduleResult<()> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        slots.insert(slot, Zeroizing::new(data.to_vec()));
        Ok(())
    }

    fn slot_load(&self, slot: SlotId) -> SecmoduleResult<Vec<u8>> {
        let slots = self.slots.lock().map_err(poisoned)?;
        slots
            .get(&slot)
            .map(|data| data.to_vec())
            .ok_or(SecmoduleError::EmptySlot(slot))
    }

    fn slot_delete(&self, slot: SlotId) -> SecmoduleResult<()> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        slots.remove(&slot);
        Ok(())
    }
}
