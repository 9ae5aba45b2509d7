//! Multi-signature quorum verification.
//!
//! A signed file (trust list, firmware image) is accepted only when it
//! carries at least `min_signatures` signatures, every signature comes from a
//! key provisioned at factory time and verifies over the signed bytes, and
//! the verified signer types cover the required set. Any failing signature
//! rejects the whole file.

use crate::records::{KeyType, SignRecord};
use crate::secmodule::{KeypairType, Secmodule, SecmoduleError};
use iotkit_core::config::TrustListConfig;
use thiserror::Error;
use tracing::{debug, warn};

/// Quorum verification errors
#[derive(Debug, Error)]
pub enum QuorumError {
    /// Fewer signatures than the configured minimum
    #[error("Insufficient signatures: got {got}, required {required} for {operation}")]
    InsufficientSignatures {
        got: usize,
        required: usize,
        operation: &'static str,
    },

    /// Signer key is not one of the provisioned high-level keys
    #[error("Signer {signer_type:?} key {fingerprint} is not provisioned")]
    UnprovisionedSigner {
        signer_type: KeyType,
        fingerprint: String,
    },

    /// Signature does not verify
    #[error("Invalid signature from {signer_type:?}: {source}")]
    InvalidSignature {
        signer_type: KeyType,
        #[source]
        source: SecmoduleError,
    },

    /// A required signer type is absent
    #[error("Missing required signer {signer_type:?} for {operation}")]
    MissingSigner {
        signer_type: KeyType,
        operation: &'static str,
    },

    /// Invalid quorum configuration
    #[error("Invalid quorum configuration: {0}")]
    InvalidConfig(String),
}

/// Lookup of keys provisioned into the device's high-level key slots.
pub trait KeyAuthority {
    /// True when `key` is stored in one of the slots reserved for `key_type`
    fn is_provisioned(&self, key_type: KeyType, ec_type: KeypairType, key: &[u8]) -> bool;
}

/// Minimum signature count plus the signer types that must be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumPolicy {
    pub operation: &'static str,
    pub min_signatures: usize,
    pub required: Vec<KeyType>,
}

impl QuorumPolicy {
    /// Default trust list policy: two signatures, AUTH and TRUSTLIST present
    pub fn trust_list() -> Self {
        Self {
            operation: "trust list",
            min_signatures: 2,
            required: vec![KeyType::Auth, KeyType::TrustList],
        }
    }

    /// Firmware policy: two signatures, AUTH and FIRMWARE present
    pub fn firmware() -> Self {
        Self {
            operation: "firmware",
            min_signatures: 2,
            required: vec![KeyType::Auth, KeyType::Firmware],
        }
    }

    /// Trust list policy from configuration
    pub fn from_config(config: &TrustListConfig) -> Result<Self, QuorumError> {
        let required = config
            .required_signers
            .iter()
            .map(|v| {
                KeyType::from_u8(*v)
                    .ok_or_else(|| QuorumError::InvalidConfig(format!("unknown signer type {v}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let policy = Self {
            operation: "trust list",
            min_signatures: config.min_signatures,
            required,
        };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), QuorumError> {
        if self.min_signatures == 0 {
            return Err(QuorumError::InvalidConfig(
                "min_signatures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Verify `signatures` over `signed` against this policy.
    ///
    /// Returns the verified signer types in signature order.
    pub fn verify(
        &self,
        secmodule: &dyn Secmodule,
        authority: &dyn KeyAuthority,
        signed: &[u8],
        signatures: &[SignRecord],
    ) -> Result<Vec<KeyType>, QuorumError> {
        if signatures.len() < self.min_signatures {
            warn!(
                operation = self.operation,
                got = signatures.len(),
                required = self.min_signatures,
                "signature count below quorum"
            );
            return Err(QuorumError::InsufficientSignatures {
                got: signatures.len(),
                required: self.min_signatures,
                operation: self.operation,
            });
        }

        let mut verified = Vec::with_capacity(signatures.len());
        for sign in signatures {
            if !authority.is_provisioned(sign.signer_type, sign.ec_type, &sign.signer_key) {
                let fingerprint = hex::encode(&sign.signer_key[sign.signer_key.len().saturating_sub(8)..]);
                warn!(signer = ?sign.signer_type, %fingerprint, "signer key not provisioned");
                return Err(QuorumError::UnprovisionedSigner {
                    signer_type: sign.signer_type,
                    fingerprint,
                });
            }
            verify_sign(secmodule, sign, signed).map_err(|source| {
                warn!(signer = ?sign.signer_type, "signature rejected");
                QuorumError::InvalidSignature {
                    signer_type: sign.signer_type,
                    source,
                }
            })?;
            debug!(signer = ?sign.signer_type, "signature verified");
            verified.push(sign.signer_type);
        }

        for required in &self.required {
            if !verified.contains(required) {
                warn!(operation = self.operation, missing = ?required, "required signer absent");
                return Err(QuorumError::MissingSigner {
                    signer_type: *required,
                    operation: self.operation,
                });
            }
        }
        Ok(verified)
    }
}

/// Hash `data` with the record's hash type and check its signature.
pub fn verify_sign(
    secmodule: &dyn Secmodule,
    sign: &SignRecord,
    data: &[u8],
) -> Result<(), SecmoduleError> {
    let hash = secmodule.hash_create(sign.hash_type, data)?;
    secmodule.ecdsa_verify(
        sign.ec_type,
        &sign.signer_key,
        sign.hash_type,
        &hash,
        &sign.signature,
    )
}

#[cfg(all(test, feature = "soft-secmodule"))]
mod tests {
    use super::*;
    use crate::secmodule::{HashType, SlotId};
    use crate::soft::SoftSecmodule;

    struct Everything;

    impl KeyAuthority for Everything {
        fn is_provisioned(&self, _: KeyType, _: KeypairType, _: &[u8]) -> bool {
            true
        }
    }

    struct Nothing;

    impl KeyAuthority for Nothing {
        fn is_provisioned(&self, _: KeyType, _: KeypairType, _: &[u8]) -> bool {
            false
        }
    }

    fn signer(sm: &SoftSecmodule, slot: SlotId, signer_type: KeyType, data: &[u8]) -> SignRecord {
        sm.keypair_create(slot, KeypairType::Secp256r1).unwrap();
        let (ec_type, signer_key) = sm.keypair_get_pubkey(slot).unwrap();
        let hash = sm.hash_create(HashType::Sha256, data).unwrap();
        SignRecord {
            signer_type,
            ec_type,
            hash_type: HashType::Sha256,
            signature: sm.ecdsa_sign(slot, HashType::Sha256, &hash).unwrap(),
            signer_key,
        }
    }

    #[test]
    fn test_quorum_satisfied() {
        let sm = SoftSecmodule::new();
        let data = b"signed payload";
        let sigs = vec![
            signer(&sm, SlotId::Tmp(1), KeyType::Auth, data),
            signer(&sm, SlotId::Tmp(2), KeyType::TrustList, data),
        ];
        let verified = QuorumPolicy::trust_list()
            .verify(&sm, &Everything, data, &sigs)
            .unwrap();
        assert_eq!(verified, vec![KeyType::Auth, KeyType::TrustList]);
    }

    #[test]
    fn test_below_minimum_rejected() {
        let sm = SoftSecmodule::new();
        let data = b"x";
        let sigs = vec![signer(&sm, SlotId::Tmp(1), KeyType::Auth, data)];
        let err = QuorumPolicy::trust_list()
            .verify(&sm, &Everything, data, &sigs)
            .unwrap_err();
        assert!(matches!(
            err,
            QuorumError::InsufficientSignatures {
                got: 1,
                required: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_type_does_not_cover_missing() {
        let sm = SoftSecmodule::new();
        let data = b"x";
        let sigs = vec![
            signer(&sm, SlotId::Tmp(1), KeyType::Auth, data),
            signer(&sm, SlotId::Tmp(2), KeyType::Auth, data),
        ];
        let err = QuorumPolicy::trust_list()
            .verify(&sm, &Everything, data, &sigs)
            .unwrap_err();
        assert!(matches!(
            err,
            QuorumError::MissingSigner {
                signer_type: KeyType::TrustList,
                ..
            }
        ));
    }

    #[test]
    fn test_tampered_data_fails_closed() {
        let sm = SoftSecmodule::new();
        let sigs = vec![
            signer(&sm, SlotId::Tmp(1), KeyType::Auth, b"original"),
            signer(&sm, SlotId::Tmp(2), KeyType::TrustList, b"original"),
        ];
        let err = QuorumPolicy::trust_list()
            .verify(&sm, &Everything, b"tampered", &sigs)
            .unwrap_err();
        assert!(matches!(err, QuorumError::InvalidSignature { .. }));
    }

    #[test]
    fn test_unprovisioned_signer_rejected() {
        let sm = SoftSecmodule::new();
        let data = b"x";
        let sigs = vec![
            signer(&sm, SlotId::Tmp(1), KeyType::Auth, data),
            signer(&sm, SlotId::Tmp(2), KeyType::TrustList, data),
        ];
        let err = QuorumPolicy::trust_list()
            .verify(&sm, &Nothing, data, &sigs)
            .unwrap_err();
        assert!(matches!(err, QuorumError::UnprovisionedSigner { .. }));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = iotkit_core::Config::default_config().trust_list;
        let policy = QuorumPolicy::from_config(&config).unwrap();
        assert_eq!(policy, QuorumPolicy::trust_list());

        config.required_signers = vec![77];
        assert!(matches!(
            QuorumPolicy::from_config(&config),
            Err(QuorumError::InvalidConfig(_))
        ));

        config.required_signers = vec![];
        config.min_signatures = 0;
        assert!(QuorumPolicy::from_config(&config).is_err());
    }
}
