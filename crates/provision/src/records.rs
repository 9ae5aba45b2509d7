//! Packed key, signature and trust list records.
//!
//! Every record is big-endian and decoded field by field. Key and signature
//! lengths are implied by the declared keypair type.

use crate::secmodule::{HashType, KeypairType};
use iotkit_core::wire::len_u16;
use iotkit_core::{CoreError, CoreResult, FileVersion, WireReader, WireWriter};
use serde::{Deserialize, Serialize};

/// Encoded size of [`TrustListHeader`]
pub const TL_HEADER_SIZE: usize = 4 + iotkit_core::FILE_VERSION_SIZE + 2 + 1;

/// Role of a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyType {
    Recovery,
    Auth,
    TrustList,
    Firmware,
    Factory,
    IotDevice,
    UserDevice,
    FirmwareInternal,
    AuthInternal,
    Cloud,
}

impl KeyType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use KeyType::*;
        Some(match v {
            0 => Recovery,
            1 => Auth,
            2 => TrustList,
            3 => Firmware,
            4 => Factory,
            5 => IotDevice,
            6 => UserDevice,
            7 => FirmwareInternal,
            8 => AuthInternal,
            9 => Cloud,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        use KeyType::*;
        match self {
            Recovery => 0,
            Auth => 1,
            TrustList => 2,
            Firmware => 3,
            Factory => 4,
            IotDevice => 5,
            UserDevice => 6,
            FirmwareInternal => 7,
            AuthInternal => 8,
            Cloud => 9,
        }
    }

    fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        let v = r.u8()?;
        Self::from_u8(v).ok_or(CoreError::InvalidValue {
            field: "key_type",
            value: u64::from(v),
        })
    }
}

fn decode_keypair_type(r: &mut WireReader<'_>) -> CoreResult<KeypairType> {
    let v = r.u8()?;
    KeypairType::from_u8(v).ok_or(CoreError::InvalidValue {
        field: "ec_type",
        value: u64::from(v),
    })
}

fn decode_hash_type(r: &mut WireReader<'_>) -> CoreResult<HashType> {
    let v = r.u8()?;
    HashType::from_u8(v).ok_or(CoreError::InvalidValue {
        field: "hash_type",
        value: u64::from(v),
    })
}

/// Typed public key with optional metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubkeyRecord {
    pub key_type: KeyType,
    pub ec_type: KeypairType,
    pub meta: Vec<u8>,
    pub key: Vec<u8>,
}

impl PubkeyRecord {
    pub fn new(key_type: KeyType, ec_type: KeypairType, key: Vec<u8>) -> Self {
        Self {
            key_type,
            ec_type,
            meta: Vec::new(),
            key,
        }
    }

    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.meta.len() + self.key.len()
    }

    pub fn encode(&self, w: &mut WireWriter) -> CoreResult<()> {
        if self.key.len() != self.ec_type.pubkey_len() {
            return Err(CoreError::InvalidValue {
                field: "pubkey length",
                value: self.key.len() as u64,
            });
        }
        w.u8(self.key_type.as_u8())
            .u8(self.ec_type.as_u8())
            .u16(len_u16(self.meta.len(), "meta_size")?)
            .bytes(&self.meta)
            .bytes(&self.key);
        Ok(())
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        let key_type = KeyType::decode(r)?;
        let ec_type = decode_keypair_type(r)?;
        let meta_size = r.u16()? as usize;
        let meta = r.bytes(meta_size)?.to_vec();
        let key = r.bytes(ec_type.pubkey_len())?.to_vec();
        Ok(Self {
            key_type,
            ec_type,
            meta,
            key,
        })
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut w = WireWriter::with_capacity(self.encoded_len());
        self.encode(&mut w)?;
        Ok(w.into_vec())
    }

    /// Short hex fingerprint for logs
    pub fn fingerprint(&self) -> String {
        let take = self.key.len().min(8);
        hex::encode(&self.key[self.key.len() - take..])
    }
}

/// Public key with a validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedPubkey {
    pub start_date: u32,
    pub expire_date: u32,
    pub pubkey: PubkeyRecord,
}

impl DatedPubkey {
    pub fn new(pubkey: PubkeyRecord) -> Self {
        Self {
            start_date: 0,
            expire_date: u32::MAX,
            pubkey,
        }
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.pubkey.encoded_len()
    }

    pub fn encode(&self, w: &mut WireWriter) -> CoreResult<()> {
        w.u32(self.start_date).u32(self.expire_date);
        self.pubkey.encode(w)
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            start_date: r.u32()?,
            expire_date: r.u32()?,
            pubkey: PubkeyRecord::decode(r)?,
        })
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut w = WireWriter::with_capacity(self.encoded_len());
        self.encode(&mut w)?;
        Ok(w.into_vec())
    }
}

/// Raw signature together with the signer's public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRecord {
    pub signer_type: KeyType,
    pub ec_type: KeypairType,
    pub hash_type: HashType,
    pub signature: Vec<u8>,
    pub signer_key: Vec<u8>,
}

impl SignRecord {
    pub fn encoded_len(&self) -> usize {
        3 + self.signature.len() + self.signer_key.len()
    }

    pub fn encode(&self, w: &mut WireWriter) -> CoreResult<()> {
        if self.signature.len() != self.ec_type.signature_len() {
            return Err(CoreError::InvalidValue {
                field: "signature length",
                value: self.signature.len() as u64,
            });
        }
        if self.signer_key.len() != self.ec_type.pubkey_len() {
            return Err(CoreError::InvalidValue {
                field: "signer key length",
                value: self.signer_key.len() as u64,
            });
        }
        w.u8(self.signer_type.as_u8())
            .u8(self.ec_type.as_u8())
            .u8(self.hash_type.as_u8())
            .bytes(&self.signature)
            .bytes(&self.signer_key);
        Ok(())
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        let signer_type = KeyType::decode(r)?;
        let ec_type = decode_keypair_type(r)?;
        let hash_type = decode_hash_type(r)?;
        let signature = r.bytes(ec_type.signature_len())?.to_vec();
        let signer_key = r.bytes(ec_type.pubkey_len())?.to_vec();
        Ok(Self {
            signer_type,
            ec_type,
            hash_type,
            signature,
            signer_key,
        })
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut w = WireWriter::with_capacity(self.encoded_len());
        self.encode(&mut w)?;
        Ok(w.into_vec())
    }
}

/// High-level key as pushed by PRVS and stored in a key slot.
///
/// Every key except RECOVERY carries a signature by a RECOVERY key over the
/// dated pubkey bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlKeyRecord {
    pub dated: DatedPubkey,
    pub sign: Option<SignRecord>,
}

impl HlKeyRecord {
    pub fn encode(&self, w: &mut WireWriter) -> CoreResult<()> {
        self.dated.encode(w)?;
        if let Some(sign) = &self.sign {
            sign.encode(w)?;
        }
        Ok(())
    }

    /// Decode a record, returning it with the length of its signed prefix.
    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<(Self, usize)> {
        let start = r.position();
        let dated = DatedPubkey::decode(r)?;
        let signed_len = r.position() - start;
        let sign = if dated.pubkey.key_type == KeyType::Recovery {
            None
        } else {
            let sign = SignRecord::decode(r)?;
            if sign.signer_type != KeyType::Recovery {
                return Err(CoreError::InvalidValue {
                    field: "hl key signer_type",
                    value: u64::from(sign.signer_type.as_u8()),
                });
            }
            Some(sign)
        };
        Ok((Self { dated, sign }, signed_len))
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut w = WireWriter::new();
        self.encode(&mut w)?;
        Ok(w.into_vec())
    }
}

/// Fixed-size trust list header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustListHeader {
    /// Total encoded size of the list, header and footer included
    pub tl_size: u32,
    pub version: FileVersion,
    pub pub_keys_count: u16,
    pub signatures_count: u8,
}

impl TrustListHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.u32(self.tl_size);
        self.version.encode(w);
        w.u16(self.pub_keys_count).u8(self.signatures_count);
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            tl_size: r.u32()?,
            version: FileVersion::decode(r)?,
            pub_keys_count: r.u16()?,
            signatures_count: r.u8()?,
        })
    }

    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        if data.len() != TL_HEADER_SIZE {
            return Err(CoreError::InvalidValue {
                field: "trust list header size",
                value: data.len() as u64,
            });
        }
        Self::decode(&mut WireReader::new(data))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(TL_HEADER_SIZE);
        self.encode(&mut w);
        w.into_vec()
    }
}

/// Trust list footer: list type followed by the signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustListFooter {
    pub tl_type: u8,
    pub signatures: Vec<SignRecord>,
}

impl TrustListFooter {
    pub fn encode(&self, w: &mut WireWriter) -> CoreResult<()> {
        w.u8(self.tl_type);
        for sign in &self.signatures {
            sign.encode(w)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut WireReader<'_>, signatures_count: u8) -> CoreResult<Self> {
        let tl_type = r.u8()?;
        let signatures = (0..signatures_count)
            .map(|_| SignRecord::decode(r))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            tl_type,
            signatures,
        })
    }
}

/// Fully parsed trust list together with its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustList {
    pub header: TrustListHeader,
    pub keys: Vec<DatedPubkey>,
    pub footer: TrustListFooter,
    raw: Vec<u8>,
    keys_end: usize,
}

impl TrustList {
    /// Parse a complete list. `tl_size` must equal the number of bytes
    /// supplied and no trailing bytes are tolerated.
    pub fn parse(raw: Vec<u8>) -> CoreResult<Self> {
        let mut r = WireReader::new(&raw);
        let header = TrustListHeader::decode(&mut r)?;
        if header.tl_size as usize != raw.len() {
            return Err(CoreError::InvalidValue {
                field: "tl_size",
                value: u64::from(header.tl_size),
            });
        }
        let keys = (0..header.pub_keys_count)
            .map(|_| DatedPubkey::decode(&mut r))
            .collect::<CoreResult<Vec<_>>>()?;
        let keys_end = r.position();
        let footer = TrustListFooter::decode(&mut r, header.signatures_count)?;
        r.finish()?;
        Ok(Self {
            header,
            keys,
            footer,
            raw,
            keys_end,
        })
    }

    /// Assemble and encode a list from parts, computing `tl_size`.
    pub fn build(
        version: FileVersion,
        keys: Vec<DatedPubkey>,
        footer: TrustListFooter,
    ) -> CoreResult<Self> {
        let keys_len: usize = keys.iter().map(DatedPubkey::encoded_len).sum();
        let footer_len: usize = 1 + footer
            .signatures
            .iter()
            .map(SignRecord::encoded_len)
            .sum::<usize>();
        let tl_size = TL_HEADER_SIZE + keys_len + footer_len;
        let header = TrustListHeader {
            tl_size: u32::try_from(tl_size).map_err(|_| CoreError::InvalidValue {
                field: "tl_size",
                value: tl_size as u64,
            })?,
            version,
            pub_keys_count: len_u16(keys.len(), "pub_keys_count")?,
            signatures_count: u8::try_from(footer.signatures.len()).map_err(|_| {
                CoreError::InvalidValue {
                    field: "signatures_count",
                    value: footer.signatures.len() as u64,
                }
            })?,
        };
        let mut w = WireWriter::with_capacity(tl_size);
        header.encode(&mut w);
        for key in &keys {
            key.encode(&mut w)?;
        }
        let keys_end = w.len();
        footer.encode(&mut w)?;
        Ok(Self {
            header,
            keys,
            footer,
            raw: w.into_vec(),
            keys_end,
        })
    }

    /// Assemble and sign a list.
    ///
    /// `signer_types` declares the keypair type of each signature so the
    /// header (which is itself signed) can carry the final size. `sign` is
    /// called once per signer with the signed bytes.
    pub fn build_signed<E, F>(
        version: FileVersion,
        keys: Vec<DatedPubkey>,
        tl_type: u8,
        signer_types: &[KeypairType],
        mut sign: F,
    ) -> Result<Self, E>
    where
        E: From<CoreError>,
        F: FnMut(usize, &[u8]) -> Result<SignRecord, E>,
    {
        let keys_len: usize = keys.iter().map(DatedPubkey::encoded_len).sum();
        let signs_len: usize = signer_types
            .iter()
            .map(|t| 3 + t.signature_len() + t.pubkey_len())
            .sum();
        let tl_size = TL_HEADER_SIZE + keys_len + 1 + signs_len;
        let header = TrustListHeader {
            tl_size: u32::try_from(tl_size).map_err(|_| CoreError::InvalidValue {
                field: "tl_size",
                value: tl_size as u64,
            })?,
            version,
            pub_keys_count: len_u16(keys.len(), "pub_keys_count")?,
            signatures_count: u8::try_from(signer_types.len()).map_err(|_| {
                CoreError::InvalidValue {
                    field: "signatures_count",
                    value: signer_types.len() as u64,
                }
            })?,
        };
        let mut w = WireWriter::with_capacity(tl_size);
        header.encode(&mut w);
        for key in &keys {
            key.encode(&mut w)?;
        }
        let signed = Self::signed_bytes_of(&w.into_vec(), tl_type);

        let mut signatures = Vec::with_capacity(signer_types.len());
        for (index, expected) in signer_types.iter().enumerate() {
            let record = sign(index, &signed)?;
            if record.ec_type != *expected {
                return Err(CoreError::InvalidValue {
                    field: "signer ec_type",
                    value: u64::from(record.ec_type.as_u8()),
                }
                .into());
            }
            signatures.push(record);
        }
        Ok(Self::build(
            version,
            keys,
            TrustListFooter {
                tl_type,
                signatures,
            },
        )?)
    }

    /// Bytes covered by every list signature: header, key records and tl_type.
    pub fn signed_bytes(&self) -> Vec<u8> {
        Self::signed_bytes_of(&self.raw[..self.keys_end], self.footer.tl_type)
    }

    /// Signed byte range for a list under construction
    pub fn signed_bytes_of(header_and_keys: &[u8], tl_type: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(header_and_keys.len() + 1);
        out.extend_from_slice(header_and_keys);
        out.push(tl_type);
        out
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.raw[..TL_HEADER_SIZE]
    }

    /// Encoded key records
    pub fn keys_bytes(&self) -> &[u8] {
        &self.raw[TL_HEADER_SIZE..self.keys_end]
    }

    pub fn footer_bytes(&self) -> &[u8] {
        &self.raw[self.keys_end..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p256_key(fill: u8) -> Vec<u8> {
        let mut key = vec![fill; 65];
        key[0] = 0x04;
        key
    }

    fn sign(signer_type: KeyType, fill: u8) -> SignRecord {
        SignRecord {
            signer_type,
            ec_type: KeypairType::Secp256r1,
            hash_type: HashType::Sha256,
            signature: vec![fill; 64],
            signer_key: p256_key(fill),
        }
    }

    #[test]
    fn test_pubkey_layout() {
        let rec = PubkeyRecord::new(KeyType::Cloud, KeypairType::Ed25519, vec![7; 32])
            .with_meta(b"url".to_vec());
        let bytes = rec.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[9, 10, 0, 3]);
        assert_eq!(&bytes[4..7], b"url");
        assert_eq!(bytes.len(), 4 + 3 + 32);
        let back = PubkeyRecord::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_pubkey_wrong_length_rejected() {
        let rec = PubkeyRecord::new(KeyType::Auth, KeypairType::Secp256r1, vec![1; 10]);
        assert!(rec.to_bytes().is_err());
    }

    #[test]
    fn test_unknown_key_type_rejected() {
        let bytes = [42u8, 3, 0, 0];
        assert!(matches!(
            PubkeyRecord::decode(&mut WireReader::new(&bytes)),
            Err(CoreError::InvalidValue {
                field: "key_type",
                value: 42
            })
        ));
    }

    #[test]
    fn test_hl_record_requires_recovery_signature() {
        let dated = DatedPubkey::new(PubkeyRecord::new(
            KeyType::Auth,
            KeypairType::Secp256r1,
            p256_key(1),
        ));
        let good = HlKeyRecord {
            dated: dated.clone(),
            sign: Some(sign(KeyType::Recovery, 2)),
        };
        let bytes = good.to_bytes().unwrap();
        let (back, signed_len) = HlKeyRecord::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(back, good);
        assert_eq!(signed_len, dated.encoded_len());

        let unsigned = dated.to_bytes().unwrap();
        assert!(HlKeyRecord::decode(&mut WireReader::new(&unsigned)).is_err());

        let wrong_signer = HlKeyRecord {
            dated,
            sign: Some(sign(KeyType::Auth, 2)),
        };
        let bytes = wrong_signer.to_bytes().unwrap();
        assert!(HlKeyRecord::decode(&mut WireReader::new(&bytes)).is_err());
    }

    #[test]
    fn test_recovery_record_has_no_signature() {
        let dated = DatedPubkey::new(PubkeyRecord::new(
            KeyType::Recovery,
            KeypairType::Secp256r1,
            p256_key(3),
        ));
        let bytes = dated.to_bytes().unwrap();
        let (rec, _) = HlKeyRecord::decode(&mut WireReader::new(&bytes)).unwrap();
        assert!(rec.sign.is_none());
    }

    #[test]
    fn test_trust_list_build_and_parse() {
        let keys = vec![
            DatedPubkey::new(PubkeyRecord::new(
                KeyType::Cloud,
                KeypairType::Secp256r1,
                p256_key(4),
            )),
            DatedPubkey::new(PubkeyRecord::new(
                KeyType::Factory,
                KeypairType::Ed25519,
                vec![5; 32],
            )),
        ];
        let footer = TrustListFooter {
            tl_type: 0,
            signatures: vec![sign(KeyType::Auth, 6), sign(KeyType::TrustList, 7)],
        };
        let tl = TrustList::build(FileVersion::new(0, 1, 0, 3), keys.clone(), footer).unwrap();
        assert_eq!(tl.header.tl_size as usize, tl.as_bytes().len());
        assert_eq!(tl.header.pub_keys_count, 2);
        assert_eq!(tl.header.signatures_count, 2);
        assert_eq!(tl.header_bytes().len(), TL_HEADER_SIZE);

        let parsed = TrustList::parse(tl.as_bytes().to_vec()).unwrap();
        assert_eq!(parsed.keys, keys);
        assert_eq!(parsed.signed_bytes(), tl.signed_bytes());
        assert_eq!(*parsed.signed_bytes().last().unwrap(), 0);
    }

    #[test]
    fn test_trust_list_size_mismatch_rejected() {
        let tl = TrustList::build(
            FileVersion::new(1, 0, 0, 0),
            vec![],
            TrustListFooter {
                tl_type: 0,
                signatures: vec![],
            },
        )
        .unwrap();
        let mut raw = tl.into_bytes();
        raw.push(0);
        assert!(TrustList::parse(raw.clone()).is_err());
        raw.truncate(raw.len() - 2);
        assert!(TrustList::parse(raw).is_err());
    }
}
