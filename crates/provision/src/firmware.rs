//! Firmware images: descriptor, signed footer and the A/B image store.
//!
//! A distributed firmware file is a header (offsets plus descriptor), the
//! raw firmware bytes and a footer carrying the signatures. The signed digest
//! covers the firmware, an 0xFF fill up to `app_size - footer_length` and
//! the fixed part of the footer.

use crate::banks::BankedStore;
use crate::error::{ProvisionError, ProvisionResult};
use crate::provision::Provision;
use crate::quorum::QuorumPolicy;
use crate::records::SignRecord;
use crate::secmodule::KeypairType;
use crate::storage::{Storage, StorageId};
use crate::update::{window, UpdateFileType, UpdateInterface};
use iotkit_core::{
    CoreError, CoreResult, FileVersion, WireReader, WireWriter, DEVICE_TYPE_SIZE,
    MANUFACTURE_ID_SIZE,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Encoded size of [`FirmwareDescriptor`]
pub const FIRMWARE_DESCRIPTOR_SIZE: usize = 44;

/// Encoded size of [`FirmwareHeader`]
pub const FIRMWARE_HEADER_SIZE: usize = 16 + 1 + FIRMWARE_DESCRIPTOR_SIZE;

/// Fixed part of the footer: signatures_count plus descriptor
pub const FIRMWARE_FOOTER_FIXED_SIZE: usize = 1 + FIRMWARE_DESCRIPTOR_SIZE;

/// Firmware version as carried in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersion {
    pub app_type: [u8; 4],
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub dev_milestone: u8,
    pub dev_build: u8,
    pub timestamp: u32,
}

impl FirmwareVersion {
    /// Comparable file version; milestone and build form the build number
    pub fn file_version(&self) -> FileVersion {
        FileVersion {
            major: self.major,
            minor: self.minor,
            patch: self.patch,
            build: (u32::from(self.dev_milestone) << 8) | u32::from(self.dev_build),
            timestamp: self.timestamp,
        }
    }

    fn encode(&self, w: &mut WireWriter) {
        w.bytes(&self.app_type)
            .u8(self.major)
            .u8(self.minor)
            .u8(self.patch)
            .u8(self.dev_milestone)
            .u8(self.dev_build)
            .u32(self.timestamp);
    }

    fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            app_type: r.array()?,
            major: r.u8()?,
            minor: r.u8()?,
            patch: r.u8()?,
            dev_milestone: r.u8()?,
            dev_build: r.u8()?,
            timestamp: r.u32()?,
        })
    }
}

/// Packed firmware descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    pub manufacture_id: [u8; MANUFACTURE_ID_SIZE],
    pub device_type: [u8; DEVICE_TYPE_SIZE],
    pub version: FirmwareVersion,
    pub padding: u8,
    pub chunk_size: u16,
    pub firmware_length: u32,
    /// firmware_length + fill + footer
    pub app_size: u32,
}

impl FirmwareDescriptor {
    pub fn encode(&self, w: &mut WireWriter) {
        w.bytes(&self.manufacture_id).bytes(&self.device_type);
        self.version.encode(w);
        w.u8(self.padding)
            .u16(self.chunk_size)
            .u32(self.firmware_length)
            .u32(self.app_size);
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            manufacture_id: r.array()?,
            device_type: r.array()?,
            version: FirmwareVersion::decode(r)?,
            padding: r.u8()?,
            chunk_size: r.u16()?,
            firmware_length: r.u32()?,
            app_size: r.u32()?,
        })
    }

    pub fn file_type(&self) -> UpdateFileType {
        UpdateFileType::firmware(
            self.manufacture_id,
            self.device_type,
            self.version.file_version(),
        )
    }

    fn matches(&self, file_type: &UpdateFileType) -> bool {
        self.manufacture_id == file_type.info.manufacture_id
            && self.device_type == file_type.info.device_type
    }
}

/// Header served ahead of the firmware data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub code_offset: u32,
    pub code_length: u32,
    pub footer_offset: u32,
    pub footer_length: u32,
    pub signatures_count: u8,
    pub descriptor: FirmwareDescriptor,
}

impl FirmwareHeader {
    pub fn encode(&self, w: &mut WireWriter) {
        w.u32(self.code_offset)
            .u32(self.code_length)
            .u32(self.footer_offset)
            .u32(self.footer_length)
            .u8(self.signatures_count);
        self.descriptor.encode(w);
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            code_offset: r.u32()?,
            code_length: r.u32()?,
            footer_offset: r.u32()?,
            footer_length: r.u32()?,
            signatures_count: r.u8()?,
            descriptor: FirmwareDescriptor::decode(r)?,
        })
    }

    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        let mut r = WireReader::new(data);
        let header = Self::decode(&mut r)?;
        r.finish()?;
        Ok(header)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(FIRMWARE_HEADER_SIZE);
        self.encode(&mut w);
        w.into_vec()
    }
}

/// Signed footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareFooter {
    pub descriptor: FirmwareDescriptor,
    pub signatures: Vec<SignRecord>,
}

impl FirmwareFooter {
    fn fixed_bytes(descriptor: &FirmwareDescriptor, signatures_count: u8) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(FIRMWARE_FOOTER_FIXED_SIZE);
        w.u8(signatures_count);
        descriptor.encode(&mut w);
        w.into_vec()
    }

    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let count = u8::try_from(self.signatures.len()).map_err(|_| CoreError::InvalidValue {
            field: "signatures_count",
            value: self.signatures.len() as u64,
        })?;
        let mut w = WireWriter::new();
        w.bytes(&Self::fixed_bytes(&self.descriptor, count));
        for sign in &self.signatures {
            sign.encode(&mut w)?;
        }
        Ok(w.into_vec())
    }

    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        let mut r = WireReader::new(data);
        let count = r.u8()?;
        let descriptor = FirmwareDescriptor::decode(&mut r)?;
        let signatures = (0..count)
            .map(|_| SignRecord::decode(&mut r))
            .collect::<CoreResult<Vec<_>>>()?;
        r.finish()?;
        Ok(Self {
            descriptor,
            signatures,
        })
    }
}

/// Bytes covered by every firmware signature.
pub fn firmware_signed_bytes(
    descriptor: &FirmwareDescriptor,
    firmware: &[u8],
    footer_len: usize,
    signatures_count: u8,
) -> CoreResult<Vec<u8>> {
    let fill = (descriptor.app_size as usize)
        .checked_sub(firmware.len())
        .and_then(|rest| rest.checked_sub(footer_len))
        .ok_or(CoreError::InvalidValue {
            field: "app_size",
            value: u64::from(descriptor.app_size),
        })?;
    let mut out = Vec::with_capacity(firmware.len() + fill + FIRMWARE_FOOTER_FIXED_SIZE);
    out.extend_from_slice(firmware);
    out.resize(firmware.len() + fill, 0xFF);
    out.extend_from_slice(&FirmwareFooter::fixed_bytes(descriptor, signatures_count));
    Ok(out)
}

/// Complete firmware file as stored and served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub header: FirmwareHeader,
    pub firmware: Vec<u8>,
    pub footer: FirmwareFooter,
    footer_bytes: Vec<u8>,
}

impl FirmwareImage {
    /// Build and sign an image for `descriptor`. `firmware_length` is taken
    /// from `firmware`; `app_size` must leave room for the footer.
    pub fn build_signed<E, F>(
        mut descriptor: FirmwareDescriptor,
        firmware: Vec<u8>,
        signer_types: &[KeypairType],
        mut sign: F,
    ) -> Result<Self, E>
    where
        E: From<CoreError>,
        F: FnMut(usize, &[u8]) -> Result<SignRecord, E>,
    {
        descriptor.firmware_length = u32::try_from(firmware.len()).map_err(|_| {
            CoreError::InvalidValue {
                field: "firmware_length",
                value: firmware.len() as u64,
            }
        })?;
        let count = u8::try_from(signer_types.len()).map_err(|_| CoreError::InvalidValue {
            field: "signatures_count",
            value: signer_types.len() as u64,
        })?;
        let footer_len = FIRMWARE_FOOTER_FIXED_SIZE
            + signer_types
                .iter()
                .map(|t| 3 + t.signature_len() + t.pubkey_len())
                .sum::<usize>();
        let signed = firmware_signed_bytes(&descriptor, &firmware, footer_len, count)?;
        let mut signatures = Vec::with_capacity(signer_types.len());
        for index in 0..signer_types.len() {
            signatures.push(sign(index, &signed)?);
        }
        let footer = FirmwareFooter {
            descriptor,
            signatures,
        };
        let footer_bytes = footer.to_bytes()?;
        if footer_bytes.len() != footer_len {
            return Err(CoreError::InvalidValue {
                field: "footer length",
                value: footer_bytes.len() as u64,
            }
            .into());
        }
        let header = FirmwareHeader {
            code_offset: FIRMWARE_HEADER_SIZE as u32,
            code_length: descriptor.firmware_length,
            footer_offset: FIRMWARE_HEADER_SIZE as u32 + descriptor.firmware_length,
            footer_length: footer_len as u32,
            signatures_count: count,
            descriptor,
        };
        Ok(Self {
            header,
            firmware,
            footer,
            footer_bytes,
        })
    }

    pub fn parse(data: &[u8]) -> CoreResult<Self> {
        let mut r = WireReader::new(data);
        let header = FirmwareHeader::decode(&mut r)?;
        let firmware = r.bytes(header.code_length as usize)?.to_vec();
        let footer_bytes = r.bytes(header.footer_length as usize)?.to_vec();
        r.finish()?;
        let footer = FirmwareFooter::from_bytes(&footer_bytes)?;
        Ok(Self {
            header,
            firmware,
            footer,
            footer_bytes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.to_bytes();
        out.extend_from_slice(&self.firmware);
        out.extend_from_slice(&self.footer_bytes);
        out
    }

    pub fn footer_bytes(&self) -> &[u8] {
        &self.footer_bytes
    }

    pub fn descriptor(&self) -> &FirmwareDescriptor {
        &self.header.descriptor
    }

    pub fn file_type(&self) -> UpdateFileType {
        self.header.descriptor.file_type()
    }

    fn signed_bytes(&self) -> CoreResult<Vec<u8>> {
        firmware_signed_bytes(
            &self.footer.descriptor,
            &self.firmware,
            self.footer_bytes.len(),
            self.footer.signatures.len() as u8,
        )
    }
}

#[derive(Debug)]
struct FwStaging {
    header: FirmwareHeader,
    received: u32,
}

/// Installed firmware images, one A/B bank pair per manufacturer and
/// device type.
pub struct FirmwareManager {
    storage: Arc<dyn Storage>,
    provision: Arc<Provision>,
    policy: QuorumPolicy,
    max_image_size: usize,
    staging: Mutex<HashMap<UpdateFileType, FwStaging>>,
}

impl std::fmt::Debug for FirmwareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareManager")
            .field("policy", &self.policy)
            .field("max_image_size", &self.max_image_size)
            .finish()
    }
}

impl FirmwareManager {
    pub fn new(storage: Arc<dyn Storage>, provision: Arc<Provision>) -> Self {
        Self {
            storage,
            provision,
            policy: QuorumPolicy::firmware(),
            max_image_size: 4 * 1024 * 1024,
            staging: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_image_size(mut self, max_image_size: usize) -> Self {
        self.max_image_size = max_image_size;
        self
    }

    fn base_id(file_type: &UpdateFileType) -> StorageId {
        StorageId::new(format!(
            "fw/{}-{}",
            hex::encode(file_type.info.manufacture_id),
            hex::encode(file_type.info.device_type)
        ))
    }

    fn banks(&self, file_type: &UpdateFileType) -> BankedStore {
        BankedStore::new(self.storage.clone(), Self::base_id(file_type))
    }

    fn tmp_id(file_type: &UpdateFileType) -> StorageId {
        Self::base_id(file_type).child("tmp")
    }

    fn lock(&self) -> ProvisionResult<MutexGuard<'_, HashMap<UpdateFileType, FwStaging>>> {
        self.staging
            .lock()
            .map_err(|_| ProvisionError::LockPoisoned("firmware staging"))
    }

    /// Installed image for the file type's manufacturer and device type
    pub fn load_image(&self, file_type: &UpdateFileType) -> ProvisionResult<Option<FirmwareImage>> {
        match self.banks(file_type).read_active()? {
            Some(raw) => Ok(Some(FirmwareImage::parse(&raw)?)),
            None => Ok(None),
        }
    }

    fn installed(&self, file_type: &UpdateFileType) -> ProvisionResult<FirmwareImage> {
        self.load_image(file_type)?
            .ok_or_else(|| ProvisionError::NotFound(format!("no firmware for {file_type}")))
    }

    /// Check an image against the firmware signature policy
    pub fn verify_image(&self, image: &FirmwareImage) -> ProvisionResult<()> {
        if image.footer.descriptor != image.header.descriptor {
            return Err(ProvisionError::Verification(
                "footer descriptor differs from header".to_string(),
            ));
        }
        if image.firmware.len() != image.header.descriptor.firmware_length as usize {
            return Err(ProvisionError::Verification(format!(
                "firmware length {} differs from descriptor {}",
                image.firmware.len(),
                image.header.descriptor.firmware_length
            )));
        }
        self.policy.verify(
            self.provision.secmodule(),
            self.provision.as_ref(),
            &image.signed_bytes()?,
            &image.footer.signatures,
        )?;
        Ok(())
    }

    /// Verify and install a complete image; it must be newer than the
    /// installed one.
    pub fn store_image(&self, image: &FirmwareImage) -> ProvisionResult<FileVersion> {
        self.verify_image(image)?;
        let file_type = image.file_type();
        let candidate = file_type.version();
        if let Some(installed) = self.load_image(&file_type)? {
            let current = installed.file_type().version();
            if !candidate.is_newer_than(&current) {
                return Err(ProvisionError::NotNewer { candidate, current });
            }
        }
        self.banks(&file_type).commit(&image.to_bytes())?;
        info!(file = %file_type, version = %candidate, "firmware installed");
        Ok(candidate)
    }

    fn discard(&self, file_type: &UpdateFileType) -> ProvisionResult<()> {
        self.lock()?.remove(file_type);
        self.storage.remove(&Self::tmp_id(file_type))?;
        Ok(())
    }
}

impl UpdateInterface for FirmwareManager {
    fn current_version(&self, file_type: &UpdateFileType) -> FileVersion {
        match self.load_image(file_type) {
            Ok(Some(image)) => image.file_type().version(),
            Ok(None) => FileVersion::default(),
            Err(e) => {
                warn!(file = %file_type, error = %e, "installed firmware unreadable");
                FileVersion::default()
            }
        }
    }

    fn header(&self, file_type: &UpdateFileType) -> ProvisionResult<Vec<u8>> {
        Ok(self.installed(file_type)?.header.to_bytes())
    }

    fn file_size(&self, file_type: &UpdateFileType) -> ProvisionResult<u32> {
        Ok(self.installed(file_type)?.header.code_length)
    }

    fn data(&self, file_type: &UpdateFileType, offset: u32, max: usize) -> ProvisionResult<Vec<u8>> {
        window(&self.installed(file_type)?.firmware, offset, max)
    }

    fn footer(&self, file_type: &UpdateFileType) -> ProvisionResult<Vec<u8>> {
        Ok(self.installed(file_type)?.footer_bytes)
    }

    fn install_prepare_space(
        &self,
        file_type: &UpdateFileType,
        header: &[u8],
        file_size: u32,
    ) -> ProvisionResult<()> {
        let parsed = FirmwareHeader::from_bytes(header)?;
        if !parsed.descriptor.matches(file_type) {
            return Err(ProvisionError::InvalidArgument(format!(
                "header describes {}, expected {file_type}",
                parsed.descriptor.file_type()
            )));
        }
        if file_size != parsed.code_length || file_size != parsed.descriptor.firmware_length {
            return Err(ProvisionError::InvalidArgument(format!(
                "file size {file_size}, header declares {}",
                parsed.code_length
            )));
        }
        let total = header.len() + file_size as usize + parsed.footer_length as usize;
        if total > self.max_image_size {
            return Err(ProvisionError::BufferTooSmall {
                needed: total,
                limit: self.max_image_size,
            });
        }
        self.storage.replace(&Self::tmp_id(file_type), header)?;
        self.lock()?.insert(
            *file_type,
            FwStaging {
                header: parsed,
                received: 0,
            },
        );
        debug!(file = %file_type, size = file_size, "firmware download prepared");
        Ok(())
    }

    fn install_append_data(
        &self,
        file_type: &UpdateFileType,
        offset: u32,
        data: &[u8],
    ) -> ProvisionResult<()> {
        let mut staging = self.lock()?;
        let entry = staging
            .get_mut(file_type)
            .ok_or_else(|| ProvisionError::OutOfSequence("firmware data before header".to_string()))?;
        if offset != entry.received {
            return Err(ProvisionError::OutOfSequence(format!(
                "offset {offset}, expected {}",
                entry.received
            )));
        }
        let end = offset as usize + data.len();
        if end > entry.header.code_length as usize {
            return Err(ProvisionError::InvalidArgument(format!(
                "data ends at {end}, firmware length {}",
                entry.header.code_length
            )));
        }
        self.storage.write(
            &Self::tmp_id(file_type),
            FIRMWARE_HEADER_SIZE + offset as usize,
            data,
        )?;
        entry.received = end as u32;
        Ok(())
    }

    fn verify_and_activate(
        &self,
        file_type: &UpdateFileType,
        footer: &[u8],
    ) -> ProvisionResult<FileVersion> {
        let result = (|| {
            let header = {
                let staging = self.lock()?;
                let entry = staging.get(file_type).ok_or_else(|| {
                    ProvisionError::OutOfSequence("firmware footer before header".to_string())
                })?;
                if entry.received != entry.header.code_length {
                    return Err(ProvisionError::OutOfSequence(format!(
                        "footer after {} of {} bytes",
                        entry.received, entry.header.code_length
                    )));
                }
                entry.header
            };
            if footer.len() != header.footer_length as usize {
                return Err(ProvisionError::InvalidArgument(format!(
                    "footer length {}, header declares {}",
                    footer.len(),
                    header.footer_length
                )));
            }
            let tmp = Self::tmp_id(file_type);
            self.storage
                .write(&tmp, FIRMWARE_HEADER_SIZE + header.code_length as usize, footer)?;
            self.storage.sync(&tmp)?;
            let raw = self
                .storage
                .read_all(&tmp)?
                .ok_or_else(|| ProvisionError::NotFound("staged firmware".to_string()))?;
            let image = FirmwareImage::parse(&raw)?;
            self.store_image(&image)
        })();

        if let Err(e) = self.discard(file_type) {
            error!(file = %file_type, error = %e, "failed to discard firmware download");
        }
        if let Err(e) = &result {
            warn!(file = %file_type, error = %e, "firmware rejected");
        }
        result
    }

    fn abort(&self, file_type: &UpdateFileType) {
        if let Err(e) = self.discard(file_type) {
            error!(file = %file_type, error = %e, "failed to discard firmware download");
        }
    }
}
