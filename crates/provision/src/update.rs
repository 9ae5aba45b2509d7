//! Distributable file types and the update interface.
//!
//! An [`UpdateInterface`] connects one kind of distributable file (firmware
//! image, trust list, user file) to the distribution service. The source
//! side serves the installed file to other devices; the sink side receives
//! a new file in header, data and footer stages and activates it only after
//! verification.

use crate::error::{ProvisionError, ProvisionResult};
use iotkit_core::{
    CoreResult, FileInfo, FileVersion, WireReader, WireWriter, DEVICE_TYPE_SIZE, FILE_INFO_SIZE,
    MANUFACTURE_ID_SIZE,
};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Encoded size of [`UpdateFileType`]
pub const UPDATE_FILE_TYPE_SIZE: usize = 2 + FILE_INFO_SIZE;

/// Type of a distributable file plus the version on offer.
///
/// Identity is `type_id`, manufacturer and device type; two values that
/// differ only in version describe the same file type.
#[derive(Debug, Clone, Copy)]
pub struct UpdateFileType {
    pub type_id: u16,
    pub info: FileInfo,
}

impl UpdateFileType {
    pub const FIRMWARE: u16 = 0;
    pub const TRUST_LIST: u16 = 1;
    /// First type id available to applications
    pub const USER_BASE: u16 = 256;

    pub fn new(
        type_id: u16,
        manufacture_id: [u8; MANUFACTURE_ID_SIZE],
        device_type: [u8; DEVICE_TYPE_SIZE],
        version: FileVersion,
    ) -> Self {
        Self {
            type_id,
            info: FileInfo {
                manufacture_id,
                device_type,
                version,
            },
        }
    }

    /// Trust list file type; trust lists are not tied to a device model
    pub fn trust_list(version: FileVersion) -> Self {
        Self::new(
            Self::TRUST_LIST,
            [0; MANUFACTURE_ID_SIZE],
            [0; DEVICE_TYPE_SIZE],
            version,
        )
    }

    pub fn firmware(
        manufacture_id: [u8; MANUFACTURE_ID_SIZE],
        device_type: [u8; DEVICE_TYPE_SIZE],
        version: FileVersion,
    ) -> Self {
        Self::new(Self::FIRMWARE, manufacture_id, device_type, version)
    }

    pub fn version(&self) -> FileVersion {
        self.info.version
    }

    pub fn with_version(mut self, version: FileVersion) -> Self {
        self.info.version = version;
        self
    }

    pub fn is_user_type(&self) -> bool {
        self.type_id >= Self::USER_BASE
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.u16(self.type_id);
        self.info.encode(w);
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            type_id: r.u16()?,
            info: FileInfo::decode(r)?,
        })
    }
}

impl PartialEq for UpdateFileType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
            && self.info.manufacture_id == other.info.manufacture_id
            && self.info.device_type == other.info.device_type
    }
}

impl Eq for UpdateFileType {}

impl Hash for UpdateFileType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.info.manufacture_id.hash(state);
        self.info.device_type.hash(state);
    }
}

impl fmt::Display for UpdateFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_id {
            Self::TRUST_LIST => write!(f, "Trust List"),
            Self::FIRMWARE => write!(
                f,
                "Firmware {}/{}",
                String::from_utf8_lossy(iotkit_core::wire::unpad(&self.info.manufacture_id)),
                String::from_utf8_lossy(iotkit_core::wire::unpad(&self.info.device_type))
            ),
            other => write!(f, "File type {other}"),
        }
    }
}

fn unsupported<T>(file_type: &UpdateFileType, op: &str) -> ProvisionResult<T> {
    Err(ProvisionError::Unsupported(format!("{op} for {file_type}")))
}

/// Per-file-type hooks used by the distribution service.
///
/// Source-side methods default to `Unsupported` so a sink-only
/// implementation (a device that never serves the file) stays small, and
/// vice versa.
pub trait UpdateInterface: Send + Sync {
    /// Human-readable name of the file type
    fn describe(&self, file_type: &UpdateFileType) -> String {
        file_type.to_string()
    }

    /// Installed version, all zero when nothing is installed
    fn current_version(&self, file_type: &UpdateFileType) -> FileVersion;

    fn file_is_newer(&self, file_type: &UpdateFileType, candidate: &FileVersion) -> bool {
        candidate.is_newer_than(&self.current_version(file_type))
    }

    fn header(&self, file_type: &UpdateFileType) -> ProvisionResult<Vec<u8>> {
        unsupported(file_type, "header")
    }

    /// Size of the data section
    fn file_size(&self, file_type: &UpdateFileType) -> ProvisionResult<u32> {
        unsupported(file_type, "file_size")
    }

    fn has_footer(&self, _file_type: &UpdateFileType) -> bool {
        true
    }

    /// At most `max` data bytes starting at `offset`
    fn data(&self, file_type: &UpdateFileType, _offset: u32, _max: usize) -> ProvisionResult<Vec<u8>> {
        unsupported(file_type, "data")
    }

    fn footer(&self, file_type: &UpdateFileType) -> ProvisionResult<Vec<u8>> {
        unsupported(file_type, "footer")
    }

    /// Start receiving a file of `file_size` data bytes described by `header`
    fn install_prepare_space(
        &self,
        file_type: &UpdateFileType,
        _header: &[u8],
        _file_size: u32,
    ) -> ProvisionResult<()> {
        unsupported(file_type, "install_prepare_space")
    }

    fn install_append_data(
        &self,
        file_type: &UpdateFileType,
        _offset: u32,
        _data: &[u8],
    ) -> ProvisionResult<()> {
        unsupported(file_type, "install_append_data")
    }

    /// Verify the received file and make it current, returning its version
    fn verify_and_activate(
        &self,
        file_type: &UpdateFileType,
        _footer: &[u8],
    ) -> ProvisionResult<FileVersion> {
        unsupported(file_type, "verify_and_activate")
    }

    /// Drop a partially received file
    fn abort(&self, _file_type: &UpdateFileType) {}
}

/// Slice `data[offset..offset + max]`, clamped to the end.
pub(crate) fn window(data: &[u8], offset: u32, max: usize) -> ProvisionResult<Vec<u8>> {
    let start = offset as usize;
    if start > data.len() {
        return Err(ProvisionError::InvalidArgument(format!(
            "offset {start} beyond size {}",
            data.len()
        )));
    }
    let end = start.saturating_add(max).min(data.len());
    Ok(data[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotkit_core::fixed;

    #[test]
    fn test_identity_ignores_version() {
        let a = UpdateFileType::firmware(fixed(b"ACME"), fixed(b"LAMP"), FileVersion::new(1, 0, 0, 0));
        let b = a.with_version(FileVersion::new(2, 0, 0, 0));
        let c = UpdateFileType::firmware(fixed(b"ACME"), fixed(b"FAN"), FileVersion::new(1, 0, 0, 0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, UpdateFileType::trust_list(FileVersion::default()));
    }

    #[test]
    fn test_wire_size() {
        let ft = UpdateFileType::trust_list(FileVersion::new(0, 1, 2, 3));
        let mut w = WireWriter::new();
        ft.encode(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), UPDATE_FILE_TYPE_SIZE);
        assert_eq!(&bytes[..2], &[0, 1]);
        let back = UpdateFileType::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(back.version(), ft.version());
    }

    #[test]
    fn test_display() {
        let ft = UpdateFileType::firmware(fixed(b"ACME"), fixed(b"LAMP"), FileVersion::default());
        assert_eq!(ft.to_string(), "Firmware ACME/LAMP");
        assert!(UpdateFileType::new(300, [0; 16], [0; 4], FileVersion::default()).is_user_type());
    }

    #[test]
    fn test_window() {
        let data = [1u8, 2, 3, 4, 5];
        assert_eq!(window(&data, 1, 2).unwrap(), vec![2, 3]);
        assert_eq!(window(&data, 4, 10).unwrap(), vec![5]);
        assert!(window(&data, 5, 1).unwrap().is_empty());
        assert!(window(&data, 6, 1).is_err());
    }
}
