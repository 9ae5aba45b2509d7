//! File versions and the "is newer" rule.
//!
//! A version is ordered by its `(major, minor, patch, build)` tuple only.
//! The embedded timestamp is informational: two versions whose tuples match
//! are the same release, and a timestamp-only difference is reported as a
//! warning rather than treated as an upgrade.

use crate::error::CoreResult;
use crate::types::{DEVICE_TYPE_SIZE, MANUFACTURE_ID_SIZE};
use crate::wire::{WireReader, WireWriter};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Version timestamps count seconds from 2015-01-01T00:00:00Z
pub const VERSION_EPOCH_UNIX: u64 = 1_420_070_400;

/// Encoded size of [`FileVersion`]
pub const FILE_VERSION_SIZE: usize = 11;

/// Encoded size of [`FileInfo`]
pub const FILE_INFO_SIZE: usize = MANUFACTURE_ID_SIZE + DEVICE_TYPE_SIZE + FILE_VERSION_SIZE;

/// Version of a distributable file (firmware, trust list, user file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FileVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u32,
    /// Seconds since [`VERSION_EPOCH_UNIX`]
    pub timestamp: u32,
}

/// Outcome of comparing a candidate against the installed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    /// Candidate tuple is strictly greater
    Newer,
    /// Tuples and timestamps are identical
    Same,
    /// Tuples match but timestamps differ
    TimestampOnly,
    /// Candidate tuple is strictly smaller
    Older,
}

impl FileVersion {
    pub fn new(major: u8, minor: u8, patch: u8, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn tuple(&self) -> (u8, u8, u8, u32) {
        (self.major, self.minor, self.patch, self.build)
    }

    /// Compare `self` (candidate) against `current`.
    pub fn compare(&self, current: &FileVersion) -> VersionOrdering {
        match self.tuple().cmp(&current.tuple()) {
            Ordering::Greater => VersionOrdering::Newer,
            Ordering::Less => VersionOrdering::Older,
            Ordering::Equal if self.timestamp != current.timestamp => {
                VersionOrdering::TimestampOnly
            }
            Ordering::Equal => VersionOrdering::Same,
        }
    }

    /// True iff the candidate tuple is strictly greater than `current`.
    pub fn is_newer_than(&self, current: &FileVersion) -> bool {
        match self.compare(current) {
            VersionOrdering::Newer => true,
            VersionOrdering::TimestampOnly => {
                tracing::warn!(
                    candidate = %self,
                    current = %current,
                    "versions differ only by timestamp, not treated as newer"
                );
                false
            }
            VersionOrdering::Same | VersionOrdering::Older => false,
        }
    }

    /// Timestamp as Unix seconds
    pub fn unix_timestamp(&self) -> u64 {
        VERSION_EPOCH_UNIX + u64::from(self.timestamp)
    }

    /// Timestamp as a UTC date, `YYYY-MM-DD HH:MM:SS UTC`
    pub fn timestamp_date(&self) -> String {
        match i64::try_from(self.unix_timestamp())
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
        {
            Some(date) => date.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => format!("unix {}", self.unix_timestamp()),
        }
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.u8(self.major)
            .u8(self.minor)
            .u8(self.patch)
            .u32(self.build)
            .u32(self.timestamp);
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            major: r.u8()?,
            minor: r.u8()?,
            patch: r.u8()?,
            build: r.u32()?,
            timestamp: r.u32()?,
        })
    }
}

impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ver {}.{}.{}.{}, {}",
            self.major,
            self.minor,
            self.patch,
            self.build,
            self.timestamp_date()
        )
    }
}

/// Identity plus version of a distributable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub manufacture_id: [u8; MANUFACTURE_ID_SIZE],
    pub device_type: [u8; DEVICE_TYPE_SIZE],
    pub version: FileVersion,
}

impl FileInfo {
    pub fn encode(&self, w: &mut WireWriter) {
        w.bytes(&self.manufacture_id).bytes(&self.device_type);
        self.version.encode(w);
    }

    pub fn decode(r: &mut WireReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            manufacture_id: r.array()?,
            device_type: r.array()?,
            version: FileVersion::decode(r)?,
        })
    }
}
