//! Configuration management for the device kit.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub snap: SnapConfig,
    pub trust_list: TrustListConfig,
    pub fldt: FldtConfig,
    pub prvs: PrvsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapConfig {
    /// Maximum registered services
    pub max_services: usize,
    /// Maximum attached network interfaces
    pub max_netifs: usize,
    /// Largest frame accepted or produced, headers included
    pub max_packet_size: usize,
    /// Number of recent request ids accepted as response correlation targets
    pub outstanding_window: usize,
    /// Forward broadcast frames between netifs (gateway builds)
    pub route_broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustListConfig {
    /// Largest trust list accepted, in bytes
    pub max_size: usize,
    /// Largest single staged part, in bytes
    pub max_part_size: usize,
    /// Minimum signature count
    pub min_signatures: usize,
    /// Signer key types that must each contribute a verified signature
    pub required_signers: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FldtConfig {
    /// Largest data chunk served per GNFD response
    pub chunk_size: usize,
    /// Ticks to wait for a response before re-sending
    pub wait_max: u32,
    /// Re-sends before a download is abandoned
    pub retry_max: u32,
    /// Ticks between repeated INFV broadcasts, 0 disables
    pub infv_period_ticks: u32,
    /// Maximum registered file types
    pub max_file_types: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrvsConfig {
    /// Attempts per blocking client call
    pub retry_limit: u32,
    /// Maximum devices collected by DNID
    pub dnid_list_max: usize,
}

impl Config {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Render as pretty JSON for diagnostics
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn default_config() -> Self {
        Self {
            snap: SnapConfig {
                max_services: 10,
                max_netifs: 5,
                max_packet_size: 1024,
                outstanding_window: 32,
                route_broadcast: false,
            },
            trust_list: TrustListConfig {
                max_size: 4096,
                max_part_size: 512,
                min_signatures: 2,
                // AUTH and TRUSTLIST key types
                required_signers: vec![1, 2],
            },
            fldt: FldtConfig {
                chunk_size: 512,
                wait_max: 10,
                retry_max: 5,
                infv_period_ticks: 60,
                max_file_types: 10,
            },
            prvs: PrvsConfig {
                retry_limit: 5,
                dnid_list_max: 50,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
