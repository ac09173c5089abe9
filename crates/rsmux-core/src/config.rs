use std::path::Path;

use rsmux_frame::{
    FrameConfig, ReassemblyConfig, DEFAULT_MIN_FRAGMENT_SIZE, FRAME_LENGTH_SIZE, FRAME_OFFSET,
    MAX_FRAME_LENGTH, MIN_MTU_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// Default bound on handler threads running for one connection.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1024;

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Fragment outbound payloads whose frame would exceed this many bytes
    /// (length prefix included). 0 disables fragmentation.
    pub mtu: usize,
    /// Largest frame sent or accepted, length prefix included.
    pub max_frame_length: usize,
    /// Largest reassembled inbound payload (metadata + data).
    pub max_inbound_payload_size: usize,
    /// Smallest accepted non-final inbound fragment.
    pub min_fragment_size: usize,
    /// Requests from the peer whose handlers may run at once. Further
    /// requests are rejected until one finishes.
    pub max_concurrent_requests: usize,
    /// Enables lease-based admission in both directions.
    pub lease: Option<LeaseConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mtu: 0,
            max_frame_length: MAX_FRAME_LENGTH,
            max_inbound_payload_size: usize::MAX,
            min_fragment_size: DEFAULT_MIN_FRAGMENT_SIZE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            lease: None,
        }
    }
}

impl ConnectionConfig {
    /// Check the settings are usable together.
    pub fn validate(&self) -> Result<()> {
        if !(FRAME_OFFSET..=MAX_FRAME_LENGTH).contains(&self.max_frame_length) {
            return Err(MuxError::Config(format!(
                "max_frame_length must be between {FRAME_OFFSET} and {MAX_FRAME_LENGTH}, got {}",
                self.max_frame_length
            )));
        }
        if self.mtu != 0 && !(MIN_MTU_SIZE..=self.max_frame_length).contains(&self.mtu) {
            return Err(MuxError::Config(format!(
                "mtu must be 0 or between {MIN_MTU_SIZE} and max_frame_length ({}), got {}",
                self.max_frame_length, self.mtu
            )));
        }
        if self.max_inbound_payload_size == 0 {
            return Err(MuxError::Config(
                "max_inbound_payload_size must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(MuxError::Config(
                "max_concurrent_requests must be greater than 0".into(),
            ));
        }
        if self.min_fragment_size > self.max_frame_length {
            return Err(MuxError::Config(format!(
                "min_fragment_size ({}) exceeds max_frame_length ({})",
                self.min_fragment_size, self.max_frame_length
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| MuxError::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_json(&json)
    }

    /// Reader/writer limits. The frame codec counts frame bytes without the
    /// length prefix.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_length: self.max_frame_length.saturating_sub(FRAME_LENGTH_SIZE),
            ..FrameConfig::default()
        }
    }

    pub fn reassembly_config(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            max_inbound_payload_size: self.max_inbound_payload_size,
            min_fragment_size: self.min_fragment_size,
        }
    }

    pub fn leases_enabled(&self) -> bool {
        self.lease.is_some()
    }
}

/// Lease settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    /// Requests waiting for a lease beyond this many are rejected.
    pub max_pending_requests: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: 256,
        }
    }
}
