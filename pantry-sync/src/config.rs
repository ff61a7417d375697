//! Sync configuration.
//!
//! Plain struct with defaults. Missing JSON fields fall back to the default
//! value, so a config file only needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::framing::HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Re-send a pending request after this long (0 = never)
    pub request_timeout_ms: u64,
    /// Fail handshakes that take longer than this
    pub handshake_timeout_ms: u64,
    /// Ping established peers this often
    pub ping_interval_ms: u64,
    /// Close a channel that has been silent this long
    pub liveness_timeout_ms: u64,
    /// Housekeeping tick of the manager loop
    pub tick_interval_ms: u64,
    /// Max bytes per frame, header included
    pub max_message_size: usize,
    /// Compress encoded messages larger than this
    pub compression_threshold: usize,
    /// Soft page size for `changes_since`
    pub max_batch_records: usize,
    /// Messages being reassembled at once, per channel
    pub max_reassembly_messages: usize,
    /// Bytes buffered for reassembly, per channel
    pub max_reassembly_bytes: usize,
    /// Closed connections kept for diagnostics
    pub closed_history: usize,
    /// Also poke the peer a batch came from
    pub gossip_to_sender: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            handshake_timeout_ms: 15_000,
            ping_interval_ms: 5_000,
            liveness_timeout_ms: 20_000,
            tick_interval_ms: 250,
            max_message_size: 16 * 1024, // SCTP-safe data channel message
            compression_threshold: 1024,
            max_batch_records: 512,
            max_reassembly_messages: 16,
            max_reassembly_bytes: 32 * 1024 * 1024,
            closed_history: 32,
            gossip_to_sender: false,
        }
    }
}

impl SyncConfig {
    /// Short timeouts and small frames, so tests exercise fragmentation.
    pub fn for_testing() -> Self {
        Self {
            request_timeout_ms: 2_000,
            handshake_timeout_ms: 3_000,
            ping_interval_ms: 200,
            liveness_timeout_ms: 2_000,
            tick_interval_ms: 50,
            max_message_size: 1024,
            compression_threshold: 512,
            max_batch_records: 64,
            max_reassembly_messages: 8,
            max_reassembly_bytes: 4 * 1024 * 1024,
            closed_history: 16,
            gossip_to_sender: false,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size <= HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must exceed the {HEADER_LEN}-byte frame header"
            )));
        }
        if self.max_batch_records == 0 {
            return Err(ConfigError::Invalid("max_batch_records must be positive".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Configuration loading errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Config I/O error: {e}"),
            Self::Parse(e) => write!(f, "Config parse error: {e}"),
            Self::Invalid(e) => write!(f, "Invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
