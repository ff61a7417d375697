//! Binary protocol for change replication between two peers.
//!
//! Three replication messages carry the data, the rest control the session:
//!
//! ```text
//!   A                                  B
//!   │── Poke(site, max_version) ──────►│   "I may have new changes"
//!   │◄── Request(id, site, since) ─────│   "send me changes since V"
//!   │── Changes(id, site, records, ───►│   possibly empty; `available`
//!   │          available)              │   tells B whether to page on
//! ```
//!
//! Session control: `Hello` binds a data channel to a signaling handshake,
//! `Ping`/`Pong` prove liveness, `Goodbye` closes in order.
//!
//! Messages are bincode-encoded (standard config) and then framed by
//! [`crate::framing`].

use pantry_core::{ChangeRecord, SiteId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::framing::FrameError;

/// Wire protocol version carried in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// First message on every data channel, in both directions.
    Hello {
        site_id: SiteId,
        session: Uuid,
        protocol_version: u16,
    },
    /// The sender holds changes from `site_id` up to `version`.
    Poke { site_id: SiteId, version: u64 },
    /// Send changes from `site_id` with version above `since`.
    Request {
        request_id: u64,
        site_id: SiteId,
        since: u64,
    },
    /// Answer to the `Request` with the same `request_id`.
    Changes {
        request_id: u64,
        site_id: SiteId,
        records: Vec<ChangeRecord>,
        /// Responder's cursor for `site_id`
        available: u64,
    },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Goodbye { reason: String },
}

impl SyncMessage {
    pub fn hello(site_id: SiteId, session: Uuid) -> Self {
        Self::Hello {
            site_id,
            session,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn poke(site_id: SiteId, version: u64) -> Self {
        Self::Poke { site_id, version }
    }

    pub fn request(request_id: u64, site_id: SiteId, since: u64) -> Self {
        Self::Request {
            request_id,
            site_id,
            since,
        }
    }

    pub fn changes(
        request_id: u64,
        site_id: SiteId,
        records: Vec<ChangeRecord>,
        available: u64,
    ) -> Self {
        Self::Changes {
            request_id,
            site_id,
            records,
            available,
        }
    }

    pub fn goodbye(reason: impl Into<String>) -> Self {
        Self::Goodbye {
            reason: reason.into(),
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Poke { .. } => "poke",
            Self::Request { .. } => "request",
            Self::Changes { .. } => "changes",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Goodbye { .. } => "goodbye",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    VersionMismatch { local: u16, remote: u16 },
    /// Message not valid in the current session state
    UnexpectedMessage(&'static str),
    Framing(FrameError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::VersionMismatch { local, remote } => {
                write!(f, "Protocol version mismatch: local {local}, remote {remote}")
            }
            Self::UnexpectedMessage(kind) => write!(f, "Unexpected {kind} message"),
            Self::Framing(e) => write!(f, "Framing error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<FrameError> for ProtocolError {
    fn from(e: FrameError) -> Self {
        Self::Framing(e)
    }
}
