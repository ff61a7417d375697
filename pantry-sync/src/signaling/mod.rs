//! Signaling: one-time handshake payloads addressed by connect token.
//!
//! ```text
//!   offerer                      rendezvous                     answerer
//!      │── Offer(session, site) ────►│─────────────────────────────►│
//!      │◄────────────────────────────│◄── Answer(session, site, ────│
//!      │                             │           endpoint)          │
//!      │══════════ dial endpoint, Hello both ways (data channel) ═══│
//! ```
//!
//! - [`memory`] — in-process rendezvous for tests and embedding
//! - [`relay`] — WebSocket relay server and client

pub mod memory;
pub mod relay;

pub use memory::{MemoryRendezvous, MemorySignaling};
pub use relay::{RelayClient, RelayConfig, RelayServer};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SignalingError;
use crate::token::ConnectToken;
use crate::transport::Endpoint;

/// Handshake payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    Offer {
        session: Uuid,
        site_id: pantry_core::SiteId,
    },
    Answer {
        session: Uuid,
        site_id: pantry_core::SiteId,
        endpoint: Endpoint,
    },
    Reject {
        session: Uuid,
        reason: String,
    },
}

impl Signal {
    pub fn session(&self) -> Uuid {
        match self {
            Signal::Offer { session, .. }
            | Signal::Answer { session, .. }
            | Signal::Reject { session, .. } => *session,
        }
    }
}

/// A signal together with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ConnectToken,
    pub signal: Signal,
}

/// Outgoing half of a signaling client. Incoming envelopes arrive on the
/// inbox receiver handed out when the client joins.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, to: &ConnectToken, signal: Signal) -> Result<(), SignalingError>;
}
