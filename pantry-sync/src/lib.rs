//! # pantry-sync — Peer-to-peer replication for pantry stores
//!
//! Keeps [`pantry_core::ChangeStore`] replicas in sync over direct data
//! channels. Peers find each other through a signaling rendezvous, open a
//! channel, and exchange change records with a three-message protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  Offer/Answer   ┌─────────────┐  Offer/Answer  ┌─────────────┐
//! │ PeerManager │ ◄──────────────► │ Rendezvous  │ ◄────────────► │ PeerManager │
//! │ (site A)    │                  │ memory/relay│                │ (site B)    │
//! └──────┬──────┘                  └─────────────┘                └──────┬──────┘
//!        │            data channel: framed SyncMessages                  │
//!        └───────────── Poke / Request / Changes ───────────────────────┘
//!        │                                                               │
//!        ▼                                                               ▼
//! ┌─────────────┐                                                 ┌─────────────┐
//! │ Replicator  │── apply / changes_since ──► ChangeStore ◄───────│ Replicator  │
//! └─────────────┘                                                 └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`framing`] — Frame header, fragmentation, LZ4, reassembly
//! - [`session`] — Typed message sessions over a data channel
//! - [`transport`] — In-memory and WebSocket data channels
//! - [`signaling`] — Handshake signals, in-memory rendezvous, WebSocket relay
//! - [`replicator`] — Per-connection poke/request/changes state machine
//! - [`manager`] — Connection lifecycle, gossip and liveness
//! - [`config`] — Tunables
//! - [`token`] — Shareable connect tokens

pub mod config;
pub mod error;
pub mod framing;
pub mod manager;
pub mod protocol;
pub mod replicator;
pub mod session;
pub mod signaling;
pub mod token;
pub mod transport;

// Re-exports for convenience
pub use config::{ConfigError, SyncConfig};
pub use error::{SignalingError, SyncError, TransportError};
pub use framing::{FrameError, FrameHeader, Fragmenter, Reassembler};
pub use manager::{
    ConnectionId, ConnectionInfo, ConnectionSnapshot, ConnectionState, Direction, Links,
    PeerManager, Subscription,
};
pub use protocol::{ProtocolError, SyncMessage, PROTOCOL_VERSION};
pub use replicator::Replicator;
pub use session::{LinkEvent, LinkId, Session};
pub use signaling::{
    Envelope, MemoryRendezvous, MemorySignaling, RelayClient, RelayConfig, RelayServer, Signal,
    SignalingChannel,
};
pub use token::ConnectToken;
pub use transport::{
    ChannelHalves, Endpoint, Listener, MemoryNetwork, MemoryTransport, Transport,
    WebSocketTransport,
};
