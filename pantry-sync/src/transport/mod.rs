//! Data channel transports.
//!
//! A data channel is an ordered, reliable pair of frame queues between two
//! peers ([`ChannelHalves`]). Transports only move frames; framing, sessions
//! and liveness live above them.
//!
//! ```text
//!   dialer                                  listener
//!   ┌──────────┐  outbound ───────► inbound ┌──────────┐
//!   │ halves   │                            │ halves   │
//!   └──────────┘  inbound ◄─────── outbound └──────────┘
//! ```
//!
//! - [`memory`] — in-process channels with fault injection
//! - [`websocket`] — binary WebSocket messages over TCP

pub mod memory;
pub mod websocket;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use websocket::WebSocketTransport;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Dialable address, exchanged during signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Memory(u64),
    /// `ws://host:port`
    WebSocket(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Memory(id) => write!(f, "mem://{id}"),
            Endpoint::WebSocket(url) => write!(f, "{url}"),
        }
    }
}

/// Both directions of one live data channel.
///
/// Dropping `outbound` closes the channel towards the peer; `inbound`
/// yields `None` once the peer side is gone.
#[derive(Debug)]
pub struct ChannelHalves {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelHalves {
    /// Two connected halves: what one writes, the other reads.
    pub fn pair() -> (ChannelHalves, ChannelHalves) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelHalves {
                outbound: a_tx,
                inbound: b_rx,
            },
            ChannelHalves {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Accepted channels for one local endpoint.
#[derive(Debug)]
pub struct Listener {
    pub endpoint: Endpoint,
    pub incoming: mpsc::UnboundedReceiver<ChannelHalves>,
}

/// Opens outgoing data channels.
pub trait Transport: Send + Sync {
    fn dial(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<ChannelHalves, TransportError>>;
}
