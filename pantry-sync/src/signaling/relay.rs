//! WebSocket signaling relay.
//!
//! The relay only forwards handshake signals between registered tokens; it
//! never sees replication traffic.
//!
//! ```text
//! Client A ──┐                         ┌── Client B
//!            ├── RelayServer ──────────┤
//!            │   token → sender map    │
//!   Send(to=B, Offer) ──► Deliver(from=A, Offer) ──►
//!   ◄── Undeliverable(to=C, Offer)  (C not registered)
//! ```

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{SignalingError, TransportError};
use crate::signaling::{Envelope, Signal, SignalingChannel};
use crate::token::ConnectToken;

/// Frames on a relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay: route signals for `token` to this connection
    Register { token: ConnectToken },
    /// Relay → client: registration acknowledged
    Registered,
    /// Client → relay
    Send { to: ConnectToken, signal: Signal },
    /// Relay → client
    Deliver { from: ConnectToken, signal: Signal },
    /// Relay → client: `to` is not registered
    Undeliverable { to: ConnectToken, signal: Signal },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, SignalingError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SignalingError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SignalingError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SignalingError::Encoding(e.to_string()))?;
        Ok(frame)
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub registered: usize,
    pub delivered: u64,
    pub undeliverable: u64,
}

type Registry = Arc<RwLock<HashMap<ConnectToken, mpsc::UnboundedSender<RelayFrame>>>>;

/// The signaling relay.
pub struct RelayServer {
    config: RelayConfig,
    clients: Registry,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            clients: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Signaling relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New relay connection from {addr}");

            let clients = self.clients.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, clients, stats).await {
                    log::warn!("Relay connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        clients: Registry,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), TransportError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut token: Option<ConnectToken> = None;

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Err(TransportError::from(e)),
                    };
                    let frame = match RelayFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Dropping malformed relay frame from {addr}: {e}");
                            continue;
                        }
                    };
                    match frame {
                        RelayFrame::Register { token: registered } => {
                            let count = {
                                let mut clients_w = clients.write().await;
                                clients_w.insert(registered, tx.clone());
                                clients_w.len()
                            };
                            stats.write().await.registered = count;
                            token = Some(registered);
                            let _ = tx.send(RelayFrame::Registered);
                            log::info!("{registered} registered from {addr}");
                        }
                        RelayFrame::Send { to, signal } => {
                            let Some(from) = token else {
                                log::warn!("Send before Register from {addr}");
                                continue;
                            };
                            let target = clients.read().await.get(&to).cloned();
                            let delivered = target
                                .map(|peer| peer.send(RelayFrame::Deliver { from, signal: signal.clone() }).is_ok())
                                .unwrap_or(false);
                            let mut s = stats.write().await;
                            if delivered {
                                s.delivered += 1;
                            } else {
                                s.undeliverable += 1;
                                log::debug!("{to} not registered, bouncing signal from {from}");
                                let _ = tx.send(RelayFrame::Undeliverable { to, signal });
                            }
                        }
                        other => log::warn!("Unexpected relay frame from {addr}: {other:?}"),
                    }
                }
                Some(frame) = rx.recv() => {
                    let encoded = match frame.encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            log::error!("Failed to encode relay frame: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                        break Err(TransportError::from(e));
                    }
                }
            }
        };

        if let Some(token) = token {
            let mut clients_w = clients.write().await;
            // A reconnect may already have replaced this entry
            if clients_w.get(&token).is_some_and(|sender| sender.same_channel(&tx)) {
                clients_w.remove(&token);
            }
            stats.write().await.registered = clients_w.len();
            log::info!("{token} left the relay");
        }
        stats.write().await.active_connections -= 1;

        result
    }
}

/// A relay connection registered under one token.
#[derive(Clone)]
pub struct RelayClient {
    token: ConnectToken,
    outbound: mpsc::UnboundedSender<RelayFrame>,
}

impl RelayClient {
    /// Connect to `url` and register `token`. Returns once the relay has
    /// acknowledged the registration.
    pub async fn connect(
        url: &str,
        token: ConnectToken,
    ) -> Result<(RelayClient, mpsc::UnboundedReceiver<Envelope>), SignalingError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SignalingError::Connect(format!("{url}: {e}")))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let register = RelayFrame::Register { token }.encode()?;
        ws_sender
            .send(Message::Binary(register.into()))
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Envelope>();
        let (ack_tx, ack_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode relay frame: {e}");
                        continue;
                    }
                };
                if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        tokio::spawn(async move {
            let mut ack_tx = Some(ack_tx);
            while let Some(msg) = ws_receiver.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("Relay read failed: {e}");
                        break;
                    }
                };
                let envelope = match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Registered) => {
                        if let Some(ack) = ack_tx.take() {
                            let _ = ack.send(());
                        }
                        continue;
                    }
                    Ok(RelayFrame::Deliver { from, signal }) => Envelope { from, signal },
                    // An offer nobody can answer is rejected on the offerer's side
                    Ok(RelayFrame::Undeliverable {
                        to,
                        signal: Signal::Offer { session, .. },
                    }) => Envelope {
                        from: to,
                        signal: Signal::Reject {
                            session,
                            reason: format!("{to} is not connected to the relay"),
                        },
                    },
                    Ok(RelayFrame::Undeliverable { to, .. }) => {
                        log::debug!("Signal to {to} was undeliverable");
                        continue;
                    }
                    Ok(other) => {
                        log::warn!("Unexpected relay frame: {other:?}");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("Dropping malformed relay frame: {e}");
                        continue;
                    }
                };
                if inbox_tx.send(envelope).is_err() {
                    break;
                }
            }
            log::debug!("Relay connection for {token} closed");
        });

        ack_rx.await.map_err(|_| SignalingError::ChannelClosed)?;
        log::info!("Registered {token} with relay {url}");

        Ok((
            RelayClient {
                token,
                outbound: out_tx,
            },
            inbox_rx,
        ))
    }

    pub fn token(&self) -> ConnectToken {
        self.token
    }
}

impl SignalingChannel for RelayClient {
    fn send(&self, to: &ConnectToken, signal: Signal) -> Result<(), SignalingError> {
        self.outbound
            .send(RelayFrame::Send { to: *to, signal })
            .map_err(|_| SignalingError::ChannelClosed)
    }
}
