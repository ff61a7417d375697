//! Peer manager: connection lifecycle, handshakes and gossip.
//!
//! One tokio task owns every connection. Signaling envelopes, accepted data
//! channels, session events, dial results, local write notifications and
//! application commands all arrive as events on queues consumed by that
//! task; nothing else mutates connection state.
//!
//! ```text
//!   PeerManager (handle) ──Command──►┐
//!   signaling inbox ─────Envelope───►│
//!   listener ───────────ChannelHalves►│   Driver loop (select!)
//!   session readers ─────LinkEvent──►│   ├── pending:     handshakes
//!   dial tasks ──────────DialResult─►│   ├── established: Session + Replicator
//!   store.watch_local_version() ────►│   └── closed:      bounded history
//!   tick ───────────────────────────►┘
//!                                     │
//!                                     └──► watch::Sender<ConnectionSnapshot>
//!                                          + on_connections_changed callbacks
//! ```
//!
//! Handshake:
//!
//! ```text
//!   offerer                                         answerer
//!   Signaling ── Offer(session, site) ────────────► Connecting
//!   Connecting ◄─ Answer(session, site, endpoint) ──
//!   dial endpoint ═════════════════════════════════► accept
//!   ── Hello(site, session) ───────────────────────► Established
//!   Established ◄────────────── Hello(site, session) ──
//! ```

use pantry_core::{ApplyReport, ChangeStore, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::protocol::{ProtocolError, SyncMessage, PROTOCOL_VERSION};
use crate::replicator::Replicator;
use crate::session::{LinkEvent, LinkId, Session};
use crate::signaling::{
    Envelope, MemoryRendezvous, RelayClient, Signal, SignalingChannel,
};
use crate::token::ConnectToken;
use crate::transport::{
    ChannelHalves, Endpoint, Listener, MemoryNetwork, Transport, WebSocketTransport,
};

/// Identity of one connection attempt. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Offer sent, waiting for the answer
    Signaling,
    /// Answer exchanged, data channel being opened
    Connecting,
    Established,
    /// Ended in order (goodbye, local disconnect, channel end)
    Closed,
    /// Ended by an error; see `reason`
    Failed,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Signaling | Self::Connecting | Self::Established)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One row of the connection list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub site_id: SiteId,
    pub session: Uuid,
    pub direction: Direction,
    pub state: ConnectionState,
    pub reason: Option<String>,
    /// New records applied from this peer
    pub records_applied: u64,
}

/// Consistent view of every connection: live ones first, then the closed
/// history (oldest first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connections: Vec<ConnectionInfo>,
}

impl ConnectionSnapshot {
    pub fn established(&self) -> impl Iterator<Item = &ConnectionInfo> {
        self.connections
            .iter()
            .filter(|c| c.state == ConnectionState::Established)
    }

    pub fn is_established(&self, site: &SiteId) -> bool {
        self.established().any(|c| c.site_id == *site)
    }

    /// The live connection for `site`, otherwise its most recent closed one.
    pub fn get(&self, site: &SiteId) -> Option<&ConnectionInfo> {
        self.connections
            .iter()
            .find(|c| c.site_id == *site && c.state.is_live())
            .or_else(|| {
                self.connections
                    .iter()
                    .rev()
                    .find(|c| c.site_id == *site)
            })
    }

    pub fn state_of(&self, site: &SiteId) -> Option<ConnectionState> {
        self.get(site).map(|c| c.state)
    }

    pub fn by_id(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| c.id == id)
    }
}

type Callback = Arc<dyn Fn(&ConnectionSnapshot) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

type SharedSubscribers = Arc<Mutex<Subscribers>>;

fn lock_subscribers(subscribers: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps an `on_connections_changed` callback registered. Dropping it
/// unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock_subscribers(&subscribers).callbacks.remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Everything the manager needs to reach other peers.
pub struct Links {
    pub transport: Arc<dyn Transport>,
    pub listener: Listener,
    pub signaling: Arc<dyn SignalingChannel>,
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl Links {
    /// In-process links for `site`.
    pub fn memory(network: &MemoryNetwork, rendezvous: &MemoryRendezvous, site: SiteId) -> Self {
        let (transport, listener) = network.listen();
        let (signaling, inbox) = rendezvous.join(ConnectToken::for_site(site));
        Self {
            transport: Arc::new(transport),
            listener,
            signaling: Arc::new(signaling),
            inbox,
        }
    }

    /// WebSocket data channels on `bind_addr`, signaling through the relay
    /// at `relay_url`.
    pub async fn websocket(bind_addr: &str, relay_url: &str, site: SiteId) -> Result<Self, SyncError> {
        let listener = WebSocketTransport::bind(bind_addr).await?;
        let (signaling, inbox) = RelayClient::connect(relay_url, ConnectToken::for_site(site)).await?;
        Ok(Self {
            transport: Arc::new(WebSocketTransport::new()),
            listener,
            signaling: Arc::new(signaling),
            inbox,
        })
    }
}

enum Command {
    Connect {
        token: ConnectToken,
        reply: oneshot::Sender<Result<ConnectionId, SyncError>>,
    },
    Disconnect {
        site: SiteId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct DialResult {
    id: ConnectionId,
    session: Uuid,
    result: Result<ChannelHalves, TransportError>,
}

/// Application handle to the manager loop.
pub struct PeerManager {
    site_id: SiteId,
    endpoint: Endpoint,
    commands: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
    subscribers: SharedSubscribers,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Start the manager loop for `store`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(store: Arc<dyn ChangeStore>, links: Links, config: SyncConfig) -> Self {
        let site_id = store.site_id();
        let Links {
            transport,
            listener,
            signaling,
            inbox,
        } = links;
        let endpoint = listener.endpoint.clone();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (dials_tx, dials_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());
        let subscribers = SharedSubscribers::default();
        let local_version = store.watch_local_version();

        let driver = Driver {
            local_site: site_id,
            endpoint: endpoint.clone(),
            store,
            config,
            transport,
            signaling,
            events_tx,
            dials_tx,
            snapshot_tx,
            subscribers: subscribers.clone(),
            next_connection: 0,
            next_link: 0,
            next_nonce: 0,
            pending: BTreeMap::new(),
            established: BTreeMap::new(),
            unbound: HashMap::new(),
            closed: VecDeque::new(),
        };
        let task = tokio::spawn(run(
            driver,
            commands_rx,
            inbox,
            listener.incoming,
            events_rx,
            dials_rx,
            local_version,
        ));
        log::info!("Peer manager for {} started on {endpoint}", site_id.short());

        Self {
            site_id,
            endpoint,
            commands: commands_tx,
            snapshot_rx,
            subscribers,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// The token other peers use to reach this one.
    pub fn local_token(&self) -> ConnectToken {
        ConnectToken::for_site(self.site_id)
    }

    /// Where this peer accepts data channels.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Start a handshake with `token`. Resolves once the offer is sent;
    /// watch the snapshot for the outcome. Connecting to a site that is
    /// already pending or established returns the existing connection.
    pub async fn connect_to(&self, token: &ConnectToken) -> Result<ConnectionId, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                token: *token,
                reply,
            })
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Close the connection to `site`. Returns whether one was open.
    pub async fn disconnect(&self, site: &SiteId) -> Result<bool, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { site: *site, reply })
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Register `callback` for every state transition. It runs on the
    /// manager task and must not block.
    pub fn on_connections_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    {
        let mut subscribers = lock_subscribers(&self.subscribers);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.callbacks.insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Say goodbye to every peer and stop the loop.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Handshake {
    info: ConnectionInfo,
    started: Instant,
    channel: Option<Session>,
}

struct Peer {
    info: ConnectionInfo,
    channel: Session,
    replicator: Replicator,
    last_seen: Instant,
    last_ping: Instant,
}

/// Accepted channel whose Hello has not arrived yet.
struct Unbound {
    channel: Session,
    accepted: Instant,
}

struct Driver {
    local_site: SiteId,
    endpoint: Endpoint,
    store: Arc<dyn ChangeStore>,
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    signaling: Arc<dyn SignalingChannel>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    dials_tx: mpsc::UnboundedSender<DialResult>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    subscribers: SharedSubscribers,
    next_connection: u64,
    next_link: u64,
    next_nonce: u64,
    pending: BTreeMap<ConnectionId, Handshake>,
    established: BTreeMap<ConnectionId, Peer>,
    unbound: HashMap<LinkId, Unbound>,
    closed: VecDeque<ConnectionInfo>,
}

async fn run(
    mut driver: Driver,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    mut incoming: mpsc::UnboundedReceiver<ChannelHalves>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut dials: mpsc::UnboundedReceiver<DialResult>,
    mut local_version: watch::Receiver<u64>,
) {
    let mut ticker = tokio::time::interval(driver.config.tick_interval().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut inbox_open = true;
    let mut incoming_open = true;
    let mut local_open = true;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Connect { token, reply }) => {
                    let _ = reply.send(driver.connect(token));
                }
                Some(Command::Disconnect { site, reply }) => {
                    let _ = reply.send(driver.disconnect(site));
                }
                Some(Command::Shutdown { reply }) => {
                    driver.shutdown();
                    let _ = reply.send(());
                    break;
                }
                None => {
                    driver.shutdown();
                    break;
                }
            },
            envelope = inbox.recv(), if inbox_open => match envelope {
                Some(envelope) => driver.on_signal(envelope),
                None => {
                    log::warn!("Signaling inbox for {} closed", driver.local_site.short());
                    inbox_open = false;
                }
            },
            halves = incoming.recv(), if incoming_open => match halves {
                Some(halves) => driver.on_accepted(halves),
                None => {
                    log::warn!("Listener on {} closed", driver.endpoint);
                    incoming_open = false;
                }
            },
            Some(event) = events.recv() => driver.on_link_event(event),
            Some(dial) = dials.recv() => driver.on_dialed(dial),
            changed = local_version.changed(), if local_open => match changed {
                Ok(()) => {
                    let version = *local_version.borrow_and_update();
                    driver.on_local_write(version);
                }
                Err(_) => local_open = false,
            },
            now = ticker.tick() => driver.on_tick(now.into_std()),
        }
    }
    log::info!("Peer manager for {} stopped", driver.local_site.short());
}

impl Driver {
    fn next_id(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    fn open_channel(&mut self, halves: ChannelHalves) -> Session {
        self.next_link += 1;
        Session::open(
            LinkId(self.next_link),
            halves,
            &self.config,
            self.events_tx.clone(),
        )
    }

    fn live_id_for(&self, site: &SiteId) -> Option<ConnectionId> {
        self.established
            .iter()
            .find(|(_, p)| p.info.site_id == *site)
            .map(|(id, _)| *id)
            .or_else(|| {
                self.pending
                    .iter()
                    .find(|(_, h)| h.info.site_id == *site)
                    .map(|(id, _)| *id)
            })
    }

    // ── commands ───────────────────────────────────────────────

    fn connect(&mut self, token: ConnectToken) -> Result<ConnectionId, SyncError> {
        let site = token.site_id();
        if site == self.local_site {
            return Err(SyncError::InvalidToken(format!("{token} is this peer")));
        }
        if let Some(id) = self.live_id_for(&site) {
            log::debug!("Already connected or connecting to {}", site.short());
            return Ok(id);
        }

        let id = self.next_id();
        let session = Uuid::new_v4();
        let info = ConnectionInfo {
            id,
            site_id: site,
            session,
            direction: Direction::Outbound,
            state: ConnectionState::Signaling,
            reason: None,
            records_applied: 0,
        };

        let offer = Signal::Offer {
            session,
            site_id: self.local_site,
        };
        if let Err(e) = self.signaling.send(&token, offer) {
            log::warn!("Offer to {} failed: {e}", site.short());
            self.archive(info, ConnectionState::Failed, Some(e.to_string()));
            self.publish();
            return Err(e.into());
        }

        log::info!("{id}: offered session to {}", site.short());
        self.pending.insert(
            id,
            Handshake {
                info,
                started: Instant::now(),
                channel: None,
            },
        );
        self.publish();
        Ok(id)
    }

    fn disconnect(&mut self, site: SiteId) -> bool {
        let Some(id) = self.live_id_for(&site) else {
            return false;
        };
        if let Some(peer) = self.established.get_mut(&id) {
            let _ = peer.channel.send(&SyncMessage::goodbye("disconnect"));
        }
        self.retire(id, ConnectionState::Closed, Some("disconnected locally".into()));
        true
    }

    fn shutdown(&mut self) {
        for peer in self.established.values_mut() {
            let _ = peer.channel.send(&SyncMessage::goodbye("shutdown"));
        }
        let ids: Vec<ConnectionId> = self
            .established
            .keys()
            .chain(self.pending.keys())
            .copied()
            .collect();
        for id in ids {
            self.close_entry(id, ConnectionState::Closed, Some("shutdown".into()));
        }
        for (_, unbound) in self.unbound.drain() {
            unbound.channel.close();
        }
        self.publish();
    }

    // ── signaling ──────────────────────────────────────────────

    fn on_signal(&mut self, envelope: Envelope) {
        let Envelope { from, signal } = envelope;
        match signal {
            Signal::Offer { session, site_id } => self.on_offer(from, session, site_id),
            Signal::Answer {
                session,
                site_id,
                endpoint,
            } => self.on_answer(from, session, site_id, endpoint),
            Signal::Reject { session, reason } => {
                let Some(id) = self.pending_by_session(&session) else {
                    return;
                };
                log::warn!("{id}: rejected by {}: {reason}", from.site_id().short());
                self.retire(id, ConnectionState::Failed, Some(format!("rejected: {reason}")));
            }
        }
    }

    fn on_offer(&mut self, from: ConnectToken, session: Uuid, site: SiteId) {
        if from.site_id() != site {
            log::warn!("Offer from {from} claims site {}", site.short());
            let _ = self.signaling.send(
                &from,
                Signal::Reject {
                    session,
                    reason: "site does not match token".into(),
                },
            );
            return;
        }
        if site == self.local_site {
            return;
        }

        let mut id = None;
        if let Some(existing) = self.live_id_for(&site) {
            if let Some(handshake) = self.pending.get(&existing) {
                let ours_in_flight = handshake.info.direction == Direction::Outbound
                    && handshake.info.state == ConnectionState::Signaling;
                if ours_in_flight && self.local_site > site {
                    log::debug!("{existing}: simultaneous offer from {}, ours wins", site.short());
                    return;
                }
                // Their offer takes over our handshake slot.
                if let Some(handshake) = self.pending.remove(&existing) {
                    if let Some(channel) = handshake.channel {
                        channel.close();
                    }
                }
                id = Some(existing);
            } else {
                log::info!("{existing}: {} reconnected, replacing connection", site.short());
                self.retire(existing, ConnectionState::Closed, Some("replaced by a new session".into()));
            }
        }
        let id = id.unwrap_or_else(|| self.next_id());

        let info = ConnectionInfo {
            id,
            site_id: site,
            session,
            direction: Direction::Inbound,
            state: ConnectionState::Connecting,
            reason: None,
            records_applied: 0,
        };
        let answer = Signal::Answer {
            session,
            site_id: self.local_site,
            endpoint: self.endpoint.clone(),
        };
        if let Err(e) = self.signaling.send(&from, answer) {
            log::warn!("{id}: answer to {} failed: {e}", site.short());
            self.archive(info, ConnectionState::Failed, Some(e.to_string()));
            self.publish();
            return;
        }

        log::info!("{id}: answered offer from {}", site.short());
        self.pending.insert(
            id,
            Handshake {
                info,
                started: Instant::now(),
                channel: None,
            },
        );
        self.publish();
    }

    fn on_answer(&mut self, from: ConnectToken, session: Uuid, site: SiteId, endpoint: Endpoint) {
        let Some(id) = self.pending_by_session(&session) else {
            log::debug!("Answer for unknown session {session}");
            return;
        };
        let Some(handshake) = self.pending.get_mut(&id) else {
            return;
        };
        if handshake.info.site_id != site || from.site_id() != site {
            log::warn!("{id}: answer from unexpected site {}", site.short());
            return;
        }
        if handshake.info.direction != Direction::Outbound
            || handshake.info.state != ConnectionState::Signaling
        {
            return;
        }
        handshake.info.state = ConnectionState::Connecting;
        log::info!("{id}: dialing {endpoint}");

        let dial = self.transport.dial(&endpoint);
        let dials = self.dials_tx.clone();
        tokio::spawn(async move {
            let result = dial.await;
            let _ = dials.send(DialResult {
                id,
                session,
                result,
            });
        });
        self.publish();
    }

    fn pending_by_session(&self, session: &Uuid) -> Option<ConnectionId> {
        self.pending
            .iter()
            .find(|(_, h)| h.info.session == *session)
            .map(|(id, _)| *id)
    }

    // ── data channels ──────────────────────────────────────────

    fn on_dialed(&mut self, dial: DialResult) {
        let DialResult {
            id,
            session,
            result,
        } = dial;
        let still_wanted = self
            .pending
            .get(&id)
            .is_some_and(|h| h.info.session == session && h.channel.is_none());
        if !still_wanted {
            // The handshake moved on; dropping the halves closes the channel.
            return;
        }

        match result {
            Ok(halves) => {
                let mut channel = self.open_channel(halves);
                let hello = SyncMessage::hello(self.local_site, session);
                if let Err(e) = channel.send(&hello) {
                    channel.close();
                    self.retire(id, ConnectionState::Failed, Some(e.to_string()));
                    return;
                }
                log::debug!("{id}: data channel {} open, hello sent", channel.link());
                if let Some(handshake) = self.pending.get_mut(&id) {
                    handshake.channel = Some(channel);
                }
            }
            Err(e) => {
                log::warn!("{id}: dial failed: {e}");
                self.retire(id, ConnectionState::Failed, Some(e.to_string()));
            }
        }
    }

    fn on_accepted(&mut self, halves: ChannelHalves) {
        let channel = self.open_channel(halves);
        log::debug!("Accepted data channel {}", channel.link());
        self.unbound.insert(
            channel.link(),
            Unbound {
                channel,
                accepted: Instant::now(),
            },
        );
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Message { link, message } => self.on_message(link, message),
            LinkEvent::Closed { link, error } => self.on_link_closed(link, error),
        }
    }

    fn on_message(&mut self, link: LinkId, message: SyncMessage) {
        if let Some(id) = self.established_by_link(link) {
            self.on_peer_message(id, message);
            return;
        }
        if self.unbound.contains_key(&link) {
            self.on_inbound_hello(link, message);
            return;
        }
        if let Some(id) = self.pending_by_link(link) {
            self.on_outbound_hello(id, message);
            return;
        }
        log::trace!("Dropping {} from retired {link}", message.kind());
    }

    fn on_link_closed(&mut self, link: LinkId, error: Option<SyncError>) {
        if let Some(unbound) = self.unbound.remove(&link) {
            unbound.channel.close();
            return;
        }
        let id = self
            .established_by_link(link)
            .or_else(|| self.pending_by_link(link));
        let Some(id) = id else {
            return;
        };
        match error {
            None if self.established.contains_key(&id) => {
                log::info!("{id}: channel closed by peer");
                self.retire(id, ConnectionState::Closed, Some("channel closed".into()));
            }
            None => {
                self.retire(id, ConnectionState::Failed, Some("channel closed during handshake".into()));
            }
            Some(e) => {
                log::warn!("{id}: channel failed: {e}");
                self.retire(id, ConnectionState::Failed, Some(e.to_string()));
            }
        }
    }

    /// Answerer side: first message on an accepted channel.
    fn on_inbound_hello(&mut self, link: LinkId, message: SyncMessage) {
        let Some(mut unbound) = self.unbound.remove(&link) else {
            return;
        };
        let kind = message.kind();
        let SyncMessage::Hello {
            site_id,
            session,
            protocol_version,
        } = message
        else {
            log::warn!("{link}: expected hello, got {kind}");
            let _ = unbound.channel.send(&SyncMessage::goodbye("expected hello"));
            unbound.channel.close();
            return;
        };

        let matching = self.pending.iter().find(|(_, h)| {
            h.info.session == session
                && h.info.site_id == site_id
                && h.info.direction == Direction::Inbound
                && h.channel.is_none()
        });
        let Some((&id, _)) = matching else {
            log::warn!("{link}: hello for unknown session {session}");
            let _ = unbound.channel.send(&SyncMessage::goodbye("unknown session"));
            unbound.channel.close();
            return;
        };

        if protocol_version != PROTOCOL_VERSION {
            let _ = unbound.channel.send(&SyncMessage::goodbye("protocol version mismatch"));
            unbound.channel.close();
            let err = ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: protocol_version,
            };
            self.retire(id, ConnectionState::Failed, Some(err.to_string()));
            return;
        }

        if let Err(e) = unbound.channel.send(&SyncMessage::hello(self.local_site, session)) {
            unbound.channel.close();
            self.retire(id, ConnectionState::Failed, Some(e.to_string()));
            return;
        }
        if let Some(handshake) = self.pending.remove(&id) {
            self.promote(handshake.info, unbound.channel);
        }
    }

    /// Offerer side: the answerer's hello on our dialed channel.
    fn on_outbound_hello(&mut self, id: ConnectionId, message: SyncMessage) {
        let kind = message.kind();
        let SyncMessage::Hello {
            site_id,
            session,
            protocol_version,
        } = message
        else {
            log::warn!("{id}: expected hello, got {kind}");
            return;
        };
        let Some(handshake) = self.pending.get(&id) else {
            return;
        };
        if handshake.info.session != session || handshake.info.site_id != site_id {
            let err = ProtocolError::UnexpectedMessage("hello for another session");
            self.retire(id, ConnectionState::Failed, Some(err.to_string()));
            return;
        }
        if protocol_version != PROTOCOL_VERSION {
            let err = ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: protocol_version,
            };
            self.retire(id, ConnectionState::Failed, Some(err.to_string()));
            return;
        }
        let Some(handshake) = self.pending.remove(&id) else {
            return;
        };
        let Handshake { info, channel, .. } = handshake;
        match channel {
            Some(channel) => self.promote(info, channel),
            None => self.archive(info, ConnectionState::Failed, Some("hello without channel".into())),
        }
    }

    fn promote(&mut self, mut info: ConnectionInfo, channel: Session) {
        let id = info.id;
        let site = info.site_id;
        info.state = ConnectionState::Established;
        info.reason = None;
        let replicator = Replicator::new(
            self.local_site,
            site,
            self.config.max_batch_records,
            self.config.request_timeout(),
        );
        let now = Instant::now();
        self.established.insert(
            id,
            Peer {
                info,
                channel,
                replicator,
                last_seen: now,
                last_ping: now,
            },
        );
        log::info!("{id}: established with {}", site.short());

        let mut out = Vec::new();
        if let Some(peer) = self.established.get(&id) {
            peer.replicator.on_open(self.store.as_ref(), &mut out);
        }
        self.publish();
        self.flush(id, out);
    }

    fn established_by_link(&self, link: LinkId) -> Option<ConnectionId> {
        self.established
            .iter()
            .find(|(_, p)| p.channel.link() == link)
            .map(|(id, _)| *id)
    }

    fn pending_by_link(&self, link: LinkId) -> Option<ConnectionId> {
        self.pending
            .iter()
            .find(|(_, h)| h.channel.as_ref().is_some_and(|c| c.link() == link))
            .map(|(id, _)| *id)
    }

    // ── replication ────────────────────────────────────────────

    fn on_peer_message(&mut self, id: ConnectionId, message: SyncMessage) {
        let store = self.store.clone();
        let Some(peer) = self.established.get_mut(&id) else {
            return;
        };
        peer.last_seen = Instant::now();

        let mut out = Vec::new();
        let result = match message {
            SyncMessage::Poke { site_id, version } => {
                peer.replicator
                    .on_poke(store.as_ref(), site_id, version, &mut out);
                Ok(None)
            }
            SyncMessage::Request {
                request_id,
                site_id,
                since,
            } => peer
                .replicator
                .on_request(store.as_ref(), request_id, site_id, since, &mut out)
                .map(|_| None),
            SyncMessage::Changes {
                request_id,
                site_id,
                records,
                available,
            } => peer.replicator.on_changes(
                store.as_ref(),
                request_id,
                site_id,
                records,
                available,
                &mut out,
            ),
            SyncMessage::Ping { nonce } => {
                out.push(SyncMessage::Pong { nonce });
                Ok(None)
            }
            SyncMessage::Pong { .. } => Ok(None),
            SyncMessage::Goodbye { reason } => {
                log::info!("{id}: peer said goodbye: {reason}");
                self.retire(id, ConnectionState::Closed, Some(format!("peer left: {reason}")));
                return;
            }
            SyncMessage::Hello { .. } => {
                log::debug!("{id}: ignoring repeated hello");
                Ok(None)
            }
        };

        match result {
            Ok(Some(report)) => {
                if let Some(peer) = self.established.get_mut(&id) {
                    peer.info.records_applied += report.new_records() as u64;
                }
                self.flush(id, out);
                self.gossip(id, &report);
                self.publish();
            }
            Ok(None) => self.flush(id, out),
            Err(e) => {
                log::error!("{id}: replication failed: {e}");
                let state = if e.is_fatal_for_peer() {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Closed
                };
                if let Some(peer) = self.established.get_mut(&id) {
                    let _ = peer.channel.send(&SyncMessage::goodbye(e.to_string()));
                }
                self.retire(id, state, Some(e.to_string()));
            }
        }
    }

    /// Tell the other peers about cursor entries `from` just advanced.
    fn gossip(&mut self, from: ConnectionId, report: &ApplyReport) {
        let targets: Vec<(ConnectionId, SiteId)> = self
            .established
            .iter()
            .filter(|(id, _)| **id != from || self.config.gossip_to_sender)
            .map(|(id, p)| (*id, p.info.site_id))
            .collect();
        for (id, remote) in targets {
            let out: Vec<SyncMessage> = report
                .advanced
                .iter()
                .filter(|(site, _)| *site != remote)
                .map(|(site, version)| SyncMessage::poke(*site, *version))
                .collect();
            self.flush(id, out);
        }
    }

    fn on_local_write(&mut self, version: u64) {
        let ids: Vec<ConnectionId> = self.established.keys().copied().collect();
        for id in ids {
            let mut out = Vec::new();
            if let Some(peer) = self.established.get(&id) {
                peer.replicator.local_poke(version, &mut out);
            }
            self.flush(id, out);
        }
    }

    /// Send `out` to `id`. A broken channel retires the connection.
    fn flush(&mut self, id: ConnectionId, out: Vec<SyncMessage>) {
        if out.is_empty() {
            return;
        }
        let Some(peer) = self.established.get_mut(&id) else {
            return;
        };
        for message in &out {
            if let Err(e) = peer.channel.send(message) {
                log::warn!("{id}: send failed: {e}");
                let state = if e.is_fatal_for_peer() {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Closed
                };
                self.retire(id, state, Some(e.to_string()));
                return;
            }
        }
    }

    // ── housekeeping ───────────────────────────────────────────

    fn on_tick(&mut self, now: Instant) {
        let handshake_timeout = self.config.handshake_timeout();
        let expired: Vec<ConnectionId> = self
            .pending
            .iter()
            .filter(|(_, h)| now.saturating_duration_since(h.started) >= handshake_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            log::warn!("{id}: handshake timed out");
            self.retire(id, ConnectionState::Failed, Some("handshake timed out".into()));
        }

        let stale_links: Vec<LinkId> = self
            .unbound
            .iter()
            .filter(|(_, u)| now.saturating_duration_since(u.accepted) >= handshake_timeout)
            .map(|(link, _)| *link)
            .collect();
        for link in stale_links {
            if let Some(unbound) = self.unbound.remove(&link) {
                log::debug!("{link}: no hello, closing");
                unbound.channel.close();
            }
        }

        let liveness = self.config.liveness_timeout();
        let silent: Vec<ConnectionId> = self
            .established
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= liveness)
            .map(|(id, _)| *id)
            .collect();
        for id in silent {
            log::warn!("{id}: no traffic for {liveness:?}");
            self.retire(
                id,
                ConnectionState::Failed,
                Some(TransportError::LivenessTimeout.to_string()),
            );
        }

        let ping_interval = self.config.ping_interval();
        let store = self.store.clone();
        let ids: Vec<ConnectionId> = self.established.keys().copied().collect();
        for id in ids {
            let mut out = Vec::new();
            if let Some(peer) = self.established.get_mut(&id) {
                if now.saturating_duration_since(peer.last_ping) >= ping_interval {
                    self.next_nonce += 1;
                    peer.last_ping = now;
                    out.push(SyncMessage::Ping {
                        nonce: self.next_nonce,
                    });
                }
                peer.replicator.expired(store.as_ref(), now, &mut out);
            }
            self.flush(id, out);
        }
    }

    // ── transitions ────────────────────────────────────────────

    /// End connection `id` and publish.
    fn retire(&mut self, id: ConnectionId, state: ConnectionState, reason: Option<String>) {
        if self.close_entry(id, state, reason) {
            self.publish();
        }
    }

    fn close_entry(&mut self, id: ConnectionId, state: ConnectionState, reason: Option<String>) -> bool {
        if let Some(peer) = self.established.remove(&id) {
            peer.channel.close();
            self.archive(peer.info, state, reason);
            return true;
        }
        if let Some(handshake) = self.pending.remove(&id) {
            if let Some(channel) = handshake.channel {
                channel.close();
            }
            self.archive(handshake.info, state, reason);
            return true;
        }
        false
    }

    fn archive(&mut self, mut info: ConnectionInfo, state: ConnectionState, reason: Option<String>) {
        info.state = state;
        info.reason = reason;
        self.closed.push_back(info);
        while self.closed.len() > self.config.closed_history {
            self.closed.pop_front();
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        let mut live: Vec<ConnectionInfo> = self
            .pending
            .values()
            .map(|h| h.info.clone())
            .chain(self.established.values().map(|p| p.info.clone()))
            .collect();
        live.sort_by_key(|c| c.id);
        live.extend(self.closed.iter().cloned());
        ConnectionSnapshot { connections: live }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        let callbacks: Vec<Callback> = lock_subscribers(&self.subscribers)
            .callbacks
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(&snapshot);
        }
    }
}
