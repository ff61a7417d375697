//! End-to-end replication over the in-memory network.
//!
//! Every test runs real peer managers: signaling through a shared
//! rendezvous, framed sessions over in-process channels, and stores that
//! must end up with identical checksums.

use pantry_core::{
    ChangeStore, ChangesetSink, ChangesetSource, LocalWrites, MemoryStore, Schema, SiteId, Value,
};
use pantry_sync::{
    ChannelHalves, ConnectToken, ConnectionSnapshot, ConnectionState, Envelope, Fragmenter,
    Links, Listener, MemoryNetwork, MemoryRendezvous, MemorySignaling, MemoryTransport,
    PeerManager, Reassembler, Signal, SignalingChannel, SyncConfig, SyncMessage, Transport,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn schema() -> Schema {
    Schema::new()
        .table("recipes", ["name", "servings"])
        .table("notes", ["body"])
}

struct TestPeer {
    store: Arc<MemoryStore>,
    manager: PeerManager,
}

impl TestPeer {
    fn site(&self) -> SiteId {
        self.store.site_id()
    }
}

fn spawn_peer(network: &MemoryNetwork, rendezvous: &MemoryRendezvous, schema: Schema) -> TestPeer {
    spawn_peer_with(network, rendezvous, MemoryStore::new(schema), SyncConfig::for_testing())
}

fn spawn_peer_with(
    network: &MemoryNetwork,
    rendezvous: &MemoryRendezvous,
    store: MemoryStore,
    config: SyncConfig,
) -> TestPeer {
    let store = Arc::new(store);
    let links = Links::memory(network, rendezvous, store.site_id());
    let manager = PeerManager::spawn(store.clone(), links, config);
    TestPeer { store, manager }
}

fn set(store: &dyn ChangeStore, table: &str, pk: &str, column: &str, value: impl Into<Value>) -> u64 {
    let mut writes = LocalWrites::new();
    writes.set(table, pk, column, value);
    store.commit(writes).unwrap()
}

fn name_of(store: &dyn ChangeStore, pk: &str) -> Option<String> {
    store
        .row("recipes", pk)
        .unwrap()
        .and_then(|row| row.get("name").and_then(Value::as_text).map(str::to_string))
}

async fn wait_for_state(manager: &PeerManager, site: SiteId, state: ConnectionState) {
    let mut rx = manager.watch();
    timeout(
        Duration::from_secs(5),
        rx.wait_for(|snapshot| snapshot.state_of(&site) == Some(state)),
    )
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {state:?} with {}", site.short()))
    .unwrap();
}

async fn wait_converged(stores: &[&Arc<MemoryStore>]) {
    timeout(Duration::from_secs(10), async {
        loop {
            let sums: Vec<u64> = stores.iter().map(|s| s.checksum().unwrap()).collect();
            if sums.windows(2).all(|pair| pair[0] == pair[1]) {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Replicas did not converge");
}

async fn connect(from: &TestPeer, to: &TestPeer) {
    from.manager
        .connect_to(&to.manager.local_token())
        .await
        .unwrap();
    wait_for_state(&from.manager, to.site(), ConnectionState::Established).await;
    wait_for_state(&to.manager, from.site(), ConnectionState::Established).await;
}

/// Hand-driven peer that speaks the wire protocol directly, so a test can
/// decide exactly when each message goes out.
struct ScriptedPeer {
    store: MemoryStore,
    signaling: MemorySignaling,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    transport: MemoryTransport,
    _listener: Listener,
    config: SyncConfig,
}

struct ScriptedLink {
    halves: ChannelHalves,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
}

impl ScriptedPeer {
    fn new(network: &MemoryNetwork, rendezvous: &MemoryRendezvous, store: MemoryStore) -> Self {
        let (signaling, inbox) = rendezvous.join(ConnectToken::for_site(store.site_id()));
        let (transport, listener) = network.listen();
        Self {
            store,
            signaling,
            inbox,
            transport,
            _listener: listener,
            config: SyncConfig::for_testing(),
        }
    }

    fn site(&self) -> SiteId {
        self.store.site_id()
    }

    /// Offer, dial the answer and exchange hellos.
    async fn open(&mut self, to: &ConnectToken) -> ScriptedLink {
        let session = Uuid::new_v4();
        self.signaling
            .send(
                to,
                Signal::Offer {
                    session,
                    site_id: self.site(),
                },
            )
            .unwrap();
        let envelope = timeout(Duration::from_secs(5), self.inbox.recv())
            .await
            .expect("No answer")
            .unwrap();
        let Signal::Answer { endpoint, .. } = envelope.signal else {
            panic!("Expected answer, got {:?}", envelope.signal);
        };

        let halves = self.transport.dial(&endpoint).await.unwrap();
        let mut link = ScriptedLink {
            halves,
            fragmenter: Fragmenter::new(self.config.max_message_size, self.config.compression_threshold),
            reassembler: Reassembler::new(
                self.config.max_message_size,
                self.config.max_reassembly_messages,
                self.config.max_reassembly_bytes,
            ),
        };
        link.send(&SyncMessage::hello(self.site(), session));
        assert!(matches!(link.recv().await, SyncMessage::Hello { .. }));
        link
    }
}

impl ScriptedLink {
    fn send(&mut self, message: &SyncMessage) {
        let bytes = message.encode().unwrap();
        for frame in self.fragmenter.split(&bytes).unwrap() {
            self.halves.outbound.send(frame).unwrap();
        }
    }

    async fn recv(&mut self) -> SyncMessage {
        timeout(Duration::from_secs(5), async {
            loop {
                let frame = self.halves.inbound.recv().await.expect("Channel closed");
                if let Some(bytes) = self.reassembler.push(&frame).unwrap() {
                    return SyncMessage::decode(&bytes).unwrap();
                }
            }
        })
        .await
        .expect("Timed out waiting for a message")
    }

    /// Next request, skipping pings and pokes. Returns `(request_id, since)`.
    async fn next_request(&mut self) -> (u64, u64) {
        loop {
            if let SyncMessage::Request {
                request_id, since, ..
            } = self.recv().await
            {
                return (request_id, since);
            }
        }
    }
}

// ─── Convergence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_peers_converge() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());

    for i in 0..3 {
        set(a.store.as_ref(), "recipes", &format!("a{i}"), "name", "from a");
    }
    for i in 0..2 {
        set(b.store.as_ref(), "recipes", &format!("b{i}"), "name", "from b");
    }

    connect(&a, &b).await;
    wait_converged(&[&a.store, &b.store]).await;

    assert_eq!(a.store.rows("recipes").unwrap().len(), 5);
    assert_eq!(b.store.rows("recipes").unwrap().len(), 5);
    assert_eq!(b.store.cursor(&a.site()), 3);
    assert_eq!(a.store.cursor(&b.site()), 2);
}

#[tokio::test]
async fn test_offline_edits_converge_with_cursors() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer_with(
        &network,
        &rendezvous,
        MemoryStore::with_site(SiteId::from_bytes([0xA1; 16]), schema()),
        SyncConfig::for_testing(),
    );
    let b = spawn_peer_with(
        &network,
        &rendezvous,
        MemoryStore::with_site(SiteId::from_bytes([0xB1; 16]), schema()),
        SyncConfig::for_testing(),
    );

    // A reaches v5 with R = "x", B reaches v3 with R = "y", both offline.
    for i in 0..4 {
        set(a.store.as_ref(), "recipes", &format!("a{i}"), "name", "filler");
    }
    assert_eq!(set(a.store.as_ref(), "recipes", "R", "name", "x"), 5);
    for i in 0..2 {
        set(b.store.as_ref(), "recipes", &format!("b{i}"), "name", "filler");
    }
    assert_eq!(set(b.store.as_ref(), "recipes", "R", "name", "y"), 3);

    connect(&b, &a).await;
    wait_converged(&[&a.store, &b.store]).await;

    for store in [&a.store, &b.store] {
        assert_eq!(name_of(store.as_ref(), "R").as_deref(), Some("x"));
        assert_eq!(store.cursor(&a.site()), 5);
        assert_eq!(store.cursor(&b.site()), 3);
    }
}

#[tokio::test]
async fn test_live_write_is_pushed() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());
    connect(&a, &b).await;

    set(a.store.as_ref(), "recipes", "r1", "name", "Lentil soup");
    wait_converged(&[&a.store, &b.store]).await;
    assert_eq!(name_of(b.store.as_ref(), "r1").as_deref(), Some("Lentil soup"));

    set(b.store.as_ref(), "recipes", "r1", "servings", 4i64);
    wait_converged(&[&a.store, &b.store]).await;
    let row = a.store.row("recipes", "r1").unwrap().unwrap();
    assert_eq!(row.get("servings").and_then(Value::as_integer), Some(4));
}

#[tokio::test]
async fn test_large_backlog_is_paged() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());

    // Several pages of records, each message spanning several frames.
    for i in 0..300 {
        set(
            a.store.as_ref(),
            "notes",
            &format!("n{i:03}"),
            "body",
            "a fairly long note body that makes every record a few dozen bytes",
        );
    }

    connect(&a, &b).await;
    wait_converged(&[&a.store, &b.store]).await;
    assert_eq!(b.store.rows("notes").unwrap().len(), 300);
    assert_eq!(b.store.cursor(&a.site()), 300);
}

#[tokio::test]
async fn test_gossip_reaches_peer_through_middle() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());
    let c = spawn_peer(&network, &rendezvous, schema());

    connect(&a, &b).await;
    connect(&c, &b).await;

    set(a.store.as_ref(), "recipes", "r1", "name", "Flatbread");
    wait_converged(&[&a.store, &b.store, &c.store]).await;

    assert_eq!(name_of(c.store.as_ref(), "r1").as_deref(), Some("Flatbread"));
    assert_eq!(c.store.cursor(&a.site()), 1);
    assert!(c.manager.snapshot().state_of(&a.site()).is_none());
}

// ─── Failures ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_severed_link_then_reconnect() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());
    for i in 0..200 {
        set(a.store.as_ref(), "recipes", &format!("r{i:03}"), "name", "backlog");
    }

    connect(&b, &a).await;
    // Cut mid-sync, the reconnect resumes from whatever cursor B reached.
    assert!(network.sever(a.manager.endpoint()) >= 1);
    wait_for_state(&a.manager, b.site(), ConnectionState::Closed).await;
    wait_for_state(&b.manager, a.site(), ConnectionState::Closed).await;

    connect(&b, &a).await;
    wait_converged(&[&a.store, &b.store]).await;
    assert_eq!(b.store.rows("recipes").unwrap().len(), 200);
}

#[tokio::test]
async fn test_late_changes_after_close_are_dropped() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let mut f = ScriptedPeer::new(&network, &rendezvous, MemoryStore::new(schema()));
    for name in ["Soup", "Stew", "Pie"] {
        set(&f.store, "recipes", &name.to_lowercase(), "name", name);
    }
    let log = f.store.changes_since(f.site(), 0, None).unwrap();
    let versions = |range: std::ops::RangeInclusive<u64>| -> Vec<_> {
        log.iter().filter(|r| range.contains(&r.version)).cloned().collect()
    };
    let a_token = a.manager.local_token();

    // First session: serve v1, then leave with the follow-up request open.
    let mut link = f.open(&a_token).await;
    link.send(&SyncMessage::poke(f.site(), 3));
    let (first, since) = link.next_request().await;
    assert_eq!(since, 0);
    link.send(&SyncMessage::changes(first, f.site(), versions(1..=1), 3));

    let (outstanding, since) = link.next_request().await;
    assert_eq!(since, 1);
    link.send(&SyncMessage::goodbye("closing"));
    link.send(&SyncMessage::changes(outstanding, f.site(), versions(2..=3), 3));
    wait_for_state(&a.manager, f.site(), ConnectionState::Closed).await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(a.store.cursor(&f.site()), 1);
    assert_eq!(a.store.rows("recipes").unwrap().len(), 1);

    // Second session asks again from the cursor and catches up.
    let mut link = f.open(&a_token).await;
    link.send(&SyncMessage::poke(f.site(), 3));
    let (request_id, since) = link.next_request().await;
    assert_eq!(since, 1);
    link.send(&SyncMessage::changes(request_id, f.site(), versions(2..=3), 3));

    timeout(Duration::from_secs(5), async {
        while a.store.cursor(&f.site()) < 3 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Second session did not catch up");
    assert_eq!(a.store.rows("recipes").unwrap().len(), 3);
    assert_eq!(name_of(a.store.as_ref(), "pie").as_deref(), Some("Pie"));
}

#[tokio::test]
async fn test_schema_mismatch_fails_only_that_pairing() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());
    let c = spawn_peer(
        &network,
        &rendezvous,
        Schema::new().table("recipes", ["name", "servings"]),
    );

    connect(&a, &b).await;
    connect(&a, &c).await;

    set(a.store.as_ref(), "notes", "n1", "body", "C has no notes table");
    wait_for_state(&c.manager, a.site(), ConnectionState::Failed).await;
    wait_converged(&[&a.store, &b.store]).await;

    let failed = c.manager.snapshot();
    let reason = failed.get(&a.site()).unwrap().reason.clone().unwrap();
    assert!(reason.contains("notes"), "reason was {reason}");
    assert!(c.store.rows("recipes").unwrap().is_empty());
    assert_eq!(c.store.cursor(&a.site()), 0);

    assert!(a.manager.snapshot().is_established(&b.site()));
    set(a.store.as_ref(), "recipes", "r1", "name", "Still syncing");
    wait_converged(&[&a.store, &b.store]).await;
    assert_eq!(name_of(b.store.as_ref(), "r1").as_deref(), Some("Still syncing"));
}

#[tokio::test]
async fn test_duplicate_changes_leave_checksum_unchanged() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());
    set(a.store.as_ref(), "recipes", "r1", "name", "Soup");
    set(a.store.as_ref(), "recipes", "r2", "name", "Stew");

    connect(&a, &b).await;
    wait_converged(&[&a.store, &b.store]).await;

    let before = b.store.checksum().unwrap();
    let batch = a.store.changes_since(a.site(), 0, None).unwrap();
    let report = b.store.apply(&batch).unwrap();
    assert_eq!(report.duplicates, batch.len());
    assert!(report.is_noop());
    assert_eq!(b.store.checksum().unwrap(), before);
}

// ─── Connection lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn test_simultaneous_connect_yields_one_connection() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());

    let (token_a, token_b) = (a.manager.local_token(), b.manager.local_token());
    let (ra, rb) = tokio::join!(
        a.manager.connect_to(&token_b),
        b.manager.connect_to(&token_a),
    );
    ra.unwrap();
    rb.unwrap();
    wait_for_state(&a.manager, b.site(), ConnectionState::Established).await;
    wait_for_state(&b.manager, a.site(), ConnectionState::Established).await;

    // Give a losing handshake time to surface if there were one.
    sleep(Duration::from_millis(200)).await;
    for peer in [&a, &b] {
        let snapshot = peer.manager.snapshot();
        assert_eq!(snapshot.connections.len(), 1, "{snapshot:?}");
        assert_eq!(snapshot.established().count(), 1);
    }

    set(b.store.as_ref(), "recipes", "r1", "name", "Both ways");
    wait_converged(&[&a.store, &b.store]).await;
}

#[tokio::test]
async fn test_connect_twice_is_noop() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());

    let first = a.manager.connect_to(&b.manager.local_token()).await.unwrap();
    let second = a.manager.connect_to(&b.manager.local_token()).await.unwrap();
    assert_eq!(first, second);
    wait_for_state(&a.manager, b.site(), ConnectionState::Established).await;

    let third = a.manager.connect_to(&b.manager.local_token()).await.unwrap();
    assert_eq!(first, third);
}

#[tokio::test]
async fn test_disconnect_closes_both_sides() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());
    connect(&a, &b).await;

    assert!(a.manager.disconnect(&b.site()).await.unwrap());
    assert!(!a.manager.disconnect(&b.site()).await.unwrap());
    wait_for_state(&a.manager, b.site(), ConnectionState::Closed).await;
    wait_for_state(&b.manager, a.site(), ConnectionState::Closed).await;

    // Writes after the disconnect stay local until reconnect.
    set(a.store.as_ref(), "recipes", "r1", "name", "Later");
    sleep(Duration::from_millis(200)).await;
    assert_eq!(name_of(b.store.as_ref(), "r1"), None);

    connect(&a, &b).await;
    wait_converged(&[&a.store, &b.store]).await;
}

#[tokio::test]
async fn test_callbacks_see_every_transition() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());

    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionSnapshot>();
    let _subscription = a.manager.on_connections_changed(move |snapshot| {
        let _ = tx.send(snapshot.clone());
    });

    a.manager
        .connect_to(&b.manager.local_token())
        .await
        .unwrap();

    let mut states = Vec::new();
    timeout(Duration::from_secs(5), async {
        while let Some(snapshot) = rx.recv().await {
            let state = snapshot.state_of(&b.site()).unwrap();
            if states.last() != Some(&state) {
                states.push(state);
            }
            if state == ConnectionState::Established {
                break;
            }
        }
    })
    .await
    .expect("Timed out waiting for callbacks");

    assert_eq!(
        states,
        vec![
            ConnectionState::Signaling,
            ConnectionState::Connecting,
            ConnectionState::Established,
        ]
    );
}

#[tokio::test]
async fn test_shutdown_says_goodbye() {
    let network = MemoryNetwork::new();
    let rendezvous = MemoryRendezvous::new();
    let a = spawn_peer(&network, &rendezvous, schema());
    let b = spawn_peer(&network, &rendezvous, schema());
    connect(&a, &b).await;

    a.manager.shutdown().await;
    wait_for_state(&b.manager, a.site(), ConnectionState::Closed).await;
    let reason = b.manager.snapshot().get(&a.site()).unwrap().reason.clone();
    assert_eq!(reason.as_deref(), Some("peer left: shutdown"));

    let err = a
        .manager
        .connect_to(&b.manager.local_token())
        .await
        .unwrap_err();
    assert!(matches!(err, pantry_sync::SyncError::Closed));
}
