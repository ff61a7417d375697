//! In-process transport.
//!
//! Every link runs through two forwarding tasks, so a link can be cut from
//! the outside with [`MemoryNetwork::sever`] to simulate a dropped
//! connection: both peers see their inbound queue end.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::TransportError;
use crate::transport::{ChannelHalves, Endpoint, Listener, Transport};

struct MemoryLink {
    ends: (u64, u64),
    forwarders: [AbortHandle; 2],
}

impl MemoryLink {
    fn touches(&self, id: u64) -> bool {
        self.ends.0 == id || self.ends.1 == id
    }

    fn is_live(&self) -> bool {
        self.forwarders.iter().all(|h| !h.is_finished())
    }

    fn cut(&self) {
        for handle in &self.forwarders {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    listeners: HashMap<u64, mpsc::UnboundedSender<ChannelHalves>>,
    links: Vec<MemoryLink>,
}

/// Shared in-process network. Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint. Returns its dialer and its listener.
    pub fn listen(&self) -> (MemoryTransport, Listener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.listeners.insert(id, tx);
        (
            MemoryTransport {
                network: self.clone(),
                local: id,
            },
            Listener {
                endpoint: Endpoint::Memory(id),
                incoming: rx,
            },
        )
    }

    /// Cut every live link touching `endpoint`. Returns how many were cut.
    pub fn sever(&self, endpoint: &Endpoint) -> usize {
        let Endpoint::Memory(id) = endpoint else {
            return 0;
        };
        let mut state = self.lock();
        let (cut, kept): (Vec<MemoryLink>, Vec<MemoryLink>) =
            state.links.drain(..).partition(|link| link.touches(*id));
        state.links = kept;
        let count = cut.iter().filter(|link| link.is_live()).count();
        for link in &cut {
            link.cut();
        }
        log::debug!("Severed {count} links at {endpoint}");
        count
    }

    /// Live links, for diagnostics and tests.
    pub fn live_links(&self) -> usize {
        let mut state = self.lock();
        state.links.retain(MemoryLink::is_live);
        state.links.len()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connect(&self, from: u64, to: u64) -> Result<ChannelHalves, TransportError> {
        let mut state = self.lock();
        let listener = state
            .listeners
            .get(&to)
            .ok_or_else(|| TransportError::DialFailed(format!("nothing listens at mem://{to}")))?;

        let (dialer, dialer_far) = ChannelHalves::pair();
        let (listener_far, accepted) = ChannelHalves::pair();

        // dialer_far and listener_far are bridged by two forwarders
        let ChannelHalves {
            outbound: to_dialer,
            inbound: from_dialer,
        } = dialer_far;
        let ChannelHalves {
            outbound: to_listener,
            inbound: from_listener,
        } = listener_far;

        listener
            .send(accepted)
            .map_err(|_| TransportError::DialFailed(format!("mem://{to} stopped listening")))?;

        let forwarders = [
            tokio::spawn(forward(from_dialer, to_listener)).abort_handle(),
            tokio::spawn(forward(from_listener, to_dialer)).abort_handle(),
        ];
        state.links.push(MemoryLink {
            ends: (from, to),
            forwarders,
        });
        Ok(dialer)
    }
}

async fn forward(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, tx: mpsc::UnboundedSender<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if tx.send(frame).is_err() {
            break;
        }
    }
}

/// Dialer bound to one endpoint of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: u64,
}

impl MemoryTransport {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Memory(self.local)
    }
}

impl Transport for MemoryTransport {
    fn dial(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<ChannelHalves, TransportError>> {
        let network = self.network.clone();
        let from = self.local;
        let target = endpoint.clone();
        Box::pin(async move {
            match target {
                Endpoint::Memory(to) => network.connect(from, to),
                other => Err(TransportError::BadEndpoint(other.to_string())),
            }
        })
    }
}
