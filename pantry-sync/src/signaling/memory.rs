//! In-process signaling rendezvous.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::signaling::{Envelope, Signal, SignalingChannel};
use crate::token::ConnectToken;

type Mailboxes = HashMap<ConnectToken, mpsc::UnboundedSender<Envelope>>;

/// Routes envelopes between tokens registered in the same process.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token`. A second join under the same token replaces the
    /// first mailbox.
    pub fn join(&self, token: ConnectToken) -> (MemorySignaling, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(token, tx);
        (
            MemorySignaling {
                rendezvous: self.clone(),
                token,
            },
            rx,
        )
    }

    /// Unregister `token`; later signals to it fail with `UnknownPeer`.
    pub fn leave(&self, token: &ConnectToken) {
        self.lock().remove(token);
    }

    fn lock(&self) -> MutexGuard<'_, Mailboxes> {
        self.mailboxes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One member's sending side.
#[derive(Clone)]
pub struct MemorySignaling {
    rendezvous: MemoryRendezvous,
    token: ConnectToken,
}

impl MemorySignaling {
    pub fn token(&self) -> ConnectToken {
        self.token
    }
}

impl SignalingChannel for MemorySignaling {
    fn send(&self, to: &ConnectToken, signal: Signal) -> Result<(), SignalingError> {
        let mailboxes = self.rendezvous.lock();
        let mailbox = mailboxes
            .get(to)
            .ok_or(SignalingError::UnknownPeer(*to))?;
        mailbox
            .send(Envelope {
                from: self.token,
                signal,
            })
            .map_err(|_| SignalingError::UnknownPeer(*to))
    }
}
