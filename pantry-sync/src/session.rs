//! Transport sessions: framed, typed messages over a data channel.
//!
//! The write side ([`SessionSender`]) is owned by the manager loop and
//! frames messages synchronously onto the outbound queue. The read side is
//! a task that reassembles frames, decodes messages and forwards them to
//! the loop as [`LinkEvent`]s. Reassembly buffers live in that task and die
//! with it.

use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::framing::{Fragmenter, Reassembler};
use crate::protocol::SyncMessage;
use crate::transport::ChannelHalves;

/// Identity of one data channel. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// What a session reader reports to the manager loop.
#[derive(Debug)]
pub enum LinkEvent {
    Message { link: LinkId, message: SyncMessage },
    /// The channel ended. `error` is `None` for a clean end of stream.
    Closed {
        link: LinkId,
        error: Option<SyncError>,
    },
}

/// Framing write side of a session.
#[derive(Debug)]
pub struct SessionSender {
    link: LinkId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    fragmenter: Fragmenter,
}

impl SessionSender {
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn send(&mut self, message: &SyncMessage) -> Result<(), SyncError> {
        let bytes = message.encode()?;
        for frame in self.fragmenter.split(&bytes)? {
            self.outbound
                .send(frame)
                .map_err(|_| TransportError::ConnectionClosed)?;
        }
        log::trace!("{} → {} ({} bytes)", self.link, message.kind(), bytes.len());
        Ok(())
    }
}

/// A live session: write side plus the reader task.
#[derive(Debug)]
pub struct Session {
    pub sender: SessionSender,
    reader: JoinHandle<()>,
}

impl Session {
    /// Start reading `halves`, reporting to `events`.
    pub fn open(
        link: LinkId,
        halves: ChannelHalves,
        config: &SyncConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let ChannelHalves { outbound, inbound } = halves;
        let reassembler = Reassembler::new(
            config.max_message_size,
            config.max_reassembly_messages,
            config.max_reassembly_bytes,
        );
        let reader = tokio::spawn(read_loop(link, inbound, reassembler, events));
        Self {
            sender: SessionSender {
                link,
                outbound,
                fragmenter: Fragmenter::new(config.max_message_size, config.compression_threshold),
            },
            reader,
        }
    }

    pub fn link(&self) -> LinkId {
        self.sender.link
    }

    pub fn send(&mut self, message: &SyncMessage) -> Result<(), SyncError> {
        self.sender.send(message)
    }

    /// Stop reading and drop the write side. No further events are
    /// reported for this link.
    pub fn close(self) {
        self.reader.abort();
    }
}

async fn read_loop(
    link: LinkId,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut reassembler: Reassembler,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let error = loop {
        let Some(frame) = inbound.recv().await else {
            break None;
        };
        let bytes = match reassembler.push(&frame) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => break Some(SyncError::from(e)),
        };
        match SyncMessage::decode(&bytes) {
            Ok(message) => {
                log::trace!("{link} ← {} ({} bytes)", message.kind(), bytes.len());
                if events.send(LinkEvent::Message { link, message }).is_err() {
                    return;
                }
            }
            Err(e) => break Some(SyncError::from(e)),
        }
    };

    if let Some(e) = &error {
        log::warn!("{link} closed on error: {e}");
    }
    let _ = events.send(LinkEvent::Closed { link, error });
}
