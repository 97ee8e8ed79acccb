//! Client entry types
//!
//! This module defines the per-client state stored by the registry actor.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Identifier assigned to each accepted connection
pub type ClientId = u64;

/// Entry for a single live client in the registry
#[derive(Debug)]
pub(crate) struct ClientEntry {
    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Sending side of the client's delivery channel
    ///
    /// The registry holds the only sender, so dropping the entry closes the
    /// channel and lets the connection's writer loop finish.
    pub delivery: mpsc::Sender<Bytes>,

    /// Release token for the connection
    ///
    /// Never sent on. Dropping it wakes the connection even while it is
    /// blocked writing to a peer that stopped reading.
    pub _release: oneshot::Sender<()>,

    /// When the client was registered
    pub connected_at: Instant,
}

impl ClientEntry {
    pub(crate) fn new(
        peer_addr: SocketAddr,
        delivery: mpsc::Sender<Bytes>,
        release: oneshot::Sender<()>,
    ) -> Self {
        Self {
            peer_addr,
            delivery,
            _release: release,
            connected_at: Instant::now(),
        }
    }

    pub(crate) fn info(&self, id: ClientId) -> ClientInfo {
        ClientInfo {
            id,
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
        }
    }
}

/// Snapshot of a live client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client identifier
    pub id: ClientId,
    /// Remote peer address
    pub peer_addr: SocketAddr,
    /// When the client was registered
    pub connected_at: Instant,
}
