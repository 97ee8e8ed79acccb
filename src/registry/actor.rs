//! Registry actor
//!
//! A single task owns the live-client map. Connection handlers and the server
//! facade never touch the map directly; they send commands and broadcast
//! messages over channels and the actor applies them one at a time.
//!
//! Fan-out awaits each client's delivery queue in turn, so a client whose
//! queue stays full delays the rest of that round by up to the delivery
//! timeout before it is evicted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::entry::{ClientEntry, ClientId, ClientInfo};

/// Control requests handled by the actor
#[derive(Debug)]
pub(crate) enum RegistryCommand {
    /// Start delivering broadcasts to a new client
    Add { id: ClientId, entry: ClientEntry },
    /// Forget a client and close its delivery channel
    Remove { id: ClientId },
    /// Report the live clients
    Snapshot {
        reply: oneshot::Sender<Vec<ClientInfo>>,
    },
}

/// The registry actor has stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegistryClosed;

/// Cloneable handle used to send commands to the actor
///
/// The command channel is unbounded so a connection handler tearing itself
/// down never waits on an actor that is busy fanning out.
#[derive(Debug, Clone)]
pub(crate) struct RegistryHandle {
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    /// Register a client's delivery channel
    ///
    /// The returned receiver completes with an error once the registry drops
    /// the client, whether by removal, eviction or shutdown.
    pub(crate) fn add(
        &self,
        id: ClientId,
        peer_addr: SocketAddr,
        delivery: mpsc::Sender<Bytes>,
    ) -> Result<oneshot::Receiver<()>, RegistryClosed> {
        let (release, released) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Add {
                id,
                entry: ClientEntry::new(peer_addr, delivery, release),
            })
            .map_err(|_| RegistryClosed)?;
        Ok(released)
    }

    /// Request removal of a client
    ///
    /// Removing a client that is already gone is a no-op.
    pub(crate) fn remove(&self, id: ClientId) {
        let _ = self.commands.send(RegistryCommand::Remove { id });
    }

    /// Ask the actor for the live clients
    pub(crate) async fn snapshot(&self) -> Result<Vec<ClientInfo>, RegistryClosed> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Snapshot { reply })
            .map_err(|_| RegistryClosed)?;
        rx.await.map_err(|_| RegistryClosed)
    }
}

/// Exclusive owner of the live-client map
pub(crate) struct RegistryActor {
    clients: HashMap<ClientId, ClientEntry>,
    commands: mpsc::UnboundedReceiver<RegistryCommand>,
    messages: mpsc::Receiver<Bytes>,
    delivery_timeout: Duration,
}

impl RegistryActor {
    /// Spawn the actor
    ///
    /// The actor runs until every sender of `messages` is dropped, at which
    /// point it closes all delivery channels and exits.
    pub(crate) fn spawn(
        messages: mpsc::Receiver<Bytes>,
        delivery_timeout: Duration,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let actor = Self {
            clients: HashMap::new(),
            commands,
            messages,
            delivery_timeout,
        };

        let task = tokio::spawn(actor.run());
        (
            RegistryHandle {
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                // Pending removals are applied before the next fan-out
                biased;

                Some(command) = self.commands.recv() => self.handle_command(command),
                message = self.messages.recv() => match message {
                    Some(message) => self.fan_out(message).await,
                    None => break,
                },
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Add { id, entry } => {
                tracing::info!(client_id = id, peer = %entry.peer_addr, "Client added");
                self.clients.insert(id, entry);
            }
            RegistryCommand::Remove { id } => match self.clients.remove(&id) {
                Some(entry) => {
                    tracing::info!(client_id = id, peer = %entry.peer_addr, "Client removed");
                }
                None => {
                    // Expected when the actor evicted the client first
                    tracing::debug!(client_id = id, "Remove requested for unknown client");
                }
            },
            RegistryCommand::Snapshot { reply } => {
                let clients = self
                    .clients
                    .iter()
                    .map(|(&id, entry)| entry.info(id))
                    .collect();
                let _ = reply.send(clients);
            }
        }
    }

    async fn fan_out(&mut self, message: Bytes) {
        let timeout = self.delivery_timeout;
        let mut dropped = Vec::new();

        for (&id, entry) in &self.clients {
            match entry.delivery.send_timeout(message.clone(), timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(
                        client_id = id,
                        peer = %entry.peer_addr,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Client queue full, evicting"
                    );
                    dropped.push(id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::debug!(client_id = id, "Client gone before delivery");
                    dropped.push(id);
                }
            }
        }

        for id in dropped {
            self.clients.remove(&id);
        }

        tracing::debug!(
            bytes = message.len(),
            clients = self.clients.len(),
            "Broadcast delivered"
        );
    }

    fn shutdown(&mut self) {
        tracing::info!(clients = self.clients.len(), "Registry shutting down");
        // Dropping the senders closes every delivery channel
        self.clients.clear();
    }
}
