//! Per-connection handler
//!
//! Each accepted socket is split in two. A spawned reader task feeds inbound
//! bytes to the host's callback and reports activity; the handler task itself
//! runs the writer/heartbeat loop, which owns the idle timer and the client's
//! delivery channel. Whichever side finishes first decides the close reason,
//! and teardown runs exactly once from the writer side.
//!
//! A write to a peer that stopped reading can stay pending indefinitely, so
//! every write is raced against the idle timer and the registry's release
//! token. Inbound activity keeps resetting the timer while a write is pending.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};

use super::inbound::{read_loop, ReadSettings};
use crate::registry::{ClientId, RegistryHandle};
use crate::server::callbacks::CallbackDirectory;

/// Why a connection ended
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its side of the stream
    PeerClosed,
    /// Reading from the peer failed
    ReadFailed(std::io::Error),
    /// No inbound data within the heartbeat duration
    HeartbeatExpired,
    /// Writing a broadcast to the peer failed
    WriteFailed(std::io::Error),
    /// The registry dropped the client (server shutdown or eviction)
    Released,
}

/// Stand-in deadline for heartbeats too long to add to the current instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Connection parameters fixed at accept time
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionSettings {
    pub heartbeat: Duration,
    pub queue_capacity: usize,
    pub read: ReadSettings,
}

/// A single accepted client connection
pub(crate) struct Connection {
    id: ClientId,
    peer_addr: SocketAddr,
    settings: ConnectionSettings,
    callbacks: Arc<CallbackDirectory>,
    registry: RegistryHandle,
}

impl Connection {
    pub(crate) fn new(
        id: ClientId,
        peer_addr: SocketAddr,
        settings: ConnectionSettings,
        callbacks: Arc<CallbackDirectory>,
        registry: RegistryHandle,
    ) -> Self {
        Self {
            id,
            peer_addr,
            settings,
            callbacks,
            registry,
        }
    }

    /// Serve a TCP socket until it closes
    pub(crate) async fn run(self, socket: TcpStream) -> CloseReason {
        let (reader, writer) = socket.into_split();
        self.serve(reader, writer).await
    }

    async fn serve<R, W>(self, reader: R, mut writer: W) -> CloseReason
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let (delivery_tx, mut delivery) = mpsc::channel::<Bytes>(self.settings.queue_capacity);
        let mut release = match self.registry.add(self.id, self.peer_addr, delivery_tx) {
            Ok(release) => release,
            Err(_) => {
                tracing::debug!(client_id = self.id, "Registry closed before client was added");
                let _ = writer.shutdown().await;
                return CloseReason::Released;
            }
        };

        tracing::info!(
            client_id = self.id,
            peer = %self.peer_addr,
            heartbeat_ms = u64::try_from(self.settings.heartbeat.as_millis()).unwrap_or(u64::MAX),
            "Client connected"
        );

        let (activity_tx, mut activity) = watch::channel(());
        let mut read_task = tokio::spawn(read_loop(
            reader,
            self.peer_addr.ip(),
            Arc::clone(&self.callbacks),
            activity_tx,
            self.settings.read,
        ));

        let heartbeat = self.settings.heartbeat;
        let idle = tokio::time::sleep_until(idle_deadline(heartbeat));
        tokio::pin!(idle);

        let mut reason = loop {
            tokio::select! {
                () = &mut idle => break CloseReason::HeartbeatExpired,
                _ = &mut release => break CloseReason::Released,
                changed = activity.changed() => match changed {
                    Ok(()) => idle.as_mut().reset(idle_deadline(heartbeat)),
                    // Reader finished; its result says why
                    Err(_) => break CloseReason::PeerClosed,
                },
                message = delivery.recv() => match message {
                    Some(message) => {
                        let outcome = write_message(
                            &mut writer,
                            &message,
                            idle.as_mut(),
                            heartbeat,
                            &mut activity,
                            &mut release,
                        )
                        .await;
                        if let Some(reason) = outcome {
                            break reason;
                        }
                    }
                    None => break CloseReason::Released,
                },
            }
        };

        if matches!(reason, CloseReason::PeerClosed) {
            reason = match (&mut read_task).await {
                Ok(Ok(())) => CloseReason::PeerClosed,
                Ok(Err(e)) => CloseReason::ReadFailed(e),
                Err(e) => {
                    tracing::error!(client_id = self.id, error = %e, "Reader task failed");
                    CloseReason::ReadFailed(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "reader task failed",
                    ))
                }
            };
        } else {
            read_task.abort();
        }

        if let Err(e) = writer.shutdown().await {
            tracing::debug!(client_id = self.id, error = %e, "Socket shutdown failed");
        }
        drop(writer);

        if !matches!(reason, CloseReason::Released) {
            self.registry.remove(self.id);
        }

        self.log_close(&reason);
        reason
    }

    fn log_close(&self, reason: &CloseReason) {
        match reason {
            CloseReason::PeerClosed => {
                tracing::info!(client_id = self.id, peer = %self.peer_addr, "Client disconnected");
            }
            CloseReason::ReadFailed(e) => {
                tracing::warn!(client_id = self.id, peer = %self.peer_addr, error = %e, "Read failed");
            }
            CloseReason::HeartbeatExpired => {
                tracing::info!(
                    client_id = self.id,
                    peer = %self.peer_addr,
                    "Heartbeat expired, closing idle client"
                );
            }
            CloseReason::WriteFailed(e) => {
                tracing::error!(client_id = self.id, peer = %self.peer_addr, error = %e, "Write failed");
            }
            CloseReason::Released => {
                tracing::debug!(client_id = self.id, peer = %self.peer_addr, "Client released by registry");
            }
        }
    }
}

/// Write one broadcast without giving up on the heartbeat or the release token
///
/// Returns `None` once the whole message was written, otherwise the reason
/// the connection has to close.
async fn write_message<W>(
    writer: &mut W,
    message: &[u8],
    mut idle: Pin<&mut Sleep>,
    heartbeat: Duration,
    activity: &mut watch::Receiver<()>,
    release: &mut oneshot::Receiver<()>,
) -> Option<CloseReason>
where
    W: AsyncWrite + Unpin,
{
    let write = writer.write_all(message);
    tokio::pin!(write);

    loop {
        tokio::select! {
            written = &mut write => return written.err().map(CloseReason::WriteFailed),
            () = idle.as_mut() => return Some(CloseReason::HeartbeatExpired),
            _ = &mut *release => return Some(CloseReason::Released),
            changed = activity.changed() => match changed {
                Ok(()) => idle.as_mut().reset(idle_deadline(heartbeat)),
                Err(_) => return Some(CloseReason::PeerClosed),
            },
        }
    }
}

fn idle_deadline(heartbeat: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(heartbeat).unwrap_or_else(|| now + FAR_FUTURE)
}
