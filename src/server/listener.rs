//! TCP server facade
//!
//! Owns the listening socket, the accept loop and the handle to the registry
//! actor. Client code configures the heartbeat and callbacks, then drives the
//! server with `start`, `broadcast` and `close`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::registry::{ClientInfo, RegistryActor, RegistryHandle};
use crate::server::callbacks::{CallbackDirectory, InboundHandler};
use crate::server::config::{ServerConfig, DEFAULT_HEARTBEAT};
use crate::session::connection::{Connection, ConnectionSettings};
use crate::session::inbound::ReadSettings;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// TCP fan-out server
///
/// Lifecycle: constructed idle, running after `start`, closed after `close`.
/// A closed server cannot be started again.
pub struct TcpServer {
    shared: Arc<Shared>,
    state: Mutex<ServerState>,
}

/// State read by the accept loop and every new connection
struct Shared {
    config: ServerConfig,
    heartbeat_nanos: AtomicU64,
    callbacks: Arc<CallbackDirectory>,
    next_client_id: AtomicU64,
}

enum ServerState {
    Idle,
    Running(Running),
    Closed,
}

struct Running {
    local_addr: SocketAddr,
    messages: mpsc::Sender<Bytes>,
    registry: RegistryHandle,
    accept_task: JoinHandle<()>,
    registry_task: JoinHandle<()>,
}

impl TcpServer {
    /// Create a server with default configuration
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a server with custom configuration
    pub fn with_config(config: ServerConfig) -> Self {
        let heartbeat_nanos = AtomicU64::new(duration_to_nanos(config.heartbeat));

        Self {
            shared: Arc::new(Shared {
                config,
                heartbeat_nanos,
                callbacks: Arc::new(CallbackDirectory::new()),
                next_client_id: AtomicU64::new(1),
            }),
            state: Mutex::new(ServerState::Idle),
        }
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Set the idle timeout for connections accepted from now on
    ///
    /// Connections already open keep the value they were accepted with. A
    /// zero duration falls back to the 60 second default.
    pub fn set_heartbeat(&self, heartbeat: Duration) {
        self.shared
            .heartbeat_nanos
            .store(duration_to_nanos(heartbeat), Ordering::Relaxed);
    }

    /// Get the idle timeout applied to new connections
    pub fn heartbeat(&self) -> Duration {
        self.shared.heartbeat()
    }

    /// Install the inbound handler for a host, replacing any previous one
    ///
    /// Every connection from `host` shares the handler regardless of port.
    /// Can be called at any time, before or after `start`.
    pub fn register<F>(&self, host: IpAddr, handler: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let handler: InboundHandler = Arc::new(handler);
        self.shared.callbacks.register(host, handler);
    }

    /// Remove the inbound handler for a host
    pub fn unregister(&self, host: IpAddr) -> bool {
        self.shared.callbacks.unregister(host)
    }

    /// Get the callback directory
    pub fn callbacks(&self) -> &Arc<CallbackDirectory> {
        &self.shared.callbacks
    }

    /// Bind the listener and start accepting connections
    ///
    /// Accepts `host:port` or `:port` (all interfaces). Returns the bound
    /// address once the accept loop is running; it does not wait for clients.
    pub async fn start(&self, address: &str) -> Result<SocketAddr> {
        self.lock_state().ensure_idle()?;

        let addr = resolve(address).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (messages, messages_rx) = mpsc::channel(self.shared.config.broadcast_capacity);
        let (registry, registry_task) =
            RegistryActor::spawn(messages_rx, self.shared.config.delivery_timeout);

        let mut state = self.lock_state();
        // Another caller may have started or closed the server meanwhile
        state.ensure_idle()?;

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            registry.clone(),
        ));

        *state = ServerState::Running(Running {
            local_addr,
            messages,
            registry,
            accept_task,
            registry_task,
        });

        tracing::info!(addr = %local_addr, "Server listening");
        Ok(local_addr)
    }

    /// Queue a message for every connected client
    ///
    /// Waits until the registry accepts the message, not until clients
    /// receive it. Fails with `NotStarted` before `start` and `Closed` after
    /// `close`.
    pub async fn broadcast(&self, message: impl Into<Bytes>) -> Result<()> {
        let messages = match &*self.lock_state() {
            ServerState::Idle => return Err(Error::NotStarted),
            ServerState::Closed => return Err(Error::Closed),
            ServerState::Running(running) => running.messages.clone(),
        };

        messages.send(message.into()).await.map_err(|_| Error::Closed)
    }

    /// Stop accepting and disconnect every client
    ///
    /// Closing the broadcast channel makes the registry close every delivery
    /// channel, which unwinds every connection. Calling `close` again is a
    /// no-op; closing a server that never started is `NotStarted`.
    pub async fn close(&self) -> Result<()> {
        let running = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, ServerState::Closed) {
                ServerState::Running(running) => running,
                ServerState::Closed => {
                    tracing::debug!("Server already closed");
                    return Ok(());
                }
                ServerState::Idle => {
                    *state = ServerState::Idle;
                    return Err(Error::NotStarted);
                }
            }
        };

        let Running {
            local_addr,
            messages,
            registry,
            accept_task,
            registry_task,
        } = running;

        accept_task.abort();
        // Wait for the listener to be dropped
        let _ = accept_task.await;

        drop(messages);
        drop(registry);
        if let Err(e) = registry_task.await {
            tracing::error!(error = %e, "Registry task failed");
        }

        tracing::info!(addr = %local_addr, "Server closed");
        Ok(())
    }

    /// Address the server is listening on, if running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_state() {
            ServerState::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    /// Whether the server is accepting connections
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), ServerState::Running(_))
    }

    /// Snapshot of the clients currently registered
    pub async fn clients(&self) -> Result<Vec<ClientInfo>> {
        let registry = match &*self.lock_state() {
            ServerState::Idle => return Err(Error::NotStarted),
            ServerState::Closed => return Err(Error::Closed),
            ServerState::Running(running) => running.registry.clone(),
        };

        registry.snapshot().await.map_err(|_| Error::Closed)
    }

    /// Number of clients currently registered
    pub async fn client_count(&self) -> Result<usize> {
        Ok(self.clients().await?.len())
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        if let ServerState::Running(running) = std::mem::replace(state, ServerState::Closed) {
            // Dropping the broadcast sender unwinds the registry and clients
            running.accept_task.abort();
        }
    }
}

impl ServerState {
    fn ensure_idle(&self) -> Result<()> {
        match self {
            ServerState::Idle => Ok(()),
            ServerState::Running(_) => Err(Error::AlreadyStarted),
            ServerState::Closed => Err(Error::Closed),
        }
    }
}

impl Shared {
    fn heartbeat(&self) -> Duration {
        match self.heartbeat_nanos.load(Ordering::Relaxed) {
            0 => DEFAULT_HEARTBEAT,
            nanos => Duration::from_nanos(nanos),
        }
    }

    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat: self.heartbeat(),
            queue_capacity: self.config.client_queue_capacity,
            read: ReadSettings {
                read_buffer_size: self.config.read_buffer_size,
                max_pending_bytes: self.config.max_pending_bytes,
            },
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr, registry: &RegistryHandle) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(client_id = client_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::warn!(client_id = client_id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        // Heartbeat is sampled once per connection
        let connection = Connection::new(
            client_id,
            peer_addr,
            self.connection_settings(),
            Arc::clone(&self.callbacks),
            registry.clone(),
        );

        tokio::spawn(async move {
            let reason = connection.run(socket).await;
            tracing::debug!(client_id = client_id, reason = ?reason, "Connection closed");
        });
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, registry: RegistryHandle) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                shared.handle_connection(socket, peer_addr, &registry);
            }
            Err(e) => {
                // Only this accept attempt is affected
                tracing::error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Resolve `host:port` or `:port` to a socket address
async fn resolve(address: &str) -> Result<SocketAddr> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::InvalidAddress(address.to_string()));
    }

    let target = match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => address.to_string(),
    };

    let mut addrs = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => Error::InvalidAddress(address.to_string()),
            _ => Error::Resolve {
                address: address.to_string(),
                source: Some(e),
            },
        })?;

    addrs.next().ok_or_else(|| Error::Resolve {
        address: address.to_string(),
        source: None,
    })
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
