//! Server configuration

use std::time::Duration;

/// Default idle timeout applied to every connection
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Idle timeout (disconnect if no data received)
    pub heartbeat: Duration,

    /// Bytes requested from the socket per read
    pub read_buffer_size: usize,

    /// Cap on inbound bytes retained while no callback is registered
    pub max_pending_bytes: usize,

    /// Capacity of each client's delivery queue
    pub client_queue_capacity: usize,

    /// Capacity of the hand-off queue between `broadcast` and the registry
    pub broadcast_capacity: usize,

    /// How long fan-out waits on a full client queue before evicting it
    pub delivery_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            read_buffer_size: 1024,
            max_pending_bytes: 64 * 1024, // 64KB
            client_queue_capacity: 32,
            broadcast_capacity: 1,
            delivery_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Set the idle timeout
    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the per-read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the cap on retained inbound bytes
    pub fn max_pending_bytes(mut self, max: usize) -> Self {
        self.max_pending_bytes = max;
        self
    }

    /// Set the per-client delivery queue capacity
    pub fn client_queue_capacity(mut self, capacity: usize) -> Self {
        // tokio mpsc channels reject a zero capacity
        self.client_queue_capacity = capacity.max(1);
        self
    }

    /// Set the broadcast hand-off capacity
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    /// Set the slow-client delivery timeout
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.heartbeat, Duration::from_secs(60));
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.broadcast_capacity, 1);
        assert!(config.client_queue_capacity > 0);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_builder_heartbeat() {
        let config = ServerConfig::default().heartbeat(Duration::from_millis(250));

        assert_eq!(config.heartbeat, Duration::from_millis(250));
    }

    #[test]
    fn test_builder_capacities_clamped() {
        // Zero-capacity channels are not allowed
        let config = ServerConfig::default()
            .client_queue_capacity(0)
            .broadcast_capacity(0)
            .read_buffer_size(0);

        assert_eq!(config.client_queue_capacity, 1);
        assert_eq!(config.broadcast_capacity, 1);
        assert_eq!(config.read_buffer_size, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let config = ServerConfig::default()
            .heartbeat(Duration::from_secs(5))
            .max_pending_bytes(16)
            .client_queue_capacity(4)
            .delivery_timeout(Duration::from_millis(100))
            .tcp_nodelay(false);

        assert_eq!(config.heartbeat, Duration::from_secs(5));
        assert_eq!(config.max_pending_bytes, 16);
        assert_eq!(config.client_queue_capacity, 4);
        assert_eq!(config.delivery_timeout, Duration::from_millis(100));
        assert!(!config.tcp_nodelay);
    }
}
