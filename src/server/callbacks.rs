//! Callback directory
//!
//! Maps a peer host address to the handler that receives inbound bytes from
//! every connection opened by that host. The port is not part of the key, so
//! two connections from the same host share one handler.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;

/// Handler invoked with inbound bytes from a host
pub type InboundHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Concurrency-safe map from host address to inbound handler
///
/// Read by every connection's read loop and written by `register` calls from
/// arbitrary tasks. Neither side ever holds the lock across an await point.
#[derive(Default)]
pub struct CallbackDirectory {
    handlers: RwLock<HashMap<IpAddr, InboundHandler>>,
}

impl CallbackDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for `host`, replacing any previous one
    ///
    /// Returns `true` if a previous handler was replaced.
    pub fn register(&self, host: IpAddr, handler: InboundHandler) -> bool {
        let host = host.to_canonical();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, handler);

        if previous.is_some() {
            tracing::warn!(host = %host, "Callback already registered, replacing");
        } else {
            tracing::debug!(host = %host, "Callback registered");
        }

        previous.is_some()
    }

    /// Remove the handler for `host`
    pub fn unregister(&self, host: IpAddr) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&host.to_canonical())
            .is_some()
    }

    /// Look up the handler for `host`
    pub fn get(&self, host: &IpAddr) -> Option<InboundHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host.to_canonical())
            .cloned()
    }

    /// Number of registered hosts
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CallbackDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDirectory")
            .field("hosts", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> InboundHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |data: Bytes| {
            counter.fetch_add(data.len(), Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_and_get() {
        let directory = CallbackDirectory::new();
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(!directory.register(host, counting_handler(&hits)));
        assert!(directory.get(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))).is_none());

        let handler = directory.get(&host).unwrap();
        handler(Bytes::from_static(b"abc"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_register_replaces() {
        let directory = CallbackDirectory::new();
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        directory.register(host, counting_handler(&first));
        assert!(directory.register(host, counting_handler(&second)));
        assert_eq!(directory.len(), 1);

        directory.get(&host).unwrap()(Bytes::from_static(b"xy"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mapped_ipv6_shares_key() {
        let directory = CallbackDirectory::new();
        let hits = Arc::new(AtomicUsize::new(0));
        directory.register(IpAddr::V4(Ipv4Addr::LOCALHOST), counting_handler(&hits));

        let mapped = IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped());
        assert!(directory.get(&mapped).is_some());
        assert!(directory.get(&IpAddr::V6(Ipv6Addr::LOCALHOST)).is_none());
    }

    #[test]
    fn test_unregister() {
        let directory = CallbackDirectory::new();
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let hits = Arc::new(AtomicUsize::new(0));

        directory.register(host, counting_handler(&hits));
        assert!(directory.unregister(host));
        assert!(!directory.unregister(host));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_concurrent_register_keeps_every_host() {
        let directory = Arc::new(CallbackDirectory::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16u8)
            .map(|i| {
                let directory = Arc::clone(&directory);
                let handler = counting_handler(&hits);
                std::thread::spawn(move || {
                    for j in 0..16u8 {
                        let host = IpAddr::V4(Ipv4Addr::new(10, 0, i, j));
                        directory.register(host, Arc::clone(&handler));
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(directory.len(), 256);
    }
}
