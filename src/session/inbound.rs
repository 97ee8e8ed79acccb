//! Inbound byte handling
//!
//! Framing contract: this layer imposes no framing. Every nonzero read is
//! appended to the connection's accumulation buffer. If a callback is
//! registered for the peer host, the whole buffer is handed to it and cleared,
//! so with no backlog the callback sees exactly the bytes of one read. With no
//! callback the bytes are retained, capped at `max_pending` by discarding the
//! oldest bytes. A zero-length read means the peer closed the stream.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::server::callbacks::CallbackDirectory;

/// Per-connection accumulation buffer
#[derive(Debug)]
pub(crate) struct InboundBuffer {
    pending: BytesMut,
    max_pending: usize,
}

impl InboundBuffer {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_pending,
        }
    }

    /// Append bytes from one read
    pub(crate) fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Take everything accumulated so far
    pub(crate) fn take(&mut self) -> Bytes {
        self.pending.split().freeze()
    }

    /// Enforce the cap, returning how many bytes were discarded
    pub(crate) fn trim(&mut self) -> usize {
        let excess = self.pending.len().saturating_sub(self.max_pending);
        if excess > 0 {
            self.pending.advance(excess);
        }
        excess
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Settings the read loop needs from the server
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadSettings {
    pub read_buffer_size: usize,
    pub max_pending_bytes: usize,
}

/// Read from `reader` until end-of-stream or error
///
/// Each nonzero read is marked on `activity`, which resets the heartbeat on
/// the writer side, before it is dispatched to the callback registered for
/// `host`. A slow callback therefore never counts against the heartbeat.
/// Dropping `activity` on return tells the writer the read side is done.
pub(crate) async fn read_loop<R>(
    mut reader: R,
    host: IpAddr,
    callbacks: Arc<CallbackDirectory>,
    activity: watch::Sender<()>,
    settings: ReadSettings,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; settings.read_buffer_size];
    let mut inbound = InboundBuffer::new(settings.max_pending_bytes);

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if inbound.len() > 0 {
                tracing::debug!(
                    host = %host,
                    bytes = inbound.len(),
                    "Discarding undelivered bytes on disconnect"
                );
            }
            return Ok(());
        }

        inbound.push(&buf[..n]);
        activity.send_replace(());

        match callbacks.get(&host) {
            Some(callback) => callback(inbound.take()),
            None => {
                tracing::warn!(
                    host = %host,
                    pending = inbound.len(),
                    "No callback registered for host, retaining bytes"
                );
                let discarded = inbound.trim();
                if discarded > 0 {
                    tracing::warn!(host = %host, discarded, "Inbound backlog full, dropped oldest bytes");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::server::callbacks::InboundHandler;

    const HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn settings() -> ReadSettings {
        ReadSettings {
            read_buffer_size: 1024,
            max_pending_bytes: 8,
        }
    }

    fn recorder() -> (InboundHandler, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: InboundHandler = Arc::new(move |data: Bytes| {
            sink.lock().unwrap().push(data);
        });
        (handler, seen)
    }

    #[test]
    fn test_buffer_take_clears() {
        let mut inbound = InboundBuffer::new(16);
        inbound.push(b"ab");
        inbound.push(b"cd");

        assert_eq!(inbound.take(), Bytes::from_static(b"abcd"));
        assert_eq!(inbound.len(), 0);
    }

    #[test]
    fn test_buffer_trim_keeps_newest() {
        let mut inbound = InboundBuffer::new(4);
        inbound.push(b"012345");

        assert_eq!(inbound.trim(), 2);
        assert_eq!(inbound.take(), Bytes::from_static(b"2345"));
        assert_eq!(inbound.trim(), 0);
    }

    #[tokio::test]
    async fn test_each_read_delivered() {
        let callbacks = Arc::new(CallbackDirectory::new());
        let (handler, seen) = recorder();
        callbacks.register(HOST, handler);

        let reader = tokio_test::io::Builder::new()
            .read(&[0x01, 0x02])
            .read(b"hello")
            .build();
        let (activity, _activity_rx) = watch::channel(());

        read_loop(reader, HOST, callbacks, activity, settings())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Bytes::from_static(&[0x01, 0x02]), Bytes::from_static(b"hello")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_flushed_once_callback_registered() {
        let callbacks = Arc::new(CallbackDirectory::new());
        let (handler, seen) = recorder();

        let reader = tokio_test::io::Builder::new()
            .read(b"abc")
            .wait(Duration::from_millis(50))
            .read(b"de")
            .build();
        let (activity, _activity_rx) = watch::channel(());
        let task = tokio::spawn(read_loop(
            reader,
            HOST,
            Arc::clone(&callbacks),
            activity,
            settings(),
        ));

        // Between the two reads
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().unwrap().is_empty());
        callbacks.register(HOST, handler);

        task.await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Bytes::from_static(b"abcde")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_capped_without_callback() {
        let callbacks = Arc::new(CallbackDirectory::new());
        let (handler, seen) = recorder();

        let reader = tokio_test::io::Builder::new()
            .read(b"0123456789")
            .wait(Duration::from_millis(50))
            .read(b"!")
            .build();
        let (activity, _activity_rx) = watch::channel(());
        let task = tokio::spawn(read_loop(
            reader,
            HOST,
            Arc::clone(&callbacks),
            activity,
            settings(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        callbacks.register(HOST, handler);

        task.await.unwrap().unwrap();
        // Cap is 8: the two oldest bytes were dropped
        assert_eq!(*seen.lock().unwrap(), vec![Bytes::from_static(b"23456789!")]);
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let callbacks = Arc::new(CallbackDirectory::new());
        let reader = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();
        let (activity, _activity_rx) = watch::channel(());

        let err = read_loop(reader, HOST, callbacks, activity, settings())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_reads_mark_activity() {
        let callbacks = Arc::new(CallbackDirectory::new());
        let reader = tokio_test::io::Builder::new().read(b"ping").build();
        let (activity, mut activity_rx) = watch::channel(());

        read_loop(reader, HOST, callbacks, activity, settings())
            .await
            .unwrap();

        // The read is still observable after the sender went away
        assert!(activity_rx.changed().await.is_ok());
        assert!(activity_rx.changed().await.is_err());
    }

    #[tokio::test]
    async fn test_activity_marked_before_dispatch() {
        let callbacks = Arc::new(CallbackDirectory::new());
        let (activity, activity_rx) = watch::channel(());

        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let handler: InboundHandler = Arc::new(move |_data: Bytes| {
            sink.lock().unwrap().push(activity_rx.has_changed().unwrap());
        });
        callbacks.register(HOST, handler);

        let reader = tokio_test::io::Builder::new().read(b"ping").build();
        read_loop(reader, HOST, callbacks, activity, settings())
            .await
            .unwrap();

        assert_eq!(*observed.lock().unwrap(), vec![true]);
    }
}
