//! TCP fan-out server
//!
//! Accepts many concurrent TCP clients, hands inbound bytes to a callback
//! chosen by the client's host address, and broadcasts outbound messages to
//! every connected client. Each connection is dropped after a configurable
//! period without inbound data.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tcp_hub::TcpServer;
//!
//! # async fn run() -> tcp_hub::Result<()> {
//! let server = TcpServer::new();
//! server.set_heartbeat(Duration::from_secs(30));
//! server.register("127.0.0.1".parse().unwrap(), |data| {
//!     println!("received {} bytes", data.len());
//! });
//!
//! let addr = server.start("127.0.0.1:50000").await?;
//! println!("listening on {}", addr);
//!
//! server.broadcast("hello").await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Framing
//!
//! No framing is imposed. A callback receives whatever one socket read
//! returned, preceded by any bytes retained while no callback was registered
//! for that host. Broadcast messages are written to each socket as-is.
//!
//! # Logging
//!
//! All diagnostics go through `tracing`. Install a subscriber in the embedding
//! program to see them.

pub mod error;
pub mod registry;
pub mod server;
pub mod session;

pub use error::{Error, Result};
pub use registry::{ClientId, ClientInfo};
pub use server::{CallbackDirectory, InboundHandler, ServerConfig, TcpServer};
pub use session::CloseReason;
