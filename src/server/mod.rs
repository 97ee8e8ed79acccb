//! Server facade, configuration and callback directory

pub mod callbacks;
pub mod config;
pub mod listener;

pub use callbacks::{CallbackDirectory, InboundHandler};
pub use config::{ServerConfig, DEFAULT_HEARTBEAT};
pub use listener::TcpServer;
