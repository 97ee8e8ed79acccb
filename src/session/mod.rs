//! Per-connection session handling

pub mod connection;
pub(crate) mod inbound;

pub use connection::CloseReason;
