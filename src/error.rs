//! Error types
//!
//! Errors returned by the server facade. Failures that only affect a single
//! connection never surface here; they are logged and the connection is torn
//! down.

use std::net::SocketAddr;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for server operations
#[derive(Debug)]
pub enum Error {
    /// The listening address string could not be parsed
    InvalidAddress(String),
    /// The address could not be resolved to a socket address
    Resolve {
        address: String,
        source: Option<std::io::Error>,
    },
    /// The listener could not bind to the resolved address
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// `start` was called on a server that is already running
    AlreadyStarted,
    /// The operation requires a running server
    NotStarted,
    /// The server has been closed
    Closed,
    /// Other I/O failure
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidAddress(addr) => write!(f, "Invalid listening address: {}", addr),
            Error::Resolve {
                address,
                source: Some(e),
            } => write!(f, "Failed to resolve {}: {}", address, e),
            Error::Resolve {
                address,
                source: None,
            } => write!(f, "Address {} resolved to nothing", address),
            Error::Bind { addr, source } => write!(f, "Failed to listen on {}: {}", addr, source),
            Error::AlreadyStarted => write!(f, "Server already started"),
            Error::NotStarted => write!(f, "Server not started"),
            Error::Closed => write!(f, "Server closed"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Resolve {
                source: Some(e), ..
            } => Some(e),
            Error::Bind { source, .. } => Some(source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
