//! Connection registry
//!
//! The live-client set is owned by a single actor task. Everything else talks
//! to it over channels, so the map needs no lock.
//!
//! # Architecture
//!
//! ```text
//!   TcpServer::broadcast()            Connection handlers
//!            │                       add / remove / snapshot
//!            ▼ messages (bounded)              │ commands (unbounded)
//!     ┌──────────────────────────────────────────────┐
//!     │ RegistryActor                                │
//!     │   clients: HashMap<ClientId, ClientEntry {   │
//!     │     delivery: mpsc::Sender<Bytes>, ...       │
//!     │   }>                                         │
//!     └──────┬──────────────────┬──────────────┬─────┘
//!            ▼                  ▼              ▼
//!       [writer loop]      [writer loop]  [writer loop] ──► TCP
//! ```
//!
//! Closing the broadcast channel drops every entry, which closes every
//! delivery channel and unwinds every connection.

mod actor;
pub mod entry;

pub(crate) use actor::{RegistryActor, RegistryHandle};
pub use entry::{ClientId, ClientInfo};
