//! Pairsync library
//!
//! Two-peer directory synchronization: each run diffs the directory against
//! its last reconciled history, trades change sets with the peer, settles
//! conflicts by modification time and pulls whatever the peer has newer.

pub mod cli;
pub mod config;
pub mod entry;
pub mod errors;
pub mod exchange;
pub mod history;
pub mod logger;
pub mod net;
pub mod policy;
pub mod protocol;
pub mod protocol_core;
pub mod resolver;
pub mod session;
pub mod snapshot;
pub mod transfer;
pub mod transport;

pub use config::{Settings, SyncConfig};
pub use errors::SyncError;
pub use session::{Session, SessionReport, SessionState};
pub use transport::{Connection, Role};
