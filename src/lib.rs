//! dirsync: one-way directory synchronization from a server to its clients.
//!
//! ```text
//! +----------------+   framed TCP (CRC32, optional XOR)   +----------------+
//! |     Server     | <----------------------------------> |   SyncClient   |
//! | auth, listing, |                                       | scheduler,     |
//! | content chunks |                                       | ledger, .sync  |
//! +----------------+                                       +----------------+
//! ```
//!
//! The client periodically lists each configured remote folder, compares
//! every entry with its local copy, and pulls what changed in chunks.
//! Partially received files live in `<name>.sync` sidecars that carry a
//! resume marker, so an interrupted transfer continues where it stopped.

pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sync;
pub mod wire;

pub use client::{ClientEvent, SyncClient};
pub use config::{ClientSettings, ServerSettings, TargetSettings};
pub use error::{Result, SyncError};
pub use ledger::FlowLedger;
pub use server::Server;
pub use session::{MessageHandler, SessionConfig, SessionHandle, SessionState};
pub use sync::{SyncEngine, SyncWindow};
