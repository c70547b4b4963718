//! Offline-first sync layer for conversations, messages and projects.
//!
//! The remote store is authoritative whenever it can be reached; a local
//! SQLite cache keeps every operation usable when it cannot.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod remote;
pub mod sync;
pub mod types;

pub use error::{StoreError, SyncError, SyncResult};
pub use sync::{Fetched, SyncCoordinator, SyncMode, SyncOptions};
