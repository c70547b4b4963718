//! Local cache store for offline-first operation.
//!
//! This module provides the device-local half of the sync layer:
//! - Caches conversations, messages and projects as JSON keyed by id and owner
//! - Lists records by owner, newest update first
//! - Cascades conversation deletes to their messages in one transaction
//! - Tracks records written while the remote was unreachable (pending state)
//! - Holds local-only settings and unconfirmed deletes (tombstones)

mod storage;
mod traits;

pub use storage::{CacheStorage, CachedEntity, SqliteStorage, Tombstone};
pub use traits::{Cacheable, DataSource, Listing, RecordState};
