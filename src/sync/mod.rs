//! Sync policy: staleness guard, per-family mode latch, the coordinator that
//! composes them with the two stores, and streamed message completion.

mod coordinator;
mod guard;
mod latch;
mod stream;
#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Fetched, SyncCoordinator, SyncOptions};
pub use guard::{FetchToken, QueryKey, StalenessGuard};
pub use latch::{SyncMode, SyncModeLatch};
pub use stream::{MessageStream, StopHandle, StreamOutcome};
