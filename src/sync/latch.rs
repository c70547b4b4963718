//! Sync mode latch, one per entity family.
//!
//! Only the coordinator moves the latch; everyone else may look.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::types::EntityFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  /// Try the remote store first (initial state)
  RemotePreferred,
  /// Remote believed down: writes stay local, reads use the cache
  Degraded,
}

impl fmt::Display for SyncMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::RemotePreferred => f.write_str("remote-preferred"),
      Self::Degraded => f.write_str("degraded"),
    }
  }
}

#[derive(Debug, Default)]
pub struct SyncModeLatch {
  degraded: [AtomicBool; 3],
}

impl SyncModeLatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn mode(&self, family: EntityFamily) -> SyncMode {
    if self.is_degraded(family) {
      SyncMode::Degraded
    } else {
      SyncMode::RemotePreferred
    }
  }

  pub fn is_degraded(&self, family: EntityFamily) -> bool {
    self.degraded[family.index()].load(Ordering::Acquire)
  }

  pub(crate) fn degrade(&self, family: EntityFamily, reason: &str) {
    let was = self.degraded[family.index()].swap(true, Ordering::AcqRel);
    if !was {
      warn!(family = %family, reason, "remote unreachable, switching to local-only mode");
    }
  }

  pub(crate) fn restore(&self, family: EntityFamily) {
    let was = self.degraded[family.index()].swap(false, Ordering::AcqRel);
    if was {
      info!(family = %family, "remote reachable again, preferring remote store");
    }
  }
}
