//! Error taxonomy for the sync layer.
//!
//! Remote failures are split by whether the remote answered at all
//! ([`RemoteError`](crate::remote::RemoteError)); this module holds the
//! local store failure type and the error surfaced to callers.

use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;

/// Local cache failure. Always fatal for the operation in progress.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("cache database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to encode or decode cached {entity_type}: {source}")]
  Serde {
    entity_type: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("cache lock poisoned")]
  Lock,

  #[error("{entity_type} {key} references missing conversation {parent}")]
  MissingParent {
    entity_type: &'static str,
    key: String,
    parent: String,
  },

  #[error("failed to prepare cache directory {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("could not determine data directory")]
  NoDataDir,
}

/// Error surfaced to callers of the coordinator.
///
/// `Unreachable` never escapes ordinary reads and writes: those fall back to
/// the local cache. It only reaches the caller from a forced resync, whose
/// purpose is to reach the remote.
#[derive(Error, Debug)]
pub enum SyncError {
  #[error("rejected: {message}")]
  Rejected { status: Option<u16>, message: String },

  #[error("local cache failure: {0}")]
  LocalStore(#[from] StoreError),

  #[error("remote store unreachable: {0}")]
  Unreachable(String),
}

impl SyncError {
  /// Validation failure detected before any store was touched.
  pub fn rejected(message: impl Into<String>) -> Self {
    Self::Rejected {
      status: None,
      message: message.into(),
    }
  }

  pub fn is_rejected(&self) -> bool {
    matches!(self, Self::Rejected { .. })
  }
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Unreachable(reason) => Self::Unreachable(reason),
      RemoteError::Rejected { status, message } => Self::Rejected {
        status: Some(status),
        message,
      },
    }
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
