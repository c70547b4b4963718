//! Core traits and types for the local cache.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::types::{Conversation, EntityFamily, Message, Project};

/// Trait for entities that can be cached.
///
/// Every cached record has a unique key within its type, an optional owner
/// (project for conversations, conversation for messages) and a last-update
/// timestamp used for ordering.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this entity
  fn cache_key(&self) -> &str;

  /// Key of the owning record, if any
  fn owner_key(&self) -> Option<&str>;

  /// Last modification timestamp
  fn updated_at(&self) -> DateTime<Utc>;

  /// Entity type name for storage organization
  fn entity_type() -> &'static str;

  fn family() -> EntityFamily;
}

impl Cacheable for Conversation {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn owner_key(&self) -> Option<&str> {
    self.project_id.as_deref()
  }

  fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }

  fn entity_type() -> &'static str {
    "conversation"
  }

  fn family() -> EntityFamily {
    EntityFamily::Conversation
  }
}

impl Cacheable for Message {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn owner_key(&self) -> Option<&str> {
    Some(&self.conversation_id)
  }

  fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }

  fn entity_type() -> &'static str {
    "message"
  }

  fn family() -> EntityFamily {
    EntityFamily::Message
  }
}

impl Cacheable for Project {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn owner_key(&self) -> Option<&str> {
    // Projects belong to the signed-in user, who is implicit locally
    None
  }

  fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }

  fn entity_type() -> &'static str {
    "project"
  }

  fn family() -> EntityFamily {
    EntityFamily::Project
  }
}

/// Whether a cached record has been confirmed by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
  /// Last written from a remote response
  Synced,
  /// Written while degraded; locally authoritative until reconciled
  Pending,
}

impl RecordState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Synced => "synced",
      Self::Pending => "pending",
    }
  }

  pub fn parse(s: &str) -> Self {
    if s == "pending" {
      Self::Pending
    } else {
      Self::Synced
    }
  }
}

/// Result of a read, including data and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: DataSource,
}

impl<T> Listing<T> {
  /// Fresh data from the remote store, already written through to the cache.
  pub fn from_remote(data: T) -> Self {
    Self {
      data,
      source: DataSource::Remote,
    }
  }

  /// Data served from the cache without contacting the remote.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: DataSource::Cache,
    }
  }

  /// Data served from the cache because the remote attempt just failed.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: DataSource::Offline,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Listing<U> {
    Listing {
      data: f(self.data),
      source: self.source,
    }
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Fresh data from the remote store
  Remote,
  /// Cache read without a remote attempt (family already degraded)
  Cache,
  /// Remote attempt failed during this read, serving cached data
  Offline,
}

/// Sortable timestamp format used for the `updated_at` column.
pub(crate) fn sortable_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
