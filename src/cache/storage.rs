//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{sortable_timestamp, Cacheable, RecordState};
use crate::error::StoreError;
use crate::types::{Conversation, EntityFamily, Message};

type StoreResult<T> = Result<T, StoreError>;

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
  pub state: RecordState,
}

/// A delete that has not been confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
  pub family: EntityFamily,
  pub entity_key: String,
  pub owner_key: Option<String>,
}

/// Trait for cache storage backends.
///
/// Calls are synchronous from the caller's perspective; writes to the same
/// key are serialized by the backend (last write wins).
pub trait CacheStorage: Send + Sync {
  /// Insert or replace one entity by key.
  fn upsert<T: Cacheable>(&self, entity: &T, state: RecordState) -> StoreResult<()>;

  /// Insert or replace many entities in one transaction.
  fn upsert_many<T: Cacheable>(&self, entities: &[T], state: RecordState) -> StoreResult<()>;

  /// Write through records read from the remote as synced. Rows still
  /// pending locally are left untouched. Returns how many were kept.
  fn upsert_fetched<T: Cacheable>(&self, entities: &[T]) -> StoreResult<usize>;

  /// Get a single entity by key.
  fn get<T: Cacheable>(&self, key: &str) -> StoreResult<Option<CachedEntity<T>>>;

  /// All entities of a type owned by `owner` (every entity when `None`),
  /// newest update first.
  fn list_by_owner<T: Cacheable>(&self, owner: Option<&str>) -> StoreResult<Vec<T>>;

  /// Entities written while degraded and not yet reconciled.
  fn list_pending<T: Cacheable>(&self, owner: Option<&str>) -> StoreResult<Vec<T>>;

  /// Replace the whole record set of a type for one owner.
  fn replace_owned<T: Cacheable>(&self, owner: Option<&str>, entities: &[T]) -> StoreResult<()>;

  /// Delete an entity. Conversations take their messages with them; projects
  /// release their conversations. Returns the number of rows removed.
  fn delete<T: Cacheable>(&self, key: &str) -> StoreResult<usize>;

  /// Insert a message and recompute its conversation's count and
  /// last-message timestamp in the same transaction.
  fn append_message(&self, message: &Message, state: RecordState) -> StoreResult<Conversation>;

  /// Number of cached conversations per project id.
  fn conversation_counts(&self) -> StoreResult<HashMap<String, u32>>;

  fn get_setting(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

  fn set_setting(&self, key: &str, value: &serde_json::Value) -> StoreResult<()>;

  fn add_tombstone(&self, family: EntityFamily, key: &str, owner: Option<&str>)
    -> StoreResult<()>;

  /// Tombstones of a family for one owner (all owners when `None`).
  fn tombstones(&self, family: EntityFamily, owner: Option<&str>) -> StoreResult<Vec<Tombstone>>;

  fn clear_tombstone(&self, family: EntityFamily, key: &str) -> StoreResult<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache at the default location.
  pub fn open() -> StoreResult<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> StoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(
      r#"
      PRAGMA journal_mode=WAL;
      PRAGMA busy_timeout=5000;
      PRAGMA synchronous=NORMAL;
      "#,
    )?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    debug!(path = %path.display(), "opened cache database");

    Ok(storage)
  }

  /// In-memory cache, used by tests and ephemeral sessions.
  pub fn open_in_memory() -> StoreResult<Self> {
    let storage = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("chatsync").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> StoreResult<()> {
    self.conn()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StoreError::Lock)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Generic entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    owner_key TEXT,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    sync_state TEXT NOT NULL DEFAULT 'synced',
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_entities_owner
    ON entities(entity_type, owner_key, updated_at);

-- Local-only key/value settings
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Deletes not yet confirmed by the remote store
CREATE TABLE IF NOT EXISTS tombstones (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    owner_key TEXT,
    deleted_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);
"#;

impl CacheStorage for SqliteStorage {
  fn upsert<T: Cacheable>(&self, entity: &T, state: RecordState) -> StoreResult<()> {
    self.upsert_many(std::slice::from_ref(entity), state)
  }

  fn upsert_many<T: Cacheable>(&self, entities: &[T], state: RecordState) -> StoreResult<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    for entity in entities {
      write_entity(&tx, entity, state)?;
    }
    refresh_owner_stats(&tx, entities)?;

    tx.commit()?;
    Ok(())
  }

  fn upsert_fetched<T: Cacheable>(&self, entities: &[T]) -> StoreResult<usize> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let mut kept = 0;
    for entity in entities {
      if read_state(&tx, T::entity_type(), entity.cache_key())? == RecordState::Pending {
        kept += 1;
        continue;
      }
      write_entity(&tx, entity, RecordState::Synced)?;
    }
    refresh_owner_stats(&tx, entities)?;

    tx.commit()?;
    Ok(kept)
  }

  fn get<T: Cacheable>(&self, key: &str) -> StoreResult<Option<CachedEntity<T>>> {
    let conn = self.conn()?;

    let row: Option<(String, String, String)> = conn
      .query_row(
        "SELECT data, cached_at, sync_state FROM entities
         WHERE entity_type = ?1 AND entity_key = ?2",
        params![T::entity_type(), key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((data, cached_at, state)) => Ok(Some(CachedEntity {
        entity: decode(&data)?,
        cached_at: parse_datetime(&cached_at),
        state: RecordState::parse(&state),
      })),
      None => Ok(None),
    }
  }

  fn list_by_owner<T: Cacheable>(&self, owner: Option<&str>) -> StoreResult<Vec<T>> {
    let conn = self.conn()?;
    read_owned(&conn, owner, None)
  }

  fn list_pending<T: Cacheable>(&self, owner: Option<&str>) -> StoreResult<Vec<T>> {
    let conn = self.conn()?;
    read_owned(&conn, owner, Some(RecordState::Pending))
  }

  fn replace_owned<T: Cacheable>(&self, owner: Option<&str>, entities: &[T]) -> StoreResult<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    if T::family() == EntityFamily::Conversation {
      // Conversations that disappear take their messages with them
      let existing: Vec<T> = read_owned(&tx, owner, None)?;
      for gone in existing
        .iter()
        .filter(|e| !entities.iter().any(|n| n.cache_key() == e.cache_key()))
      {
        delete_messages_of(&tx, gone.cache_key())?;
      }
    }

    let removed = tx.execute(
      "DELETE FROM entities WHERE entity_type = ?1 AND (?2 IS NULL OR owner_key = ?2)",
      params![T::entity_type(), owner],
    )?;
    for entity in entities {
      write_entity(&tx, entity, RecordState::Synced)?;
    }
    if T::family() == EntityFamily::Message {
      if let Some(conversation_id) = owner {
        refresh_conversation_stats(&tx, conversation_id, StatsFloor::Exact)?;
      }
    }

    tx.commit()?;
    debug!(
      entity_type = T::entity_type(),
      owner = owner.unwrap_or("*"),
      removed,
      inserted = entities.len(),
      "replaced cached record set"
    );
    Ok(())
  }

  fn delete<T: Cacheable>(&self, key: &str) -> StoreResult<usize> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let mut removed = 0;
    match T::family() {
      EntityFamily::Conversation => {
        removed += delete_messages_of(&tx, key)?;
      }
      EntityFamily::Project => {
        detach_conversations(&tx, key)?;
      }
      EntityFamily::Message => {}
    }
    let owner: Option<Option<String>> = tx
      .query_row(
        "SELECT owner_key FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
        params![T::entity_type(), key],
        |row| row.get(0),
      )
      .optional()?;
    removed += tx.execute(
      "DELETE FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
      params![T::entity_type(), key],
    )?;
    if T::family() == EntityFamily::Message {
      if let Some(Some(conversation_id)) = owner {
        refresh_conversation_stats(&tx, &conversation_id, StatsFloor::Exact)?;
      }
    }

    tx.commit()?;
    Ok(removed)
  }

  fn append_message(&self, message: &Message, state: RecordState) -> StoreResult<Conversation> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let existed: bool = tx
      .query_row(
        "SELECT 1 FROM entities WHERE entity_type = 'message' AND entity_key = ?1",
        params![message.id],
        |_| Ok(()),
      )
      .optional()?
      .is_some();

    let floor = if existed {
      StatsFloor::Keep
    } else {
      StatsFloor::Bump
    };

    // The owning conversation must exist before a message can reference it
    let conversation: Option<String> = tx
      .query_row(
        "SELECT entity_key FROM entities WHERE entity_type = 'conversation' AND entity_key = ?1",
        params![message.conversation_id],
        |row| row.get(0),
      )
      .optional()?;
    if conversation.is_none() {
      return Err(StoreError::MissingParent {
        entity_type: Message::entity_type(),
        key: message.id.clone(),
        parent: message.conversation_id.clone(),
      });
    }

    write_entity(&tx, message, state)?;
    let conversation = refresh_conversation_stats(&tx, &message.conversation_id, floor)?
      .ok_or_else(|| StoreError::MissingParent {
        entity_type: Message::entity_type(),
        key: message.id.clone(),
        parent: message.conversation_id.clone(),
      })?;

    tx.commit()?;
    Ok(conversation)
  }

  fn conversation_counts(&self) -> StoreResult<HashMap<String, u32>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT owner_key, COUNT(*) FROM entities
       WHERE entity_type = 'conversation' AND owner_key IS NOT NULL
       GROUP BY owner_key",
    )?;

    let counts = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
      .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(counts)
  }

  fn get_setting(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
    let conn = self.conn()?;
    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    value
      .map(|v| {
        serde_json::from_str(&v).map_err(|source| StoreError::Serde {
          entity_type: "setting",
          source,
        })
      })
      .transpose()
  }

  fn set_setting(&self, key: &str, value: &serde_json::Value) -> StoreResult<()> {
    let conn = self.conn()?;
    let data = serde_json::to_string(value).map_err(|source| StoreError::Serde {
      entity_type: "setting",
      source,
    })?;

    conn.execute(
      "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
      params![key, data],
    )?;
    Ok(())
  }

  fn add_tombstone(
    &self,
    family: EntityFamily,
    key: &str,
    owner: Option<&str>,
  ) -> StoreResult<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO tombstones (entity_type, entity_key, owner_key, deleted_at)
       VALUES (?1, ?2, ?3, datetime('now'))",
      params![family.as_str(), key, owner],
    )?;
    Ok(())
  }

  fn tombstones(&self, family: EntityFamily, owner: Option<&str>) -> StoreResult<Vec<Tombstone>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT entity_key, owner_key FROM tombstones
       WHERE entity_type = ?1 AND (?2 IS NULL OR owner_key = ?2)
       ORDER BY deleted_at",
    )?;

    let tombstones = stmt
      .query_map(params![family.as_str(), owner], |row| {
        Ok(Tombstone {
          family,
          entity_key: row.get(0)?,
          owner_key: row.get(1)?,
        })
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(tombstones)
  }

  fn clear_tombstone(&self, family: EntityFamily, key: &str) -> StoreResult<()> {
    let conn = self.conn()?;
    conn.execute(
      "DELETE FROM tombstones WHERE entity_type = ?1 AND entity_key = ?2",
      params![family.as_str(), key],
    )?;
    Ok(())
  }
}

// ============================================================================
// Statement helpers (usable on a connection or an open transaction)
// ============================================================================

/// How the derived message count may move when recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsFloor {
  /// A new message was appended: count grows by at least one
  Bump,
  /// Never drop below the stored values
  Keep,
  /// Take exactly what the cache holds (after an authoritative replace)
  Exact,
}

fn write_entity<T: Cacheable>(conn: &Connection, entity: &T, state: RecordState) -> StoreResult<()> {
  let data = serde_json::to_string(entity).map_err(|source| StoreError::Serde {
    entity_type: T::entity_type(),
    source,
  })?;

  conn.execute(
    "INSERT OR REPLACE INTO entities (entity_type, entity_key, owner_key, data, updated_at, sync_state, cached_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
    params![
      T::entity_type(),
      entity.cache_key(),
      entity.owner_key(),
      data,
      sortable_timestamp(entity.updated_at()),
      state.as_str(),
    ],
  )?;
  Ok(())
}

fn read_owned<T: Cacheable>(
  conn: &Connection,
  owner: Option<&str>,
  state: Option<RecordState>,
) -> StoreResult<Vec<T>> {
  let mut stmt = conn.prepare(
    "SELECT data FROM entities
     WHERE entity_type = ?1 AND (?2 IS NULL OR owner_key = ?2) AND (?3 IS NULL OR sync_state = ?3)
     ORDER BY updated_at DESC, entity_key",
  )?;

  let rows = stmt
    .query_map(
      params![T::entity_type(), owner, state.map(|s| s.as_str())],
      |row| row.get::<_, String>(0),
    )?
    .collect::<Result<Vec<_>, _>>()?;

  rows.iter().map(|data| decode(data)).collect()
}

fn read_state(conn: &Connection, entity_type: &str, key: &str) -> StoreResult<RecordState> {
  let state: Option<String> = conn
    .query_row(
      "SELECT sync_state FROM entities WHERE entity_type = ?1 AND entity_key = ?2",
      params![entity_type, key],
      |row| row.get(0),
    )
    .optional()?;
  Ok(state.map_or(RecordState::Synced, |s| RecordState::parse(&s)))
}

fn delete_messages_of(conn: &Connection, conversation_id: &str) -> StoreResult<usize> {
  let removed = conn.execute(
    "DELETE FROM entities WHERE entity_type = 'message' AND owner_key = ?1",
    params![conversation_id],
  )?;
  Ok(removed)
}

fn detach_conversations(conn: &Connection, project_id: &str) -> StoreResult<()> {
  let conversations: Vec<Conversation> = read_owned(conn, Some(project_id), None)?;
  for mut conversation in conversations {
    let state = read_state(conn, Conversation::entity_type(), &conversation.id)?;
    conversation.project_id = None;
    write_entity(conn, &conversation, state)?;
  }
  Ok(())
}

/// Recompute a conversation's message count and last-message timestamp from
/// the cached messages. Returns `None` when the conversation is not cached.
fn refresh_conversation_stats(
  conn: &Connection,
  conversation_id: &str,
  floor: StatsFloor,
) -> StoreResult<Option<Conversation>> {
  let Some(data) = conn
    .query_row(
      "SELECT data FROM entities WHERE entity_type = 'conversation' AND entity_key = ?1",
      params![conversation_id],
      |row| row.get::<_, String>(0),
    )
    .optional()?
  else {
    return Ok(None);
  };
  let mut conversation: Conversation = decode(&data)?;
  let state = read_state(conn, Conversation::entity_type(), conversation_id)?;

  let messages: Vec<Message> = read_owned(conn, Some(conversation_id), None)?;
  let cached_count = messages.len() as u32;
  let cached_last = messages.iter().map(|m| m.created_at).max();

  match floor {
    StatsFloor::Exact => {
      conversation.message_count = cached_count;
      conversation.last_message_at = cached_last;
    }
    StatsFloor::Keep | StatsFloor::Bump => {
      let minimum = if floor == StatsFloor::Bump {
        conversation.message_count + 1
      } else {
        conversation.message_count
      };
      conversation.message_count = cached_count.max(minimum);
      conversation.last_message_at = conversation.last_message_at.max(cached_last);
    }
  }
  if let Some(last) = conversation.last_message_at {
    conversation.updated_at = conversation.updated_at.max(last);
  }

  write_entity(conn, &conversation, state)?;
  Ok(Some(conversation))
}

/// Derived stats never fall below what the cached messages show.
fn refresh_owner_stats<T: Cacheable>(conn: &Connection, entities: &[T]) -> StoreResult<()> {
  match T::family() {
    EntityFamily::Message => {
      for conversation_id in distinct_owners(entities) {
        refresh_conversation_stats(conn, &conversation_id, StatsFloor::Keep)?;
      }
    }
    EntityFamily::Conversation => {
      for conversation in entities {
        refresh_conversation_stats(conn, conversation.cache_key(), StatsFloor::Keep)?;
      }
    }
    EntityFamily::Project => {}
  }
  Ok(())
}

fn distinct_owners<T: Cacheable>(entities: &[T]) -> Vec<String> {
  let mut owners: Vec<String> = entities
    .iter()
    .filter_map(|e| e.owner_key().map(String::from))
    .collect();
  owners.sort();
  owners.dedup();
  owners
}

fn decode<T: Cacheable>(data: &str) -> StoreResult<T> {
  serde_json::from_str(data).map_err(|source| StoreError::Serde {
    entity_type: T::entity_type(),
    source,
  })
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> DateTime<Utc> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{
    MessageStatus, NewConversation, NewMessage, NewProject, Project, Role,
  };
  use chrono::Duration;

  fn conversation(id: &str, project: Option<&str>, minutes_ago: i64) -> Conversation {
    let at = Utc::now() - Duration::minutes(minutes_ago);
    let mut c = Conversation::local(
      &NewConversation {
        id: Some(id.to_string()),
        title: format!("Conversation {}", id),
        project_id: project.map(String::from),
      },
      at,
    );
    c.updated_at = at;
    c
  }

  fn message(id: &str, conversation_id: &str) -> Message {
    let mut new = NewMessage::new(conversation_id, Role::User, format!("body {}", id));
    new.id = Some(id.to_string());
    Message::local(&new, Utc::now())
  }

  #[test]
  fn test_upsert_is_idempotent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let c = conversation("c1", None, 0);

    storage.upsert(&c, RecordState::Synced).unwrap();
    storage.upsert(&c, RecordState::Synced).unwrap();

    let all: Vec<Conversation> = storage.list_by_owner(None).unwrap();
    assert_eq!(all, vec![c]);
  }

  #[test]
  fn test_list_by_owner_orders_newest_first() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert_many(
        &[
          conversation("old", Some("p1"), 30),
          conversation("new", Some("p1"), 1),
          conversation("other", Some("p2"), 0),
        ],
        RecordState::Synced,
      )
      .unwrap();

    let listed: Vec<Conversation> = storage.list_by_owner(Some("p1")).unwrap();
    let ids: Vec<&str> = listed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "old"]);

    let everything: Vec<Conversation> = storage.list_by_owner(None).unwrap();
    assert_eq!(everything.len(), 3);
  }

  #[test]
  fn test_delete_conversation_cascades_messages() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert(&conversation("c1", None, 0), RecordState::Synced)
      .unwrap();
    storage
      .upsert(&conversation("c2", None, 0), RecordState::Synced)
      .unwrap();
    storage
      .append_message(&message("m1", "c1"), RecordState::Synced)
      .unwrap();
    storage
      .append_message(&message("m2", "c1"), RecordState::Pending)
      .unwrap();
    storage
      .append_message(&message("m3", "c2"), RecordState::Synced)
      .unwrap();

    let removed = storage.delete::<Conversation>("c1").unwrap();
    assert_eq!(removed, 3);

    let left: Vec<Message> = storage.list_by_owner(Some("c1")).unwrap();
    assert!(left.is_empty());
    let other: Vec<Message> = storage.list_by_owner(Some("c2")).unwrap();
    assert_eq!(other.len(), 1);
  }

  #[test]
  fn test_append_message_updates_conversation_stats() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert(&conversation("c1", None, 10), RecordState::Synced)
      .unwrap();

    let m1 = message("m1", "c1");
    let updated = storage.append_message(&m1, RecordState::Synced).unwrap();
    assert_eq!(updated.message_count, 1);
    assert_eq!(updated.last_message_at, Some(m1.created_at));
    assert!(updated.updated_at >= m1.created_at);

    // Re-appending the same message does not double count
    let again = storage.append_message(&m1, RecordState::Synced).unwrap();
    assert_eq!(again.message_count, 1);

    let cached = storage.get::<Conversation>("c1").unwrap().unwrap();
    assert_eq!(cached.entity.message_count, 1);
  }

  #[test]
  fn test_conversation_upsert_keeps_cached_message_stats() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert(&conversation("c1", None, 10), RecordState::Synced)
      .unwrap();
    storage
      .append_message(&message("m1", "c1"), RecordState::Synced)
      .unwrap();

    // A renamed copy from the remote that does not carry the count
    let mut renamed = conversation("c1", None, 0);
    renamed.title = "Renamed".to_string();
    storage.upsert(&renamed, RecordState::Synced).unwrap();

    let cached = storage.get::<Conversation>("c1").unwrap().unwrap().entity;
    assert_eq!(cached.title, "Renamed");
    assert_eq!(cached.message_count, 1);
    assert!(cached.last_message_at.is_some());
  }

  #[test]
  fn test_append_message_requires_conversation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let err = storage
      .append_message(&message("m1", "missing"), RecordState::Pending)
      .unwrap_err();
    assert!(matches!(err, StoreError::MissingParent { .. }));

    let none: Vec<Message> = storage.list_by_owner(Some("missing")).unwrap();
    assert!(none.is_empty());
  }

  #[test]
  fn test_replace_owned_drops_unlisted_records() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert(&conversation("c1", None, 0), RecordState::Synced)
      .unwrap();
    storage
      .append_message(&message("remote", "c1"), RecordState::Synced)
      .unwrap();
    storage
      .append_message(&message("local-only", "c1"), RecordState::Pending)
      .unwrap();

    let replacement = vec![message("remote", "c1"), message("newer", "c1")];
    storage.replace_owned(Some("c1"), &replacement).unwrap();

    let mut ids: Vec<String> = storage
      .list_by_owner::<Message>(Some("c1"))
      .unwrap()
      .into_iter()
      .map(|m| m.id)
      .collect();
    ids.sort();
    assert_eq!(ids, vec!["newer", "remote"]);
    assert!(storage.list_pending::<Message>(Some("c1")).unwrap().is_empty());

    let c1 = storage.get::<Conversation>("c1").unwrap().unwrap().entity;
    assert_eq!(c1.message_count, 2);
  }

  #[test]
  fn test_replace_conversations_cascades_removed_ones() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert(&conversation("keep", None, 0), RecordState::Synced)
      .unwrap();
    storage
      .upsert(&conversation("gone", None, 0), RecordState::Pending)
      .unwrap();
    storage
      .append_message(&message("m1", "gone"), RecordState::Pending)
      .unwrap();

    storage
      .replace_owned(None, &[conversation("keep", None, 0)])
      .unwrap();

    assert!(storage.get::<Conversation>("gone").unwrap().is_none());
    assert!(storage.get::<Message>("m1").unwrap().is_none());
  }

  #[test]
  fn test_pending_state_round_trips() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert(&conversation("c1", None, 0), RecordState::Pending)
      .unwrap();
    storage
      .upsert(&conversation("c2", None, 0), RecordState::Synced)
      .unwrap();

    let pending: Vec<Conversation> = storage.list_pending(None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "c1");
    assert_eq!(
      storage.get::<Conversation>("c1").unwrap().unwrap().state,
      RecordState::Pending
    );
  }

  #[test]
  fn test_fetched_rows_leave_pending_edits_alone() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let mut edited = conversation("c1", None, 0);
    edited.title = "Edited offline".to_string();
    storage.upsert(&edited, RecordState::Pending).unwrap();

    let mut fetched_c1 = conversation("c1", None, 10);
    fetched_c1.title = "Server title".to_string();
    let fetched_c2 = conversation("c2", None, 5);

    let kept = storage
      .upsert_fetched(&[fetched_c1, fetched_c2])
      .unwrap();
    assert_eq!(kept, 1);

    let c1 = storage.get::<Conversation>("c1").unwrap().unwrap();
    assert_eq!(c1.entity.title, "Edited offline");
    assert_eq!(c1.state, RecordState::Pending);
    let c2 = storage.get::<Conversation>("c2").unwrap().unwrap();
    assert_eq!(c2.state, RecordState::Synced);
  }

  #[test]
  fn test_conversation_counts_and_project_delete() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let project = Project::local(
      &NewProject {
        id: Some("p1".to_string()),
        ..NewProject::new("Launch")
      },
      Utc::now(),
    );
    storage.upsert(&project, RecordState::Synced).unwrap();
    storage
      .upsert_many(
        &[
          conversation("a", Some("p1"), 0),
          conversation("b", Some("p1"), 0),
          conversation("c", Some("p2"), 0),
          conversation("d", None, 0),
        ],
        RecordState::Synced,
      )
      .unwrap();

    let counts = storage.conversation_counts().unwrap();
    assert_eq!(counts.get("p1"), Some(&2));
    assert_eq!(counts.get("p2"), Some(&1));

    storage.delete::<Project>("p1").unwrap();
    let counts = storage.conversation_counts().unwrap();
    assert_eq!(counts.get("p1"), None);
    let a = storage.get::<Conversation>("a").unwrap().unwrap().entity;
    assert_eq!(a.project_id, None);
  }

  #[test]
  fn test_settings_and_tombstones() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.get_setting("theme").unwrap(), None);

    storage
      .set_setting("theme", &serde_json::json!({"mode": "dark"}))
      .unwrap();
    storage.set_setting("theme", &serde_json::json!("light")).unwrap();
    assert_eq!(
      storage.get_setting("theme").unwrap(),
      Some(serde_json::json!("light"))
    );

    storage
      .add_tombstone(EntityFamily::Conversation, "c1", Some("p1"))
      .unwrap();
    storage
      .add_tombstone(EntityFamily::Conversation, "c2", None)
      .unwrap();
    assert_eq!(
      storage
        .tombstones(EntityFamily::Conversation, Some("p1"))
        .unwrap()
        .len(),
      1
    );
    assert_eq!(
      storage
        .tombstones(EntityFamily::Conversation, None)
        .unwrap()
        .len(),
      2
    );
    storage
      .clear_tombstone(EntityFamily::Conversation, "c1")
      .unwrap();
    assert_eq!(
      storage
        .tombstones(EntityFamily::Conversation, None)
        .unwrap()
        .len(),
      1
    );
  }

  #[test]
  fn test_on_disk_cache_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage
        .upsert(&conversation("c1", None, 0), RecordState::Pending)
        .unwrap();
    }

    let reopened = SqliteStorage::open_at(&path).unwrap();
    let cached = reopened.get::<Conversation>("c1").unwrap().unwrap();
    assert_eq!(cached.state, RecordState::Pending);
    assert_eq!(cached.entity.title, "Conversation c1");
  }

  #[test]
  fn test_message_delete_recomputes_stats() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .upsert(&conversation("c1", None, 0), RecordState::Synced)
      .unwrap();
    let mut m = message("m1", "c1");
    m.status = MessageStatus::Complete;
    storage.append_message(&m, RecordState::Synced).unwrap();

    storage.delete::<Message>("m1").unwrap();
    let c1 = storage.get::<Conversation>("c1").unwrap().unwrap().entity;
    assert_eq!(c1.message_count, 0);
  }
}
