//! Synchronization coordinator.
//!
//! Composes the local cache, the remote client, the staleness guard and the
//! sync mode latch:
//!
//! 1. Reads try the remote while the family prefers it, write the returned
//!    records through to the cache, and fall back to the cache when the remote
//!    is unreachable. Message reads keep probing while degraded. Records still
//!    pending locally win over the remote copy until a resync reconciles them.
//! 2. Writes go remote-first and mirror the canonical record locally. Once a
//!    family is degraded, writes go local-only without probing and the record
//!    is marked pending.
//! 3. Deletes always cascade locally; a delete the remote never saw is kept
//!    as a tombstone.
//! 4. A forced resync replays pending work (when enabled), then overwrites the
//!    local record set with the remote one.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::guard::{QueryKey, StalenessGuard};
use super::latch::{SyncMode, SyncModeLatch};
use crate::cache::{CacheStorage, Cacheable, Listing, RecordState};
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::types::{
  Conversation, ConversationPatch, EntityFamily, Message, MessagePatch, NewConversation,
  NewMessage, NewProject, Project, ProjectPatch, Role,
};

/// Coordinator behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
  /// Push pending records and tombstones to the remote before a forced resync
  /// overwrites the cache. When off, the remote simply wins.
  pub replay_pending: bool,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      replay_pending: true,
    }
  }
}

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
  /// The result was committed and is the latest for its query
  Current(Listing<T>),
  /// A newer read for the same query was issued meanwhile; nothing was committed
  Superseded,
}

impl<T> Fetched<T> {
  pub fn current(self) -> Option<Listing<T>> {
    match self {
      Self::Current(listing) => Some(listing),
      Self::Superseded => None,
    }
  }

  pub fn is_superseded(&self) -> bool {
    matches!(self, Self::Superseded)
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
    match self {
      Self::Current(listing) => Fetched::Current(listing.map(f)),
      Self::Superseded => Fetched::Superseded,
    }
  }
}

pub struct SyncCoordinator<S: CacheStorage> {
  storage: Arc<S>,
  remote: Arc<dyn RemoteStore>,
  latch: Arc<SyncModeLatch>,
  guard: Arc<StalenessGuard>,
  options: SyncOptions,
}

impl<S: CacheStorage> SyncCoordinator<S> {
  pub fn new(storage: S, remote: Arc<dyn RemoteStore>) -> Self {
    Self {
      storage: Arc::new(storage),
      remote,
      latch: Arc::new(SyncModeLatch::new()),
      guard: Arc::new(StalenessGuard::new()),
      options: SyncOptions::default(),
    }
  }

  pub fn with_options(mut self, options: SyncOptions) -> Self {
    self.options = options;
    self
  }

  pub fn sync_mode(&self, family: EntityFamily) -> SyncMode {
    self.latch.mode(family)
  }

  // ==========================================================================
  // Policy engine
  // ==========================================================================

  /// Read the records of one type for one owner.
  ///
  /// `probe` lets the read try the remote even while the family is degraded;
  /// a success then restores the latch.
  async fn read_owned<T, F, Fut>(
    &self,
    owner: Option<&str>,
    probe: bool,
    fetch: F,
  ) -> SyncResult<Fetched<Vec<T>>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<Vec<T>>>,
  {
    let family = T::family();
    let key = QueryKey::new(family, owner);
    let token = self.guard.begin_fetch(&key);
    let degraded = self.latch.is_degraded(family);

    if degraded && !probe {
      let cached = self.storage.list_by_owner::<T>(owner)?;
      if !self.guard.is_current(&key, token) {
        return Ok(Fetched::Superseded);
      }
      return Ok(Fetched::Current(Listing::from_cache(cached)));
    }

    match fetch().await {
      Ok(records) => {
        if !self.guard.is_current(&key, token) {
          debug!(family = %family, owner = owner.unwrap_or("*"), "discarding superseded fetch");
          return Ok(Fetched::Superseded);
        }
        let kept = self.storage.upsert_fetched(&records)?;
        let pending = self.storage.list_pending::<T>(owner)?;
        if !pending.is_empty() {
          debug!(family = %family, kept, pending = pending.len(), "keeping unsynced local records");
        }
        if degraded {
          self.latch.restore(family);
        }
        Ok(Fetched::Current(Listing::from_remote(overlay_pending(
          records, pending,
        ))))
      }
      Err(RemoteError::Unreachable(reason)) => {
        self.latch.degrade(family, &reason);
        let cached = self.storage.list_by_owner::<T>(owner)?;
        if !self.guard.is_current(&key, token) {
          return Ok(Fetched::Superseded);
        }
        debug!(family = %family, owner = owner.unwrap_or("*"), count = cached.len(), "serving cached records");
        Ok(Fetched::Current(Listing::offline(cached)))
      }
      Err(rejected) => Err(rejected.into()),
    }
  }

  /// Run a remote write unless the family is degraded.
  ///
  /// `Ok(None)` means the caller must write locally only: either the family
  /// was already degraded or the remote just proved unreachable. The error
  /// side only ever carries a rejection.
  async fn remote_first<T, F, Fut>(&self, family: EntityFamily, call: F) -> Result<Option<T>, RemoteError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    if self.latch.is_degraded(family) {
      debug!(family = %family, "family degraded, writing locally only");
      return Ok(None);
    }

    match call().await {
      Ok(record) => Ok(Some(record)),
      Err(RemoteError::Unreachable(reason)) => {
        self.latch.degrade(family, &reason);
        Ok(None)
      }
      Err(rejected) => Err(rejected),
    }
  }

  /// Create a record remote-first, falling back to a pending local record.
  async fn create_record<T, F, Fut>(&self, local: impl FnOnce() -> T, push: F) -> SyncResult<T>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    match self.remote_first(T::family(), push).await? {
      Some(confirmed) => {
        self.storage.upsert(&confirmed, RecordState::Synced)?;
        Ok(confirmed)
      }
      None => {
        let record = local();
        self.storage.upsert(&record, RecordState::Pending)?;
        debug!(entity_type = T::entity_type(), key = record.cache_key(), "created locally");
        Ok(record)
      }
    }
  }

  /// Mirror a revised record locally whatever the remote answered.
  async fn write_revision<T, F, Fut>(&self, revised: T, push: F) -> SyncResult<T>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    match self.remote_first(T::family(), push).await {
      Ok(Some(confirmed)) => {
        self.storage.upsert(&confirmed, RecordState::Synced)?;
        Ok(confirmed)
      }
      Ok(None) => {
        self.storage.upsert(&revised, RecordState::Pending)?;
        Ok(revised)
      }
      Err(rejected) => {
        self.storage.upsert(&revised, RecordState::Pending)?;
        Err(rejected.into())
      }
    }
  }

  /// Delete remotely if possible, then always cascade locally.
  async fn delete_record<T, F, Fut>(&self, key: &str, owner: Option<&str>, push: F) -> SyncResult<()>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<()>>,
  {
    let family = T::family();
    let outcome = self.remote_first(family, push).await;
    let removed = self.storage.delete::<T>(key)?;
    debug!(family = %family, key, removed, "deleted locally");

    match outcome {
      Ok(Some(())) => Ok(()),
      Ok(None) => {
        self.storage.add_tombstone(family, key, owner)?;
        Ok(())
      }
      // Already gone remotely
      Err(err) if err.is_not_found() => Ok(()),
      Err(err) => Err(err.into()),
    }
  }

  fn cached<T: Cacheable>(&self, key: &str) -> SyncResult<(T, RecordState)> {
    self
      .storage
      .get::<T>(key)?
      .map(|cached| (cached.entity, cached.state))
      .ok_or_else(|| SyncError::rejected(format!("unknown {} {}", T::entity_type(), key)))
  }

  // ==========================================================================
  // Conversations
  // ==========================================================================

  /// Conversations of one project, or every conversation when `project_id`
  /// is `None`. Newest update first.
  pub async fn list_conversations(
    &self,
    project_id: Option<&str>,
  ) -> SyncResult<Fetched<Vec<Conversation>>> {
    self
      .read_owned(project_id, false, || self.remote.list_conversations(project_id))
      .await
  }

  pub async fn create_conversation(
    &self,
    title: &str,
    project_id: Option<&str>,
  ) -> SyncResult<Conversation> {
    let new = NewConversation::new(title, project_id.map(String::from));
    if new.title.is_empty() {
      return Err(SyncError::rejected("conversation title must not be empty"));
    }

    self
      .create_record(
        || Conversation::local(&new, Utc::now()),
        || self.remote.create_conversation(&new),
      )
      .await
  }

  pub async fn rename_conversation(&self, id: &str, title: &str) -> SyncResult<Conversation> {
    let title = title.trim();
    if title.is_empty() {
      return Err(SyncError::rejected("conversation title must not be empty"));
    }
    let (mut revised, state) = self.cached::<Conversation>(id)?;
    let patch = ConversationPatch {
      title: Some(title.to_string()),
    };
    revised.apply(&patch, Utc::now());

    // A record the remote never confirmed is pushed whole
    if state == RecordState::Pending {
      let new = NewConversation::from(&revised);
      self
        .write_revision(revised, || self.remote.create_conversation(&new))
        .await
    } else {
      self
        .write_revision(revised, || self.remote.update_conversation(id, &patch))
        .await
    }
  }

  /// Delete a conversation and all of its messages.
  pub async fn delete_conversation(&self, id: &str) -> SyncResult<()> {
    let owner = self
      .storage
      .get::<Conversation>(id)?
      .and_then(|cached| cached.entity.project_id);

    self
      .delete_record::<Conversation, _, _>(id, owner.as_deref(), || {
        self.remote.delete_conversation(id)
      })
      .await
  }

  // ==========================================================================
  // Messages
  // ==========================================================================

  /// Messages of a conversation in chat order (oldest first).
  pub async fn list_messages(&self, conversation_id: &str) -> SyncResult<Fetched<Vec<Message>>> {
    let fetched = self
      .read_owned(Some(conversation_id), true, || {
        self.remote.list_messages(conversation_id)
      })
      .await?;

    Ok(fetched.map(|mut messages| {
      sort_chronologically(&mut messages);
      messages
    }))
  }

  /// Append a message, bumping the conversation's count and last-message time.
  pub async fn append_message(
    &self,
    conversation_id: &str,
    role: Role,
    content: &str,
  ) -> SyncResult<Message> {
    let new = NewMessage::new(conversation_id, role, content);

    match self
      .remote_first(EntityFamily::Message, || self.remote.create_message(&new))
      .await?
    {
      Some(confirmed) => {
        self.storage.append_message(&confirmed, RecordState::Synced)?;
        Ok(confirmed)
      }
      None => {
        let message = Message::local(&new, Utc::now());
        self.storage.append_message(&message, RecordState::Pending)?;
        debug!(conversation_id, message_id = %message.id, "appended message locally");
        Ok(message)
      }
    }
  }

  pub async fn update_message(&self, id: &str, patch: MessagePatch) -> SyncResult<Message> {
    let (mut revised, state) = self.cached::<Message>(id)?;
    revised.check_patch(&patch).map_err(SyncError::rejected)?;
    revised.apply(&patch, Utc::now());

    if state == RecordState::Pending {
      let new = NewMessage::from(&revised);
      self
        .write_revision(revised, || self.remote.create_message(&new))
        .await
    } else {
      self
        .write_revision(revised, || self.remote.update_message(id, &patch))
        .await
    }
  }

  /// Replace a message's content in the cache only, keeping its sync state.
  /// Used while a response streams in.
  pub(crate) fn apply_streamed_content(&self, id: &str, content: &str) -> SyncResult<Message> {
    let (mut message, state) = self.cached::<Message>(id)?;
    let patch = MessagePatch {
      content: Some(content.to_string()),
      ..MessagePatch::default()
    };
    message.check_patch(&patch).map_err(SyncError::rejected)?;
    message.apply(&patch, Utc::now());
    self.storage.upsert(&message, state)?;
    Ok(message)
  }

  pub(crate) fn cached_message(&self, id: &str) -> SyncResult<Message> {
    self.cached::<Message>(id).map(|(message, _)| message)
  }

  // ==========================================================================
  // Projects
  // ==========================================================================

  /// Projects with conversation counts taken from the local cache.
  pub async fn list_projects(&self) -> SyncResult<Fetched<Vec<Project>>> {
    let fetched = self
      .read_owned(None, false, || self.remote.list_projects())
      .await?;

    let counts = self.storage.conversation_counts()?;
    Ok(fetched.map(|mut projects| {
      for project in &mut projects {
        project.conversation_count = counts.get(&project.id).copied().unwrap_or(0);
      }
      projects
    }))
  }

  pub async fn create_project(&self, mut new: NewProject) -> SyncResult<Project> {
    new.name = new.name.trim().to_string();
    if new.name.is_empty() {
      return Err(SyncError::rejected("project name must not be empty"));
    }

    let project = self
      .create_record(
        || Project::local(&new, Utc::now()),
        || self.remote.create_project(&new),
      )
      .await?;
    self.with_count(project)
  }

  pub async fn update_project(&self, id: &str, mut patch: ProjectPatch) -> SyncResult<Project> {
    if let Some(name) = patch.name.take() {
      let name = name.trim().to_string();
      if name.is_empty() {
        return Err(SyncError::rejected("project name must not be empty"));
      }
      patch.name = Some(name);
    }
    let (mut revised, state) = self.cached::<Project>(id)?;
    revised.apply(&patch, Utc::now());

    let project = if state == RecordState::Pending {
      let new = NewProject::from(&revised);
      self
        .write_revision(revised, || self.remote.create_project(&new))
        .await?
    } else {
      self
        .write_revision(revised, || self.remote.update_project(id, &patch))
        .await?
    };
    self.with_count(project)
  }

  /// Delete a project. Its conversations survive, detached from it.
  pub async fn delete_project(&self, id: &str) -> SyncResult<()> {
    self
      .delete_record::<Project, _, _>(id, None, || self.remote.delete_project(id))
      .await
  }

  fn with_count(&self, mut project: Project) -> SyncResult<Project> {
    let counts = self.storage.conversation_counts()?;
    project.conversation_count = counts.get(&project.id).copied().unwrap_or(0);
    Ok(project)
  }

  // ==========================================================================
  // Settings (local only)
  // ==========================================================================

  pub fn get_setting(&self, key: &str) -> SyncResult<Option<serde_json::Value>> {
    Ok(self.storage.get_setting(key)?)
  }

  pub fn set_setting(&self, key: &str, value: &serde_json::Value) -> SyncResult<()> {
    if key.trim().is_empty() {
      return Err(SyncError::rejected("setting key must not be empty"));
    }
    Ok(self.storage.set_setting(key, value)?)
  }

  // ==========================================================================
  // Forced resync
  // ==========================================================================

  /// Reach the remote again and overwrite the cached record set for `owner`.
  ///
  /// This is the only operation that surfaces `Unreachable`: the latch stays
  /// (or goes back to) degraded and the cache is left as it was.
  pub async fn force_resync(&self, family: EntityFamily, owner: Option<&str>) -> SyncResult<()> {
    info!(family = %family, owner = owner.unwrap_or("*"), "forcing resync");

    match (family, owner) {
      (EntityFamily::Message, None) => Err(SyncError::rejected(
        "message resync requires a conversation id",
      )),
      (EntityFamily::Conversation | EntityFamily::Message, Some(conversation_id)) => {
        self.resync_messages(conversation_id).await
      }
      (EntityFamily::Conversation, None) => self.resync_conversations(None).await,
      (EntityFamily::Project, None) => self.resync_projects().await,
      (EntityFamily::Project, Some(project_id)) => {
        self.resync_projects().await?;
        self.resync_conversations(Some(project_id)).await
      }
    }
  }

  async fn resync_messages(&self, conversation_id: &str) -> SyncResult<()> {
    let families = [EntityFamily::Conversation, EntityFamily::Message];

    if self.options.replay_pending {
      // Both latches are restored below
      self.replay_conversations(None).await?;

      let mut pending = self.storage.list_pending::<Message>(Some(conversation_id))?;
      sort_chronologically(&mut pending);
      for message in &pending {
        let new = NewMessage::from(message);
        self
          .replay(message, || self.remote.create_message(&new))
          .await?;
      }
    }

    let key = QueryKey::new(EntityFamily::Message, Some(conversation_id));
    let token = self.guard.begin_fetch(&key);
    let messages = self
      .remote
      .list_messages(conversation_id)
      .await
      .map_err(|err| self.resync_failure(&families, err))?;

    if self.guard.is_current(&key, token) {
      self.storage.replace_owned(Some(conversation_id), &messages)?;
    } else {
      debug!(conversation_id, "resync result superseded by a newer read");
    }
    for family in families {
      self.latch.restore(family);
    }
    info!(conversation_id, count = messages.len(), "messages resynced");
    Ok(())
  }

  async fn resync_conversations(&self, project_id: Option<&str>) -> SyncResult<()> {
    if self.options.replay_pending {
      self.replay_conversations(None).await?;
    } else {
      self.discard_tombstones(EntityFamily::Conversation, project_id)?;
    }

    let key = QueryKey::new(EntityFamily::Conversation, project_id);
    let token = self.guard.begin_fetch(&key);
    let conversations = self
      .remote
      .list_conversations(project_id)
      .await
      .map_err(|err| self.resync_failure(&[EntityFamily::Conversation], err))?;

    if self.guard.is_current(&key, token) {
      self.storage.replace_owned(project_id, &conversations)?;
    } else {
      debug!(project_id, "resync result superseded by a newer read");
    }
    self.latch.restore(EntityFamily::Conversation);
    info!(project_id, count = conversations.len(), "conversations resynced");
    Ok(())
  }

  async fn resync_projects(&self) -> SyncResult<()> {
    if self.options.replay_pending {
      self.replay_tombstones(EntityFamily::Project, None).await?;
      for project in self.storage.list_pending::<Project>(None)? {
        let new = NewProject::from(&project);
        self
          .replay(&project, || self.remote.create_project(&new))
          .await?;
      }
    } else {
      self.discard_tombstones(EntityFamily::Project, None)?;
    }

    let key = QueryKey::new(EntityFamily::Project, None);
    let token = self.guard.begin_fetch(&key);
    let projects = self
      .remote
      .list_projects()
      .await
      .map_err(|err| self.resync_failure(&[EntityFamily::Project], err))?;

    if self.guard.is_current(&key, token) {
      self.storage.replace_owned(None, &projects)?;
    } else {
      debug!("project resync result superseded by a newer read");
    }
    self.latch.restore(EntityFamily::Project);
    info!(count = projects.len(), "projects resynced");
    Ok(())
  }

  /// Push every conversation tombstone and pending conversation of `project_id`
  /// (all of them when `None`).
  async fn replay_conversations(&self, project_id: Option<&str>) -> SyncResult<()> {
    self
      .replay_tombstones(EntityFamily::Conversation, project_id)
      .await?;
    for conversation in self.storage.list_pending::<Conversation>(project_id)? {
      let new = NewConversation::from(&conversation);
      self
        .replay(&conversation, || self.remote.create_conversation(&new))
        .await?;
    }
    Ok(())
  }

  /// Push one pending record. Unreachable aborts the resync; a rejection
  /// clears the pending mark and leaves the record to the overwrite.
  async fn replay<T, F, Fut>(&self, record: &T, push: F) -> SyncResult<()>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    match push().await {
      Ok(confirmed) => {
        self.storage.upsert(&confirmed, RecordState::Synced)?;
        debug!(entity_type = T::entity_type(), key = record.cache_key(), "replayed pending record");
        Ok(())
      }
      Err(RemoteError::Unreachable(reason)) => {
        self.latch.degrade(T::family(), &reason);
        Err(SyncError::Unreachable(reason))
      }
      Err(RemoteError::Rejected { status, message }) => {
        warn!(
          entity_type = T::entity_type(),
          key = record.cache_key(),
          status,
          message = %message,
          "remote refused pending record, discarding it"
        );
        // No longer pending, so the next overwrite or read replaces it
        self.storage.upsert(record, RecordState::Synced)?;
        Ok(())
      }
    }
  }

  async fn replay_tombstones(&self, family: EntityFamily, owner: Option<&str>) -> SyncResult<()> {
    for tombstone in self.storage.tombstones(family, owner)? {
      let key = tombstone.entity_key.as_str();
      let outcome = match family {
        EntityFamily::Conversation => self.remote.delete_conversation(key).await,
        EntityFamily::Project => self.remote.delete_project(key).await,
        EntityFamily::Message => Ok(()),
      };

      match outcome {
        Ok(()) => debug!(family = %family, key, "replayed delete"),
        Err(RemoteError::Unreachable(reason)) => {
          self.latch.degrade(family, &reason);
          return Err(SyncError::Unreachable(reason));
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => warn!(family = %family, key, error = %err, "remote refused pending delete, dropping it"),
      }
      self.storage.clear_tombstone(family, key)?;
    }
    Ok(())
  }

  fn discard_tombstones(&self, family: EntityFamily, owner: Option<&str>) -> SyncResult<()> {
    for tombstone in self.storage.tombstones(family, owner)? {
      self.storage.clear_tombstone(family, &tombstone.entity_key)?;
    }
    Ok(())
  }

  fn resync_failure(&self, families: &[EntityFamily], err: RemoteError) -> SyncError {
    if let RemoteError::Unreachable(reason) = &err {
      for family in families {
        self.latch.degrade(*family, reason);
      }
    }
    err.into()
  }
}

impl<S: CacheStorage> Clone for SyncCoordinator<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      remote: Arc::clone(&self.remote),
      latch: Arc::clone(&self.latch),
      guard: Arc::clone(&self.guard),
      options: self.options,
    }
  }
}

/// Substitute locally pending records for their remote copies and keep the
/// ones the remote has not seen yet.
fn overlay_pending<T: Cacheable>(mut records: Vec<T>, pending: Vec<T>) -> Vec<T> {
  if pending.is_empty() {
    return records;
  }
  for local in pending {
    match records
      .iter_mut()
      .find(|r| r.cache_key() == local.cache_key())
    {
      Some(slot) => *slot = local,
      None => records.push(local),
    }
  }
  records.sort_by(|a, b| b.updated_at().cmp(&a.updated_at()));
  records
}

fn sort_chronologically(messages: &mut [Message]) {
  messages.sort_by(|a, b| {
    a.created_at
      .cmp(&b.created_at)
      .then_with(|| a.id.cmp(&b.id))
  });
}
