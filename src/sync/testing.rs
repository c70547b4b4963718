//! Scripted in-memory remote store for coordinator tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::types::{
  Conversation, ConversationPatch, Message, MessagePatch, NewConversation, NewMessage, NewProject,
  Project, ProjectPatch,
};

#[derive(Default)]
struct Tables {
  conversations: Vec<Conversation>,
  messages: Vec<Message>,
  projects: Vec<Project>,
  next_id: u64,
  reject_next: Option<RemoteError>,
  holds: VecDeque<Hold>,
}

impl Tables {
  fn server_id(&mut self, requested: Option<&String>) -> String {
    match requested {
      Some(id) => id.clone(),
      None => {
        self.next_id += 1;
        format!("srv-{}", self.next_id)
      }
    }
  }
}

/// A call parked inside the fake until released.
#[derive(Clone, Default)]
pub(crate) struct Hold {
  entered: Arc<Notify>,
  release: Arc<Notify>,
}

impl Hold {
  /// Wait until the held call has taken its snapshot and parked.
  pub async fn entered(&self) {
    self.entered.notified().await;
  }

  pub fn release(&self) {
    self.release.notify_one();
  }
}

/// Remote store that can be taken down, told to reject, or held mid-call.
pub(crate) struct FakeRemote {
  tables: Mutex<Tables>,
  reachable: AtomicBool,
  calls: AtomicUsize,
}

impl Default for FakeRemote {
  fn default() -> Self {
    Self {
      tables: Mutex::new(Tables::default()),
      reachable: AtomicBool::new(true),
      calls: AtomicUsize::new(0),
    }
  }
}

impl FakeRemote {
  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn reject_next(&self, status: u16, message: &str) {
    self.tables.lock().unwrap().reject_next = Some(RemoteError::Rejected {
      status,
      message: message.to_string(),
    });
  }

  /// Park the next call until the returned hold is released. Reads
  /// snapshot their rows before parking.
  pub fn hold_next(&self) -> Hold {
    let hold = Hold::default();
    self.tables.lock().unwrap().holds.push_back(hold.clone());
    hold
  }

  /// Number of calls that reached the fake, including failed ones.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn seed_message(&self, message: Message) {
    self.tables.lock().unwrap().messages.push(message);
  }

  pub fn edit_message(&self, id: &str, content: &str) {
    let mut tables = self.tables.lock().unwrap();
    if let Some(message) = tables.messages.iter_mut().find(|m| m.id == id) {
      message.content = content.to_string();
      message.updated_at = Utc::now();
    }
  }

  pub fn conversations(&self) -> Vec<Conversation> {
    self.tables.lock().unwrap().conversations.clone()
  }

  pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
    let tables = self.tables.lock().unwrap();
    tables
      .messages
      .iter()
      .filter(|m| m.conversation_id == conversation_id)
      .cloned()
      .collect()
  }

  pub fn projects(&self) -> Vec<Project> {
    self.tables.lock().unwrap().projects.clone()
  }

  async fn gate(&self) -> RemoteResult<()> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let hold = self.tables.lock().unwrap().holds.pop_front();
    if let Some(hold) = hold {
      hold.entered.notify_one();
      hold.release.notified().await;
    }
    if !self.reachable.load(Ordering::SeqCst) {
      return Err(RemoteError::Unreachable("connection refused".to_string()));
    }
    match self.tables.lock().unwrap().reject_next.take() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn not_found(what: &str, id: &str) -> RemoteError {
    RemoteError::Rejected {
      status: 404,
      message: format!("{} {} not found", what, id),
    }
  }
}

#[async_trait]
impl RemoteStore for FakeRemote {
  async fn list_conversations(&self, project_id: Option<&str>) -> RemoteResult<Vec<Conversation>> {
    let mut rows: Vec<Conversation> = self
      .conversations()
      .into_iter()
      .filter(|c| project_id.is_none() || c.project_id.as_deref() == project_id)
      .collect();
    rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    self.gate().await?;
    Ok(rows)
  }

  async fn create_conversation(&self, new: &NewConversation) -> RemoteResult<Conversation> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    let id = tables.server_id(new.id.as_ref());
    let conversation = Conversation::local(
      &NewConversation {
        id: Some(id.clone()),
        ..new.clone()
      },
      Utc::now(),
    );
    tables.conversations.retain(|c| c.id != id);
    tables.conversations.push(conversation.clone());
    Ok(conversation)
  }

  async fn update_conversation(
    &self,
    id: &str,
    patch: &ConversationPatch,
  ) -> RemoteResult<Conversation> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    let conversation = tables
      .conversations
      .iter_mut()
      .find(|c| c.id == id)
      .ok_or_else(|| Self::not_found("conversation", id))?;
    conversation.apply(patch, Utc::now());
    Ok(conversation.clone())
  }

  async fn delete_conversation(&self, id: &str) -> RemoteResult<()> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    tables.conversations.retain(|c| c.id != id);
    tables.messages.retain(|m| m.conversation_id != id);
    Ok(())
  }

  async fn list_messages(&self, conversation_id: &str) -> RemoteResult<Vec<Message>> {
    let mut rows = self.messages(conversation_id);
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    self.gate().await?;
    Ok(rows)
  }

  async fn create_message(&self, new: &NewMessage) -> RemoteResult<Message> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    let id = tables.server_id(new.id.as_ref());
    let message = Message::local(
      &NewMessage {
        id: Some(id.clone()),
        ..new.clone()
      },
      Utc::now(),
    );
    tables.messages.retain(|m| m.id != id);
    tables.messages.push(message.clone());
    Ok(message)
  }

  async fn update_message(&self, id: &str, patch: &MessagePatch) -> RemoteResult<Message> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    let message = tables
      .messages
      .iter_mut()
      .find(|m| m.id == id)
      .ok_or_else(|| Self::not_found("message", id))?;
    message.apply(patch, Utc::now());
    Ok(message.clone())
  }

  async fn list_projects(&self) -> RemoteResult<Vec<Project>> {
    let rows = self.projects();
    self.gate().await?;
    Ok(rows)
  }

  async fn create_project(&self, new: &NewProject) -> RemoteResult<Project> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    let id = tables.server_id(new.id.as_ref());
    let project = Project::local(
      &NewProject {
        id: Some(id.clone()),
        ..new.clone()
      },
      Utc::now(),
    );
    tables.projects.retain(|p| p.id != id);
    tables.projects.push(project.clone());
    Ok(project)
  }

  async fn update_project(&self, id: &str, patch: &ProjectPatch) -> RemoteResult<Project> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    let project = tables
      .projects
      .iter_mut()
      .find(|p| p.id == id)
      .ok_or_else(|| Self::not_found("project", id))?;
    project.apply(patch, Utc::now());
    Ok(project.clone())
  }

  async fn delete_project(&self, id: &str) -> RemoteResult<()> {
    self.gate().await?;
    let mut tables = self.tables.lock().unwrap();
    tables.projects.retain(|p| p.id != id);
    for conversation in tables.conversations.iter_mut() {
      if conversation.project_id.as_deref() == Some(id) {
        conversation.project_id = None;
      }
    }
    Ok(())
  }
}
