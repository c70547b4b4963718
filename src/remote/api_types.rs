//! Serde types matching the backend's REST rows.
//!
//! These types are separate from domain types so the wire shape (user
//! scoping, nullable counters, insert/patch bodies) stays out of the rest of
//! the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
  Citation, Conversation, ConversationPatch, Department, Message, MessagePatch, MessageStatus,
  NewConversation, NewMessage, NewProject, Project, ProjectPatch, Role,
};

/// Error body returned by the backend on 4xx/5xx.
#[derive(Debug, Deserialize)]
pub struct ApiError {
  pub message: String,
  #[serde(default)]
  pub code: Option<String>,
  #[serde(default)]
  pub details: Option<String>,
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiConversation {
  pub id: String,
  #[serde(default)]
  pub project_id: Option<String>,
  #[serde(default)]
  pub title: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub message_count: Option<u32>,
  #[serde(default)]
  pub last_message_at: Option<DateTime<Utc>>,
}

impl From<ApiConversation> for Conversation {
  fn from(row: ApiConversation) -> Self {
    Self {
      id: row.id,
      project_id: row.project_id,
      title: row.title,
      created_at: row.created_at,
      updated_at: row.updated_at,
      message_count: row.message_count.unwrap_or(0),
      last_message_at: row.last_message_at,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ConversationInsert<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<&'a str>,
  pub user_id: &'a str,
  pub title: &'a str,
  pub project_id: Option<&'a str>,
}

impl<'a> ConversationInsert<'a> {
  pub fn new(user_id: &'a str, new: &'a NewConversation) -> Self {
    Self {
      id: new.id.as_deref(),
      user_id,
      title: new.title.trim(),
      project_id: new.project_id.as_deref(),
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ConversationUpdate<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<&'a str>,
  pub updated_at: DateTime<Utc>,
}

impl<'a> ConversationUpdate<'a> {
  pub fn new(patch: &'a ConversationPatch, now: DateTime<Utc>) -> Self {
    Self {
      title: patch.title.as_deref().map(str::trim),
      updated_at: now,
    }
  }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
  pub id: String,
  pub conversation_id: String,
  pub role: Role,
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub sources: Option<Vec<Citation>>,
  #[serde(default = "default_status")]
  pub status: MessageStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

fn default_status() -> MessageStatus {
  MessageStatus::Complete
}

impl From<ApiMessage> for Message {
  fn from(row: ApiMessage) -> Self {
    Self {
      id: row.id,
      conversation_id: row.conversation_id,
      role: row.role,
      content: row.content,
      sources: row.sources.unwrap_or_default(),
      status: row.status,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct MessageInsert<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<&'a str>,
  pub conversation_id: &'a str,
  pub role: Role,
  pub content: &'a str,
  pub sources: &'a [Citation],
  pub status: MessageStatus,
}

impl<'a> From<&'a NewMessage> for MessageInsert<'a> {
  fn from(new: &'a NewMessage) -> Self {
    Self {
      id: new.id.as_deref(),
      conversation_id: &new.conversation_id,
      role: new.role,
      content: &new.content,
      sources: &new.sources,
      status: new.status,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct MessageUpdate<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sources: Option<&'a [Citation]>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<MessageStatus>,
  pub updated_at: DateTime<Utc>,
}

impl<'a> MessageUpdate<'a> {
  pub fn new(patch: &'a MessagePatch, now: DateTime<Utc>) -> Self {
    Self {
      content: patch.content.as_deref(),
      sources: patch.sources.as_deref(),
      status: patch.status,
      updated_at: now,
    }
  }
}

// ============================================================================
// Projects
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiProject {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub department: Option<Department>,
  #[serde(default)]
  pub instructions: Option<String>,
  #[serde(default)]
  pub memory_context: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl From<ApiProject> for Project {
  fn from(row: ApiProject) -> Self {
    Self {
      id: row.id,
      name: row.name,
      description: row.description,
      department: row.department,
      instructions: row.instructions,
      memory_context: row.memory_context,
      created_at: row.created_at,
      updated_at: row.updated_at,
      // Derived locally at read time, never taken from the backend
      conversation_count: 0,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ProjectInsert<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<&'a str>,
  pub user_id: &'a str,
  pub name: &'a str,
  pub description: Option<&'a str>,
  pub department: Option<Department>,
  pub instructions: Option<&'a str>,
  pub memory_context: Option<&'a str>,
}

impl<'a> ProjectInsert<'a> {
  pub fn new(user_id: &'a str, new: &'a NewProject) -> Self {
    Self {
      id: new.id.as_deref(),
      user_id,
      name: new.name.trim(),
      description: trimmed(new.description.as_deref()),
      department: new.department,
      instructions: trimmed(new.instructions.as_deref()),
      memory_context: new.memory_context.as_deref(),
    }
  }
}

/// Patch body. `Some(None)` fields serialize as JSON null to clear a column.
#[derive(Debug, Serialize)]
pub struct ProjectUpdate<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<Option<&'a str>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub department: Option<Department>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub instructions: Option<Option<&'a str>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub memory_context: Option<Option<&'a str>>,
  pub updated_at: DateTime<Utc>,
}

impl<'a> ProjectUpdate<'a> {
  pub fn new(patch: &'a ProjectPatch, now: DateTime<Utc>) -> Self {
    Self {
      name: patch.name.as_deref().map(str::trim),
      description: patch.description.as_deref().map(|d| trimmed(Some(d))),
      department: patch.department,
      instructions: patch.instructions.as_deref().map(|i| trimmed(Some(i))),
      memory_context: patch.memory_context.as_deref().map(|m| trimmed(Some(m))),
      updated_at: now,
    }
  }
}

fn trimmed(s: Option<&str>) -> Option<&str> {
  s.map(str::trim).filter(|s| !s.is_empty())
}
