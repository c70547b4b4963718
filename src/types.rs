//! Domain records shared by the local cache, the remote client and the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three synchronized entity families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityFamily {
  Conversation,
  Message,
  Project,
}

impl EntityFamily {
  pub const ALL: [EntityFamily; 3] = [
    EntityFamily::Conversation,
    EntityFamily::Message,
    EntityFamily::Project,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Conversation => "conversation",
      Self::Message => "message",
      Self::Project => "project",
    }
  }

  pub(crate) fn index(&self) -> usize {
    match self {
      Self::Conversation => 0,
      Self::Message => 1,
      Self::Project => 2,
    }
  }
}

impl fmt::Display for EntityFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityFamily {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "conversation" | "conversations" | "conv" | "c" => Ok(Self::Conversation),
      "message" | "messages" | "msg" | "m" => Ok(Self::Message),
      "project" | "projects" | "p" => Ok(Self::Project),
      other => Err(format!("unknown entity family: {}", other)),
    }
  }
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
  pub id: String,
  pub project_id: Option<String>,
  pub title: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub message_count: u32,
  pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
  /// Build a conversation that only exists locally (client-generated id).
  pub fn local(new: &NewConversation, now: DateTime<Utc>) -> Self {
    Self {
      id: new.id.clone().unwrap_or_else(new_client_id),
      project_id: new.project_id.clone(),
      title: new.title.clone(),
      created_at: now,
      updated_at: now,
      message_count: 0,
      last_message_at: None,
    }
  }

  pub fn apply(&mut self, patch: &ConversationPatch, now: DateTime<Utc>) {
    if let Some(title) = &patch.title {
      self.title = title.clone();
    }
    self.updated_at = now;
  }
}

/// Input for creating a conversation. `id` is only set when replaying a
/// record that was created while the remote was unreachable.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
  pub id: Option<String>,
  pub title: String,
  pub project_id: Option<String>,
}

impl NewConversation {
  pub fn new(title: impl Into<String>, project_id: Option<String>) -> Self {
    Self {
      id: None,
      title: title.into().trim().to_string(),
      project_id,
    }
  }
}

impl From<&Conversation> for NewConversation {
  fn from(c: &Conversation) -> Self {
    Self {
      id: Some(c.id.clone()),
      title: c.title.clone(),
      project_id: c.project_id.clone(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPatch {
  pub title: Option<String>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  User,
  Assistant,
}

impl FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "user" | "user-authored" => Ok(Self::User),
      "assistant" | "assistant-authored" => Ok(Self::Assistant),
      other => Err(format!("unknown role: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
  Pending,
  Complete,
  Error,
}

impl MessageStatus {
  /// Allowed moves: pending stays pending while content streams in, then
  /// settles on complete or error. Complete may be revised in place.
  pub fn can_transition_to(self, next: MessageStatus) -> bool {
    matches!(
      (self, next),
      (Self::Pending, Self::Pending)
        | (Self::Pending, Self::Complete)
        | (Self::Pending, Self::Error)
        | (Self::Complete, Self::Complete)
    )
  }
}

impl fmt::Display for MessageStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Pending => "pending",
      Self::Complete => "complete",
      Self::Error => "error",
    };
    f.write_str(s)
  }
}

/// A source citation attached to an assistant answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub excerpt: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: String,
  pub conversation_id: String,
  pub role: Role,
  pub content: String,
  #[serde(default)]
  pub sources: Vec<Citation>,
  pub status: MessageStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Message {
  pub fn local(new: &NewMessage, now: DateTime<Utc>) -> Self {
    Self {
      id: new.id.clone().unwrap_or_else(new_client_id),
      conversation_id: new.conversation_id.clone(),
      role: new.role,
      content: new.content.clone(),
      sources: new.sources.clone(),
      status: new.status,
      created_at: now,
      updated_at: now,
    }
  }

  /// Apply a patch after the status transition has been validated.
  pub fn apply(&mut self, patch: &MessagePatch, now: DateTime<Utc>) {
    if let Some(content) = &patch.content {
      self.content = content.clone();
    }
    if let Some(sources) = &patch.sources {
      self.sources = sources.clone();
    }
    if let Some(status) = patch.status {
      self.status = status;
    }
    self.updated_at = now;
  }

  /// Check that `patch` is a legal revision of this message.
  pub fn check_patch(&self, patch: &MessagePatch) -> Result<(), String> {
    let next = patch.status.unwrap_or(self.status);
    if !self.status.can_transition_to(next) {
      return Err(format!(
        "message {} cannot move from {} to {}",
        self.id, self.status, next
      ));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
  pub id: Option<String>,
  pub conversation_id: String,
  pub role: Role,
  pub content: String,
  pub sources: Vec<Citation>,
  pub status: MessageStatus,
}

impl NewMessage {
  /// User messages are final when sent; assistant messages start pending and
  /// are filled in as tokens stream back.
  pub fn new(conversation_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
    let status = match role {
      Role::User => MessageStatus::Complete,
      Role::Assistant => MessageStatus::Pending,
    };
    Self {
      id: None,
      conversation_id: conversation_id.into(),
      role,
      content: content.into(),
      sources: Vec::new(),
      status,
    }
  }
}

impl From<&Message> for NewMessage {
  fn from(m: &Message) -> Self {
    Self {
      id: Some(m.id.clone()),
      conversation_id: m.conversation_id.clone(),
      role: m.role,
      content: m.content.clone(),
      sources: m.sources.clone(),
      status: m.status,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
  pub content: Option<String>,
  pub sources: Option<Vec<Citation>>,
  pub status: Option<MessageStatus>,
}

// ============================================================================
// Projects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Department {
  #[serde(rename = "it-engineering")]
  ItEngineering,
  #[serde(rename = "sales-marketing")]
  SalesMarketing,
  #[serde(rename = "customer-support")]
  CustomerSupport,
  #[serde(rename = "operations-hr-supply")]
  OperationsHrSupply,
  #[serde(rename = "finance-accounting")]
  FinanceAccounting,
  #[serde(rename = "project-management")]
  ProjectManagement,
  #[serde(rename = "real-estate")]
  RealEstate,
  #[serde(rename = "private-equity-ma")]
  PrivateEquityMa,
  #[serde(rename = "consulting")]
  Consulting,
  #[serde(rename = "personal-continuing-ed")]
  PersonalContinuingEd,
  #[serde(rename = "_global")]
  Global,
  #[serde(rename = "research-development")]
  ResearchDevelopment,
}

impl Department {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::ItEngineering => "it-engineering",
      Self::SalesMarketing => "sales-marketing",
      Self::CustomerSupport => "customer-support",
      Self::OperationsHrSupply => "operations-hr-supply",
      Self::FinanceAccounting => "finance-accounting",
      Self::ProjectManagement => "project-management",
      Self::RealEstate => "real-estate",
      Self::PrivateEquityMa => "private-equity-ma",
      Self::Consulting => "consulting",
      Self::PersonalContinuingEd => "personal-continuing-ed",
      Self::Global => "_global",
      Self::ResearchDevelopment => "research-development",
    }
  }
}

impl FromStr for Department {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let wanted = s.trim().to_lowercase();
    ALL_DEPARTMENTS
      .iter()
      .copied()
      .find(|d| d.as_str() == wanted)
      .ok_or_else(|| format!("unknown department: {}", s))
  }
}

const ALL_DEPARTMENTS: [Department; 12] = [
  Department::ItEngineering,
  Department::SalesMarketing,
  Department::CustomerSupport,
  Department::OperationsHrSupply,
  Department::FinanceAccounting,
  Department::ProjectManagement,
  Department::RealEstate,
  Department::PrivateEquityMa,
  Department::Consulting,
  Department::PersonalContinuingEd,
  Department::Global,
  Department::ResearchDevelopment,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  pub department: Option<Department>,
  pub instructions: Option<String>,
  pub memory_context: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Always derived from the local cache at read time.
  #[serde(default)]
  pub conversation_count: u32,
}

impl Project {
  pub fn local(new: &NewProject, now: DateTime<Utc>) -> Self {
    Self {
      id: new.id.clone().unwrap_or_else(new_client_id),
      name: new.name.clone(),
      description: new.description.clone(),
      department: new.department,
      instructions: new.instructions.clone(),
      memory_context: new.memory_context.clone(),
      created_at: now,
      updated_at: now,
      conversation_count: 0,
    }
  }

  pub fn apply(&mut self, patch: &ProjectPatch, now: DateTime<Utc>) {
    if let Some(name) = &patch.name {
      self.name = name.clone();
    }
    if let Some(description) = &patch.description {
      self.description = non_empty(description);
    }
    if let Some(department) = patch.department {
      self.department = Some(department);
    }
    if let Some(instructions) = &patch.instructions {
      self.instructions = non_empty(instructions);
    }
    if let Some(memory) = &patch.memory_context {
      self.memory_context = non_empty(memory);
    }
    self.updated_at = now;
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewProject {
  pub id: Option<String>,
  pub name: String,
  pub description: Option<String>,
  pub department: Option<Department>,
  pub instructions: Option<String>,
  pub memory_context: Option<String>,
}

impl NewProject {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into().trim().to_string(),
      ..Self::default()
    }
  }

  pub fn with_description(mut self, description: impl AsRef<str>) -> Self {
    self.description = non_empty(description.as_ref());
    self
  }

  pub fn with_department(mut self, department: Department) -> Self {
    self.department = Some(department);
    self
  }

  pub fn with_instructions(mut self, instructions: impl AsRef<str>) -> Self {
    self.instructions = non_empty(instructions.as_ref());
    self
  }
}

impl From<&Project> for NewProject {
  fn from(p: &Project) -> Self {
    Self {
      id: Some(p.id.clone()),
      name: p.name.clone(),
      description: p.description.clone(),
      department: p.department,
      instructions: p.instructions.clone(),
      memory_context: p.memory_context.clone(),
    }
  }
}

/// Partial project update. An empty description, instructions or memory
/// string clears the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
  pub name: Option<String>,
  pub description: Option<String>,
  pub department: Option<Department>,
  pub instructions: Option<String>,
  pub memory_context: Option<String>,
}

/// Trim user text, mapping blank input to `None`.
pub fn non_empty(s: &str) -> Option<String> {
  let trimmed = s.trim();
  if trimmed.is_empty() {
    None
  } else {
    Some(trimmed.to_string())
  }
}

/// Identifier for records created while the remote is unreachable.
pub fn new_client_id() -> String {
  uuid::Uuid::new_v4().to_string()
}
