//! Remote store client: one CRUD call per operation against the
//! authoritative backend. No retries, no caching, no knowledge of sync mode.

pub mod api_types;
mod client;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
  Conversation, ConversationPatch, Message, MessagePatch, NewConversation, NewMessage, NewProject,
  Project, ProjectPatch,
};

pub use client::HttpRemoteStore;

/// Classified remote failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  /// Transport failure, timeout or an unavailable backend. Drives the latch.
  #[error("remote store unreachable: {0}")]
  Unreachable(String),

  /// The backend answered and refused the request (validation, auth, missing row).
  #[error("remote store rejected the request ({status}): {message}")]
  Rejected { status: u16, message: String },
}

impl RemoteError {
  pub fn is_unreachable(&self) -> bool {
    matches!(self, Self::Unreachable(_))
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::Rejected { status: 404, .. })
  }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// CRUD contract for the authoritative backend.
///
/// Every returned record carries server-confirmed timestamps. Creates are
/// idempotent when retried with the same client-generated id.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Conversations of the user, optionally restricted to one project.
  async fn list_conversations(&self, project_id: Option<&str>) -> RemoteResult<Vec<Conversation>>;

  async fn create_conversation(&self, new: &NewConversation) -> RemoteResult<Conversation>;

  async fn update_conversation(
    &self,
    id: &str,
    patch: &ConversationPatch,
  ) -> RemoteResult<Conversation>;

  async fn delete_conversation(&self, id: &str) -> RemoteResult<()>;

  async fn list_messages(&self, conversation_id: &str) -> RemoteResult<Vec<Message>>;

  async fn create_message(&self, new: &NewMessage) -> RemoteResult<Message>;

  async fn update_message(&self, id: &str, patch: &MessagePatch) -> RemoteResult<Message>;

  async fn list_projects(&self) -> RemoteResult<Vec<Project>>;

  async fn create_project(&self, new: &NewProject) -> RemoteResult<Project>;

  async fn update_project(&self, id: &str, patch: &ProjectPatch) -> RemoteResult<Project>;

  async fn delete_project(&self, id: &str) -> RemoteResult<()>;
}
