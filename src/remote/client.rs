use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{
  ApiConversation, ApiError, ApiMessage, ApiProject, ConversationInsert, ConversationUpdate,
  MessageInsert, MessageUpdate, ProjectInsert, ProjectUpdate,
};
use super::{RemoteError, RemoteResult, RemoteStore};
use crate::config::RemoteConfig;
use crate::types::{
  Conversation, ConversationPatch, Message, MessagePatch, NewConversation, NewMessage, NewProject,
  Project, ProjectPatch,
};

/// Ask the backend to echo the written rows back.
const PREFER_RETURN: &str = "return=representation";
/// Creates are upserts so a replayed create with a client id is idempotent.
const PREFER_UPSERT: &str = "return=representation,resolution=merge-duplicates";

/// REST endpoints, one per table.
#[derive(Clone)]
struct Tables {
  conversations: Url,
  messages: Url,
  projects: Url,
}

/// HTTP client for the PostgREST-style backend.
#[derive(Clone)]
pub struct HttpRemoteStore {
  http: Client,
  tables: Tables,
  api_key: String,
  user_id: String,
}

impl HttpRemoteStore {
  pub fn new(config: &RemoteConfig, api_key: impl Into<String>) -> Result<Self> {
    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    let rest = base
      .join("rest/v1/")
      .map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;

    let table = |name: &str| {
      rest
        .join(name)
        .map_err(|e| eyre!("Invalid table url for {}: {}", name, e))
    };
    let tables = Tables {
      conversations: table("conversations")?,
      messages: table("messages")?,
      projects: table("projects")?,
    };

    // Every call carries its own timeout; expiry is classified as unreachable
    let http = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      tables,
      api_key: api_key.into(),
      user_id: config.user_id.clone(),
    })
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    debug!(%method, url = %url, "remote request");
    self
      .http
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
  }

  /// Table url with `user_id=eq.<user>` and any extra filters applied.
  fn scoped(&self, table: &Url, filters: &[(&str, String)]) -> Url {
    let mut url = table.clone();
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("user_id", &format!("eq.{}", self.user_id));
      for (key, value) in filters {
        query.append_pair(key, value);
      }
    }
    url
  }

  fn filtered(table: &Url, filters: &[(&str, String)]) -> Url {
    let mut url = table.clone();
    {
      let mut query = url.query_pairs_mut();
      for (key, value) in filters {
        query.append_pair(key, value);
      }
    }
    url
  }

  async fn fetch_rows<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<Vec<T>> {
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response).await?;
    let status = response.status().as_u16();

    response
      .json::<Vec<T>>()
      .await
      .map_err(|e| body_error(status, e))
  }

  /// Writes return an array of affected rows; an empty array means no row matched.
  async fn fetch_one<T: DeserializeOwned>(
    &self,
    request: RequestBuilder,
    what: &str,
  ) -> RemoteResult<T> {
    self
      .fetch_rows(request)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| RemoteError::Rejected {
        status: StatusCode::NOT_FOUND.as_u16(),
        message: format!("{} not found", what),
      })
  }

  async fn execute(&self, request: RequestBuilder) -> RemoteResult<()> {
    let response = request.send().await.map_err(transport_error)?;
    check_status(response).await?;
    Ok(())
  }
}

#[async_trait::async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn list_conversations(&self, project_id: Option<&str>) -> RemoteResult<Vec<Conversation>> {
    let mut filters = vec![("select", "*".to_string())];
    if let Some(project_id) = project_id {
      filters.push(("project_id", format!("eq.{}", project_id)));
    }
    filters.push(("order", "updated_at.desc".to_string()));

    let url = self.scoped(&self.tables.conversations, &filters);
    let rows: Vec<ApiConversation> = self.fetch_rows(self.request(Method::GET, url)).await?;
    Ok(rows.into_iter().map(Conversation::from).collect())
  }

  async fn create_conversation(&self, new: &NewConversation) -> RemoteResult<Conversation> {
    let url = Self::filtered(&self.tables.conversations, &[("on_conflict", "id".to_string())]);
    let request = self
      .request(Method::POST, url)
      .header("Prefer", PREFER_UPSERT)
      .json(&ConversationInsert::new(&self.user_id, new));

    let row: ApiConversation = self.fetch_one(request, "created conversation").await?;
    Ok(row.into())
  }

  async fn update_conversation(
    &self,
    id: &str,
    patch: &ConversationPatch,
  ) -> RemoteResult<Conversation> {
    let url = self.scoped(&self.tables.conversations, &[("id", format!("eq.{}", id))]);
    let request = self
      .request(Method::PATCH, url)
      .header("Prefer", PREFER_RETURN)
      .json(&ConversationUpdate::new(patch, Utc::now()));

    let row: ApiConversation = self
      .fetch_one(request, &format!("conversation {}", id))
      .await?;
    Ok(row.into())
  }

  async fn delete_conversation(&self, id: &str) -> RemoteResult<()> {
    let url = self.scoped(&self.tables.conversations, &[("id", format!("eq.{}", id))]);
    self.execute(self.request(Method::DELETE, url)).await
  }

  async fn list_messages(&self, conversation_id: &str) -> RemoteResult<Vec<Message>> {
    let url = Self::filtered(
      &self.tables.messages,
      &[
        ("select", "*".to_string()),
        ("conversation_id", format!("eq.{}", conversation_id)),
        ("order", "created_at.asc".to_string()),
      ],
    );
    let rows: Vec<ApiMessage> = self.fetch_rows(self.request(Method::GET, url)).await?;
    Ok(rows.into_iter().map(Message::from).collect())
  }

  async fn create_message(&self, new: &NewMessage) -> RemoteResult<Message> {
    let url = Self::filtered(&self.tables.messages, &[("on_conflict", "id".to_string())]);
    let request = self
      .request(Method::POST, url)
      .header("Prefer", PREFER_UPSERT)
      .json(&MessageInsert::from(new));

    let row: ApiMessage = self.fetch_one(request, "created message").await?;
    Ok(row.into())
  }

  async fn update_message(&self, id: &str, patch: &MessagePatch) -> RemoteResult<Message> {
    let url = Self::filtered(&self.tables.messages, &[("id", format!("eq.{}", id))]);
    let request = self
      .request(Method::PATCH, url)
      .header("Prefer", PREFER_RETURN)
      .json(&MessageUpdate::new(patch, Utc::now()));

    let row: ApiMessage = self.fetch_one(request, &format!("message {}", id)).await?;
    Ok(row.into())
  }

  async fn list_projects(&self) -> RemoteResult<Vec<Project>> {
    let url = self.scoped(
      &self.tables.projects,
      &[
        ("select", "*".to_string()),
        ("order", "updated_at.desc".to_string()),
      ],
    );
    let rows: Vec<ApiProject> = self.fetch_rows(self.request(Method::GET, url)).await?;
    Ok(rows.into_iter().map(Project::from).collect())
  }

  async fn create_project(&self, new: &NewProject) -> RemoteResult<Project> {
    let url = Self::filtered(&self.tables.projects, &[("on_conflict", "id".to_string())]);
    let request = self
      .request(Method::POST, url)
      .header("Prefer", PREFER_UPSERT)
      .json(&ProjectInsert::new(&self.user_id, new));

    let row: ApiProject = self.fetch_one(request, "created project").await?;
    Ok(row.into())
  }

  async fn update_project(&self, id: &str, patch: &ProjectPatch) -> RemoteResult<Project> {
    let url = self.scoped(&self.tables.projects, &[("id", format!("eq.{}", id))]);
    let request = self
      .request(Method::PATCH, url)
      .header("Prefer", PREFER_RETURN)
      .json(&ProjectUpdate::new(patch, Utc::now()));

    let row: ApiProject = self.fetch_one(request, &format!("project {}", id)).await?;
    Ok(row.into())
  }

  async fn delete_project(&self, id: &str) -> RemoteResult<()> {
    let url = self.scoped(&self.tables.projects, &[("id", format!("eq.{}", id))]);
    self.execute(self.request(Method::DELETE, url)).await
  }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
  if e.is_timeout() {
    RemoteError::Unreachable(format!("request timed out: {}", e))
  } else if e.is_connect() {
    RemoteError::Unreachable(format!("connection failed: {}", e))
  } else {
    RemoteError::Unreachable(e.to_string())
  }
}

/// A success status with a body we cannot read as the expected rows.
fn body_error(status: u16, e: reqwest::Error) -> RemoteError {
  if e.is_decode() {
    RemoteError::Rejected {
      status,
      message: format!("unexpected response body: {}", e),
    }
  } else {
    transport_error(e)
  }
}

async fn check_status(response: Response) -> RemoteResult<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let body = response.text().await.unwrap_or_default();
  let message = serde_json::from_str::<ApiError>(&body)
    .map(|e| e.message)
    .unwrap_or(body);
  Err(classify_status(status, message))
}

/// Timeouts, throttling and server faults mean the backend is not usable
/// right now; every other refusal is a definite answer.
fn classify_status(status: StatusCode, message: String) -> RemoteError {
  if status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
    || status.is_server_error()
  {
    RemoteError::Unreachable(format!("HTTP {}: {}", status.as_u16(), message))
  } else {
    RemoteError::Rejected {
      status: status.as_u16(),
      message,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::Role;
  use serde_json::json;
  use wiremock::matchers::{body_partial_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn store_for(url: &str, timeout_secs: u64) -> HttpRemoteStore {
    let config = RemoteConfig {
      url: url.to_string(),
      user_id: "u1".to_string(),
      timeout_secs,
    };
    HttpRemoteStore::new(&config, "test-key").unwrap()
  }

  fn conversation_row(id: &str, title: &str) -> serde_json::Value {
    json!({
      "id": id,
      "user_id": "u1",
      "project_id": null,
      "title": title,
      "created_at": "2024-03-01T10:00:00Z",
      "updated_at": "2024-03-01T10:00:00Z",
      "message_count": 0,
      "last_message_at": null
    })
  }

  #[tokio::test]
  async fn test_list_conversations_scopes_to_user() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/conversations"))
      .and(query_param("user_id", "eq.u1"))
      .and(query_param("project_id", "eq.p1"))
      .and(query_param("order", "updated_at.desc"))
      .and(header("apikey", "test-key"))
      .and(header("authorization", "Bearer test-key"))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(json!([conversation_row("c1", "Q1 Review")])),
      )
      .expect(1)
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 5);
    let conversations = store.list_conversations(Some("p1")).await.unwrap();

    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id, "c1");
    assert_eq!(conversations[0].title, "Q1 Review");
  }

  #[tokio::test]
  async fn test_create_conversation_is_an_upsert() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/rest/v1/conversations"))
      .and(query_param("on_conflict", "id"))
      .and(header("prefer", PREFER_UPSERT))
      .and(body_partial_json(json!({ "user_id": "u1", "title": "Q1 Review" })))
      .respond_with(
        ResponseTemplate::new(201).set_body_json(json!([conversation_row("srv-1", "Q1 Review")])),
      )
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 5);
    let created = store
      .create_conversation(&NewConversation::new("  Q1 Review ", None))
      .await
      .unwrap();

    assert_eq!(created.id, "srv-1");
  }

  #[tokio::test]
  async fn test_create_message_round_trips_role() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/rest/v1/messages"))
      .and(body_partial_json(json!({ "conversation_id": "c1", "role": "user" })))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!([{
        "id": "m1",
        "conversation_id": "c1",
        "role": "user",
        "content": "hello",
        "sources": null,
        "status": "complete",
        "created_at": "2024-03-01T10:00:00Z",
        "updated_at": "2024-03-01T10:00:00Z"
      }])))
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 5);
    let message = store
      .create_message(&NewMessage::new("c1", Role::User, "hello"))
      .await
      .unwrap();

    assert_eq!(message.id, "m1");
    assert!(message.sources.is_empty());
  }

  #[tokio::test]
  async fn test_server_errors_are_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/projects"))
      .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 5);
    let err = store.list_projects().await.unwrap_err();
    assert!(err.is_unreachable(), "got {:?}", err);
  }

  #[tokio::test]
  async fn test_validation_errors_are_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
      .and(path("/rest/v1/conversations"))
      .and(query_param("id", "eq.c1"))
      .respond_with(ResponseTemplate::new(422).set_body_json(json!({
        "message": "title must not be empty",
        "code": "23514"
      })))
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 5);
    let err = store
      .update_conversation(
        "c1",
        &ConversationPatch {
          title: Some(String::new()),
        },
      )
      .await
      .unwrap_err();

    assert_eq!(
      err,
      RemoteError::Rejected {
        status: 422,
        message: "title must not be empty".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_update_without_matching_row_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
      .and(path("/rest/v1/projects"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 5);
    let err = store
      .update_project("missing", &ProjectPatch::default())
      .await
      .unwrap_err();
    assert!(err.is_not_found());
  }

  #[tokio::test]
  async fn test_timeout_is_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/messages"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!([]))
          .set_delay(Duration::from_secs(3)),
      )
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 1);
    let err = store.list_messages("c1").await.unwrap_err();
    assert!(err.is_unreachable());
  }

  #[tokio::test]
  async fn test_refused_connection_is_unreachable() {
    // Nothing listens on the discard port
    let store = store_for("http://127.0.0.1:9", 1);
    let err = store.delete_conversation("c1").await.unwrap_err();
    assert!(err.is_unreachable());
  }

  #[tokio::test]
  async fn test_garbage_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/projects"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
      .mount(&server)
      .await;

    let store = store_for(&server.uri(), 5);
    let err = store.list_projects().await.unwrap_err();
    assert!(matches!(err, RemoteError::Rejected { status: 200, .. }));
  }
}
