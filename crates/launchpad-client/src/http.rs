//! REST + SSE backend.
//!
//! [`HttpBackend`] talks to the messaging server over JSON/HTTP and
//! normalizes every row it receives. [`SseChannel`] follows the server's
//! `GET /messages/stream` event stream and reconnects when it drops.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use launchpad_shared::constants::SSE_EVENT_INSERT;
use launchpad_shared::rows::{normalize_all, MessageRow, UserRow};
use launchpad_shared::types::{Message, Participant, ParticipantId, Role};

use crate::channel::{spawn_delivery, InsertCallback, MessageChannel, SubscriptionHandle};
use crate::config::ClientConfig;
use crate::error::ServiceError;
use crate::services::{MessageService, UserDirectory};

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    sender_id: &'a str,
    receiver_id: &'a str,
    message: &'a str,
}

/// Fields of a profile update. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Serialize)]
struct UpdateUserRequest<'a> {
    uuid: &'a str,
    values: &'a ProfileUpdate,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UsersResponse {
    Wrapped { users: Vec<UserRow> },
    Bare(Vec<UserRow>),
}

#[derive(Deserialize)]
struct UserResponse {
    user: UserRow,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.api_url.clone(), config.api_token.clone())
    }

    /// Realtime channel against the same server.
    pub fn channel(&self, reconnect_delay: Duration) -> SseChannel {
        SseChannel {
            backend: self.clone(),
            reconnect_delay,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Update the caller's profile (`PATCH /users`).
    pub async fn update_user(
        &self,
        uuid: &ParticipantId,
        update: &ProfileUpdate,
    ) -> Result<Participant, ServiceError> {
        let resp = self
            .request(Method::PATCH, "/users")
            .json(&UpdateUserRequest {
                uuid: uuid.as_str(),
                values: update,
            })
            .send()
            .await?;
        let body: UserResponse = check(resp).await?.json().await?;
        Ok(body.user.normalize()?)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fetch_messages(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<Message>, ServiceError> {
        let resp = self.request(Method::GET, path).query(query).send().await?;
        let rows: Vec<MessageRow> = check(resp).await?.json().await?;
        Ok(normalize_messages(rows))
    }
}

impl MessageService for HttpBackend {
    async fn create(
        &self,
        sender: &ParticipantId,
        receiver: &ParticipantId,
        body: &str,
    ) -> Result<Option<Message>, ServiceError> {
        let resp = self
            .request(Method::POST, "/messages")
            .json(&CreateMessageRequest {
                sender_id: sender.as_str(),
                receiver_id: receiver.as_str(),
                message: body,
            })
            .send()
            .await?;
        let resp = check(resp).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode_created(&resp.text().await?)
    }

    async fn query_by_participant(
        &self,
        user: &ParticipantId,
    ) -> Result<Vec<Message>, ServiceError> {
        self.fetch_messages("/messages", &[("participant", user.as_str())])
            .await
    }

    async fn query_by_pair(
        &self,
        a: &ParticipantId,
        b: &ParticipantId,
    ) -> Result<Vec<Message>, ServiceError> {
        let mut thread = self
            .fetch_messages("/messages/pair", &[("a", a.as_str()), ("b", b.as_str())])
            .await?;
        thread.sort_by_key(|m| m.created_at);
        Ok(thread)
    }
}

impl UserDirectory for HttpBackend {
    async fn list_users(&self) -> Result<Vec<Participant>, ServiceError> {
        let resp = self.request(Method::GET, "/users").send().await?;
        let text = check(resp).await?.text().await?;
        decode_users(&text)
    }
}

/// Realtime channel over the server's SSE stream.
#[derive(Debug, Clone)]
pub struct SseChannel {
    backend: HttpBackend,
    reconnect_delay: Duration,
}

impl MessageChannel for SseChannel {
    fn subscribe(
        &self,
        user: &ParticipantId,
        on_insert: InsertCallback,
    ) -> Result<SubscriptionHandle, ServiceError> {
        let backend = self.backend.clone();
        let delay = self.reconnect_delay;
        let user = user.clone();

        let task = spawn_delivery(async move {
            loop {
                match open_stream(&backend, &user).await {
                    Ok(resp) => {
                        info!(user = %user, "Realtime stream connected");
                        let mut events = resp.bytes_stream().eventsource();
                        while let Some(event) = events.next().await {
                            match event {
                                Ok(event) if event.event == SSE_EVENT_INSERT => {
                                    match decode_insert(&event.data) {
                                        Ok(message) if message.involves(&user) => on_insert(message),
                                        Ok(_) => {}
                                        Err(e) => warn!(error = %e, "Dropping malformed insert event"),
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(error = %e, "Realtime stream error");
                                    break;
                                }
                            }
                        }
                        debug!(user = %user, "Realtime stream ended");
                    }
                    Err(e) => warn!(user = %user, error = %e, "Failed to open realtime stream"),
                }
                tokio::time::sleep(delay).await;
            }
        })?;

        Ok(SubscriptionHandle::for_task(task))
    }
}

async fn open_stream(backend: &HttpBackend, user: &ParticipantId) -> Result<Response, ServiceError> {
    let resp = backend
        .request(Method::GET, "/messages/stream")
        .query(&[("participant", user.as_str())])
        .send()
        .await?;
    check(resp).await
}

/// Map non-2xx responses to [`ServiceError::Status`], using the server's
/// `{ "error": ... }` body when present.
async fn check(resp: Response) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(ServiceError::Status {
        status: status.as_u16(),
        message,
    })
}

fn normalize_messages(rows: Vec<MessageRow>) -> Vec<Message> {
    let (messages, rejected) = normalize_all(rows, MessageRow::normalize);
    if !rejected.is_empty() {
        warn!(count = rejected.len(), first = %rejected[0], "Skipped malformed message rows");
    }
    messages
}

fn decode_created(text: &str) -> Result<Option<Message>, ServiceError> {
    let text = text.trim();
    if text.is_empty() || text == "null" {
        return Ok(None);
    }
    let row: MessageRow =
        serde_json::from_str(text).map_err(|e| ServiceError::Decode(e.to_string()))?;
    Ok(Some(row.normalize()?))
}

fn decode_insert(data: &str) -> Result<Message, ServiceError> {
    let row: MessageRow =
        serde_json::from_str(data).map_err(|e| ServiceError::Decode(e.to_string()))?;
    Ok(row.normalize()?)
}

fn decode_users(text: &str) -> Result<Vec<Participant>, ServiceError> {
    let parsed: UsersResponse =
        serde_json::from_str(text).map_err(|e| ServiceError::Decode(e.to_string()))?;
    let rows = match parsed {
        UsersResponse::Wrapped { users } => users,
        UsersResponse::Bare(users) => users,
    };
    let (users, rejected) = normalize_all(rows, UserRow::normalize);
    if !rejected.is_empty() {
        warn!(count = rejected.len(), "Skipped malformed user rows");
    }
    Ok(users)
}
