use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
    routing::get,
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use launchpad_shared::constants::SSE_EVENT_INSERT;
use launchpad_shared::types::{Message, ParticipantId};
use launchpad_store::{Database, StoreError, UserRecord, UserUpdate};

use crate::config::ServerConfig;
use crate::error::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub feed: broadcast::Sender<Message>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(db: Database, config: ServerConfig) -> Self {
        let (feed, _) = broadcast::channel(config.feed_capacity);
        Self {
            db: Arc::new(Mutex::new(db)),
            feed,
            config: Arc::new(config),
        }
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, ServerError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&db)?)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route("/users", get(list_users).patch(update_user))
        .route("/messages", get(messages_for_participant).post(create_message))
        .route("/messages/pair", get(messages_between))
        .route("/messages/stream", get(message_stream))
        .route_layer(middleware::from_fn_with_state(
            state.config.clone(),
            require_token,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<UserRecord>,
}

#[derive(Serialize)]
struct UserResponse {
    user: UserRecord,
}

#[derive(Deserialize)]
struct UpdateUserRequest {
    uuid: String,
    #[serde(default)]
    values: UserUpdate,
}

#[derive(Deserialize)]
struct CreateMessageRequest {
    #[serde(alias = "senderId")]
    sender_id: String,
    #[serde(alias = "receiverId")]
    receiver_id: String,
    #[serde(alias = "body", alias = "content")]
    message: String,
}

#[derive(Deserialize)]
struct ParticipantQuery {
    participant: String,
}

#[derive(Deserialize)]
struct PairQuery {
    a: String,
    b: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Bearer-token guard. A server without `API_TOKEN` is open.
async fn require_token(
    State(config): State<Arc<ServerConfig>>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    if let Some(expected) = config.api_token.as_deref() {
        verify_token(&headers, expected)?;
    }
    Ok(next.run(req).await)
}

fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), ServerError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        warn!("Rejected request with invalid API token");
        return Err(ServerError::Unauthorized);
    }
    Ok(())
}

async fn list_users(State(state): State<AppState>) -> Result<Json<UsersResponse>, ServerError> {
    let users = state.with_db(|db| db.list_users())?;
    Ok(Json(UsersResponse { users }))
}

async fn update_user(
    State(state): State<AppState>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ServerError> {
    if req.values.is_empty() {
        return Err(ServerError::BadRequest("No fields to update".into()));
    }
    let user = state
        .with_db(|db| db.update_user(&req.uuid, &req.values))?
        .ok_or_else(|| ServerError::NotFound(format!("user {}", req.uuid)))?;

    info!(user = %user.uuid, "User profile updated");
    Ok(Json(UserResponse { user }))
}

async fn create_message(
    State(state): State<AppState>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let sender = ParticipantId::from(req.sender_id.trim());
    let receiver = ParticipantId::from(req.receiver_id.trim());
    if sender.as_str().is_empty() || receiver.as_str().is_empty() {
        return Err(ServerError::BadRequest(
            "sender_id and receiver_id are required".into(),
        ));
    }

    let message = state.with_db(|db| db.insert_message(&sender, &receiver, &req.message))?;
    info!(msg_id = %message.id, sender = %sender, receiver = %receiver, "Message stored");

    // No subscribers is fine.
    let _ = state.feed.send(message.clone());

    Ok((StatusCode::CREATED, Json(message)))
}

async fn messages_for_participant(
    State(state): State<AppState>,
    Query(q): Query<ParticipantQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let participant = ParticipantId::from(q.participant);
    let messages = state.with_db(|db| db.messages_for_participant(&participant))?;
    Ok(Json(messages))
}

async fn messages_between(
    State(state): State<AppState>,
    Query(q): Query<PairQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let (a, b) = (ParticipantId::from(q.a), ParticipantId::from(q.b));
    let messages = state.with_db(|db| db.messages_between(&a, &b))?;
    Ok(Json(messages))
}

async fn message_stream(
    State(state): State<AppState>,
    Query(q): Query<ParticipantQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let participant = ParticipantId::from(q.participant);
    debug!(participant = %participant, "Realtime stream opened");

    let rx = state.feed.subscribe();
    let stream = futures::stream::unfold((rx, participant), |(mut rx, participant)| async move {
        loop {
            match rx.recv().await {
                Ok(message) if message.involves(&participant) => {
                    match Event::default().event(SSE_EVENT_INSERT).json_data(&message) {
                        Ok(event) => return Some((Ok::<_, Infallible>(event), (rx, participant))),
                        Err(e) => warn!(msg_id = %message.id, error = %e, "Failed to encode event"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(participant = %participant, skipped, "Realtime stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::header;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use launchpad_client::channel::MessageChannel;
    use launchpad_client::services::{MessageService, UserDirectory};
    use launchpad_client::http::ProfileUpdate;
    use launchpad_client::{HttpBackend, ServiceError};
    use launchpad_shared::types::Role;
    use launchpad_store::NewUser;

    use super::*;

    fn state_with(token: Option<&str>) -> AppState {
        let db = Database::open_in_memory().unwrap();
        for (id, uuid, name) in [(1, "U", "Una"), (2, "A", "Alice")] {
            db.upsert_user(&NewUser {
                id: Some(id),
                uuid: uuid.into(),
                name: Some(name.into()),
                ..NewUser::default()
            })
            .unwrap();
        }
        let config = ServerConfig {
            api_token: token.map(str::to_string),
            ..ServerConfig::default()
        };
        AppState::new(db, config)
    }

    async fn call(app: Router, req: axum::http::Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: Method, uri: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = build_router(state_with(Some("t0k")));
        let (status, body) = call(app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let state = state_with(Some("t0k"));

        let (status, body) = call(build_router(state.clone()), get("/users")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let req = axum::http::Request::get("/users")
            .header(header::AUTHORIZATION, "Bearer t0k")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(build_router(state), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["users"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_and_query_messages() {
        let state = state_with(None);

        let (status, created) = call(
            build_router(state.clone()),
            json_request(
                Method::POST,
                "/messages",
                json!({"sender_id": "U", "receiver_id": "A", "message": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["body"], "hi");

        let (_, reply) = call(
            build_router(state.clone()),
            json_request(
                Method::POST,
                "/messages",
                json!({"senderId": "A", "receiverId": "U", "content": "hello"}),
            ),
        )
        .await;
        assert_eq!(reply["sender_id"], "A");

        let (status, history) =
            call(build_router(state.clone()), get("/messages?participant=U")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 2);

        let (_, thread) = call(build_router(state), get("/messages/pair?a=A&b=U")).await;
        let bodies: Vec<_> = thread
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["body"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(bodies, vec!["hi", "hello"]);
    }

    #[tokio::test]
    async fn test_invalid_messages_are_rejected() {
        let state = state_with(None);

        let (status, _) = call(
            build_router(state.clone()),
            json_request(
                Method::POST,
                "/messages",
                json!({"sender_id": "U", "receiver_id": "A", "message": "   "}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            build_router(state),
            json_request(
                Method::POST,
                "/messages",
                json!({"sender_id": "U", "receiver_id": "U", "message": "me"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_user() {
        let state = state_with(None);

        let (status, body) = call(
            build_router(state.clone()),
            json_request(
                Method::PATCH,
                "/users",
                json!({"uuid": "A", "values": {"name": "Alicia", "role": "investor"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], "Alicia");
        assert_eq!(body["user"]["role"], "investor");

        let (status, _) = call(
            build_router(state.clone()),
            json_request(
                Method::PATCH,
                "/users",
                json!({"uuid": "nobody", "values": {"name": "x"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            build_router(state),
            json_request(Method::PATCH, "/users", json!({"uuid": "A", "values": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_publishes_to_feed() {
        let state = state_with(None);
        let mut feed = state.feed.subscribe();

        call(
            build_router(state),
            json_request(
                Method::POST,
                "/messages",
                json!({"sender_id": "U", "receiver_id": "A", "message": "live"}),
            ),
        )
        .await;

        assert_eq!(feed.recv().await.unwrap().body, "live");
    }

    /// The HTTP backend and SSE channel against a real listener.
    #[tokio::test]
    async fn test_http_backend_end_to_end() {
        let state = state_with(Some("t0k"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let backend = HttpBackend::new(format!("http://{addr}"), Some("t0k".into()));
        let users = backend.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].display_name, "Alice");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = backend.channel(Duration::from_millis(50));
        let handle = channel
            .subscribe(
                &"A".into(),
                Box::new(move |m| {
                    let _ = tx.send(m);
                }),
            )
            .unwrap();
        // Give the stream time to connect before inserting.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let echo = backend
            .create(&"U".into(), &"A".into(), "over the wire")
            .await
            .unwrap()
            .unwrap();
        let live = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live, echo);

        let thread = backend.query_by_pair(&"A".into(), &"U".into()).await.unwrap();
        assert_eq!(thread, vec![echo]);
        channel.unsubscribe(&handle);

        let renamed = backend
            .update_user(
                &"A".into(),
                &ProfileUpdate {
                    name: Some("Alice B.".into()),
                    role: Some(Role::Investor),
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.uuid, ParticipantId::from("A"));
        assert_eq!(renamed.id, "2");
        assert_eq!(renamed.display_name, "Alice B.");
        assert_eq!(renamed.role, Some(Role::Investor));
        assert_eq!(backend.list_users().await.unwrap()[1].display_name, "Alice B.");

        let unauthorized = HttpBackend::new(format!("http://{addr}"), None);
        assert!(matches!(
            unauthorized.list_users().await,
            Err(ServiceError::Status { status: 401, .. })
        ));
    }
}
