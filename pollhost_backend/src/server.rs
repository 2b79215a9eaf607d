use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::poll::{PollOption, PollSnapshot};
use crate::state::{ConversationState, SharedConversation};
use crate::store::{HostDatabase, InboundMessage, OutboundReply};
use crate::workers::HostEvent;

const DEFAULT_REPLY_LIMIT: usize = 50;
const MAX_REPLY_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ServerState {
    pub db: HostDatabase,
    pub conversation: SharedConversation,
    pub poll_document_id: String,
    pub auth: ApiAuth,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

/// Who may call the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiAuth {
    /// Every request must carry `Authorization: Bearer <token>`.
    Bearer(String),
    Open,
}

impl ApiAuth {
    /// From `POLLHOST_API_AUTH_MODE` (`required` by default, or `disabled`)
    /// and `POLLHOST_API_TOKEN`.
    pub fn from_env() -> Result<Self> {
        Self::from_settings(
            std::env::var("POLLHOST_API_AUTH_MODE").ok().as_deref(),
            std::env::var("POLLHOST_API_TOKEN").ok().as_deref(),
        )
    }

    fn from_settings(mode: Option<&str>, token: Option<&str>) -> Result<Self> {
        match mode.map(str::trim).unwrap_or("required") {
            "required" | "" => token
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(|token| ApiAuth::Bearer(token.to_string()))
                .ok_or_else(|| anyhow!("POLLHOST_API_TOKEN must be set unless auth is disabled")),
            "disabled" => {
                tracing::warn!("API auth is disabled; anyone who can reach the port can post");
                Ok(ApiAuth::Open)
            }
            other => Err(anyhow!(
                "Invalid POLLHOST_API_AUTH_MODE '{}' (expected 'required' or 'disabled')",
                other
            )),
        }
    }

    fn permits(&self, headers: &HeaderMap) -> bool {
        let ApiAuth::Bearer(expected) = self else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().strip_prefix("Bearer "))
            .is_some_and(|presented| presented == expected)
    }
}

/// Handler failures, rendered as `{"error": ...}` with a matching status.
#[derive(Debug)]
enum ApiError {
    BadRequest(&'static str),
    NotFound(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::Internal(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(message) => message.to_string(),
            ApiError::NotFound(message) => message,
            ApiError::Internal(error) => {
                tracing::error!("API request failed: {:#}", error);
                format!("{:#}", error)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListRepliesQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    voter: String,
}

#[derive(Debug, Deserialize)]
struct PutPollRequest {
    question: String,
    #[serde(default)]
    options: BTreeMap<String, PollOption>,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    poll: PollSnapshot,
    summary: String,
    total_votes: usize,
}

/// Serve the ingestion/inspection API until the listener fails.
pub async fn serve_api(
    bind: &str,
    state: Arc<ServerState>,
    event_rx: flume::Receiver<HostEvent>,
) -> Result<()> {
    let bind_addr = bind
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid api_bind '{}' (expected host:port)", bind))?;

    spawn_event_bridge(event_rx, state.ws_events.clone());

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", bind_addr))?;
    tracing::info!("pollhost API listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("API server failed")?;
    Ok(())
}

pub fn build_state(
    db: HostDatabase,
    conversation: SharedConversation,
    poll_document_id: String,
) -> Result<Arc<ServerState>> {
    let auth = ApiAuth::from_env()?;
    let (ws_events, _) = broadcast::channel(512);
    Ok(Arc::new(ServerState {
        db,
        conversation,
        poll_document_id,
        auth,
        ws_events,
    }))
}

fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/messages", post(post_message))
        .route("/messages/:id", get(get_message))
        .route("/replies", get(list_replies))
        .route("/replies/:id", get(get_reply))
        .route("/poll", get(get_poll).put(put_poll))
        .route("/poll/options/:label/votes", post(cast_vote))
        .route("/state", get(get_state))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<HostEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_host_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

pub fn map_host_event(event: HostEvent) -> ApiEventEnvelope {
    match event {
        HostEvent::BacklogDrained { count } => {
            envelope("backlog_drained", serde_json::json!({ "count": count }))
        }
        HostEvent::ReplyWritten { message_id, reply } => envelope(
            "reply_written",
            serde_json::json!({ "message_id": message_id, "reply": reply }),
        ),
        HostEvent::PromptEmitted {
            kind,
            reply_id,
            text,
        } => envelope(
            "prompt_emitted",
            serde_json::json!({ "kind": kind, "reply_id": reply_id, "text": text }),
        ),
        HostEvent::SummaryRefreshed(summary) => {
            envelope("summary_refreshed", serde_json::json!({ "summary": summary }))
        }
        HostEvent::WorkerStopped { worker, exit } => envelope(
            "worker_stopped",
            serde_json::json!({ "worker": worker, "exit": exit }),
        ),
        HostEvent::WorkerFailed { worker, error } => envelope(
            "worker_failed",
            serde_json::json!({ "worker": worker, "error": error }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if !state.auth.permits(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<PostMessageRequest>,
) -> ApiResult<InboundMessage> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("message cannot be empty"));
    }
    Ok(Json(state.db.insert_inbound_message(message)?))
}

async fn get_message(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<InboundMessage> {
    state
        .db
        .get_inbound_message(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("message '{}' not found", id)))
}

async fn list_replies(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListRepliesQuery>,
) -> ApiResult<Vec<OutboundReply>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_REPLY_LIMIT)
        .clamp(1, MAX_REPLY_LIMIT);
    Ok(Json(state.db.list_replies(limit)?))
}

async fn get_reply(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<OutboundReply> {
    state
        .db
        .get_reply(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("reply '{}' not found", id)))
}

fn current_poll(state: &ServerState) -> Result<PollSnapshot, ApiError> {
    state
        .db
        .get_poll(&state.poll_document_id)?
        .ok_or_else(|| ApiError::NotFound(format!("poll '{}' not found", state.poll_document_id)))
}

async fn get_poll(State(state): State<Arc<ServerState>>) -> ApiResult<PollResponse> {
    Ok(Json(poll_response(current_poll(&state)?)))
}

async fn put_poll(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<PutPollRequest>,
) -> ApiResult<PollResponse> {
    if body.question.trim().is_empty() {
        return Err(ApiError::BadRequest("question cannot be empty"));
    }
    let poll = PollSnapshot {
        question: body.question,
        options: body.options,
    };
    state.db.upsert_poll(&state.poll_document_id, &poll)?;
    Ok(Json(poll_response(poll)))
}

async fn cast_vote(
    State(state): State<Arc<ServerState>>,
    Path(label): Path<String>,
    Json(body): Json<VoteRequest>,
) -> ApiResult<PollResponse> {
    let voter = body.voter.trim();
    if voter.is_empty() {
        return Err(ApiError::BadRequest("voter cannot be empty"));
    }
    if !current_poll(&state)?.options.contains_key(&label) {
        return Err(ApiError::NotFound(format!("option '{}' not found", label)));
    }
    let poll = state.db.cast_vote(&state.poll_document_id, &label, voter)?;
    Ok(Json(poll_response(poll)))
}

async fn get_state(State(state): State<Arc<ServerState>>) -> Json<ConversationState> {
    Json(state.conversation.snapshot().await)
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.ws_events.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

/// Pushes every envelope to the client until either side goes away.
async fn stream_events(mut socket: WebSocket, mut rx: broadcast::Receiver<ApiEventEnvelope>) {
    loop {
        let received = tokio::select! {
            received = rx.recv() => received,
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            },
        };

        let envelope = match received {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Event socket fell behind, {} events skipped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Dropping unserializable {} event: {}", envelope.event_type, e);
                continue;
            }
        };
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
}

fn poll_response(poll: PollSnapshot) -> PollResponse {
    PollResponse {
        summary: poll.summary(),
        total_votes: poll.total_votes(),
        poll,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    use crate::store::sqlite::StoreLayout;
    use crate::workers::{PromptKind, WorkerExit, WorkerKind};

    fn test_state(dir: &tempfile::TempDir) -> Arc<ServerState> {
        let db = HostDatabase::new(dir.path().join("api.db"), StoreLayout::default())
            .expect("db init");
        let (ws_events, _) = broadcast::channel(16);
        Arc::new(ServerState {
            db,
            conversation: SharedConversation::new(),
            poll_document_id: "q1".to_string(),
            auth: ApiAuth::Open,
            ws_events,
        })
    }

    fn bearer(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn bearer_auth_checks_the_presented_token() {
        let auth = ApiAuth::Bearer("s3cret".to_string());
        assert!(auth.permits(&bearer("Bearer s3cret")));
        assert!(!auth.permits(&bearer("Bearer wrong")));
        assert!(!auth.permits(&bearer("s3cret")));
        assert!(!auth.permits(&HeaderMap::new()));
        assert!(ApiAuth::Open.permits(&HeaderMap::new()));
    }

    #[test]
    fn auth_settings_require_a_token_unless_disabled() {
        assert_eq!(
            ApiAuth::from_settings(None, Some(" s3cret ")).unwrap(),
            ApiAuth::Bearer("s3cret".to_string())
        );
        assert!(ApiAuth::from_settings(None, None).is_err());
        assert!(ApiAuth::from_settings(Some("required"), Some("  ")).is_err());
        assert_eq!(
            ApiAuth::from_settings(Some("disabled"), None).unwrap(),
            ApiAuth::Open
        );
        assert!(ApiAuth::from_settings(Some("on"), Some("s3cret")).is_err());
    }

    #[test]
    fn host_events_map_to_typed_envelopes() {
        let prompt = map_host_event(HostEvent::PromptEmitted {
            kind: PromptKind::PollUpdate,
            reply_id: "host-prompt".to_string(),
            text: "Votes are in!".to_string(),
        });
        assert_eq!(prompt.event_type, "prompt_emitted");
        assert_eq!(prompt.payload["kind"], "poll_update");
        assert_eq!(prompt.payload["reply_id"], "host-prompt");

        let stopped = map_host_event(HostEvent::WorkerStopped {
            worker: WorkerKind::Message,
            exit: WorkerExit::DeadlineExceeded,
        });
        assert_eq!(stopped.payload["worker"], "message");
        assert_eq!(stopped.payload["exit"], "deadline_exceeded");
        assert!(stopped.emitted_at <= Utc::now());
    }

    #[tokio::test]
    async fn posted_message_lands_unprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let Json(message) = post_message(
            State(state.clone()),
            Json(PostMessageRequest {
                message: "  Is it C?  ".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(message.message, "Is it C?");
        assert!(!message.processed);
        assert_eq!(state.db.get_unprocessed_messages().unwrap().len(), 1);

        let rejected = post_message(
            State(state),
            Json(PostMessageRequest {
                message: "   ".to_string(),
            }),
        )
        .await;
        assert_eq!(rejected.unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn votes_accumulate_through_the_api() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let mut options = BTreeMap::new();
        options.insert(
            "a".to_string(),
            PollOption {
                label: "A".to_string(),
                text: "Paris".to_string(),
                voters: vec![],
            },
        );
        put_poll(
            State(state.clone()),
            Json(PutPollRequest {
                question: "Capital of France?".to_string(),
                options,
            }),
        )
        .await
        .unwrap();

        for voter in ["a", "b", "a"] {
            cast_vote(
                State(state.clone()),
                Path("a".to_string()),
                Json(VoteRequest {
                    voter: voter.to_string(),
                }),
            )
            .await
            .unwrap();
        }

        let Json(response) = get_poll(State(state.clone())).await.unwrap();
        assert_eq!(response.total_votes, 3);
        assert!(response.summary.contains("A - Paris: 3 votes"));

        let missing = cast_vote(
            State(state),
            Path("z".to_string()),
            Json(VoteRequest {
                voter: "c".to_string(),
            }),
        )
        .await;
        assert_eq!(missing.unwrap_err().status(), StatusCode::NOT_FOUND);
    }
}
