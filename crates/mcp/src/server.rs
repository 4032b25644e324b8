//! Tool host: serves a [`ToolRegistry`] to remote sessions over HTTP + SSE.
//!
//! Routes:
//!
//! - `POST /sessions` creates a session
//! - `GET /sessions/{id}/events` attaches the outbound event stream
//! - `POST /sessions/{id}/messages` delivers one envelope
//! - `DELETE /sessions/{id}` ends a session
//! - `GET /health` reports liveness

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::codec;
use crate::envelope::{
    Envelope, ErrorKind, LIST_TOOLS, METHOD_CANCELLED, Notification, PING, RequestId,
};
use crate::error::{Error, Result};
use crate::registry::{ToolContext, ToolList, ToolRegistry};
use crate::transport::{ENVELOPE_EVENT, SESSION_HEADER, ServerInfo, SessionInfo};

/// Tool host settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    /// Handler invocations running at once across all sessions.
    pub max_concurrent_calls: usize,
    /// Sessions with no traffic and no running calls are dropped after this. `None` disables.
    pub session_idle_timeout: Option<Duration>,
    /// Envelopes buffered per session before handlers wait on the event stream.
    pub outbound_buffer: usize,
    /// Interval between SSE keep-alive comments.
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "toolwire".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_concurrent_calls: 64,
            session_idle_timeout: Some(Duration::from_secs(300)),
            outbound_buffer: 256,
            keep_alive: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max.max(1);
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_idle_timeout = timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

struct HostSession {
    id: String,
    created_at: DateTime<Utc>,
    outbound: mpsc::Sender<Envelope>,
    receiver: Mutex<Option<mpsc::Receiver<Envelope>>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    last_activity: Mutex<Instant>,
    closed: CancellationToken,
}

impl HostSession {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn is_idle(&self, idle: Duration) -> bool {
        self.in_flight.lock().is_empty() && self.last_activity.lock().elapsed() >= idle
    }

    fn cancel_call(&self, id: &RequestId) {
        match self.in_flight.lock().remove(id) {
            Some(token) => {
                tracing::debug!(session = %self.id, %id, "call cancelled by client");
                token.cancel();
            }
            None => tracing::debug!(session = %self.id, %id, "cancel for unknown call"),
        }
    }

    async fn reply(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            tracing::debug!(session = %self.id, "reply dropped, event stream gone");
        }
    }
}

struct ServerState {
    registry: Arc<ToolRegistry>,
    config: ServerConfig,
    sessions: RwLock<HashMap<String, Arc<HostSession>>>,
    permits: Arc<Semaphore>,
}

impl ServerState {
    fn session(&self, id: &str) -> Option<Arc<HostSession>> {
        self.sessions.read().get(id).cloned()
    }

    fn remove_session(&self, id: &str, reason: &str) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        session.closed.cancel();
        tracing::info!(session = %id, %reason, "session ended");
        true
    }

    fn close_all(&self, reason: &str) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.remove_session(&id, reason);
        }
    }

    fn reap_idle(&self, idle: Duration) -> usize {
        let idle_ids: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_idle(idle))
            .map(|s| s.id.clone())
            .collect();
        for id in &idle_ids {
            self.remove_session(id, "idle timeout");
        }
        idle_ids.len()
    }
}

/// Ends the session when its event stream is dropped.
struct StreamGuard {
    state: Arc<ServerState>,
    id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.remove_session(&self.id, "event stream closed");
    }
}

/// Clears a call from its session's in-flight table, even if the call task dies.
struct InFlightEntry {
    session: Arc<HostSession>,
    id: RequestId,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.session.in_flight.lock().remove(&self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP tool host.
#[derive(Clone)]
pub struct ToolServer {
    state: Arc<ServerState>,
}

impl ToolServer {
    pub fn new(registry: Arc<ToolRegistry>, config: ServerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_calls.max(1)));
        Self {
            state: Arc::new(ServerState {
                registry,
                config,
                sessions: RwLock::new(HashMap::new()),
                permits,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.state.registry
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.read().len()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/sessions", post(create_session))
            .route("/sessions/{id}", delete(delete_session))
            .route("/sessions/{id}/events", get(attach_events))
            .route("/sessions/{id}/messages", post(post_message))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until `shutdown` resolves. Open sessions are closed on shutdown.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            name = %self.state.config.name,
            tools = self.state.registry.len(),
            "tool host listening"
        );

        let reaper = self.state.config.session_idle_timeout.map(|idle| {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval((idle / 4).max(Duration::from_millis(50)));
                loop {
                    tick.tick().await;
                    state.reap_idle(idle);
                }
            })
        });

        let state = Arc::clone(&self.state);
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                state.close_all("server shutting down");
            })
            .await;

        if let Some(reaper) = reaper {
            reaper.abort();
        }
        result.map_err(Error::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let sessions = state.sessions.read().len();
    Json(json!({ "status": "ok", "sessions": sessions }))
}

async fn create_session(State(state): State<Arc<ServerState>>) -> Response {
    let id = Uuid::new_v4().to_string();
    let (outbound, receiver) = mpsc::channel(state.config.outbound_buffer.max(1));
    let session = Arc::new(HostSession {
        id: id.clone(),
        created_at: Utc::now(),
        outbound,
        receiver: Mutex::new(Some(receiver)),
        in_flight: Mutex::new(HashMap::new()),
        last_activity: Mutex::new(Instant::now()),
        closed: CancellationToken::new(),
    });
    let info = SessionInfo {
        session_id: id.clone(),
        server: ServerInfo {
            name: state.config.name.clone(),
            version: state.config.version.clone(),
        },
        created_at: session.created_at,
    };
    state.sessions.write().insert(id.clone(), session);
    tracing::info!(session = %id, "session created");

    (StatusCode::CREATED, [(SESSION_HEADER, id)], Json(info)).into_response()
}

async fn delete_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.remove_session(&id, "deleted by client") {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn attach_events(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    let Some(session) = state.session(&id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let Some(mut rx) = session.receiver.lock().take() else {
        return (StatusCode::CONFLICT, "event stream already attached").into_response();
    };
    tracing::debug!(session = %id, "event stream attached");

    let closed = session.closed.clone();
    let guard = StreamGuard {
        state: Arc::clone(&state),
        id,
    };
    drop(session);

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => None,
                next = rx.recv() => next,
            };
            let Some(envelope) = next else { break };
            match codec::encode_str(&envelope) {
                Ok(data) => {
                    let event = Event::default().event(ENVELOPE_EVENT).data(data);
                    yield Ok::<_, Infallible>(event);
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode outbound envelope"),
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.config.keep_alive))
        .into_response()
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Some(session) = state.session(&id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let envelope = match codec::decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(session = %id, error = %e, "rejecting malformed message");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    session.touch();

    match envelope {
        Envelope::Request { id, tool, params } => match tool.as_str() {
            LIST_TOOLS => {
                let list = ToolList {
                    tools: state.registry.descriptors(),
                };
                let reply = match serde_json::to_value(list) {
                    Ok(value) => Envelope::response(id, value),
                    Err(e) => Envelope::error(id, ErrorKind::Internal, e.to_string()),
                };
                session.reply(reply).await;
            }
            PING => session.reply(Envelope::response(id, json!({}))).await,
            _ => dispatch(&state, &session, id, tool, params),
        },
        Envelope::Notification(note) => handle_notification(&session, note),
        other => {
            tracing::debug!(
                session = %session.id,
                kind = other.type_name(),
                "ignoring unexpected envelope"
            );
        }
    }
    StatusCode::ACCEPTED.into_response()
}

fn handle_notification(session: &HostSession, note: Notification) {
    if note.method != METHOD_CANCELLED {
        tracing::debug!(session = %session.id, method = %note.method, "ignoring notification");
        return;
    }
    match note.request_id() {
        Some(id) => session.cancel_call(&id),
        None => tracing::debug!(session = %session.id, "cancel notification without id"),
    }
}

/// Run one tool call on its own task, bounded by the server-wide permit pool.
fn dispatch(
    state: &Arc<ServerState>,
    session: &Arc<HostSession>,
    id: RequestId,
    tool: String,
    params: Value,
) {
    let mut in_flight = session.in_flight.lock();
    if in_flight.contains_key(&id) {
        tracing::warn!(session = %session.id, %id, "duplicate request id in flight, dropping");
        return;
    }

    let cancel = session.closed.child_token();
    in_flight.insert(id.clone(), cancel.clone());
    drop(in_flight);

    let ctx = ToolContext::new(tool.clone(), id.clone())
        .with_session(session.id.clone())
        .with_notifier(session.outbound.clone())
        .with_cancel(cancel.clone());
    let registry = Arc::clone(&state.registry);
    let permits = Arc::clone(&state.permits);
    let session = Arc::clone(session);
    let entry = InFlightEntry {
        session: Arc::clone(&session),
        id: id.clone(),
    };

    tokio::spawn(async move {
        let permit = tokio::select! {
            permit = permits.acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        let outcome = match permit {
            Some(_permit) => {
                let started = Instant::now();
                let outcome = registry.invoke(&tool, params, ctx).await;
                tracing::debug!(
                    session = %session.id,
                    %id,
                    %tool,
                    ok = outcome.is_ok(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "call finished"
                );
                outcome
            }
            None => Err(Error::Cancelled),
        };
        drop(entry);

        let reply = match outcome {
            Ok(result) => Envelope::response(id, result),
            Err(e) => Envelope::Error {
                id,
                error: e.to_error_body(),
            },
        };
        session.reply(reply).await;
    });
}
