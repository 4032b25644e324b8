//! Client side of a tool session.
//!
//! A [`ClientSession`] owns one transport connection, issues calls through a
//! [`Dispatcher`], and runs a background pump that routes incoming envelopes
//! to waiting callers. Clones share the same connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::client::RemoteTool;
use crate::dispatcher::Dispatcher;
use crate::envelope::{Envelope, ErrorKind, LIST_TOOLS, Notification, PING, RequestId};
use crate::error::{Error, Result};
use crate::registry::{ToolDescriptor, ToolList};
use crate::transport::{EnvelopeStream, HttpTransport, Transport};

/// Client session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default deadline for a single call.
    pub call_timeout: Duration,
    /// Close the session after this long without traffic. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent outstanding calls; further calls wait.
    pub max_in_flight: usize,
    /// Deadline for each HTTP request made by the transport.
    pub request_timeout: Duration,
    /// Extra headers sent with every HTTP request.
    pub headers: Vec<(String, String)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(300)),
            max_in_flight: 64,
            request_timeout: Duration::from_secs(30),
            headers: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    notifications: broadcast::Sender<Notification>,
    permits: Semaphore,
    last_activity: Mutex<Instant>,
    shut: AtomicBool,
    closed: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an open tool session.
///
/// Dropping the last clone closes the session as if [`close`](Self::close)
/// had been called, without waiting for the pump to finish.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
    _owner: Arc<DropGuard>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ClientSession {
    /// Open a session against a tool host over HTTP.
    pub async fn connect(endpoint: &str, config: SessionConfig) -> Result<Self> {
        let (transport, stream) = HttpTransport::open(endpoint, &config).await?;
        tracing::info!(
            session = %transport.session_id(),
            server = %transport.info().server.name,
            %endpoint,
            "connected to tool host"
        );
        Ok(Self::start(Arc::new(transport), stream, config))
    }

    /// Run a session over an already-open transport.
    pub fn start(
        transport: Arc<dyn Transport>,
        stream: EnvelopeStream,
        config: SessionConfig,
    ) -> Self {
        let (notifications, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            transport,
            dispatcher: Arc::new(Dispatcher::new()),
            permits: Semaphore::new(config.max_in_flight.max(1)),
            config,
            notifications,
            last_activity: Mutex::new(Instant::now()),
            shut: AtomicBool::new(false),
            closed: CancellationToken::new(),
            pump: Mutex::new(None),
        });
        let owner = Arc::new(inner.closed.clone().drop_guard());
        let handle = tokio::spawn(pump(Arc::clone(&inner), stream));
        *inner.pump.lock() = Some(handle);
        Self {
            inner,
            _owner: owner,
        }
    }

    pub fn id(&self) -> &str {
        self.inner.transport.session_id()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of calls awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight()
    }

    /// Receive notifications pushed by the host, such as progress updates.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Invoke a remote tool with the session's default timeout.
    pub async fn call(&self, tool: &str, params: Value) -> Result<Value> {
        self.call_inner(tool, params, self.inner.config.call_timeout, None)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        tool: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.call_inner(tool, params, timeout, None).await
    }

    /// Invoke a remote tool, giving up when `cancel` fires.
    ///
    /// The host is told about the cancellation; a response that still
    /// arrives is discarded.
    pub async fn call_with_cancel(
        &self,
        tool: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        self.call_inner(tool, params, self.inner.config.call_timeout, Some(cancel))
            .await
    }

    /// Ask the host for its tool descriptors.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let value = self.call(LIST_TOOLS, json!({})).await?;
        let list: ToolList = serde_json::from_value(value)
            .map_err(|e| Error::Malformed(format!("tool list: {e}")))?;
        Ok(list.tools)
    }

    /// List the host's tools as callable handles bound to this session.
    pub async fn discover(&self) -> Result<Vec<RemoteTool>> {
        let tools = self.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|d| RemoteTool::new(d, self.clone()))
            .collect())
    }

    /// Round-trip a no-op request, returning the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let started = std::time::Instant::now();
        self.call(PING, json!({})).await?;
        Ok(started.elapsed())
    }

    /// Close the session. Pending calls fail with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        self.inner.shutdown("closed by client").await;
        let handle = self.inner.pump.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn call_inner(
        &self,
        tool: &str,
        params: Value,
        timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        let inner = &self.inner;
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let _permit = inner
            .permits
            .acquire()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let id = inner.dispatcher.next_id();
        let (guard, rx) = inner.dispatcher.register(id.clone(), tool)?;
        tracing::debug!(session = %self.id(), %id, %tool, "calling tool");

        if let Err(e) = inner
            .transport
            .send(&Envelope::request(id.clone(), tool, params))
            .await
        {
            if e.is_session_fatal() {
                inner.shutdown(&format!("send failed: {e}")).await;
            }
            return Err(e);
        }
        inner.touch();

        let cancel = cancel.unwrap_or_default();
        let outcome = tokio::select! {
            received = tokio::time::timeout(timeout, rx) => match received {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::ConnectionClosed),
                Err(_) => {
                    tracing::debug!(%id, %tool, ?timeout, "call timed out");
                    inner.notify_cancelled(&id).await;
                    Err(Error::Timeout(timeout))
                }
            },
            _ = cancel.cancelled() => {
                inner.notify_cancelled(&id).await;
                Err(Error::Cancelled)
            }
        };
        drop(guard);
        outcome
    }
}

impl Inner {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.config
            .idle_timeout
            .map(|idle| *self.last_activity.lock() + idle)
    }

    async fn notify_cancelled(&self, id: &RequestId) {
        if !self.dispatcher.cancel(id) || self.closed.is_cancelled() {
            return;
        }
        let note = Notification::cancelled(id);
        if let Err(e) = self.transport.send(&note.into()).await {
            tracing::debug!(%id, error = %e, "cancel notification not delivered");
        }
    }

    async fn shutdown(&self, reason: &str) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        self.permits.close();
        let failed = self.dispatcher.close_all();
        self.transport.close().await;
        tracing::info!(
            session = %self.transport.session_id(),
            %reason,
            failed_calls = failed,
            "session closed"
        );
    }

    async fn handle_incoming(&self, envelope: Envelope) {
        self.touch();
        match envelope {
            Envelope::Response { .. } | Envelope::Error { .. } => {
                self.dispatcher.resolve(envelope);
            }
            Envelope::Notification(note) => {
                tracing::trace!(method = %note.method, "notification");
                let _ = self.notifications.send(note);
            }
            Envelope::Request { id, tool, .. } => {
                tracing::debug!(%id, %tool, "rejecting host-initiated request");
                let reply = Envelope::error(
                    id,
                    ErrorKind::InvalidRequest,
                    "client does not serve tools",
                );
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    if let Err(e) = transport.send(&reply).await {
                        tracing::debug!(error = %e, "reply to host request failed");
                    }
                });
            }
        }
    }
}

async fn pump(inner: Arc<Inner>, mut stream: EnvelopeStream) {
    let reason = loop {
        let deadline = inner.idle_deadline();
        tokio::select! {
            _ = inner.closed.cancelled() => break "closed by client".to_string(),
            next = stream.next() => match next {
                Some(Ok(envelope)) => inner.handle_incoming(envelope).await,
                Some(Err(Error::Malformed(reason))) => {
                    tracing::warn!(
                        session = %inner.transport.session_id(),
                        %reason,
                        "dropping malformed envelope"
                    );
                }
                Some(Err(e)) => break format!("stream error: {e}"),
                None => break "event stream ended".to_string(),
            },
            _ = idle(deadline) => {
                if inner.dispatcher.in_flight() == 0 {
                    break "idle timeout".to_string();
                }
                inner.touch();
            }
        }
    };
    inner.shutdown(&reason).await;
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;

    /// Loopback transport: every request is answered by `respond`.
    struct Loopback {
        incoming: mpsc::UnboundedSender<Result<Envelope>>,
        sent: Mutex<Vec<Envelope>>,
        respond: fn(&Envelope) -> Option<Envelope>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Transport for Loopback {
        fn session_id(&self) -> &str {
            "loopback"
        }

        async fn send(&self, envelope: &Envelope) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            self.sent.lock().push(envelope.clone());
            if let Some(reply) = (self.respond)(envelope) {
                let _ = self.incoming.send(Ok(reply));
            }
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn receiver_stream(mut rx: mpsc::UnboundedReceiver<Result<Envelope>>) -> EnvelopeStream {
        Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        })
    }

    fn session(
        respond: fn(&Envelope) -> Option<Envelope>,
        config: SessionConfig,
    ) -> (ClientSession, Arc<Loopback>, mpsc::UnboundedSender<Result<Envelope>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Loopback {
            incoming: tx.clone(),
            sent: Mutex::new(Vec::new()),
            respond,
            closed: AtomicBool::new(false),
        });
        let session = ClientSession::start(transport.clone(), receiver_stream(rx), config);
        (session, transport, tx)
    }

    fn echo(envelope: &Envelope) -> Option<Envelope> {
        match envelope {
            Envelope::Request { id, params, .. } => {
                Some(Envelope::response(id.clone(), params.clone()))
            }
            _ => None,
        }
    }

    fn silent(_: &Envelope) -> Option<Envelope> {
        None
    }

    #[tokio::test]
    async fn call_returns_response() {
        let (session, _, _) = session(echo, SessionConfig::default());
        let out = session.call("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn timeout_sends_cancel_and_discards_late_reply() {
        let (session, transport, incoming) = session(silent, SessionConfig::default());
        let err = session
            .call_with_timeout("slow", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(session.in_flight(), 0);

        let sent = transport.sent.lock().clone();
        assert!(matches!(
            &sent[1],
            Envelope::Notification(n) if n.method == crate::envelope::METHOD_CANCELLED
        ));

        // Late response for the abandoned call is dropped; the session stays usable.
        incoming.send(Ok(Envelope::response("c-1", json!(1)))).unwrap();
        assert!(session.is_open());
    }

    fn echo_except_slow(envelope: &Envelope) -> Option<Envelope> {
        match envelope {
            Envelope::Request { tool, .. } if tool == "slow" => None,
            other => echo(other),
        }
    }

    #[tokio::test]
    async fn late_reply_does_not_reach_next_call() {
        let (session, _, incoming) = session(echo_except_slow, SessionConfig::default());
        let err = session
            .call_with_timeout("slow", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Queued ahead of the next call's reply, so the pump must discard it first.
        incoming.send(Ok(Envelope::response("c-1", json!("late")))).unwrap();
        let out = session.call("echo", json!({"n": 2})).await.unwrap();
        assert_eq!(out, json!({"n": 2}));
        assert!(session.is_open());
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_token_aborts_call() {
        let (session, _, _) = session(silent, SessionConfig::default());
        let token = CancellationToken::new();
        let call = {
            let session = session.clone();
            let token = token.clone();
            tokio::spawn(async move { session.call_with_cancel("slow", json!({}), token).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert!(matches!(call.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let (session, _, _incoming) = session(silent, SessionConfig::default());
        let call = {
            let session = session.clone();
            tokio::spawn(async move { session.call("slow", json!({})).await })
        };
        while session.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        session.close().await;
        assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(!session.is_open());
        assert!(matches!(
            session.call("add", json!({})).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn close_fails_every_pending_call() {
        let (session, _, _incoming) = session(silent, SessionConfig::default());
        let calls: Vec<_> = (0..7)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move { session.call("slow", json!({ "i": i })).await })
            })
            .collect();
        while session.in_flight() < 7 {
            tokio::task::yield_now().await;
        }

        session.close().await;
        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed)));
        }
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropping_last_handle_closes_session() {
        let config = SessionConfig::default().with_idle_timeout(None);
        let (session, transport, _incoming) = session(echo, config);
        let clone = session.clone();
        drop(session);
        assert!(clone.is_open());

        drop(clone);
        while !transport.closed.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn host_request_is_rejected() {
        let (session, transport, incoming) = session(echo, SessionConfig::default());
        incoming
            .send(Ok(Envelope::request("h-1", "ask", json!({}))))
            .unwrap();

        let out = session.call("echo", json!(3)).await.unwrap();
        assert_eq!(out, json!(3));
        loop {
            let rejected = transport.sent.lock().iter().any(|e| match e {
                Envelope::Error { id, error } => {
                    id.as_str() == "h-1" && error.kind == ErrorKind::InvalidRequest
                }
                _ => false,
            });
            if rejected {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn transport_error_is_fatal() {
        let (session, _, incoming) = session(silent, SessionConfig::default());
        incoming
            .send(Err(Error::transport("connection reset")))
            .unwrap();
        while session.is_open() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_closes() {
        let config = SessionConfig::default().with_idle_timeout(Some(Duration::from_secs(5)));
        let (session, transport, _incoming) = session(echo, config);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!session.is_open());
        assert!(transport.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn notifications_are_broadcast() {
        let (session, _, incoming) = session(silent, SessionConfig::default());
        let mut rx = session.subscribe();
        let id = RequestId::new("c-1");
        incoming
            .send(Ok(Notification::progress(&id, "steps", json!(50)).into()))
            .unwrap();
        let note = rx.recv().await.unwrap();
        assert_eq!(note.params["data"], json!(50));
    }

    #[tokio::test]
    async fn malformed_envelope_is_not_fatal() {
        let (session, _, incoming) = session(echo, SessionConfig::default());
        incoming
            .send(Err(Error::Malformed("bad".into())))
            .unwrap();
        let out = session.call("echo", json!(2)).await.unwrap();
        assert_eq!(out, json!(2));
    }

    #[test]
    fn config_builders() {
        let config = SessionConfig::default()
            .with_max_in_flight(0)
            .with_header("authorization", "Bearer x");
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.headers.len(), 1);
    }
}
