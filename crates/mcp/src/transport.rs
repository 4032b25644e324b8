//! Session transport over HTTP with server-sent events.
//!
//! Outgoing envelopes are POSTed one per request. Incoming envelopes arrive on
//! a long-lived SSE stream opened right after the session is created.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::session::SessionConfig;

/// Header carrying the session id on session creation.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// SSE event name used for envelopes.
pub const ENVELOPE_EVENT: &str = "envelope";

/// Incoming envelopes, in arrival order. Ends when the connection drops.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Envelope>> + Send>>;

/// Identity of a tool host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Body of the session creation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub server: ServerInfo,
    pub created_at: DateTime<Utc>,
}

/// Outgoing half of a session connection.
///
/// The incoming half is the [`EnvelopeStream`] returned when the transport
/// is opened.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Session identifier assigned by the host.
    fn session_id(&self) -> &str;

    /// Deliver one envelope to the host.
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Tear down the connection. Safe to call more than once.
    async fn close(&self);
}

/// HTTP + SSE transport.
pub struct HttpTransport {
    http: reqwest::Client,
    session_url: Url,
    info: SessionInfo,
    request_timeout: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl HttpTransport {
    /// Create a session at `endpoint` and attach to its event stream.
    pub async fn open(endpoint: &str, config: &SessionConfig) -> Result<(Self, EnvelopeStream)> {
        let base = base_url(endpoint)?;
        let http = reqwest::Client::builder()
            .default_headers(header_map(endpoint, &config.headers)?)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::connection(endpoint, e))?;

        let resp = http
            .post(join(&base, "sessions")?)
            .timeout(config.request_timeout)
            .send()
            .await
            .map_err(|e| Error::connection(endpoint, e))?;
        if resp.status() != StatusCode::CREATED {
            let status = resp.status();
            return Err(Error::connection(
                endpoint,
                format!("session creation failed: {status}"),
            ));
        }
        let info: SessionInfo = resp
            .json()
            .await
            .map_err(|e| Error::connection(endpoint, e))?;

        let session_url = join(&base, &format!("sessions/{}/", info.session_id))?;
        let resp = http
            .get(join(&session_url, "events")?)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::connection(endpoint, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Error::connection(
                endpoint,
                format!("event stream rejected: {status}"),
            ));
        }

        tracing::debug!(session = %info.session_id, %endpoint, "session opened");

        let shutdown = CancellationToken::new();
        let stream = resp
            .bytes_stream()
            .eventsource()
            .take_until(shutdown.clone().cancelled_owned())
            .filter_map(|event| async move {
                match event {
                    Ok(event) => {
                        if event.data.is_empty()
                            || !(event.event == ENVELOPE_EVENT || event.event == "message")
                        {
                            return None;
                        }
                        Some(codec::decode(event.data.as_bytes()))
                    }
                    Err(e) => Some(Err(Error::transport(e))),
                }
            });

        let transport = Self {
            http,
            session_url,
            info,
            request_timeout: config.request_timeout,
            closed: AtomicBool::new(false),
            shutdown,
        };
        Ok((transport, Box::pin(stream)))
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn session_id(&self) -> &str {
        &self.info.session_id
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let body = codec::encode(envelope)?;
        let resp = self
            .http
            .post(join(&self.session_url, "messages")?)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
            .body(body)
            .send()
            .await
            .map_err(Error::transport)?;

        match resp.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::ConnectionClosed),
            StatusCode::BAD_REQUEST => {
                let reason = resp.text().await.unwrap_or_default();
                Err(Error::Malformed(format!("rejected by host: {reason}")))
            }
            status => Err(Error::transport(format!("unexpected status {status}"))),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let url = self.session_url.as_str().trim_end_matches('/').to_string();
        let result = self
            .http
            .delete(url)
            .timeout(self.request_timeout)
            .send()
            .await;
        match result {
            Ok(resp) => {
                tracing::debug!(
                    session = %self.info.session_id,
                    status = %resp.status(),
                    "session deleted"
                )
            }
            Err(e) => {
                tracing::debug!(
                    session = %self.info.session_id,
                    error = %e,
                    "session delete failed"
                )
            }
        }
    }
}

fn base_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).map_err(|e| Error::connection(endpoint, e))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::connection(base.as_str(), e))
}

fn header_map(endpoint: &str, headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::connection(endpoint, format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::connection(endpoint, format!("header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}
