//! Protocol envelopes exchanged over a session.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Reserved request name for tool discovery.
pub const LIST_TOOLS: &str = "tools/list";

/// Reserved request name for a liveness check.
pub const PING: &str = "session/ping";

/// Notification sent by a client that gave up on one of its calls.
pub const METHOD_CANCELLED: &str = "cancelled";

/// Notification streamed by a running tool handler.
pub const METHOD_PROGRESS: &str = "tools/progress";

/// Request identifier, unique within a session while the call is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Category of a failed call, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    Validation,
    Handler,
    Cancelled,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::Validation => "validation",
            Self::Handler => "handler",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "unknown_tool" => Self::UnknownTool,
            "validation" => Self::Validation,
            "handler" => Self::Handler,
            "cancelled" => Self::Cancelled,
            "invalid_request" => Self::InvalidRequest,
            "internal" => Self::Internal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = self.kind;
        let message = &self.message;
        write!(f, "[{kind}] {message}")
    }
}

impl std::error::Error for ErrorBody {}

/// A one-way message with no response.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Tell the host that the caller abandoned request `id`.
    pub fn cancelled(id: &RequestId) -> Self {
        Self::new(METHOD_CANCELLED, json!({ "id": id }))
    }

    /// Progress update from the handler serving request `id`.
    pub fn progress(id: &RequestId, tool: &str, data: Value) -> Self {
        Self::new(
            METHOD_PROGRESS,
            json!({ "id": id, "tool": tool, "data": data }),
        )
    }

    /// The request this notification refers to, if it carries one.
    pub fn request_id(&self) -> Option<RequestId> {
        self.params
            .get("id")
            .and_then(Value::as_str)
            .map(RequestId::from)
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: RequestId,
        tool: String,
        params: Value,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    Error {
        id: RequestId,
        error: ErrorBody,
    },
    Notification(Notification),
}

impl Envelope {
    pub fn request(id: impl Into<RequestId>, tool: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id: id.into(),
            tool: tool.into(),
            params,
        }
    }

    pub fn response(id: impl Into<RequestId>, result: Value) -> Self {
        Self::Response {
            id: id.into(),
            result,
        }
    }

    pub fn error(id: impl Into<RequestId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            id: id.into(),
            error: ErrorBody::new(kind, message),
        }
    }

    /// Identifier of the call this envelope belongs to. Notifications have none.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } | Self::Error { id, .. } => {
                Some(id)
            }
            Self::Notification(_) => None,
        }
    }

    /// Wire name of the envelope type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Notification(_) => "notification",
        }
    }
}

impl From<Notification> for Envelope {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}
