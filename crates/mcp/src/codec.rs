//! Envelope encoding and decoding.
//!
//! Envelopes are JSON objects tagged by a `type` field. Unknown fields are
//! ignored so that newer peers can add to the format.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::envelope::{Envelope, ErrorBody, ErrorKind, Notification, RequestId};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorBody>,
}

impl<'a> WireEnvelope<'a> {
    fn bare(kind: &'static str) -> Self {
        Self {
            kind,
            id: None,
            tool: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }
}

/// Serialize an envelope to JSON bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut wire = WireEnvelope::bare(envelope.type_name());
    match envelope {
        Envelope::Request { id, tool, params } => {
            wire.id = Some(id);
            wire.tool = Some(tool);
            wire.params = Some(params);
        }
        Envelope::Response { id, result } => {
            wire.id = Some(id);
            wire.result = Some(result);
        }
        Envelope::Error { id, error } => {
            wire.id = Some(id);
            wire.error = Some(error);
        }
        Envelope::Notification(n) => {
            wire.method = Some(&n.method);
            if !n.params.is_null() {
                wire.params = Some(&n.params);
            }
        }
    }
    Ok(serde_json::to_vec(&wire)?)
}

/// Serialize an envelope to a JSON string, for text framings such as SSE.
pub fn encode_str(envelope: &Envelope) -> Result<String> {
    let bytes = encode(envelope)?;
    String::from_utf8(bytes).map_err(|e| Error::Malformed(e.to_string()))
}

/// Parse JSON bytes into an envelope.
///
/// Fails with [`Error::Malformed`] on invalid JSON, an unknown `type`, or a
/// missing field required by the type.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| Error::Malformed(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(Error::Malformed("envelope is not a JSON object".into()));
    };

    let kind = take_string(&mut obj, "type")?;
    match kind.as_str() {
        "request" => {
            let id = take_id(&mut obj)?;
            let tool = take_string(&mut obj, "tool")?;
            let params = match obj.remove("params") {
                None | Some(Value::Null) => Value::Object(Map::new()),
                Some(v) => v,
            };
            Ok(Envelope::Request { id, tool, params })
        }
        "response" => {
            let id = take_id(&mut obj)?;
            // An explicit null is a valid result.
            let result = obj.remove("result").ok_or_else(|| missing("result"))?;
            Ok(Envelope::Response { id, result })
        }
        "error" => {
            let id = take_id(&mut obj)?;
            let error = take_error(&mut obj)?;
            Ok(Envelope::Error { id, error })
        }
        "notification" => {
            let method = take_string(&mut obj, "method")?;
            let params = obj.remove("params").unwrap_or(Value::Null);
            Ok(Envelope::Notification(Notification { method, params }))
        }
        other => Err(Error::Malformed(format!("unknown envelope type {other:?}"))),
    }
}

fn missing(field: &str) -> Error {
    Error::Malformed(format!("missing field `{field}`"))
}

fn take_string(obj: &mut Map<String, Value>, field: &str) -> Result<String> {
    match obj.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(Error::Malformed(format!("field `{field}` must be a string"))),
        None => Err(missing(field)),
    }
}

fn take_id(obj: &mut Map<String, Value>) -> Result<RequestId> {
    take_string(obj, "id").map(RequestId::from)
}

fn take_error(obj: &mut Map<String, Value>) -> Result<ErrorBody> {
    let Some(Value::Object(mut body)) = obj.remove("error") else {
        return Err(missing("error"));
    };
    let kind = take_string(&mut body, "kind")?;
    let kind = ErrorKind::parse(&kind)
        .ok_or_else(|| Error::Malformed(format!("unknown error kind {kind:?}")))?;
    let message = match body.remove("message") {
        Some(Value::String(s)) => s,
        _ => String::new(),
    };
    Ok(ErrorBody { kind, message })
}
