//! Tool registry: named handlers with JSON Schema contracts.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use jsonschema::Validator;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, Notification, RequestId};
use crate::error::{Error, Result};

/// Longest accepted tool name.
pub const MAX_TOOL_NAME_LEN: usize = 128;

/// Error type returned by tool handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Public description of a tool, as returned by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema,
            output_schema: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// Result of the reserved tool-listing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolList {
    pub tools: Vec<ToolDescriptor>,
}

/// Per-invocation context handed to async handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    tool: String,
    request_id: RequestId,
    session_id: Option<String>,
    notifier: Option<mpsc::Sender<Envelope>>,
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(tool: impl Into<String>, request_id: RequestId) -> Self {
        Self {
            tool: tool.into(),
            request_id,
            session_id: None,
            notifier: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_notifier(mut self, notifier: mpsc::Sender<Envelope>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Emit a progress notification to the caller's session.
    ///
    /// Does nothing when the invocation is not attached to a session.
    pub async fn progress(&self, data: Value) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let note = Notification::progress(&self.request_id, &self.tool, data);
        if notifier.send(note.into()).await.is_err() {
            tracing::debug!(
                tool = %self.tool,
                id = %self.request_id,
                "progress dropped, session gone"
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the caller has cancelled this invocation.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

type HandlerResult = std::result::Result<Value, HandlerError>;
type BlockingFn = dyn Fn(Value) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Value, ToolContext) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A tool implementation.
#[derive(Clone)]
pub enum ToolHandler {
    /// Synchronous function, run on the blocking thread pool.
    Blocking(Arc<BlockingFn>),
    /// Async function with access to the invocation context.
    Async(Arc<AsyncFn>),
}

impl std::fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("ToolHandler::Blocking"),
            Self::Async(_) => f.write_str("ToolHandler::Async"),
        }
    }
}

/// Parameters that passed schema validation but not deserialization.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InvalidParams(String);

impl ToolHandler {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |params, ctx| f(params, ctx).boxed()))
    }

    /// Async handler over typed parameters and result.
    pub fn typed<P, R, F, Fut>(f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::from_async(move |params, ctx| {
            let f = Arc::clone(&f);
            async move {
                let params: P = serde_json::from_value(params)
                    .map_err(|e| Box::new(InvalidParams(e.to_string())) as HandlerError)?;
                let result = f(params, ctx).await?;
                Ok(serde_json::to_value(result)?)
            }
        })
    }

    async fn run(&self, tool: &str, params: Value, ctx: ToolContext) -> Result<Value> {
        let outcome = match self {
            Self::Blocking(f) => {
                let f = Arc::clone(f);
                match tokio::task::spawn_blocking(move || f(params)).await {
                    Ok(outcome) => outcome,
                    Err(e) => return Err(handler_failed(tool, format!("handler panicked: {e}"))),
                }
            }
            Self::Async(f) => {
                // `f` is called inside the guard so eager panics are caught too.
                let f = Arc::clone(f);
                let fut = async move { f(params, ctx).await };
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(handler_failed(tool, "handler panicked")),
                }
            }
        };

        outcome.map_err(|e| match e.downcast_ref::<InvalidParams>() {
            Some(invalid) => Error::Validation {
                tool: tool.to_string(),
                message: invalid.0.clone(),
            },
            None => handler_failed(tool, e.to_string()),
        })
    }
}

fn handler_failed(tool: &str, message: impl Into<String>) -> Error {
    Error::Handler {
        tool: tool.to_string(),
        message: message.into(),
    }
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
    input: Validator,
    output: Option<Validator>,
}

/// Thread-safe map of tool name to handler.
///
/// Registration may happen while invocations are in flight; an invocation
/// keeps using the entry it resolved even if the tool is unregistered.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Names are unique; schemas must compile.
    pub fn register(&self, descriptor: ToolDescriptor, handler: ToolHandler) -> Result<()> {
        validate_name(&descriptor.name)?;

        let input = compile(&descriptor.name, &descriptor.input_schema)?;
        let output = descriptor
            .output_schema
            .as_ref()
            .map(|schema| compile(&descriptor.name, schema))
            .transpose()?;

        let mut tools = self.tools.write();
        if tools.contains_key(&descriptor.name) {
            return Err(Error::DuplicateTool(descriptor.name));
        }
        tracing::debug!(tool = %descriptor.name, "registered tool");
        tools.insert(
            descriptor.name.clone(),
            Arc::new(RegisteredTool {
                descriptor,
                handler,
                input,
                output,
            }),
        );
        Ok(())
    }

    /// Remove a tool. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.read().get(name).map(|t| t.descriptor.clone())
    }

    /// Descriptors of all registered tools, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<_> = self
            .tools
            .read()
            .values()
            .map(|t| t.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Validate `params`, run the handler, and validate its result.
    ///
    /// The handler is never called with parameters that fail the input
    /// schema. Cancelling the context's token abandons the handler.
    pub async fn invoke(&self, name: &str, params: Value, ctx: ToolContext) -> Result<Value> {
        let tool = self
            .tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        check(&tool.input, &params).map_err(|message| Error::Validation {
            tool: name.to_string(),
            message,
        })?;

        let cancel = ctx.cancel.clone();
        let result = tokio::select! {
            result = tool.handler.run(name, params, ctx) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        if let Some(output) = &tool.output {
            check(output, &result).map_err(|message| {
                handler_failed(name, format!("result does not match output schema: {message}"))
            })?;
        }
        Ok(result)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.descriptors())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_TOOL_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidToolName(name.to_string()))
    }
}

fn compile(tool: &str, schema: &Value) -> Result<Validator> {
    jsonschema::validator_for(schema).map_err(|e| Error::InvalidSchema {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

fn check(validator: &Validator, value: &Value) -> std::result::Result<(), String> {
    if validator.is_valid(value) {
        return Ok(());
    }
    let msg = validator
        .iter_errors(value)
        .take(5)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    if msg.is_empty() {
        Err("invalid value".to_string())
    } else {
        Err(msg)
    }
}
