//! Where the agent's tool calls run.

use std::future::Future;

use serde_json::Value;

use crate::model::{ToolCall, ToolSpec};
use crate::tools::ToolError;

/// Source of tool definitions and executor of tool calls.
///
/// [`ToolError::is_fatal`] errors end the agent run; every other error is
/// reported back to the model as a failed result.
pub trait ToolHost: Send + Sync {
    /// Tools offered to the model.
    fn specs(&self) -> &[ToolSpec];

    fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.specs().iter().find(|spec| spec.name == name)
    }

    fn execute(&self, call: &ToolCall) -> impl Future<Output = Result<Value, ToolError>> + Send;
}
