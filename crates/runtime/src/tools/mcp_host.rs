//! Tool host backed by a remote tool session.

use super::{ToolError, ToolHost};
use crate::model::{ToolCall, ToolSpec};
use mcp::{ClientSession, SessionConfig};
use serde_json::Value;

/// Tool host that forwards calls over a [`ClientSession`].
pub struct McpToolHost {
    session: ClientSession,
    specs: Vec<ToolSpec>,
}

impl McpToolHost {
    /// Connect to a tool host and cache its tool specs.
    pub async fn connect(endpoint: &str, config: SessionConfig) -> Result<Self, mcp::Error> {
        let session = ClientSession::connect(endpoint, config).await?;
        Self::from_session(session).await
    }

    /// Wrap an open session, discovering its tools.
    pub async fn from_session(session: ClientSession) -> Result<Self, mcp::Error> {
        let specs = session
            .list_tools()
            .await?
            .into_iter()
            .map(ToolSpec::from)
            .collect();
        Ok(Self { session, specs })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

impl ToolHost for McpToolHost {
    fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    async fn execute(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let params = match &call.input {
            Value::Null => Value::Object(Default::default()),
            input => input.clone(),
        };
        self.session
            .call(&call.name, params)
            .await
            .map_err(ToolError::from)
    }
}
