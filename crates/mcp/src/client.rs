//! Remote tools bound to a session.

use std::time::Duration;

use serde_json::Value;

use crate::error::Result;
use crate::registry::ToolDescriptor;
use crate::session::ClientSession;

/// A tool discovered on a host, callable like a local function.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    descriptor: ToolDescriptor,
    session: ClientSession,
}

impl RemoteTool {
    pub fn new(descriptor: ToolDescriptor, session: ClientSession) -> Self {
        Self {
            descriptor,
            session,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn description(&self) -> Option<&str> {
        self.descriptor.description.as_deref()
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub async fn call(&self, params: Value) -> Result<Value> {
        self.session.call(&self.descriptor.name, params).await
    }

    pub async fn call_with_timeout(&self, params: Value, timeout: Duration) -> Result<Value> {
        self.session
            .call_with_timeout(&self.descriptor.name, params, timeout)
            .await
    }
}
