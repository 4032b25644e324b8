use super::errors::ModelError;
use crate::tools::ToolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// The result the runtime returned from a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success {
        tool_call_id: String,
        output: Value,
    },
    Failure {
        tool_call_id: String,
        error: ToolError,
    },
}

impl ToolResult {
    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::Success { tool_call_id, .. } | Self::Failure { tool_call_id, .. } => tool_call_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A part of a message, which can be text or a tool interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Part {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// A message, consisting of a role and one or more parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// User-side message carrying results of the previous turn's tool calls.
    pub fn tool_results(results: impl IntoIterator<Item = ToolResult>) -> Self {
        Self {
            role: Role::User,
            parts: results.into_iter().map(Part::ToolResult).collect(),
        }
    }

    /// Get combined text content from all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool calls from this message.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl From<mcp::ToolDescriptor> for ToolSpec {
    fn from(descriptor: mcp::ToolDescriptor) -> Self {
        Self {
            name: descriptor.name,
            description: descriptor.description.unwrap_or_default(),
            schema: descriptor.input_schema,
        }
    }
}

/// Whether the model may, must, or must not call tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
}

impl std::str::FromStr for ToolChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "required" => Ok(Self::Required),
            "none" => Ok(Self::None),
            other => Err(format!("unknown tool choice: {other}")),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Everything needed for a model request.
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub tool_choice: ToolChoice,
}

/// The response from a model.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: Message,
    pub usage: Usage,
}

/// Trait for LLM provider backends.
pub trait Backend: Send + Sync {
    fn call(
        &self,
        request: ModelRequest<'_>,
    ) -> impl Future<Output = Result<ModelResponse, ModelError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_extraction() {
        let msg = Message {
            role: Role::Assistant,
            parts: vec![
                Part::Text("Hello ".into()),
                Part::ToolCall(ToolCall {
                    id: "1".into(),
                    name: "add".into(),
                    input: Value::Null,
                }),
                Part::Text("world".into()),
            ],
        };
        assert_eq!(msg.text(), "Hello world");
    }

    #[test]
    fn message_tool_calls_extraction() {
        let msg = Message {
            role: Role::Assistant,
            parts: vec![
                Part::Text("Let me check".into()),
                Part::ToolCall(ToolCall {
                    id: "1".into(),
                    name: "get_current_weather".into(),
                    input: serde_json::json!({"city": "Tokyo"}),
                }),
                Part::ToolCall(ToolCall {
                    id: "2".into(),
                    name: "get_secret_word".into(),
                    input: serde_json::json!({}),
                }),
            ],
        };
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "get_current_weather");
        assert_eq!(calls[1].name, "get_secret_word");
    }

    #[test]
    fn tool_spec_from_descriptor() {
        let descriptor = mcp::ToolDescriptor::new("add", serde_json::json!({"type": "object"}));
        let spec = ToolSpec::from(descriptor);
        assert_eq!(spec.name, "add");
        assert_eq!(spec.description, "");
    }

    #[test]
    fn tool_choice_parses() {
        assert_eq!("required".parse::<ToolChoice>(), Ok(ToolChoice::Required));
        assert!("sometimes".parse::<ToolChoice>().is_err());
    }
}
