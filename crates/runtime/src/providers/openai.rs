//! OpenAI-compatible chat completions backend.

use crate::model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, ToolCall, ToolChoice,
    ToolResult, ToolSpec, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ApiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an OpenAI backend.
#[derive(Debug, Clone)]
pub struct OpenAiBackendBuilder {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: Option<u32>,
}

impl OpenAiBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: None,
        }
    }

    /// Point at any OpenAI-compatible server.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn build(self) -> OpenAiBackend {
        OpenAiBackend {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            endpoint: format!("{}/chat/completions", self.base_url.trim_end_matches('/')),
            max_tokens: self.max_tokens,
        }
    }
}

/// OpenAI chat completions backend.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_tokens: Option<u32>,
}

impl OpenAiBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> OpenAiBackendBuilder {
        OpenAiBackendBuilder::new(api_key, model)
    }

    fn messages_to_api(messages: &[Message]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg.role {
                Role::System => out.push(ApiMessage::text("system", msg.text())),
                Role::Assistant => {
                    let text = msg.text();
                    let tool_calls = msg
                        .tool_calls()
                        .into_iter()
                        .map(|call| ApiToolCall {
                            id: call.id,
                            call_type: function_type(),
                            function: ApiFunctionCall {
                                name: call.name,
                                arguments: call.input.to_string(),
                            },
                        })
                        .collect();
                    out.push(ApiMessage {
                        role: "assistant",
                        content: (!text.is_empty()).then_some(text),
                        tool_calls,
                        tool_call_id: None,
                    });
                }
                Role::User => {
                    // Tool results become one `tool` message each; any text follows them.
                    for part in &msg.parts {
                        if let Part::ToolResult(result) = part {
                            out.push(Self::tool_result_to_api(result));
                        }
                    }
                    let text = msg.text();
                    if !text.is_empty() {
                        out.push(ApiMessage::text("user", text));
                    }
                }
            }
        }
        out
    }

    fn tool_result_to_api(result: &ToolResult) -> ApiMessage {
        let (id, content) = match result {
            ToolResult::Success {
                tool_call_id,
                output,
            } => (tool_call_id.clone(), output.to_string()),
            ToolResult::Failure {
                tool_call_id,
                error,
            } => (tool_call_id.clone(), format!("error: {error}")),
        };
        ApiMessage {
            role: "tool",
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: Some(id),
        }
    }

    fn tool_to_api(spec: &ToolSpec) -> ApiTool {
        ApiTool {
            tool_type: "function",
            function: ApiFunction {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.schema.clone(),
            },
        }
    }

    fn choice_to_api(choice: ToolChoice) -> &'static str {
        match choice {
            ToolChoice::Auto => "auto",
            ToolChoice::Required => "required",
            ToolChoice::None => "none",
        }
    }

    fn response_to_message(message: ApiResponseMessage) -> Message {
        let mut parts = Vec::new();
        if let Some(text) = message.content.filter(|t| !t.is_empty()) {
            parts.push(Part::Text(text));
        }
        for call in message.tool_calls.unwrap_or_default() {
            // Unparseable arguments are passed through so the tool host reports them.
            let input = if call.function.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments))
            };
            parts.push(Part::ToolCall(ToolCall {
                id: call.id,
                name: call.function.name,
                input,
            }));
        }
        Message {
            role: Role::Assistant,
            parts,
        }
    }
}

impl std::fmt::Display for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "openai({}, {})", self.model, self.endpoint)
    }
}

impl Backend for OpenAiBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let tools: Vec<ApiTool> = request.tools.iter().map(Self::tool_to_api).collect();
        let tool_choice = (!tools.is_empty()).then(|| Self::choice_to_api(request.tool_choice));

        let api_request = ApiRequest {
            model: self.model.clone(),
            messages: Self::messages_to_api(request.messages),
            tools,
            tool_choice,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, message });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("no choices in response".into()))?;

        let usage = api_response
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ModelResponse {
            message: Self::response_to_message(choice.message),
            usage,
        })
    }
}
