//! The agent loop calling tools on a real host over HTTP.

use std::collections::VecDeque;
use std::sync::Arc;

use mcp::{ServerConfig, SessionConfig, ToolDescriptor, ToolHandler, ToolRegistry, ToolServer};
use parking_lot::Mutex;
use runtime::{
    Agent, AgentConfig, Backend, McpToolHost, Message, ModelError, ModelRequest, ModelResponse,
    Part, Role, ToolCall, ToolError, ToolHost, ToolResult, Usage,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Scripted(Mutex<VecDeque<Message>>);

impl Backend for Scripted {
    async fn call(&self, _request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let message = self
            .0
            .lock()
            .pop_front()
            .ok_or_else(|| ModelError::InvalidResponse("script exhausted".into()))?;
        Ok(ModelResponse {
            message,
            usage: Usage::default(),
        })
    }
}

async fn start_host() -> (String, CancellationToken) {
    let registry = ToolRegistry::new();
    registry
        .register(
            ToolDescriptor::new(
                "add",
                json!({
                    "type": "object",
                    "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                    "required": ["a", "b"]
                }),
            ),
            ToolHandler::blocking(|params: Value| {
                let a = params["a"].as_i64().unwrap_or_default();
                let b = params["b"].as_i64().unwrap_or_default();
                Ok(json!({ "result": a + b }))
            }),
        )
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = ToolServer::new(Arc::new(registry), ServerConfig::default());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        server
            .serve(listener, async move { token.cancelled().await })
            .await
            .unwrap();
    });
    (url, shutdown)
}

fn tool_calls(calls: Vec<ToolCall>) -> Message {
    Message {
        role: Role::Assistant,
        parts: calls.into_iter().map(Part::ToolCall).collect(),
    }
}

#[tokio::test]
async fn agent_adds_numbers_through_remote_tool() {
    let (url, shutdown) = start_host().await;
    let host = McpToolHost::connect(&url, SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(host.specs().len(), 1);

    let backend = Scripted(Mutex::new(VecDeque::from([
        tool_calls(vec![
            ToolCall {
                id: "call_1".into(),
                name: "add".into(),
                input: json!({ "a": 7, "b": 22 }),
            },
            ToolCall {
                id: "call_2".into(),
                name: "ghost".into(),
                input: json!({}),
            },
        ]),
        Message::assistant("7 + 22 = 29"),
    ])));

    let agent = Agent::new(backend, host, AgentConfig::default());
    let run = agent.run("Add these numbers: 7 and 22.").await.unwrap();
    assert_eq!(run.output, "7 + 22 = 29");

    let results = &run.turns[0].results;
    match &results[0] {
        ToolResult::Success { output, .. } => assert_eq!(output, &json!({ "result": 29 })),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        &results[1],
        ToolResult::Failure { error: ToolError::NotFound(_), .. }
    ));

    agent.host().close().await;
    shutdown.cancel();
}
