//! Agent loop: alternate model steps and tool execution until the model answers.

use std::collections::HashMap;

use futures::StreamExt;
use futures::stream;

use crate::error::{Error, Result};
use crate::model::{
    Backend, Message, ModelRequest, ToolCall, ToolChoice, ToolResult, Usage,
};
use crate::tools::ToolHost;

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// System instructions prepended to every run.
    pub instructions: Option<String>,
    /// Maximum reasoning steps before giving up.
    pub max_turns: usize,
    /// Tool calls from one step executed at once.
    pub max_parallel_tools: usize,
    /// Tool choice for the first step. Later steps use `auto` so the model can answer.
    pub tool_choice: ToolChoice,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instructions: None,
            max_turns: 10,
            max_parallel_tools: 8,
            tool_choice: ToolChoice::Auto,
        }
    }
}

impl AgentConfig {
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_max_parallel_tools(mut self, max: usize) -> Self {
        self.max_parallel_tools = max.max(1);
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }
}

/// One reasoning step and the tool work it caused.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub index: usize,
    pub message: Message,
    pub calls: Vec<ToolCall>,
    /// Results in the same order as `calls`.
    pub results: Vec<ToolResult>,
}

/// Outcome of [`Agent::run`].
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Text of the model's final answer.
    pub output: String,
    pub turns: Vec<AgentTurn>,
    /// Full conversation, including instructions and tool results.
    pub messages: Vec<Message>,
    pub usage: Usage,
}

/// Drives a model backend against a tool host.
pub struct Agent<B, H> {
    backend: B,
    host: H,
    config: AgentConfig,
}

impl<B: Backend, H: ToolHost> Agent<B, H> {
    pub fn new(backend: B, host: H, config: AgentConfig) -> Self {
        Self {
            backend,
            host,
            config,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Execute one step's tool calls concurrently, keyed by call id.
    ///
    /// Failures are returned as [`ToolResult::Failure`], never as errors.
    pub async fn execute(&self, calls: &[ToolCall]) -> HashMap<String, ToolResult> {
        stream::iter(calls)
            .map(|call| async move {
                if self.host.spec(&call.name).is_none() {
                    tracing::debug!(
                        tool = %call.name,
                        id = %call.id,
                        "model called an undeclared tool"
                    );
                }
                let result = match self.host.execute(call).await {
                    Ok(output) => ToolResult::Success {
                        tool_call_id: call.id.clone(),
                        output,
                    },
                    Err(error) => {
                        tracing::warn!(
                            tool = %call.name,
                            id = %call.id,
                            %error,
                            "tool call failed"
                        );
                        ToolResult::Failure {
                            tool_call_id: call.id.clone(),
                            error,
                        }
                    }
                };
                (call.id.clone(), result)
            })
            .buffer_unordered(self.config.max_parallel_tools.max(1))
            .collect()
            .await
    }

    /// Run the loop for a single user input.
    pub async fn run(&self, input: &str) -> Result<RunResult> {
        let mut messages = Vec::new();
        if let Some(instructions) = &self.config.instructions {
            messages.push(Message::system(instructions.clone()));
        }
        messages.push(Message::user(input));
        self.run_messages(messages).await
    }

    /// Run the loop from an existing conversation.
    pub async fn run_messages(&self, mut messages: Vec<Message>) -> Result<RunResult> {
        let mut turns = Vec::new();
        let mut usage = Usage::default();

        for index in 0..self.config.max_turns {
            let tool_choice = if turns.is_empty() {
                self.config.tool_choice
            } else {
                ToolChoice::Auto
            };
            let response = self
                .backend
                .call(ModelRequest {
                    messages: &messages,
                    tools: self.host.specs(),
                    tool_choice,
                })
                .await?;
            usage += response.usage;

            let message = response.message;
            let calls = message.tool_calls();
            messages.push(message.clone());

            if calls.is_empty() {
                tracing::debug!(turn = index, "model produced final answer");
                let output = message.text();
                turns.push(AgentTurn {
                    index,
                    message,
                    calls,
                    results: Vec::new(),
                });
                return Ok(RunResult {
                    output,
                    turns,
                    messages,
                    usage,
                });
            }

            tracing::debug!(turn = index, calls = calls.len(), "executing tool calls");
            let mut by_id = self.execute(&calls).await;
            let results: Vec<ToolResult> =
                calls.iter().filter_map(|c| by_id.remove(&c.id)).collect();

            if let Some(error) = results.iter().find_map(|r| match r {
                ToolResult::Failure { error, .. } if error.is_fatal() => Some(error),
                _ => None,
            }) {
                tracing::error!(%error, "tool session lost, aborting run");
                return Err(Error::Session(error.to_string()));
            }

            messages.push(Message::tool_results(results.clone()));
            turns.push(AgentTurn {
                index,
                message,
                calls,
                results,
            });
        }

        Err(Error::TurnLimitExceeded {
            max_turns: self.config.max_turns,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::model::{ModelError, ModelResponse, Part, Role, ToolSpec};
    use crate::tools::ToolError;

    /// Replays canned model messages and records the requests it saw.
    struct Scripted {
        replies: Mutex<VecDeque<Message>>,
        seen: Mutex<Vec<(usize, ToolChoice)>>,
    }

    impl Scripted {
        fn new(replies: Vec<Message>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Backend for Scripted {
        async fn call(
            &self,
            request: ModelRequest<'_>,
        ) -> std::result::Result<ModelResponse, ModelError> {
            self.seen
                .lock()
                .push((request.messages.len(), request.tool_choice));
            let message = self
                .replies
                .lock()
                .pop_front()
                .ok_or_else(|| ModelError::InvalidResponse("script exhausted".into()))?;
            Ok(ModelResponse {
                message,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 2,
                },
            })
        }
    }

    /// Local tools: `add`, a slow `sleep`, and `lost` which reports a dead session.
    struct LocalTools {
        specs: Vec<ToolSpec>,
    }

    impl LocalTools {
        fn new() -> Self {
            let spec = |name: &str| ToolSpec {
                name: name.into(),
                description: String::new(),
                schema: json!({"type": "object"}),
            };
            Self {
                specs: vec![spec("add"), spec("sleep"), spec("lost")],
            }
        }
    }

    impl ToolHost for LocalTools {
        fn specs(&self) -> &[ToolSpec] {
            &self.specs
        }

        async fn execute(&self, call: &ToolCall) -> std::result::Result<Value, ToolError> {
            match call.name.as_str() {
                "add" => {
                    let a = call.input["a"].as_i64().unwrap_or(0);
                    let b = call.input["b"].as_i64().unwrap_or(0);
                    Ok(json!({"result": a + b}))
                }
                "sleep" => {
                    let ms = call.input["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!(ms))
                }
                "lost" => Err(ToolError::SessionLost("connection closed".into())),
                other => Err(ToolError::NotFound(other.into())),
            }
        }
    }

    fn call(id: &str, name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    fn calls(items: Vec<ToolCall>) -> Message {
        Message {
            role: Role::Assistant,
            parts: items.into_iter().map(Part::ToolCall).collect(),
        }
    }

    #[tokio::test]
    async fn final_answer_without_tools() {
        let agent = Agent::new(
            Scripted::new(vec![Message::assistant("hello")]),
            LocalTools::new(),
            AgentConfig::default(),
        );
        let run = agent.run("hi").await.unwrap();
        assert_eq!(run.output, "hello");
        assert_eq!(run.turns.len(), 1);
        assert_eq!(run.usage.input_tokens, 10);
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let backend = Scripted::new(vec![
            calls(vec![call("t1", "add", json!({"a": 7, "b": 22}))]),
            Message::assistant("The sum is 29."),
        ]);
        let config = AgentConfig::default()
            .with_instructions("Use the tools to answer the questions.")
            .with_tool_choice(ToolChoice::Required);
        let agent = Agent::new(backend, LocalTools::new(), config);

        let run = agent.run("Add these numbers: 7 and 22.").await.unwrap();
        assert_eq!(run.output, "The sum is 29.");
        assert_eq!(run.turns.len(), 2);
        match &run.turns[0].results[0] {
            ToolResult::Success { output, .. } => assert_eq!(output, &json!({"result": 29})),
            other => panic!("unexpected {other:?}"),
        }
        // system, user, assistant(call), tool results, assistant(answer)
        assert_eq!(run.messages.len(), 5);
        assert_eq!(run.usage.output_tokens, 4);

        let seen = agent.backend.seen.lock().clone();
        assert_eq!(seen, [(2, ToolChoice::Required), (4, ToolChoice::Auto)]);
    }

    #[tokio::test]
    async fn tool_failure_is_folded_back() {
        let backend = Scripted::new(vec![
            calls(vec![call("t1", "ghost", json!({}))]),
            Message::assistant("No such tool."),
        ]);
        let agent = Agent::new(backend, LocalTools::new(), AgentConfig::default());
        let run = agent.run("use ghost").await.unwrap();
        assert!(matches!(
            &run.turns[0].results[0],
            ToolResult::Failure { error: ToolError::NotFound(_), .. }
        ));
        assert_eq!(run.output, "No such tool.");
    }

    #[tokio::test]
    async fn turn_limit() {
        let backend = Scripted::new(vec![
            calls(vec![call("t1", "add", json!({"a": 1, "b": 1}))]),
            calls(vec![call("t2", "add", json!({"a": 2, "b": 2}))]),
            calls(vec![call("t3", "add", json!({"a": 3, "b": 3}))]),
        ]);
        let agent = Agent::new(
            backend,
            LocalTools::new(),
            AgentConfig::default().with_max_turns(2),
        );
        let err = agent.run("loop").await.unwrap_err();
        assert!(matches!(err, Error::TurnLimitExceeded { max_turns: 2 }));
    }

    #[tokio::test]
    async fn lost_session_aborts_run() {
        let backend = Scripted::new(vec![calls(vec![call("t1", "lost", json!({}))])]);
        let agent = Agent::new(backend, LocalTools::new(), AgentConfig::default());
        let err = agent.run("go").await.unwrap_err();
        assert!(matches!(err, Error::Session(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_runs_calls_concurrently() {
        let agent = Agent::new(
            Scripted::new(vec![]),
            LocalTools::new(),
            AgentConfig::default(),
        );
        let batch: Vec<_> = (0..4)
            .map(|i| call(&format!("s{i}"), "sleep", json!({"ms": 1000})))
            .collect();

        let started = tokio::time::Instant::now();
        let results = agent.execute(&batch).await;
        assert_eq!(results.len(), 4);
        assert!(results.values().all(ToolResult::is_success));
        assert!(started.elapsed() < Duration::from_millis(2000));
    }

    #[test]
    fn host_spec_lookup() {
        let tools = LocalTools::new();
        assert_eq!(tools.spec("sleep").map(|s| s.name.as_str()), Some("sleep"));
        assert!(tools.spec("ghost").is_none());
    }

    #[tokio::test]
    async fn model_error_propagates() {
        let agent = Agent::new(Scripted::new(vec![]), LocalTools::new(), AgentConfig::default());
        assert!(matches!(agent.run("hi").await, Err(Error::Model(_))));
    }
}
