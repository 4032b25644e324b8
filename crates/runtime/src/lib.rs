//! Toolwire runtime: drives a language model against remote tools.
//!
//! # Overview
//!
//! - **Backend**: a trait abstracting LLM providers; [`providers::OpenAiBackend`]
//!   speaks the chat completions API.
//! - **ToolHost**: where tool calls run; [`McpToolHost`] forwards them over a
//!   tool session.
//! - **Agent**: the reasoning loop that alternates model steps and tool calls.
//!
//! # Example
//!
//! ```no_run
//! use mcp::SessionConfig;
//! use runtime::providers::OpenAiBackend;
//! use runtime::{Agent, AgentConfig, McpToolHost, ToolChoice};
//!
//! # async fn example() -> runtime::Result<()> {
//! let host = McpToolHost::connect("http://localhost:8000", SessionConfig::default()).await?;
//! let backend = OpenAiBackend::builder("sk-...", "gpt-4o").build();
//! let config = AgentConfig::default()
//!     .with_instructions("Use the tools to answer the questions.")
//!     .with_tool_choice(ToolChoice::Required);
//!
//! let agent = Agent::new(backend, host, config);
//! let run = agent.run("Add these numbers: 7 and 22.").await?;
//! println!("{}", run.output);
//! # Ok(())
//! # }
//! ```

pub mod agent;
mod error;
pub mod model;
pub mod providers;
pub mod tools;

pub use agent::{Agent, AgentConfig, AgentTurn, RunResult};
pub use error::{Error, Result};
pub use model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, ToolCall, ToolChoice,
    ToolResult, ToolSpec, Usage,
};
pub use tools::{McpToolHost, ToolError, ToolHost};
