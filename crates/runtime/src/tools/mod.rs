//! Tool execution: the host trait and the remote-session host.

pub mod errors;
mod host;
mod mcp_host;

pub use errors::ToolError;
pub use host::ToolHost;
pub use mcp_host::McpToolHost;
