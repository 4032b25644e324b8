//! Tool-invocation protocol: wire envelopes, a tool registry, an HTTP + SSE
//! tool host, and a concurrent client session.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ClientSession, SessionConfig};
//! use serde_json::json;
//!
//! # async fn example() -> mcp::Result<()> {
//! let session = ClientSession::connect("http://localhost:8000", SessionConfig::default()).await?;
//!
//! for tool in session.discover().await? {
//!     println!("Tool: {}", tool.name());
//! }
//!
//! let sum = session.call("add", json!({ "a": 7, "b": 22 })).await?;
//! println!("{sum}");
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod codec;
pub mod dispatcher;
pub mod envelope;
mod error;
mod registry;
mod server;
mod session;
mod transport;

pub use client::RemoteTool;
pub use dispatcher::{Dispatcher, PendingGuard, Resolution};
pub use envelope::{Envelope, ErrorBody, ErrorKind, Notification, RequestId};
pub use error::{Error, Result};
pub use registry::{
    HandlerError, MAX_TOOL_NAME_LEN, ToolContext, ToolDescriptor, ToolHandler, ToolList,
    ToolRegistry,
};
pub use server::{ServerConfig, ToolServer};
pub use session::{ClientSession, SessionConfig};
pub use transport::{
    ENVELOPE_EVENT, EnvelopeStream, HttpTransport, SESSION_HEADER, ServerInfo, SessionInfo,
    Transport,
};
