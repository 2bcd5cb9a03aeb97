//! Tool registration and correlated async dispatch
//!
//! The registry holds tool handlers alongside their compiled argument
//! schemas; the dispatcher runs calls concurrently and answers every
//! request id exactly once, out of order when handlers finish out of
//! order.

pub mod dispatcher;
pub mod registry;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid schema for tool {name}: {message}")]
    InvalidSchema { name: String, message: String },

    #[error("tool {name} timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("tool execution failed: {0}")]
    Execution(String),
}

pub use dispatcher::{DispatchStats, ToolDispatcher};
pub use registry::{FnTool, RegisteredTool, ToolHandler, ToolRegistry};
