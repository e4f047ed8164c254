//! Sandboxed connection pool for external MCP tool servers.
//!
//! [`manager::ConnectionManager`] owns one live connection per server,
//! connecting lazily, syncing the tool catalog on connect, enforcing the
//! server's [`SandboxPolicy`](agora_core::model::SandboxPolicy) on every call
//! and evicting idle connections.

use std::sync::Arc;

use agora_core::error::AgoraError;
use serde::{Deserialize, Serialize};

pub mod manager;
pub mod result;
pub mod sandbox;
pub mod transport;

pub use manager::ConnectionManager;
pub use transport::{McpTransportFactory, ToolTransport, TransportFactory};

/// Progress callback, invoked with a percentage in `0.0..=100.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Outcome of one tool execution. Sandbox rejections, timeouts and tool
/// failures all land here with `success = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolExecutionResult {
    pub fn ok(result: serde_json::Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool server '{0}'")]
    UnknownServer(String),

    #[error("failed to connect to '{server}': {reason}")]
    Connect { server: String, reason: String },

    #[error(transparent)]
    Catalog(#[from] AgoraError),
}
