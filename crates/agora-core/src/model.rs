//! Chat model: agents, sessions, messages, tool calls and tool servers.
//!
//! Relations are one-directional references by id. Read-side joins are
//! performed by the store (see [`crate::store::ConversationContext`]).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-defined persona bound to a model and a set of enabled tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    /// Explicit provider id; when absent it is derived from the model prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Ids of [`RegisteredTool`]s this agent may call.
    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A group of agents; a swarm-bound session is answered by its lead agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: String,
    pub name: String,
    pub agent_ids: Vec<String>,
    pub lead_agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub profile_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub swarm_id: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, profile_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            profile_id: profile_id.into(),
            agent_id: None,
            swarm_id: None,
            message_count: 0,
            last_message_at: None,
            is_archived: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub is_complete: bool,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
    /// Insertion order within the store; assigned on insert.
    #[serde(default)]
    pub seq: u64,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            is_complete: true,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
            seq: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_ids: Vec<String>,
    /// Latest known status per tool call id, written by the worker.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_status: BTreeMap<String, ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<SwarmAnnotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmAnnotation {
    pub swarm_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Tool call lifecycle: `pending -> running -> {completed | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// A pending call must start running before it can complete, but may be
    /// rejected straight to `error` before execution. Terminal states never
    /// move back to a non-terminal one. Re-writing a terminal state (retry
    /// redelivery) is allowed and overwrites it.
    pub fn can_transition_to(self, next: ToolCallStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Error),
            Self::Running => next != Self::Pending,
            Self::Completed | Self::Error => next.is_terminal(),
        }
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub message_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub status: ToolCallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    pub fn pending(
        id: impl Into<String>,
        message_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            message_id: message_id.into(),
            tool_name: tool_name.into(),
            tool_id: None,
            server_id: None,
            arguments,
            result: None,
            error: None,
            status: ToolCallStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// A single status write against a tool call row.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallUpdate {
    pub status: ToolCallStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ToolCallUpdate {
    pub fn running() -> Self {
        Self {
            status: ToolCallStatus::Running,
            result: None,
            error: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: ToolCallStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ToolCallStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransport {
    /// Spawn a child process and speak newline-delimited JSON-RPC over its pipes.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// POST JSON-RPC requests to a network endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
    Connecting,
    Error,
}

/// Per-connection execution limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub max_execution_time_ms: u64,
    pub max_tool_calls_per_session: u32,
    pub network_enabled: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000,
            max_tool_calls_per_session: 100,
            network_enabled: true,
            allowed_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub id: String,
    pub name: String,
    pub transport: McpTransport,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Server-specific policy; the configured default applies when absent.
    #[serde(default)]
    pub sandbox: Option<SandboxPolicy>,
    #[serde(default)]
    pub tool_call_count: u64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl McpServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: McpTransport) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport,
            status: ConnectionStatus::Disconnected,
            status_reason: None,
            sandbox: None,
            tool_call_count: 0,
            last_used_at: None,
        }
    }
}

/// A tool advertised by a server, as synced into the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredTool {
    pub id: String,
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}
