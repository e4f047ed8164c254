//! Chat SSE wire frames.
//!
//! Every frame serializes to one JSON object:
//! `{type, id, sessionId, messageId, timestamp, ...}` with type-specific
//! fields flattened in. Clients ignore types they do not know.

use agora_core::model::ErrorInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFrame {
    pub id: String,
    pub tool_name: String,
    /// Parsed arguments, or the raw string when they were not valid JSON.
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPendingFrame {
    pub id: String,
    pub tool_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    Start,
    Content {
        content: String,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: ToolCallFrame,
    },
    ToolPending {
        #[serde(rename = "toolCall")]
        tool_call: ToolPendingFrame,
    },
    Error {
        error: ErrorInfo,
    },
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseFrame {
    #[serde(flatten)]
    pub body: FrameBody,
    pub id: String,
    pub session_id: String,
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SseFrame {
    pub fn new(session_id: &str, message_id: Option<&str>, body: FrameBody) -> Self {
        Self {
            body,
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            message_id: message_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            FrameBody::Start => "start",
            FrameBody::Content { .. } => "content",
            FrameBody::ToolCall { .. } => "tool_call",
            FrameBody::ToolPending { .. } => "tool_pending",
            FrameBody::Error { .. } => "error",
            FrameBody::Complete => "complete",
        }
    }

    /// `complete` and `error` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.body, FrameBody::Complete | FrameBody::Error { .. })
    }

    /// JSON payload for one `data:` line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","error":{{"code":"SERIALIZATION_ERROR","message":"{e}"}}}}"#
            )
        })
    }
}
