//! Conversation stream orchestrator.
//!
//! Turns one user message into a persisted, incrementally streamed assistant
//! reply. Tool calls the model requests mid-stream are persisted and handed
//! to the job pipeline without pausing the stream.

use serde::{Deserialize, Serialize};

pub mod frames;
pub mod orchestrator;
pub mod prompt;

pub use frames::{FrameBody, SseFrame};
pub use orchestrator::{ChatSettings, FrameStream, Orchestrator};

/// Body of a chat stream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub content: String,
}

/// Error codes carried by `error` frames, besides the gateway's own.
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const PERSISTENCE_ERROR: &str = "PERSISTENCE_ERROR";
    pub const STREAM_INTERRUPTED: &str = "STREAM_INTERRUPTED";
}
