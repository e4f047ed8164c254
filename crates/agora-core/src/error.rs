use thiserror::Error;

use crate::model::ToolCallStatus;

#[derive(Debug, Error)]
pub enum AgoraError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tool call {id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ToolCallStatus,
        to: ToolCallStatus,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgoraError>;
