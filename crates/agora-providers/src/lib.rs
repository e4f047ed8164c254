//! LLM provider abstraction and the streaming gateway.
//!
//! Each backend implements [`LlmProvider`] and translates its native stream
//! into [`ProviderChunk`]s. The [`gateway::Gateway`] turns those chunks into
//! the canonical [`StreamEvent`] vocabulary, buffering tool-call argument
//! fragments until a [`tool_args::CompletionDetector`] declares them complete.

use std::pin::Pin;

use agora_core::model::MessageRole;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod anthropic;
pub mod gateway;
pub mod openai;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;
pub mod sse;
pub mod tool_args;

pub use gateway::{CompletionResponse, Gateway, GatewayError};

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelApi {
    AnthropicMessages,
    OpenAiCompletions,
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A callable tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A request to the gateway.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    /// Explicit provider id; derived from the model prefix when absent.
    pub provider: Option<String>,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    pub max_tokens: u32,
    /// Cancelling ends the stream and drops the upstream HTTP request.
    pub cancel: CancellationToken,
}

/// Canonical gateway event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        fragment: String,
        is_complete: bool,
        /// Full buffered arguments, present once `is_complete` is set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Error {
        code: String,
        message: String,
    },
    Done {
        finish_reason: String,
    },
}

impl StreamEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Provider-native increment, before tool-call buffering.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChunk {
    Text(String),
    /// A tool-call argument fragment. `key` is stable for one call within a
    /// stream; `id` and `name` arrive on the first fragment only.
    ToolFragment {
        key: String,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Finish {
        reason: String,
    },
}

/// Failures a provider reports; each maps to one terminal error code.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Http { .. } => "PROVIDER_ERROR",
            Self::Transport(_) => "NETWORK_ERROR",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::Upstream(_) => "PROVIDER_ERROR",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk, ProviderError>> + Send>>;

/// A model-serving backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "anthropic", "ollama").
    fn id(&self) -> &str;

    fn api(&self) -> ModelApi;

    /// Whether the provider runs locally and needs no key.
    fn is_local(&self) -> bool {
        false
    }

    /// Open a streaming completion. `model` is the upstream model name with
    /// any routing prefix already stripped.
    async fn stream(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError>;
}
