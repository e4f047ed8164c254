//! Anthropic Messages API provider.
//!
//! POSTs to `/v1/messages` with `stream: true` and translates the typed SSE
//! events (`content_block_start`, `content_block_delta`, `message_delta`, ...)
//! into provider chunks. Tool arguments arrive as `input_json_delta`
//! fragments keyed by content block index.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use agora_core::model::MessageRole;

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{
    ChatMessage, ChunkStream, CompletionRequest, LlmProvider, ModelApi, ProviderChunk,
    ProviderError, ToolSchema,
};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(base_url: Option<&str>, api_key: String) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn format_tools(tools: &[ToolSchema]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect()
    }

    /// Split history into the `system` parameter and alternating turns.
    /// Consecutive turns of the same role are merged.
    pub fn format_messages(
        system: Option<&str>,
        history: &[ChatMessage],
    ) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_parts: Vec<String> = system
            .filter(|s| !s.is_empty())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default();
        let mut turns: Vec<(&'static str, String)> = Vec::new();

        for msg in history {
            let (role, text) = match msg.role {
                MessageRole::System => {
                    system_parts.push(msg.content.clone());
                    continue;
                }
                MessageRole::User => ("user", msg.content.clone()),
                MessageRole::Assistant => ("assistant", msg.content.clone()),
                MessageRole::Tool => ("user", format!("[tool result]\n{}", msg.content)),
            };
            match turns.last_mut() {
                Some((last_role, last_text)) if *last_role == role => {
                    last_text.push_str("\n\n");
                    last_text.push_str(&text);
                }
                _ => turns.push((role, text)),
            }
        }

        let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
        let messages = turns
            .into_iter()
            .map(|(role, text)| json!({ "role": role, "content": text }))
            .collect();
        (system, messages)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        message: MessageStartBody,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<OutputUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
    /// Event types added upstream after this adapter was written.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    #[serde(default)]
    usage: Option<InputUsage>,
}

#[derive(Debug, Deserialize)]
struct InputUsage {
    #[serde(default)]
    input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Stream-scoped state: input token count arrives in `message_start` but is
/// reported together with output tokens at `message_delta`.
#[derive(Debug, Default)]
struct EventTranslator {
    input_tokens: u64,
}

impl EventTranslator {
    fn translate(&mut self, event: &SseEvent) -> Result<Vec<ProviderChunk>, ProviderError> {
        let parsed: AnthropicEvent = serde_json::from_str(&event.data).map_err(|e| {
            trace!(%e, data = %event.data, "Failed to parse Anthropic event");
            ProviderError::MalformedFrame(format!("{e}: {}", event.data))
        })?;

        let chunks = match parsed {
            AnthropicEvent::MessageStart { message } => {
                self.input_tokens = message.usage.map(|u| u.input_tokens).unwrap_or(0);
                vec![]
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text } if !text.is_empty() => vec![ProviderChunk::Text(text)],
                ContentBlock::ToolUse { id, name } => vec![ProviderChunk::ToolFragment {
                    key: index.to_string(),
                    id: Some(id),
                    name: Some(name),
                    arguments: String::new(),
                }],
                _ => vec![],
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![ProviderChunk::Text(text)]
                }
                BlockDelta::InputJsonDelta { partial_json } => vec![ProviderChunk::ToolFragment {
                    key: index.to_string(),
                    id: None,
                    name: None,
                    arguments: partial_json,
                }],
                _ => vec![],
            },
            AnthropicEvent::MessageDelta { delta, usage } => {
                let mut out = Vec::new();
                if let Some(usage) = usage {
                    out.push(ProviderChunk::Usage {
                        prompt_tokens: self.input_tokens,
                        completion_tokens: usage.output_tokens,
                    });
                }
                if let Some(reason) = delta.stop_reason {
                    out.push(ProviderChunk::Finish { reason });
                }
                out
            }
            AnthropicEvent::ContentBlockStop { .. }
            | AnthropicEvent::MessageStop
            | AnthropicEvent::Ping => vec![],
            AnthropicEvent::Unknown => {
                trace!(data = %event.data, "Ignoring unknown Anthropic event");
                vec![]
            }
            AnthropicEvent::Error { error } => {
                return Err(ProviderError::Upstream(format!(
                    "{}: {}",
                    error.kind, error.message
                )));
            }
        };
        Ok(chunks)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn api(&self) -> ModelApi {
        ModelApi::AnthropicMessages
    }

    async fn stream(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let (system, messages) =
            Self::format_messages(request.system.as_deref(), &request.messages);
        let body = MessagesRequest {
            model: model.to_string(),
            max_tokens: request.max_tokens,
            messages,
            stream: true,
            system,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            tools: Self::format_tools(&request.tools),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming Anthropic Messages API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let mut translator = EventTranslator::default();
        let chunks = parse_sse_stream(response).flat_map(move |event| {
            let items: Vec<Result<ProviderChunk, ProviderError>> =
                match event.and_then(|e| translator.translate(&e)) {
                    Ok(chunks) => chunks.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
            futures::stream::iter(items)
        });

        Ok(Box::pin(chunks))
    }
}
