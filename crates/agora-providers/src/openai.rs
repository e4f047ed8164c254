//! OpenAI Chat Completions API provider.
//!
//! Streams via `/v1/chat/completions`. Also serves OpenRouter and the local
//! Ollama backend, which speak the same protocol.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use agora_core::model::MessageRole;

use crate::sse::parse_sse_stream;
use crate::{
    ChatMessage, ChunkStream, CompletionRequest, LlmProvider, ModelApi, ProviderChunk,
    ProviderError, ToolSchema,
};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// API style, which determines auth headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    fn build(id: &str, style: ApiStyle, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_style: style,
            provider_id: id.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>, api_key: String) -> Self {
        Self::build(
            "openai",
            ApiStyle::OpenAi,
            base_url.unwrap_or(OPENAI_BASE_URL),
            Some(api_key),
        )
    }

    pub fn openrouter(base_url: Option<&str>, api_key: String) -> Self {
        Self::build(
            "openrouter",
            ApiStyle::OpenRouter,
            base_url.unwrap_or(OPENROUTER_BASE_URL),
            Some(api_key),
        )
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::build(
            "ollama",
            ApiStyle::Ollama,
            base_url.unwrap_or(OLLAMA_BASE_URL),
            None,
        )
    }

    pub fn format_tools(tools: &[ToolSchema]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    pub fn format_messages(
        system: Option<&str>,
        history: &[ChatMessage],
    ) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(system) = system.filter(|s| !s.is_empty()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in history {
            let (role, content) = match msg.role {
                MessageRole::User => ("user", msg.content.clone()),
                MessageRole::Assistant => ("assistant", msg.content.clone()),
                MessageRole::System => ("system", msg.content.clone()),
                // Without a tool_call_id the API rejects role=tool.
                MessageRole::Tool => ("user", format!("[tool result]\n{}", msg.content)),
            };
            messages.push(json!({ "role": role, "content": content }));
        }
        messages
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Translate one `data:` payload into provider chunks, in delivery order.
fn translate_chunk(data: &str) -> Result<Vec<ProviderChunk>, ProviderError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data).map_err(|e| {
        trace!(%e, data, "Failed to parse OpenAI chunk");
        ProviderError::MalformedFrame(format!("{e}: {data}"))
    })?;

    let mut out = Vec::new();

    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            out.push(ProviderChunk::Text(content));
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            out.push(ProviderChunk::ToolFragment {
                key: tc.index.to_string(),
                id: tc.id,
                name,
                arguments,
            });
        }
        if let Some(reason) = choice.finish_reason {
            out.push(ProviderChunk::Finish { reason });
        }
    }

    // Sent once at the end when stream_options.include_usage is set
    if let Some(usage) = chunk.usage {
        out.push(ProviderChunk::Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        });
    }

    Ok(out)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn api(&self) -> ModelApi {
        ModelApi::OpenAiCompletions
    }

    fn is_local(&self) -> bool {
        self.api_style == ApiStyle::Ollama
    }

    async fn stream(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let body = OpenAiRequest {
            model: model.to_string(),
            messages: Self::format_messages(request.system.as_deref(), &request.messages),
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop.clone(),
            tools: Self::format_tools(&request.tools),
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(key) = self.api_key.as_deref().filter(|_| self.api_style != ApiStyle::Ollama) {
            req_builder = req_builder.header("authorization", format!("Bearer {key}"));
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("X-Title", "Agora");
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let chunks = parse_sse_stream(response)
            .take_while(|event| {
                // OpenAI terminates with "data: [DONE]"
                futures::future::ready(!matches!(event, Ok(e) if e.data.trim() == "[DONE]"))
            })
            .map(|event| event.and_then(|e| translate_chunk(e.data.trim())))
            .flat_map(|result| {
                let items: Vec<Result<ProviderChunk, ProviderError>> = match result {
                    Ok(chunks) => chunks.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                futures::stream::iter(items)
            });

        Ok(Box::pin(chunks))
    }
}
