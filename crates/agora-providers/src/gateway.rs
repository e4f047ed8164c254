//! The streaming gateway: provider selection plus normalization of provider
//! chunks into [`StreamEvent`]s.
//!
//! The gateway holds no per-call state and never retries. Each failure
//! (refused connection, non-2xx status, malformed frame) becomes exactly one
//! terminal `Error` event. Cancelling the request token ends the stream
//! without a terminal event and drops the upstream response.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agora_core::config::Config;
use agora_core::model::TokenUsage;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::tool_args::{BraceBalance, CompletionDetector, ToolCallBuffer, detector_by_name};
use crate::{ChunkStream, CompletionRequest, EventStream, LlmProvider, ProviderChunk, StreamEvent};

pub const PROVIDER_NOT_ENABLED: &str = "PROVIDER_NOT_ENABLED";

/// Provider id serving models with no recognised prefix.
pub const LOCAL_PROVIDER: &str = "ollama";

/// Buffered result of [`Gateway::complete`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<CompletedToolCall>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: String,
    pub message: String,
}

/// Map a model string to `(provider id, upstream model)`.
///
/// Vendor routing prefixes (`openai/`, `anthropic/`, `openrouter/`,
/// `ollama/`) are stripped. Unknown names go to the local provider.
pub fn route_model(model: &str) -> (&'static str, &str) {
    const ROUTES: [(&str, &str); 4] = [
        ("openai/", "openai"),
        ("anthropic/", "anthropic"),
        ("openrouter/", "openrouter"),
        ("ollama/", "ollama"),
    ];
    for (prefix, provider) in ROUTES {
        if let Some(rest) = model.strip_prefix(prefix) {
            return (provider, rest);
        }
    }
    if ["gpt-", "o1", "o3", "o4", "chatgpt-"]
        .iter()
        .any(|p| model.starts_with(p))
    {
        return ("openai", model);
    }
    if model.starts_with("claude-") {
        return ("anthropic", model);
    }
    (LOCAL_PROVIDER, model)
}

pub struct Gateway {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    detector: Arc<dyn CompletionDetector>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    /// Empty gateway using brace-balance completion detection.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            detector: Arc::new(BraceBalance),
        }
    }

    /// Register an enabled provider under its id.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn CompletionDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Build from config. The local provider is always enabled; a cloud
    /// provider is enabled only when its API key resolves.
    pub fn from_config(config: &Config) -> Self {
        let mut gateway = Self::new();
        match detector_by_name(&config.tool_call_detection()) {
            Some(detector) => gateway.detector = detector,
            None => warn!(
                detector = %config.tool_call_detection(),
                "Unknown tool-call detector, using brace_balance"
            ),
        }

        let local_url = config
            .provider(LOCAL_PROVIDER)
            .and_then(|p| p.base_url.as_deref());
        gateway = gateway.with_provider(Arc::new(OpenAiProvider::ollama(local_url)));

        for pc in config.providers.iter().flatten() {
            if pc.id == LOCAL_PROVIDER {
                continue;
            }
            let Some(key) = pc.resolve_api_key() else {
                debug!(provider = %pc.id, "No API key, provider stays disabled");
                continue;
            };
            let base = pc.base_url.as_deref();
            let provider: Arc<dyn LlmProvider> = match pc.id.as_str() {
                "openai" => Arc::new(OpenAiProvider::openai(base, key)),
                "openrouter" => Arc::new(OpenAiProvider::openrouter(base, key)),
                "anthropic" => Arc::new(AnthropicProvider::new(base, key)),
                other => {
                    warn!(provider = other, "Unknown provider id in config, ignoring");
                    continue;
                }
            };
            gateway = gateway.with_provider(provider);
        }

        info!(providers = ?gateway.enabled_providers(), detector = gateway.detector.name(), "Gateway ready");
        gateway
    }

    pub fn enabled_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pick the provider for a request and the model name to send upstream.
    pub fn resolve(
        &self,
        request: &CompletionRequest,
    ) -> Result<(Arc<dyn LlmProvider>, String), GatewayError> {
        let (provider_id, model) = match request.provider.as_deref() {
            Some(explicit) => {
                let prefix = format!("{explicit}/");
                let model = request
                    .model
                    .strip_prefix(&prefix)
                    .unwrap_or(&request.model);
                (explicit, model)
            }
            None => route_model(&request.model),
        };

        match self.providers.get(provider_id) {
            Some(provider) => Ok((provider.clone(), model.to_string())),
            None => Err(GatewayError {
                code: PROVIDER_NOT_ENABLED.into(),
                message: format!(
                    "provider '{provider_id}' is not enabled for model '{}'",
                    request.model
                ),
            }),
        }
    }

    /// Open a streaming completion. Always returns a stream; setup failures
    /// arrive as its single `Error` event.
    pub fn stream_completion(&self, request: CompletionRequest) -> EventStream {
        let cancel = request.cancel.clone();
        let buffer = ToolCallBuffer::new(self.detector.clone());

        let mut state = StreamState {
            phase: Phase::Finished,
            queue: VecDeque::new(),
            buffer,
            finish_reason: None,
            cancel,
        };

        match self.resolve(&request) {
            Ok((provider, model)) => {
                debug!(provider = provider.id(), %model, "Opening completion stream");
                state.phase = Phase::Connect {
                    provider,
                    model,
                    request: Box::new(request),
                };
            }
            Err(e) => {
                warn!(code = %e.code, "{}", e.message);
                state.queue.push_back(StreamEvent::error(&e.code, e.message));
            }
        }

        Box::pin(futures::stream::unfold(state, StreamState::next_event))
    }

    /// Buffered completion: drains [`Self::stream_completion`].
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let mut stream = self.stream_completion(request);
        let mut response = CompletionResponse::default();
        let mut finished = false;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Content { text } => response.content.push_str(&text),
                StreamEvent::ToolCall {
                    id,
                    name,
                    is_complete: true,
                    arguments,
                    ..
                } => response.tool_calls.push(CompletedToolCall {
                    id,
                    name,
                    arguments: arguments.unwrap_or_default(),
                }),
                StreamEvent::ToolCall { .. } => {}
                StreamEvent::Usage {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    response.usage = Some(TokenUsage {
                        prompt_tokens,
                        completion_tokens,
                    })
                }
                StreamEvent::Error { code, message } => return Err(GatewayError { code, message }),
                StreamEvent::Done { finish_reason } => {
                    response.finish_reason = finish_reason;
                    finished = true;
                }
            }
        }

        if !finished {
            return Err(GatewayError {
                code: "CANCELLED".into(),
                message: "completion cancelled before it finished".into(),
            });
        }
        Ok(response)
    }
}

enum Phase {
    Connect {
        provider: Arc<dyn LlmProvider>,
        model: String,
        request: Box<CompletionRequest>,
    },
    Streaming(ChunkStream),
    Finished,
}

struct StreamState {
    phase: Phase,
    queue: VecDeque<StreamEvent>,
    buffer: ToolCallBuffer,
    finish_reason: Option<String>,
    cancel: CancellationToken,
}

impl StreamState {
    async fn next_event(mut self) -> Option<(StreamEvent, Self)> {
        loop {
            if self.cancel.is_cancelled() {
                debug!("Completion stream cancelled");
                return None;
            }
            if let Some(event) = self.queue.pop_front() {
                return Some((event, self));
            }

            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,
                Phase::Connect {
                    provider,
                    model,
                    request,
                } => {
                    let opened = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        opened = provider.stream(&model, &request) => opened,
                    };
                    match opened {
                        Ok(chunks) => self.phase = Phase::Streaming(chunks),
                        Err(e) => {
                            warn!(provider = provider.id(), error = %e, "Provider stream failed to open");
                            self.queue.push_back(StreamEvent::error(e.code(), e.to_string()));
                        }
                    }
                }
                Phase::Streaming(mut chunks) => {
                    let next = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        next = chunks.next() => next,
                    };
                    match next {
                        Some(Ok(chunk)) => {
                            self.absorb(chunk);
                            self.phase = Phase::Streaming(chunks);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Provider stream failed mid-flight");
                            self.queue.push_back(StreamEvent::error(e.code(), e.to_string()));
                        }
                        None => {
                            let flushed = self.buffer.flush();
                            self.queue.extend(flushed);
                            let finish_reason =
                                self.finish_reason.take().unwrap_or_else(|| "stop".into());
                            self.queue.push_back(StreamEvent::Done { finish_reason });
                        }
                    }
                }
            }
        }
    }

    fn absorb(&mut self, chunk: ProviderChunk) {
        match chunk {
            ProviderChunk::Text(text) => {
                if !text.is_empty() {
                    self.queue.push_back(StreamEvent::Content { text });
                }
            }
            ProviderChunk::ToolFragment {
                key,
                id,
                name,
                arguments,
            } => {
                if let Some(event) = self.buffer.push(&key, id, name, &arguments) {
                    self.queue.push_back(event);
                }
            }
            ProviderChunk::Usage {
                prompt_tokens,
                completion_tokens,
            } => self.queue.push_back(StreamEvent::Usage {
                prompt_tokens,
                completion_tokens,
            }),
            ProviderChunk::Finish { reason } => {
                let flushed = self.buffer.flush();
                self.queue.extend(flushed);
                self.finish_reason = Some(reason);
            }
        }
    }
}
