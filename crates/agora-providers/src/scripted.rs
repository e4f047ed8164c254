//! A provider that replays canned chunk sequences.
//!
//! Drives the gateway in tests across the workspace without a model backend.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::{ChunkStream, CompletionRequest, LlmProvider, ModelApi, ProviderChunk, ProviderError};

/// One scripted response.
pub struct Script {
    chunks: Vec<Result<ProviderChunk, ProviderError>>,
    delay: Duration,
    hang: bool,
    open_error: Option<ProviderError>,
}

impl Script {
    pub fn chunks(chunks: Vec<Result<ProviderChunk, ProviderError>>) -> Self {
        Self {
            chunks,
            delay: Duration::ZERO,
            hang: false,
            open_error: None,
        }
    }

    /// Text fragments followed by a `stop` finish.
    pub fn text(parts: &[&str]) -> Self {
        let mut chunks: Vec<Result<ProviderChunk, ProviderError>> = parts
            .iter()
            .map(|p| Ok(ProviderChunk::Text(p.to_string())))
            .collect();
        chunks.push(Ok(ProviderChunk::Finish {
            reason: "stop".into(),
        }));
        Self::chunks(chunks)
    }

    /// Fail when the stream is opened, before any chunk.
    pub fn failing_open(error: ProviderError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::chunks(Vec::new())
        }
    }

    /// Sleep before every chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never end after the last chunk; the stream stays pending.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

pub struct ScriptedProvider {
    id: String,
    local: bool,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// A cloud-style provider; scripts are consumed one per `stream` call.
    pub fn new(id: &str, scripts: Vec<Script>) -> Self {
        Self {
            id: id.to_string(),
            local: false,
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn local(id: &str, scripts: Vec<Script>) -> Self {
        Self {
            local: true,
            ..Self::new(id, scripts)
        }
    }

    /// Requests received so far, with the routed model name.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn api(&self) -> ModelApi {
        ModelApi::OpenAiCompletions
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn stream(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        if let Ok(mut seen) = self.requests.lock() {
            let mut captured = request.clone();
            captured.model = model.to_string();
            seen.push(captured);
        }

        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .ok_or_else(|| ProviderError::Upstream("no scripted response left".into()))?;

        if let Some(err) = script.open_error {
            return Err(err);
        }

        let delay = script.delay;
        let chunks = futures::stream::iter(script.chunks).then(move |chunk| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            chunk
        });

        if script.hang {
            Ok(Box::pin(chunks.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(chunks))
        }
    }
}
