//! Per-request chat state machine.
//!
//! `INIT -> CONTEXT_READY -> STREAMING -> FINALIZING -> DONE`, with tool
//! calls dispatched from `STREAMING` and an abort path from any state.
//! The assistant message is inserted as an incomplete placeholder when
//! streaming starts, so tool-call rows can reference it; it is only marked
//! complete, with its full content, on `done`.

use std::sync::Arc;

use agora_core::config::Config;
use agora_core::context::ContextInjector;
use agora_core::model::{
    ErrorInfo, Message, MessageRole, SwarmAnnotation, TokenUsage, ToolCall, ToolCallStatus,
    ToolCallUpdate,
};
use agora_core::store::{ChatStore, ConversationContext, MessagePatch, ToolCatalog};
use agora_jobs::{JobSubmitter, ToolExecutionJob};
use agora_providers::gateway::route_model;
use agora_providers::{CompletionRequest, Gateway, StreamEvent};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::ChatRequest;
use crate::codes::{PERSISTENCE_ERROR, SESSION_NOT_FOUND, STREAM_INTERRUPTED, VALIDATION_ERROR};
use crate::frames::{FrameBody, SseFrame, ToolCallFrame, ToolPendingFrame};
use crate::prompt::{self, ToolIndex};

pub type FrameStream = ReceiverStream<SseFrame>;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub history_limit: usize,
    pub max_tokens: u32,
    /// Used when the agent does not set its own.
    pub temperature: Option<f64>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_limit: 20,
            max_tokens: 4096,
            temperature: None,
        }
    }
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            history_limit: config.history_limit(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
        }
    }
}

/// Frame sink for one request.
struct Emitter {
    tx: mpsc::Sender<SseFrame>,
    session_id: String,
    message_id: Option<String>,
}

impl Emitter {
    /// False once the client has gone away.
    async fn emit(&self, body: FrameBody) -> bool {
        let frame = SseFrame::new(&self.session_id, self.message_id.as_deref(), body);
        debug!(kind = frame.kind(), "Emitting frame");
        self.tx.send(frame).await.is_ok()
    }

    async fn error(&self, code: &str, message: impl Into<String>) {
        let error = ErrorInfo {
            code: code.to_string(),
            message: message.into(),
        };
        self.emit(FrameBody::Error { error }).await;
    }
}

/// Accumulated state of the assistant reply being streamed.
struct Turn {
    message_id: String,
    content: String,
    tool_call_ids: Vec<String>,
    usage: Option<TokenUsage>,
}

/// Everything `STREAMING` needs, assembled in `CONTEXT_READY`.
struct Prepared {
    completion: CompletionRequest,
    tools: ToolIndex,
}

pub struct Orchestrator {
    store: Arc<dyn ChatStore>,
    catalog: Arc<dyn ToolCatalog>,
    gateway: Arc<Gateway>,
    jobs: Arc<dyn JobSubmitter>,
    context: Arc<dyn ContextInjector>,
    settings: ChatSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        catalog: Arc<dyn ToolCatalog>,
        gateway: Arc<Gateway>,
        jobs: Arc<dyn JobSubmitter>,
        context: Arc<dyn ContextInjector>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            gateway,
            jobs,
            context,
            settings,
        }
    }

    /// Start a chat request. Frames arrive on the returned stream, which
    /// always ends with `complete` or `error` unless `cancel` fires first.
    pub fn stream_chat(self: &Arc<Self>, request: ChatRequest, cancel: CancellationToken) -> FrameStream {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("chat", session_id = %request.session_id, %request_id);
        tokio::spawn(
            async move { this.run(request, request_id, cancel, tx).await }.instrument(span),
        );
        ReceiverStream::new(rx)
    }

    async fn run(
        &self,
        request: ChatRequest,
        request_id: String,
        cancel: CancellationToken,
        tx: mpsc::Sender<SseFrame>,
    ) {
        let mut out = Emitter {
            tx,
            session_id: request.session_id.clone(),
            message_id: None,
        };

        // INIT
        if request.session_id.trim().is_empty() || request.content.trim().is_empty() {
            out.error(VALIDATION_ERROR, "sessionId and content are required")
                .await;
            return;
        }
        let conversation = match self.store.load_conversation(&request.session_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                warn!("Session or agent not found");
                out.error(
                    SESSION_NOT_FOUND,
                    format!("session '{}' or its agent was not found", request.session_id),
                )
                .await;
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to load session");
                out.error(PERSISTENCE_ERROR, e.to_string()).await;
                return;
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        // CONTEXT_READY
        let mut prepared = match self.prepare(&request, &conversation).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "Failed to prepare context");
                out.error(PERSISTENCE_ERROR, e.to_string()).await;
                return;
            }
        };
        prepared.completion.cancel = cancel.clone();

        // STREAMING
        let message_id = match self.insert_placeholder(&conversation, &prepared).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Failed to insert assistant message");
                out.error(PERSISTENCE_ERROR, e.to_string()).await;
                return;
            }
        };
        out.message_id = Some(message_id.clone());
        let mut turn = Turn {
            message_id,
            content: String::new(),
            tool_call_ids: Vec::new(),
            usage: None,
        };
        if !out.emit(FrameBody::Start).await {
            self.abort(&turn).await;
            return;
        }

        let mut stream = self.gateway.stream_completion(prepared.completion);
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.abort(&turn).await;
                    return;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else {
                if cancel.is_cancelled() {
                    self.abort(&turn).await;
                } else {
                    self.fail(&out, &turn, STREAM_INTERRUPTED, "model stream ended before completion")
                        .await;
                }
                return;
            };

            match event {
                StreamEvent::Content { text } => {
                    turn.content.push_str(&text);
                    if !out.emit(FrameBody::Content { content: text }).await {
                        self.abort(&turn).await;
                        return;
                    }
                }
                StreamEvent::ToolCall {
                    id,
                    name,
                    is_complete: true,
                    arguments,
                    ..
                } => {
                    let arguments = arguments.unwrap_or_default();
                    let delivered = self
                        .dispatch_tool_call(
                            &out,
                            &mut turn,
                            &prepared.tools,
                            &request,
                            &request_id,
                            &id,
                            &name,
                            &arguments,
                        )
                        .await;
                    if !delivered {
                        self.abort(&turn).await;
                        return;
                    }
                }
                StreamEvent::ToolCall { .. } => {}
                StreamEvent::Usage {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    turn.usage = Some(TokenUsage {
                        prompt_tokens,
                        completion_tokens,
                    });
                }
                StreamEvent::Error { code, message } => {
                    self.fail(&out, &turn, &code, message).await;
                    return;
                }
                StreamEvent::Done { finish_reason } => {
                    debug!(%finish_reason, "Model stream done");
                    break;
                }
            }
        }

        // FINALIZING
        self.finalize(&out, &turn, &conversation).await;
    }

    async fn prepare(
        &self,
        request: &ChatRequest,
        conversation: &ConversationContext,
    ) -> agora_core::error::Result<Prepared> {
        let session_id = &conversation.session.id;
        let agent = &conversation.agent;

        self.store
            .insert_message(Message::new(session_id, MessageRole::User, request.content.clone()))
            .await?;

        let history = self
            .store
            .recent_messages(session_id, self.settings.history_limit)
            .await?;
        let tools = ToolIndex::new(self.catalog.tools_for_agent(agent).await?);

        let completion = CompletionRequest {
            model: agent.model.clone(),
            provider: agent.provider.clone(),
            system: Some(prompt::system_prompt(
                agent,
                conversation.swarm.as_ref(),
                self.context.as_ref(),
            )),
            messages: prompt::history(&history),
            tools: tools.schemas(),
            temperature: agent.temperature.or(self.settings.temperature),
            max_tokens: self.settings.max_tokens,
            ..Default::default()
        };
        debug!(
            history = completion.messages.len(),
            tools = completion.tools.len(),
            "Context ready"
        );
        Ok(Prepared { completion, tools })
    }

    async fn insert_placeholder(
        &self,
        conversation: &ConversationContext,
        prepared: &Prepared,
    ) -> agora_core::error::Result<String> {
        let agent = &conversation.agent;
        let mut message = Message::new(&conversation.session.id, MessageRole::Assistant, "");
        message.is_complete = false;
        message.metadata.model = Some(agent.model.clone());
        message.metadata.provider = Some(
            prepared
                .completion
                .provider
                .clone()
                .unwrap_or_else(|| route_model(&agent.model).0.to_string()),
        );
        message.metadata.swarm = conversation.swarm.as_ref().map(|swarm| SwarmAnnotation {
            swarm_id: swarm.id.clone(),
            agent_id: agent.id.clone(),
        });
        self.store.insert_message(message).await
    }

    /// Persist and enqueue one complete tool call. Returns false only when
    /// the client has gone away; per-call failures never end the stream.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_call(
        &self,
        out: &Emitter,
        turn: &mut Turn,
        tools: &ToolIndex,
        request: &ChatRequest,
        request_id: &str,
        provider_call_id: &str,
        name: &str,
        raw_arguments: &str,
    ) -> bool {
        let call_id = uuid::Uuid::new_v4().to_string();
        let parsed = serde_json::from_str::<Value>(raw_arguments)
            .ok()
            .filter(Value::is_object);
        let arguments = parsed
            .clone()
            .unwrap_or_else(|| Value::String(raw_arguments.to_string()));

        let frame = ToolCallFrame {
            id: call_id.clone(),
            tool_name: name.to_string(),
            arguments: arguments.clone(),
        };
        if !out.emit(FrameBody::ToolCall { tool_call: frame }).await {
            return false;
        }

        let tool = tools.get(name);
        let mut row = ToolCall::pending(&call_id, &turn.message_id, name, arguments);
        row.tool_id = tool.map(|t| t.id.clone());
        row.server_id = tool.map(|t| t.server_id.clone());
        if let Err(e) = self.store.insert_tool_call(row).await {
            // The frame is already out; give the call a terminal status on the message
            error!(tool_call_id = %call_id, error = %e, "Failed to persist tool call");
            self.mark_tool_error(&call_id, &turn.message_id).await;
            return true;
        }
        turn.tool_call_ids.push(call_id.clone());

        let failure = match (parsed, tool) {
            (None, _) => format!("malformed tool-call arguments: {raw_arguments}"),
            (Some(_), None) => format!("unknown tool '{name}'"),
            (Some(arguments), Some(tool)) => {
                let job = ToolExecutionJob {
                    tool_call_id: call_id.clone(),
                    server_id: tool.server_id.clone(),
                    tool_name: name.to_string(),
                    tool_id: Some(tool.id.clone()),
                    arguments,
                    session_id: request.session_id.clone(),
                    message_id: turn.message_id.clone(),
                    request_id: request_id.to_string(),
                };
                match self.jobs.submit(job).await {
                    Ok(job_id) => {
                        info!(tool_call_id = %call_id, provider_call_id, %job_id, tool = name, "Tool call dispatched");
                        let pending = ToolPendingFrame {
                            id: call_id,
                            tool_name: name.to_string(),
                        };
                        return out
                            .emit(FrameBody::ToolPending { tool_call: pending })
                            .await;
                    }
                    Err(e) => format!("failed to enqueue tool job: {e}"),
                }
            }
        };

        warn!(tool_call_id = %call_id, tool = name, reason = %failure, "Tool call rejected");
        self.fail_tool_call(&call_id, &turn.message_id, failure).await;
        true
    }

    async fn fail_tool_call(&self, call_id: &str, message_id: &str, reason: String) {
        if let Err(e) = self
            .store
            .update_tool_call(call_id, ToolCallUpdate::failed(reason))
            .await
        {
            error!(tool_call_id = call_id, error = %e, "Failed to record tool call error");
        }
        self.mark_tool_error(call_id, message_id).await;
    }

    async fn mark_tool_error(&self, call_id: &str, message_id: &str) {
        let patch = MessagePatch {
            tool_status: Some((call_id.to_string(), ToolCallStatus::Error)),
            ..Default::default()
        };
        if let Err(e) = self.store.patch_message(message_id, patch).await {
            warn!(tool_call_id = call_id, error = %e, "Failed to record tool status");
        }
    }

    /// Gateway failure: the partial reply is discarded and the placeholder
    /// stays incomplete, carrying the error.
    async fn fail(&self, out: &Emitter, turn: &Turn, code: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(message_id = %turn.message_id, code, %message, "Chat stream failed");
        let patch = MessagePatch {
            tool_call_ids: Some(turn.tool_call_ids.clone()),
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.clone(),
            }),
            ..Default::default()
        };
        if let Err(e) = self.store.patch_message(&turn.message_id, patch).await {
            error!(message_id = %turn.message_id, error = %e, "Failed to record stream error");
        }
        out.error(code, message).await;
    }

    /// Client went away. Submitted jobs keep running; no more frames.
    async fn abort(&self, turn: &Turn) {
        info!(
            message_id = %turn.message_id,
            tool_calls = turn.tool_call_ids.len(),
            "Chat request aborted by client"
        );
        let patch = MessagePatch {
            tool_call_ids: Some(turn.tool_call_ids.clone()),
            aborted: Some(true),
            ..Default::default()
        };
        if let Err(e) = self.store.patch_message(&turn.message_id, patch).await {
            warn!(message_id = %turn.message_id, error = %e, "Failed to record abort");
        }
    }

    async fn finalize(&self, out: &Emitter, turn: &Turn, conversation: &ConversationContext) {
        let patch = MessagePatch {
            content: Some(turn.content.clone()),
            is_complete: Some(true),
            tool_call_ids: Some(turn.tool_call_ids.clone()),
            usage: turn.usage,
            ..Default::default()
        };
        if let Err(e) = self.store.patch_message(&turn.message_id, patch).await {
            error!(message_id = %turn.message_id, error = %e, "Failed to persist assistant message");
            out.error(PERSISTENCE_ERROR, e.to_string()).await;
            return;
        }

        if let Err(e) = self.store.touch_session(&conversation.session.id, 2).await {
            warn!(error = %e, "Failed to update session counters");
        }
        if let Err(e) = self.store.record_agent_usage(&conversation.agent.id).await {
            warn!(agent_id = %conversation.agent.id, error = %e, "Failed to record agent usage");
        }

        info!(
            message_id = %turn.message_id,
            chars = turn.content.len(),
            tool_calls = turn.tool_call_ids.len(),
            "Assistant reply complete"
        );
        out.emit(FrameBody::Complete).await;
    }
}
