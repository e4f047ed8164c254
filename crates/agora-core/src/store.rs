//! Persistence collaborators and the bundled store.
//!
//! [`ChatStore`] owns sessions, messages, and tool calls; [`ToolCatalog`]
//! owns tool servers and their synced tools. [`Store`] implements both on
//! in-memory maps, optionally snapshotting to a JSON file after every write.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AgoraError, Result};
use crate::model::{
    Agent, ChatSession, ConnectionStatus, ErrorInfo, McpServer, Message, RegisteredTool, Swarm,
    ToolCall, ToolCallStatus, ToolCallUpdate, TokenUsage,
};

/// A session joined with the agent that answers it.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub session: ChatSession,
    pub agent: Agent,
    pub swarm: Option<Swarm>,
}

/// A partial update applied atomically to a message.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub is_complete: Option<bool>,
    pub tool_call_ids: Option<Vec<String>>,
    pub tool_status: Option<(String, ToolCallStatus)>,
    pub usage: Option<TokenUsage>,
    pub error: Option<ErrorInfo>,
    pub aborted: Option<bool>,
}

/// A tool as listed by a server, before it has a catalog id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert_session(&self, session: ChatSession) -> Result<String>;
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>>;
    async fn insert_agent(&self, agent: Agent) -> Result<String>;
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn insert_swarm(&self, swarm: Swarm) -> Result<String>;
    async fn get_swarm(&self, id: &str) -> Result<Option<Swarm>>;

    /// Find a session by id with its answering agent joined in. `None` when
    /// either the session or its agent is missing.
    async fn load_conversation(&self, session_id: &str) -> Result<Option<ConversationContext>>;

    async fn insert_message(&self, message: Message) -> Result<String>;
    async fn get_message(&self, id: &str) -> Result<Option<Message>>;
    async fn patch_message(&self, id: &str, patch: MessagePatch) -> Result<()>;

    /// The last `limit` messages of a session, oldest first.
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    async fn insert_tool_call(&self, call: ToolCall) -> Result<String>;
    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCall>>;

    /// Apply a status write keyed by tool call id. Rejects transitions out of
    /// a terminal state into a non-terminal one.
    async fn update_tool_call(&self, id: &str, update: ToolCallUpdate) -> Result<ToolCall>;
    async fn tool_calls_for_message(&self, message_id: &str) -> Result<Vec<ToolCall>>;

    /// Bump `message_count` and set `last_message_at = now`.
    async fn touch_session(&self, session_id: &str, added_messages: u64) -> Result<()>;
    async fn record_agent_usage(&self, agent_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn upsert_server(&self, server: McpServer) -> Result<()>;
    async fn get_server(&self, id: &str) -> Result<Option<McpServer>>;
    async fn list_servers(&self) -> Result<Vec<McpServer>>;
    async fn set_server_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        reason: Option<String>,
    ) -> Result<()>;
    async fn record_server_usage(&self, id: &str) -> Result<()>;

    /// Upsert the tools a server advertises, keyed by `(server_id, name)`.
    async fn upsert_tools(
        &self,
        server_id: &str,
        tools: Vec<ToolDescriptor>,
    ) -> Result<Vec<RegisteredTool>>;
    /// Tools synced from one server, sorted by name.
    async fn server_tools(&self, server_id: &str) -> Result<Vec<RegisteredTool>>;
    async fn tools_for_agent(&self, agent: &Agent) -> Result<Vec<RegisteredTool>>;
    async fn record_tool_usage(&self, tool_id: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    sessions: HashMap<String, ChatSession>,
    agents: HashMap<String, Agent>,
    swarms: HashMap<String, Swarm>,
    messages: HashMap<String, Message>,
    tool_calls: HashMap<String, ToolCall>,
    servers: HashMap<String, McpServer>,
    tools: HashMap<String, RegisteredTool>,
    next_seq: u64,
}

/// Map-backed store with optional JSON snapshot persistence.
///
/// Layout when persistent: `<dir>/store.json`, rewritten atomically
/// (temp file + rename) while the write lock is held.
pub struct Store {
    data: RwLock<StoreData>,
    path: Option<PathBuf>,
}

impl Store {
    /// Ephemeral store, used by tests and one-shot runs.
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            path: None,
        }
    }

    /// Open (or create) a persistent store under `dir`.
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("store.json");
        let data = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&raw)
                .map_err(|e| AgoraError::Persistence(format!("corrupt store snapshot: {e}")))?
        } else {
            StoreData::default()
        };
        debug!(path = %path.display(), sessions = data.sessions.len(), "Opened store");
        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
        })
    }

    async fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string(data)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for Store {
    async fn insert_session(&self, session: ChatSession) -> Result<String> {
        let mut data = self.data.write().await;
        let id = session.id.clone();
        data.sessions.insert(id.clone(), session);
        self.persist(&data).await?;
        Ok(id)
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        Ok(self.data.read().await.sessions.get(id).cloned())
    }

    async fn insert_agent(&self, agent: Agent) -> Result<String> {
        let mut data = self.data.write().await;
        let id = agent.id.clone();
        data.agents.insert(id.clone(), agent);
        self.persist(&data).await?;
        Ok(id)
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.data.read().await.agents.get(id).cloned())
    }

    async fn insert_swarm(&self, swarm: Swarm) -> Result<String> {
        let mut data = self.data.write().await;
        let id = swarm.id.clone();
        data.swarms.insert(id.clone(), swarm);
        self.persist(&data).await?;
        Ok(id)
    }

    async fn get_swarm(&self, id: &str) -> Result<Option<Swarm>> {
        Ok(self.data.read().await.swarms.get(id).cloned())
    }

    async fn load_conversation(&self, session_id: &str) -> Result<Option<ConversationContext>> {
        let data = self.data.read().await;
        let Some(session) = data.sessions.get(session_id) else {
            return Ok(None);
        };

        let swarm = session
            .swarm_id
            .as_ref()
            .and_then(|id| data.swarms.get(id))
            .cloned();

        // A direct agent binding wins over the swarm's lead.
        let agent_id = session
            .agent_id
            .clone()
            .or_else(|| swarm.as_ref().map(|s| s.lead_agent_id.clone()));

        let Some(agent) = agent_id.and_then(|id| data.agents.get(&id).cloned()) else {
            return Ok(None);
        };

        Ok(Some(ConversationContext {
            session: session.clone(),
            agent,
            swarm,
        }))
    }

    async fn insert_message(&self, mut message: Message) -> Result<String> {
        let mut data = self.data.write().await;
        if !data.sessions.contains_key(&message.session_id) {
            return Err(AgoraError::NotFound(format!(
                "session {}",
                message.session_id
            )));
        }
        data.next_seq += 1;
        message.seq = data.next_seq;
        let id = message.id.clone();
        data.messages.insert(id.clone(), message);
        self.persist(&data).await?;
        Ok(id)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.data.read().await.messages.get(id).cloned())
    }

    async fn patch_message(&self, id: &str, patch: MessagePatch) -> Result<()> {
        let mut data = self.data.write().await;
        let message = data
            .messages
            .get_mut(id)
            .ok_or_else(|| AgoraError::NotFound(format!("message {id}")))?;

        if message.is_complete && patch.content.is_some() {
            return Err(AgoraError::Validation(format!(
                "message {id} is complete and its content is immutable"
            )));
        }
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(is_complete) = patch.is_complete {
            message.is_complete = is_complete;
        }
        if let Some(ids) = patch.tool_call_ids {
            message.metadata.tool_call_ids = ids;
        }
        if let Some((call_id, status)) = patch.tool_status {
            message.metadata.tool_status.insert(call_id, status);
        }
        if let Some(usage) = patch.usage {
            message.metadata.usage = Some(usage);
        }
        if let Some(error) = patch.error {
            message.metadata.error = Some(error);
        }
        if let Some(aborted) = patch.aborted {
            message.metadata.aborted = aborted;
        }

        self.persist(&data).await
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let data = self.data.read().await;
        let mut messages: Vec<Message> = data
            .messages
            .values()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    async fn insert_tool_call(&self, call: ToolCall) -> Result<String> {
        let mut data = self.data.write().await;
        if !data.messages.contains_key(&call.message_id) {
            return Err(AgoraError::NotFound(format!("message {}", call.message_id)));
        }
        let id = call.id.clone();
        // Same id re-inserted overwrites instead of duplicating.
        data.tool_calls.insert(id.clone(), call);
        self.persist(&data).await?;
        Ok(id)
    }

    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCall>> {
        Ok(self.data.read().await.tool_calls.get(id).cloned())
    }

    async fn update_tool_call(&self, id: &str, update: ToolCallUpdate) -> Result<ToolCall> {
        let mut data = self.data.write().await;
        let call = data
            .tool_calls
            .get_mut(id)
            .ok_or_else(|| AgoraError::NotFound(format!("tool call {id}")))?;

        if !call.status.can_transition_to(update.status) {
            return Err(AgoraError::InvalidTransition {
                id: id.to_string(),
                from: call.status,
                to: update.status,
            });
        }

        call.status = update.status;
        if update.status.is_terminal() {
            call.result = update.result;
            call.error = update.error;
            call.completed_at = Some(Utc::now());
        }
        let updated = call.clone();
        self.persist(&data).await?;
        Ok(updated)
    }

    async fn tool_calls_for_message(&self, message_id: &str) -> Result<Vec<ToolCall>> {
        let data = self.data.read().await;
        let mut calls: Vec<ToolCall> = data
            .tool_calls
            .values()
            .filter(|c| c.message_id == message_id)
            .cloned()
            .collect();
        calls.sort_by_key(|c| c.created_at);
        Ok(calls)
    }

    async fn touch_session(&self, session_id: &str, added_messages: u64) -> Result<()> {
        let mut data = self.data.write().await;
        let session = data
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AgoraError::NotFound(format!("session {session_id}")))?;
        session.message_count += added_messages;
        session.last_message_at = Some(Utc::now());
        self.persist(&data).await
    }

    async fn record_agent_usage(&self, agent_id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        if let Some(agent) = data.agents.get_mut(agent_id) {
            agent.usage_count += 1;
            agent.last_used_at = Some(Utc::now());
        }
        self.persist(&data).await
    }
}

#[async_trait]
impl ToolCatalog for Store {
    async fn upsert_server(&self, server: McpServer) -> Result<()> {
        let mut data = self.data.write().await;
        data.servers.insert(server.id.clone(), server);
        self.persist(&data).await
    }

    async fn get_server(&self, id: &str) -> Result<Option<McpServer>> {
        Ok(self.data.read().await.servers.get(id).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<McpServer>> {
        let data = self.data.read().await;
        let mut servers: Vec<McpServer> = data.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn set_server_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let mut data = self.data.write().await;
        let server = data
            .servers
            .get_mut(id)
            .ok_or_else(|| AgoraError::NotFound(format!("server {id}")))?;
        server.status = status;
        server.status_reason = reason;
        self.persist(&data).await
    }

    async fn record_server_usage(&self, id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        if let Some(server) = data.servers.get_mut(id) {
            server.tool_call_count += 1;
            server.last_used_at = Some(Utc::now());
        }
        self.persist(&data).await
    }

    async fn upsert_tools(
        &self,
        server_id: &str,
        tools: Vec<ToolDescriptor>,
    ) -> Result<Vec<RegisteredTool>> {
        let mut data = self.data.write().await;
        let mut synced = Vec::with_capacity(tools.len());

        for descriptor in tools {
            let existing = data
                .tools
                .values_mut()
                .find(|t| t.server_id == server_id && t.name == descriptor.name);

            let tool = match existing {
                Some(tool) => {
                    tool.description = descriptor.description;
                    tool.input_schema = descriptor.input_schema;
                    tool.clone()
                }
                None => {
                    let tool = RegisteredTool {
                        id: uuid::Uuid::new_v4().to_string(),
                        server_id: server_id.to_string(),
                        name: descriptor.name,
                        description: descriptor.description,
                        input_schema: descriptor.input_schema,
                        usage_count: 0,
                        last_used_at: None,
                    };
                    data.tools.insert(tool.id.clone(), tool.clone());
                    tool
                }
            };
            synced.push(tool);
        }

        self.persist(&data).await?;
        Ok(synced)
    }

    async fn server_tools(&self, server_id: &str) -> Result<Vec<RegisteredTool>> {
        let data = self.data.read().await;
        let mut tools: Vec<RegisteredTool> = data
            .tools
            .values()
            .filter(|t| t.server_id == server_id)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    async fn tools_for_agent(&self, agent: &Agent) -> Result<Vec<RegisteredTool>> {
        let data = self.data.read().await;
        Ok(agent
            .tool_ids
            .iter()
            .filter_map(|id| data.tools.get(id).cloned())
            .collect())
    }

    async fn record_tool_usage(&self, tool_id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        if let Some(tool) = data.tools.get_mut(tool_id) {
            tool.usage_count += 1;
            tool.last_used_at = Some(Utc::now());
        }
        self.persist(&data).await
    }
}
