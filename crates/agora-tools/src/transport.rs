//! MCP client transports.
//!
//! JSON-RPC 2.0 over a child process (newline-delimited JSON on stdin/stdout)
//! or over HTTP POST. Responses are routed to callers by request id, so a
//! caller that gives up (timeout) never causes a later caller to receive the
//! wrong response. `notifications/progress` messages are relayed to the
//! progress callback registered for their token.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_core::model::{McpServer, McpTransport};
use agora_core::store::ToolDescriptor;
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::ProgressFn;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A live, initialized connection to one tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>>;

    /// Invoke a tool, returning the raw MCP `tools/call` result.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        progress: Option<ProgressFn>,
    ) -> anyhow::Result<Value>;

    async fn close(&self);
}

/// Builds initialized transports for registered servers.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, server: &McpServer) -> anyhow::Result<Arc<dyn ToolTransport>>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl JsonRpcResponse {
    fn into_result(self) -> anyhow::Result<Value> {
        match self.error {
            Some(e) => bail!("JSON-RPC error {}: {}", e.code, e.message),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Convert a `notifications/progress` payload to a percentage.
fn progress_percent(params: &Value) -> Option<(String, f64)> {
    let token = match params.get("progressToken")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let progress = params.get("progress")?.as_f64()?;
    let percent = match params.get("total").and_then(Value::as_f64) {
        Some(total) if total > 0.0 => progress / total * 100.0,
        _ => progress,
    };
    Some((token, percent.clamp(0.0, 100.0)))
}

fn with_progress_token(mut params: Value, token: &str) -> Value {
    if let Value::Object(map) = &mut params {
        map.insert("_meta".into(), json!({ "progressToken": token }));
    }
    params
}

/// Low-level JSON-RPC channel shared by both transports.
#[async_trait]
trait RpcChannel: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: Value,
        progress: Option<ProgressFn>,
    ) -> anyhow::Result<Value>;
    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()>;
    async fn shutdown(&self);
}

/// An initialized MCP session over some channel.
pub struct McpClient {
    server_id: String,
    channel: Box<dyn RpcChannel>,
}

impl McpClient {
    async fn initialize(server_id: &str, channel: Box<dyn RpcChannel>) -> anyhow::Result<Self> {
        let result = channel
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "agora", "version": env!("CARGO_PKG_VERSION") },
                }),
                None,
            )
            .await
            .with_context(|| format!("initialize handshake with '{server_id}' failed"))?;

        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(server_id, protocol_version = version, "MCP server initialized");

        channel
            .notify("notifications/initialized", json!({}))
            .await?;

        Ok(Self {
            server_id: server_id.to_string(),
            channel,
        })
    }
}

#[async_trait]
impl ToolTransport for McpClient {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.channel.request("tools/list", params, None).await?;
            for tool in result
                .get("tools")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                tools.push(ToolDescriptor {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                });
            }
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        debug!(server_id = %self.server_id, count = tools.len(), "Listed tools");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        progress: Option<ProgressFn>,
    ) -> anyhow::Result<Value> {
        self.channel
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                progress,
            )
            .await
    }

    async fn close(&self) {
        self.channel.shutdown().await;
    }
}

/// Connects real MCP servers from their declared transport.
#[derive(Debug, Clone, Default)]
pub struct McpTransportFactory;

#[async_trait]
impl TransportFactory for McpTransportFactory {
    async fn connect(&self, server: &McpServer) -> anyhow::Result<Arc<dyn ToolTransport>> {
        let channel: Box<dyn RpcChannel> = match &server.transport {
            McpTransport::Stdio { command, args, env } => {
                Box::new(StdioChannel::spawn(&server.id, command, args, env)?)
            }
            McpTransport::Http { url, headers } => Box::new(HttpChannel::new(url, headers)?),
        };
        let client = McpClient::initialize(&server.id, channel).await?;
        Ok(Arc::new(client))
    }
}

// --- stdio ---

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    progress: HashMap<String, ProgressFn>,
}

struct StdioShared {
    routes: Mutex<Routes>,
    closed: AtomicBool,
}

impl StdioShared {
    fn dispatch(&self, server_id: &str, line: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            // Servers sometimes log to stdout
            trace!(server_id, line, "Ignoring non-JSON line");
            return;
        };

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            if method == "notifications/progress" {
                let relay = value.get("params").and_then(progress_percent).and_then(
                    |(token, pct)| {
                        let routes = self.routes.lock().ok()?;
                        routes.progress.get(&token).cloned().map(|f| (f, pct))
                    },
                );
                if let Some((callback, pct)) = relay {
                    callback(pct);
                }
            } else {
                trace!(server_id, method, "Ignoring server-initiated message");
            }
            return;
        }

        let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) else {
            return;
        };
        let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
            return;
        };
        let sender = self
            .routes
            .lock()
            .ok()
            .and_then(|mut r| r.pending.remove(&id));
        match sender {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(server_id, id, "Dropping response for abandoned request"),
        }
    }

    /// Register a request's routes. Checked under the route lock so a
    /// request racing `close` cannot land in an already drained table.
    fn register(
        &self,
        server_id: &str,
        id: u64,
        tx: oneshot::Sender<JsonRpcResponse>,
        progress: Option<(String, ProgressFn)>,
    ) -> anyhow::Result<()> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| anyhow!("route table poisoned"))?;
        if self.closed.load(Ordering::SeqCst) {
            bail!("server '{server_id}' has exited");
        }
        routes.pending.insert(id, tx);
        if let Some((token, callback)) = progress {
            routes.progress.insert(token, callback);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut routes) = self.routes.lock() {
            // Dropping the senders wakes every waiter with an error
            routes.pending.clear();
            routes.progress.clear();
        }
    }
}

/// Removes a request's routes when its caller finishes or gives up.
struct RouteGuard<'a> {
    shared: &'a StdioShared,
    id: u64,
    token: Option<String>,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut routes) = self.shared.routes.lock() {
            routes.pending.remove(&self.id);
            if let Some(token) = &self.token {
                routes.progress.remove(token);
            }
        }
    }
}

struct StdioChannel {
    server_id: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Option<Child>>,
    shared: Arc<StdioShared>,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioChannel {
    fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{command}' for server '{server_id}'"))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("child stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("child stdout unavailable"))?;
        let stderr = child.stderr.take();

        let shared = Arc::new(StdioShared {
            routes: Mutex::new(Routes::default()),
            closed: AtomicBool::new(false),
        });

        let mut tasks = Vec::new();
        let reader_shared = shared.clone();
        let reader_id = server_id.to_string();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => reader_shared.dispatch(&reader_id, line.trim()),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(server_id = %reader_id, error = %e, "Failed reading server stdout");
                        break;
                    }
                }
            }
            debug!(server_id = %reader_id, "Server stdout closed");
            reader_shared.close();
        }));

        if let Some(stderr) = stderr {
            let stderr_id = server_id.to_string();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server_id = %stderr_id, "{line}");
                }
            }));
        }

        Ok(Self {
            server_id: server_id.to_string(),
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(Some(child)),
            shared,
            next_id: AtomicU64::new(1),
            tasks,
        })
    }

    async fn write_message(&self, message: &JsonRpcRequest<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .with_context(|| format!("failed writing to server '{}'", self.server_id))?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn request(
        &self,
        method: &str,
        params: Value,
        progress: Option<ProgressFn>,
    ) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let token = progress.as_ref().map(|_| format!("agora-{id}"));
        let relay = token.clone().zip(progress);
        self.shared.register(&self.server_id, id, tx, relay)?;
        let _guard = RouteGuard {
            shared: &self.shared,
            id,
            token: token.clone(),
        };

        let params = match &token {
            Some(t) => with_progress_token(params, t),
            None => params,
        };
        self.write_message(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        })
        .await?;

        let response = rx
            .await
            .map_err(|_| anyhow!("server '{}' closed before responding", self.server_id))?;
        response.into_result()
    }

    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.write_message(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        })
        .await
    }

    async fn shutdown(&self) {
        self.shared.close();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        for task in &self.tasks {
            task.abort();
        }
        debug!(server_id = %self.server_id, "Stdio server stopped");
    }
}

// --- HTTP ---

struct HttpChannel {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpChannel {
    fn new(url: &str, headers: &HashMap<String, String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            headers: headers.clone(),
            client,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, body: &JsonRpcRequest<'_>) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream");
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        let session = self.session_id.lock().ok().and_then(|s| s.clone());
        if let Some(session) = session {
            req = req.header("mcp-session-id", session);
        }

        let response = req.json(body).send().await?;
        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session_id.lock() {
                *slot = Some(session.to_string());
            }
        }
        Ok(response)
    }
}

/// Read an SSE-framed response until the message answering `id` arrives,
/// relaying progress notifications on the way.
async fn read_event_stream(
    response: reqwest::Response,
    id: u64,
    token: Option<&str>,
    progress: Option<&ProgressFn>,
) -> anyhow::Result<JsonRpcResponse> {
    let mut bytes = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = bytes.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            if value.get("method").and_then(Value::as_str) == Some("notifications/progress") {
                if let (Some((t, pct)), Some(callback), Some(expected)) = (
                    value.get("params").and_then(progress_percent),
                    progress,
                    token,
                ) {
                    if t == expected {
                        callback(pct);
                    }
                }
                continue;
            }
            if value.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(serde_json::from_value(value)?);
            }
        }
    }
    bail!("event stream ended before response {id}")
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn request(
        &self,
        method: &str,
        params: Value,
        progress: Option<ProgressFn>,
    ) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = progress.as_ref().map(|_| format!("agora-{id}"));
        let params = match &token {
            Some(t) => with_progress_token(params, t),
            None => params,
        };

        let response = self
            .post(&JsonRpcRequest {
                jsonrpc: "2.0",
                id: Some(id),
                method,
                params,
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("tool server returned HTTP {status}: {body}");
        }

        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let rpc = if is_event_stream {
            read_event_stream(response, id, token.as_deref(), progress.as_ref()).await?
        } else {
            response.json::<JsonRpcResponse>().await?
        };
        rpc.into_result()
    }

    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        // Notifications get 202 with no body; failures are not actionable
        if let Err(e) = self
            .post(&JsonRpcRequest {
                jsonrpc: "2.0",
                id: None,
                method,
                params,
            })
            .await
        {
            debug!(url = %self.url, error = %e, "Notification delivery failed");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let session = self.session_id.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            let _ = self
                .client
                .delete(&self.url)
                .header("mcp-session-id", session)
                .send()
                .await;
        }
    }
}
