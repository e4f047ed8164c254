//! Connection pool with per-server sandboxing and idle eviction.
//!
//! The connection map is shared between callers and the idle sweeper. A
//! caller takes a [`Lease`] under the map lock, which bumps the connection's
//! in-flight count; the sweeper only evicts entries whose in-flight count is
//! zero, also under the map lock. So a call never starts on a connection
//! being evicted, and an eviction never interrupts a call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use agora_core::config::Config;
use agora_core::model::{ConnectionStatus, SandboxPolicy};
use agora_core::store::ToolCatalog;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::result::normalize_result;
use crate::sandbox::{self, SandboxViolation};
use crate::transport::{ToolTransport, TransportFactory};
use crate::{ProgressFn, ToolError, ToolExecutionResult};

struct Connection {
    server_id: String,
    transport: Arc<dyn ToolTransport>,
    policy: SandboxPolicy,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    last_used: Mutex<Instant>,
    retired: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    fn new(server_id: &str, transport: Arc<dyn ToolTransport>, policy: SandboxPolicy) -> Self {
        Self {
            server_id: server_id.to_string(),
            transport,
            policy,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Take one slot of the call quota.
    fn reserve_call(&self) -> Result<(), SandboxViolation> {
        let limit = self.policy.max_tool_calls_per_session;
        self.calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| SandboxViolation::QuotaExceeded { limit })
    }

    fn release_call(&self) {
        let _ = self
            .calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.close().await;
        debug!(server_id = %self.server_id, "Connection closed");
    }
}

/// Marks a connection busy for the duration of one call.
struct Lease {
    conn: Arc<Connection>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Ok(mut last) = self.conn.last_used.lock() {
            *last = Instant::now();
        }
        let remaining = self.conn.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.conn.retired.load(Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let conn = self.conn.clone();
                handle.spawn(async move { conn.close().await });
            }
        }
    }
}

pub struct ConnectionManager {
    catalog: Arc<dyn ToolCatalog>,
    factory: Arc<dyn TransportFactory>,
    default_policy: SandboxPolicy,
    connect_timeout: Duration,
    idle_timeout: Duration,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    connect_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(
        catalog: Arc<dyn ToolCatalog>,
        factory: Arc<dyn TransportFactory>,
        default_policy: SandboxPolicy,
    ) -> Self {
        Self {
            catalog,
            factory,
            default_policy,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            connections: Mutex::new(HashMap::new()),
            connect_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn ToolCatalog>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self::new(catalog, factory, config.default_sandbox())
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms()))
            .with_idle_timeout(Duration::from_millis(config.idle_timeout_ms()))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.connect_gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    fn try_lease(&self, server_id: &str) -> Option<Lease> {
        let map = self.connections();
        let conn = map.get(server_id)?;
        conn.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(Lease { conn: conn.clone() })
    }

    /// Lease a live connection, connecting first if needed. Concurrent
    /// callers for the same server share one handshake.
    async fn acquire(&self, server_id: &str) -> Result<Lease, ToolError> {
        if let Some(lease) = self.try_lease(server_id) {
            return Ok(lease);
        }
        let gate = self.gate(server_id);
        let _guard = gate.lock().await;
        if let Some(lease) = self.try_lease(server_id) {
            return Ok(lease);
        }

        let conn = Arc::new(self.connect(server_id).await?);
        conn.in_flight.fetch_add(1, Ordering::SeqCst);
        self.connections()
            .insert(server_id.to_string(), conn.clone());
        Ok(Lease { conn })
    }

    async fn connect(&self, server_id: &str) -> Result<Connection, ToolError> {
        let server = self
            .catalog
            .get_server(server_id)
            .await?
            .ok_or_else(|| ToolError::UnknownServer(server_id.to_string()))?;

        self.catalog
            .set_server_status(server_id, ConnectionStatus::Connecting, None)
            .await?;
        debug!(server_id, "Connecting to tool server");

        let factory = self.factory.clone();
        let handshake = async {
            let transport = factory.connect(&server).await?;
            match transport.list_tools().await {
                Ok(tools) => Ok::<_, anyhow::Error>((transport, tools)),
                Err(e) => {
                    transport.close().await;
                    Err(e)
                }
            }
        };

        let reason = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok((transport, tools))) => {
                let count = tools.len();
                if let Err(e) = self.catalog.upsert_tools(server_id, tools).await {
                    transport.close().await;
                    self.mark_failed(server_id, &e.to_string()).await;
                    return Err(e.into());
                }
                self.catalog
                    .set_server_status(server_id, ConnectionStatus::Connected, None)
                    .await?;
                info!(server_id, tools = count, "Tool server connected");

                let policy = server
                    .sandbox
                    .clone()
                    .unwrap_or_else(|| self.default_policy.clone());
                return Ok(Connection::new(server_id, transport, policy));
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!(
                "connection timed out after {}ms",
                self.connect_timeout.as_millis()
            ),
        };

        self.mark_failed(server_id, &reason).await;
        Err(ToolError::Connect {
            server: server_id.to_string(),
            reason,
        })
    }

    async fn mark_failed(&self, server_id: &str, reason: &str) {
        warn!(server_id, reason, "Tool server connection failed");
        if let Err(e) = self
            .catalog
            .set_server_status(server_id, ConnectionStatus::Error, Some(reason.to_string()))
            .await
        {
            warn!(server_id, error = %e, "Failed to record connection error");
        }
    }

    /// The server's own sandbox policy, or the default when it has none.
    async fn policy_for(&self, server_id: &str) -> Result<SandboxPolicy, ToolError> {
        let server = self
            .catalog
            .get_server(server_id)
            .await?
            .ok_or_else(|| ToolError::UnknownServer(server_id.to_string()))?;
        Ok(server.sandbox.unwrap_or_else(|| self.default_policy.clone()))
    }

    /// A live client for `server_id`, connecting on demand.
    pub async fn get_client(&self, server_id: &str) -> Result<Arc<dyn ToolTransport>, ToolError> {
        let lease = self.acquire(server_id).await?;
        Ok(lease.conn.transport.clone())
    }

    /// Run one tool call under the server's sandbox policy.
    ///
    /// Never fails: connection errors, sandbox rejections, timeouts and tool
    /// errors are all reported as `success = false`.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        on_progress: Option<ProgressFn>,
    ) -> ToolExecutionResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        // Argument checks run before connecting so a rejected call never
        // starts the server.
        let policy = match self.policy_for(server_id).await {
            Ok(policy) => policy,
            Err(e) => return ToolExecutionResult::failed(e.to_string(), elapsed()),
        };
        if let Err(violation) = sandbox::check_arguments(&policy, &arguments) {
            warn!(server_id, tool_name, "{violation}");
            return ToolExecutionResult::failed(violation.to_string(), elapsed());
        }

        let lease = match self.acquire(server_id).await {
            Ok(lease) => lease,
            Err(e) => return ToolExecutionResult::failed(e.to_string(), elapsed()),
        };
        let conn = &lease.conn;

        if let Err(violation) = conn.reserve_call() {
            warn!(server_id, tool_name, "{violation}");
            return ToolExecutionResult::failed(violation.to_string(), elapsed());
        }

        let limit_ms = conn.policy.max_execution_time_ms;
        let call = conn.transport.call_tool(tool_name, arguments, on_progress);
        let result = match tokio::time::timeout(Duration::from_millis(limit_ms), call).await {
            Ok(Ok(raw)) => match normalize_result(raw) {
                Ok(value) => ToolExecutionResult::ok(value, elapsed()),
                Err(message) => ToolExecutionResult::failed(message, elapsed()),
            },
            Ok(Err(e)) => ToolExecutionResult::failed(format!("{e:#}"), elapsed()),
            Err(_) => {
                ToolExecutionResult::failed(format!("Tool execution timed out after {limit_ms}ms"), elapsed())
            }
        };

        if let Err(e) = self.catalog.record_server_usage(server_id).await {
            warn!(server_id, error = %e, "Failed to record server usage");
        }
        debug!(
            server_id,
            tool_name,
            success = result.success,
            elapsed_ms = result.execution_time_ms,
            "Tool call finished"
        );
        result
    }

    /// Drop the connection. A call in progress finishes first; the transport
    /// closes when it does.
    pub async fn disconnect(&self, server_id: &str) -> Result<(), ToolError> {
        let removed = self.connections().remove(server_id);
        if let Some(conn) = removed {
            self.retire(conn).await;
        }
        self.catalog
            .set_server_status(server_id, ConnectionStatus::Disconnected, None)
            .await?;
        info!(server_id, "Tool server disconnected");
        Ok(())
    }

    async fn retire(&self, conn: Arc<Connection>) {
        conn.retired.store(true, Ordering::SeqCst);
        if conn.in_flight.load(Ordering::SeqCst) == 0 {
            conn.close().await;
        }
    }

    pub async fn disconnect_all(&self) {
        for server_id in self.live_connections() {
            if let Err(e) = self.disconnect(&server_id).await {
                warn!(server_id, error = %e, "Disconnect failed");
            }
        }
    }

    /// Evict connections idle past the threshold with no call in flight.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let evicted: Vec<Arc<Connection>> = {
            let mut map = self.connections();
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, c)| {
                    c.in_flight.load(Ordering::SeqCst) == 0 && c.idle_for() >= self.idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for conn in evicted {
            self.retire(conn.clone()).await;
            if let Err(e) = self
                .catalog
                .set_server_status(&conn.server_id, ConnectionStatus::Disconnected, None)
                .await
            {
                warn!(server_id = %conn.server_id, error = %e, "Failed to record eviction");
            }
            info!(server_id = %conn.server_id, "Evicted idle tool connection");
            ids.push(conn.server_id.clone());
        }
        ids
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_idle().await;
                    }
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    /// Ids of servers with a live connection, sorted.
    pub fn live_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::model::{McpServer, McpTransport};
    use agora_core::store::{Store, ToolDescriptor};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Echoes arguments back; `sleep` sleeps for `ms`, `fail` errors.
    struct FakeTransport {
        calls: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ToolTransport for FakeTransport {
        async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
            Ok(vec![ToolDescriptor {
                name: "echo".into(),
                description: "Echo".into(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: Value,
            progress: Option<ProgressFn>,
        ) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(p) = progress {
                p(50.0);
            }
            match name {
                "sleep" => {
                    let ms = arguments["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({"content": [{"type": "text", "text": "slept"}]}))
                }
                "fail" => anyhow::bail!("boom"),
                _ => Ok(json!({"content": [{"type": "text", "text": arguments.to_string()}]})),
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        connects: AtomicUsize,
        calls: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        refuse: bool,
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn connect(&self, _server: &McpServer) -> anyhow::Result<Arc<dyn ToolTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                anyhow::bail!("connection refused");
            }
            Ok(Arc::new(FakeTransport {
                calls: self.calls.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    async fn setup(
        policy: Option<SandboxPolicy>,
        factory: FakeFactory,
    ) -> (Arc<Store>, Arc<FakeFactory>, ConnectionManager) {
        let store = Arc::new(Store::in_memory());
        let mut server = McpServer::new(
            "search",
            "Search",
            McpTransport::Stdio {
                command: "search-mcp".into(),
                args: vec![],
                env: HashMap::new(),
            },
        );
        server.sandbox = policy;
        store.upsert_server(server).await.unwrap();
        let factory = Arc::new(factory);
        let manager = ConnectionManager::new(store.clone(), factory.clone(), SandboxPolicy::default());
        (store, factory, manager)
    }

    #[tokio::test]
    async fn test_lazy_connect_syncs_catalog_and_reuses_connection() {
        let (store, factory, manager) = setup(None, FakeFactory::default()).await;
        assert!(manager.live_connections().is_empty());

        let r1 = manager.execute_tool("search", "echo", json!({"q": 1}), None).await;
        let r2 = manager.execute_tool("search", "echo", json!({"q": 2}), None).await;
        assert!(r1.success && r2.success);
        assert_eq!(r2.result, Some(json!({"q": 2})));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);

        let server = store.get_server("search").await.unwrap().unwrap();
        assert_eq!(server.status, ConnectionStatus::Connected);
        assert_eq!(server.tool_call_count, 2);
        let tools = store.server_tools("search").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn test_failed_connect_records_error_and_retains_nothing() {
        let factory = FakeFactory {
            refuse: true,
            ..Default::default()
        };
        let (store, _factory, manager) = setup(None, factory).await;

        let r = manager.execute_tool("search", "echo", json!({}), None).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("connection refused"));
        assert!(manager.live_connections().is_empty());

        let server = store.get_server("search").await.unwrap().unwrap();
        assert_eq!(server.status, ConnectionStatus::Error);
        assert!(server.status_reason.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unknown_server_is_structured_failure() {
        let (_store, _factory, manager) = setup(None, FakeFactory::default()).await;
        let r = manager.execute_tool("nope", "echo", json!({}), None).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("unknown tool server"));
        assert!(manager.get_client("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_network_disabled_blocks_without_side_effects() {
        let policy = SandboxPolicy {
            network_enabled: false,
            ..Default::default()
        };
        let (_store, factory, manager) = setup(Some(policy), FakeFactory::default()).await;

        let r = manager
            .execute_tool("search", "echo", json!({"url": "http://example.com"}), None)
            .await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("Network access is disabled"));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
        assert!(manager.live_connections().is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_rejection_does_not_need_reachable_server() {
        let policy = SandboxPolicy {
            network_enabled: false,
            ..Default::default()
        };
        let factory = FakeFactory {
            refuse: true,
            ..Default::default()
        };
        let (store, factory, manager) = setup(Some(policy), factory).await;

        let r = manager
            .execute_tool("search", "echo", json!({"url": "http://example.com"}), None)
            .await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("Network access is disabled"));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
        let server = store.get_server("search").await.unwrap().unwrap();
        assert_ne!(server.status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_domain_allowlist() {
        let policy = SandboxPolicy {
            allowed_domains: vec!["example.com".into()],
            ..Default::default()
        };
        let (_store, factory, manager) = setup(Some(policy), FakeFactory::default()).await;

        let ok = manager
            .execute_tool("search", "echo", json!({"url": "https://docs.example.com/x"}), None)
            .await;
        assert!(ok.success);
        let blocked = manager
            .execute_tool("search", "echo", json!({"url": "https://evil.org"}), None)
            .await;
        assert!(!blocked.success);
        assert!(blocked.error.unwrap().contains("evil.org"));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion() {
        let policy = SandboxPolicy {
            max_tool_calls_per_session: 2,
            ..Default::default()
        };
        let (_store, factory, manager) = setup(Some(policy), FakeFactory::default()).await;

        for _ in 0..2 {
            assert!(manager.execute_tool("search", "echo", json!({}), None).await.success);
        }
        let r = manager.execute_tool("search", "echo", json!({}), None).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("quota exceeded"));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_resolves_to_failure() {
        let policy = SandboxPolicy {
            max_execution_time_ms: 50,
            ..Default::default()
        };
        let (_store, _factory, manager) = setup(Some(policy), FakeFactory::default()).await;

        let started = Instant::now();
        let r = manager
            .execute_tool("search", "sleep", json!({"ms": 5_000}), None)
            .await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("timed out after 50ms"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tool_error_and_progress() {
        let (_store, _factory, manager) = setup(None, FakeFactory::default()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));

        let r = manager.execute_tool("search", "fail", json!({}), Some(progress)).await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert_eq!(*seen.lock().unwrap(), vec![50.0]);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_but_not_in_flight() {
        let (store, factory, manager) = setup(None, FakeFactory::default()).await;
        let manager = Arc::new(manager.with_idle_timeout(Duration::ZERO));

        // A long call keeps the connection busy
        let busy = manager.clone();
        let call = tokio::spawn(async move {
            busy.execute_tool("search", "sleep", json!({"ms": 200}), None).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.sweep_idle().await.is_empty());
        assert_eq!(manager.live_connections(), vec!["search".to_string()]);

        assert!(call.await.unwrap().success);
        assert_eq!(manager.sweep_idle().await, vec!["search".to_string()]);
        assert!(manager.live_connections().is_empty());
        assert!(factory.closed.load(Ordering::SeqCst));
        let server = store.get_server("search").await.unwrap().unwrap();
        assert_eq!(server.status, ConnectionStatus::Disconnected);

        // Reconnects on demand
        assert!(manager.execute_tool("search", "echo", json!({}), None).await.success);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_defers_close_until_call_finishes() {
        let (_store, factory, manager) = setup(None, FakeFactory::default()).await;
        let manager = Arc::new(manager);

        let busy = manager.clone();
        let call = tokio::spawn(async move {
            busy.execute_tool("search", "sleep", json!({"ms": 150}), None).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.disconnect("search").await.unwrap();
        assert!(!factory.closed.load(Ordering::SeqCst));

        assert!(call.await.unwrap().success);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(factory.closed.load(Ordering::SeqCst));
    }
}
