//! Connection manager against an in-process HTTP MCP server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_core::model::{ConnectionStatus, McpServer, McpTransport, SandboxPolicy};
use agora_core::store::{Store, ToolCatalog};
use agora_tools::{ConnectionManager, McpTransportFactory, ProgressFn};
use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};

const SESSION: &str = "session-abc";

fn rpc_result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn mcp(headers: HeaderMap, body: String) -> Response {
    let request: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let id = request["id"].clone();

    if method != "initialize"
        && headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) != Some(SESSION)
    {
        return (StatusCode::BAD_REQUEST, "missing session").into_response();
    }

    match method.as_str() {
        "initialize" => (
            [("mcp-session-id", SESSION)],
            axum::Json(rpc_result(
                &id,
                json!({"protocolVersion": "2024-11-05", "capabilities": {"tools": {}}}),
            )),
        )
            .into_response(),
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "tools/list" => {
            let page = if request["params"]["cursor"] == "page2" {
                json!({"tools": [{"name": "fetch", "description": "Fetch a URL",
                    "inputSchema": {"type": "object", "properties": {"url": {"type": "string"}}}}]})
            } else {
                json!({"tools": [{"name": "search", "inputSchema": {"type": "object"}}],
                    "nextCursor": "page2"})
            };
            axum::Json(rpc_result(&id, page)).into_response()
        }
        "tools/call" => {
            let token = request["params"]["_meta"]["progressToken"].clone();
            let name = request["params"]["name"].as_str().unwrap_or_default();
            let text = match name {
                "search" => request["params"]["arguments"].to_string(),
                _ => "{\"status\": 200}".to_string(),
            };
            let mut body = String::new();
            if !token.is_null() {
                for step in [1, 2] {
                    let note = json!({"jsonrpc": "2.0", "method": "notifications/progress",
                        "params": {"progressToken": token, "progress": step, "total": 4}});
                    body.push_str(&format!("event: message\ndata: {note}\n\n"));
                }
            }
            let done = rpc_result(&id, json!({"content": [{"type": "text", "text": text}]}));
            body.push_str(&format!("event: message\ndata: {done}\n\n"));
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }
        _ => axum::Json(json!({"jsonrpc": "2.0", "id": id,
            "error": {"code": -32601, "message": "Method not found"}}))
        .into_response(),
    }
}

async fn start_server() -> String {
    let app = Router::new().route("/mcp", post(mcp));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/mcp")
}

async fn manager_for(url: String, policy: Option<SandboxPolicy>) -> (Arc<Store>, ConnectionManager) {
    let store = Arc::new(Store::in_memory());
    let mut server = McpServer::new(
        "web",
        "Web",
        McpTransport::Http {
            url,
            headers: HashMap::new(),
        },
    );
    server.sandbox = policy;
    store.upsert_server(server).await.unwrap();
    let manager = ConnectionManager::new(
        store.clone(),
        Arc::new(McpTransportFactory),
        SandboxPolicy::default(),
    )
    .with_connect_timeout(Duration::from_secs(5));
    (store, manager)
}

#[tokio::test]
async fn test_http_server_connect_sync_and_call() {
    let url = start_server().await;
    let (store, manager) = manager_for(url, None).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));

    let result = manager
        .execute_tool("web", "search", json!({"query": "x"}), Some(progress))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!({"query": "x"})));
    assert_eq!(*seen.lock().unwrap(), vec![25.0, 50.0]);

    let tools = store.server_tools("web").await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["fetch", "search"]);

    let server = store.get_server("web").await.unwrap().unwrap();
    assert_eq!(server.status, ConnectionStatus::Connected);
    assert_eq!(server.tool_call_count, 1);
    assert!(server.last_used_at.is_some());
}

#[tokio::test]
async fn test_http_server_sandbox_blocks_before_request() {
    let url = start_server().await;
    let policy = SandboxPolicy {
        network_enabled: false,
        ..Default::default()
    };
    let (store, manager) = manager_for(url, Some(policy)).await;

    let result = manager
        .execute_tool("web", "fetch", json!({"url": "http://example.com"}), None)
        .await;
    assert!(!result.success);
    let server = store.get_server("web").await.unwrap().unwrap();
    assert_eq!(server.tool_call_count, 0);
}

#[tokio::test]
async fn test_unreachable_server_records_error_status() {
    let (store, manager) = manager_for("http://127.0.0.1:9/mcp".into(), None).await;

    let result = manager.execute_tool("web", "search", json!({}), None).await;
    assert!(!result.success);
    assert!(manager.live_connections().is_empty());

    let server = store.get_server("web").await.unwrap().unwrap();
    assert_eq!(server.status, ConnectionStatus::Error);
    assert!(server.status_reason.is_some());
}
