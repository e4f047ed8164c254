//! Gateway integration tests: start a real server and drive it over HTTP.

use std::sync::Arc;
use std::time::Duration;

use agora_agent::{ChatSettings, Orchestrator};
use agora_core::config::Config;
use agora_core::context::StaticContext;
use agora_core::model::{Agent, ChatSession, SandboxPolicy};
use agora_core::store::{ChatStore, Store};
use agora_gateway::GatewayState;
use agora_jobs::JobQueue;
use agora_providers::scripted::{Script, ScriptedProvider};
use agora_providers::{Gateway, ProviderChunk};
use agora_tools::{ConnectionManager, McpTransportFactory};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

struct TestGateway {
    base: String,
    store: Arc<Store>,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_test_gateway(scripts: Vec<Script>) -> TestGateway {
    let store = Arc::new(Store::in_memory());
    store
        .insert_agent(Agent {
            id: "a1".into(),
            name: "Sage".into(),
            system_prompt: "You are terse.".into(),
            model: "llama3.2".into(),
            provider: None,
            temperature: None,
            tool_ids: vec![],
            usage_count: 0,
            last_used_at: None,
        })
        .await
        .unwrap();
    let mut session = ChatSession::new("S1", "p1");
    session.agent_id = Some("a1".into());
    store.insert_session(session).await.unwrap();

    let gateway = Gateway::new().with_provider(Arc::new(ScriptedProvider::local("ollama", scripts)));
    let queue = Arc::new(JobQueue::in_memory());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        Arc::new(gateway),
        queue.clone(),
        Arc::new(StaticContext::default()),
        ChatSettings::default(),
    ));
    let tools = Arc::new(ConnectionManager::new(
        store.clone(),
        Arc::new(McpTransportFactory),
        SandboxPolicy::default(),
    ));
    let state = Arc::new(GatewayState::new(
        Arc::new(Config::default()),
        orchestrator,
        queue,
        tools,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    tokio::spawn(agora_gateway::serve(listener, state.clone(), shutdown.clone()));

    TestGateway {
        base,
        store,
        state,
        shutdown,
    }
}

/// Parse `data:` lines of an SSE body. Keep-alive comments and a trailing
/// partial line are skipped.
fn parse_frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str(data.trim()).ok())
        .collect()
}

fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

async fn post_chat(gw: &TestGateway, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/chat/stream", gw.base))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let gw = start_test_gateway(vec![]).await;

    let resp = reqwest::get(format!("{}/health", gw.base)).await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["queueDepth"], 0);
    assert_eq!(body["activeStreams"], 0);
    assert_eq!(body["connections"], json!([]));
}

#[tokio::test]
async fn test_chat_stream_frames() {
    let gw = start_test_gateway(vec![Script::text(&["2+2 ", "is 4"])]).await;

    let resp = post_chat(&gw, json!({"sessionId": "S1", "content": "What is 2+2?"})).await;
    assert!(resp.status().is_success());
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let frames = parse_frames(&resp.text().await.unwrap());
    assert_eq!(types(&frames), vec!["start", "content", "content", "complete"]);
    assert_eq!(frames[1]["content"], "2+2 ");
    assert!(frames.iter().all(|f| f["sessionId"] == "S1"));

    let message_id = frames[0]["messageId"].as_str().unwrap();
    let reply = gw.store.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(reply.content, "2+2 is 4");
    assert!(reply.is_complete);
}

#[tokio::test]
async fn test_missing_fields_yield_validation_frame() {
    let gw = start_test_gateway(vec![]).await;

    let frames = parse_frames(&post_chat(&gw, json!({"sessionId": "S1"})).await.text().await.unwrap());
    assert_eq!(types(&frames), vec!["error"]);
    assert_eq!(frames[0]["error"]["code"], "VALIDATION_ERROR");
    assert!(frames[0]["messageId"].is_null());
}

#[tokio::test]
async fn test_unknown_session_yields_error_frame() {
    let gw = start_test_gateway(vec![]).await;

    let frames = parse_frames(
        &post_chat(&gw, json!({"sessionId": "missing", "content": "hi"}))
            .await
            .text()
            .await
            .unwrap(),
    );
    assert_eq!(types(&frames), vec!["error"]);
    assert_eq!(frames[0]["error"]["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_client_disconnect_aborts_request() {
    let gw = start_test_gateway(vec![
        Script::chunks(vec![Ok(ProviderChunk::Text("thinking".into()))]).hanging(),
    ])
    .await;

    let resp = post_chat(&gw, json!({"sessionId": "S1", "content": "long question"})).await;
    let mut body = resp.bytes_stream();
    let mut seen = String::new();
    while !seen.contains("\"content\"") {
        let chunk = body.next().await.unwrap().unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    let start = parse_frames(&seen)
        .into_iter()
        .find(|f| f["type"] == "start")
        .unwrap();
    let message_id = start["messageId"].as_str().unwrap().to_string();
    assert_eq!(gw.state.active_streams(), 1);
    drop(body);

    // Detected on the next read or keep-alive write
    let reply = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let message = gw.store.get_message(&message_id).await.unwrap().unwrap();
            if message.metadata.aborted {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert!(!reply.is_complete);
    assert_eq!(gw.state.active_streams(), 0);
}
