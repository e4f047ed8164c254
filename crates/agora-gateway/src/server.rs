//! Axum-based HTTP server.

use std::convert::Infallible;
use std::sync::Arc;

use agora_agent::{ChatRequest, FrameBody, SseFrame};
use axum::{
    Json, Router,
    extract::State,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::state::GatewayState;

/// Routes served by the gateway.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind to the configured address and serve until `shutdown` fires.
pub async fn start_gateway(state: Arc<GatewayState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.gateway_bind(), state.config.gateway_port());
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, state, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Gateway shutting down");
        })
        .await?;
    Ok(())
}

/// Lives as long as the response body. Dropping it, on completion or on
/// client disconnect, cancels the request token.
struct OpenStream {
    state: Arc<GatewayState>,
    _cancel: DropGuard,
}

impl OpenStream {
    fn new(state: Arc<GatewayState>, cancel: CancellationToken) -> Self {
        let active = state.stream_opened();
        debug!(active, "Chat stream opened");
        #[cfg(feature = "metrics")]
        crate::metrics::record_stream_open();
        Self {
            state,
            _cancel: cancel.drop_guard(),
        }
    }

    fn encode(&self, frame: &SseFrame) -> Event {
        if let FrameBody::Error { error } = &frame.body {
            debug!(code = %error.code, "Streaming error frame");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error(&error.code);
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_frame(frame.kind());
        Event::default().data(frame.to_json())
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        let active = self.state.stream_closed();
        debug!(active, "Chat stream closed");
        #[cfg(feature = "metrics")]
        crate::metrics::record_stream_close();
    }
}

async fn chat_stream_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cancel = CancellationToken::new();
    let frames = state.orchestrator.stream_chat(request, cancel.clone());
    let open = OpenStream::new(state, cancel);
    let events = frames.map(move |frame| Ok(open.encode(&frame)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let queue_depth = state.queue.depth();
    let connections = state.tools.live_connections();

    #[cfg(feature = "metrics")]
    crate::metrics::record_queue_depth(queue_depth);

    Json(json!({
        "status": "ok",
        "version": version,
        "queueDepth": queue_depth,
        "activeStreams": state.active_streams(),
        "connections": connections,
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (axum::http::StatusCode::OK, handle.render()),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        ),
    }
}
