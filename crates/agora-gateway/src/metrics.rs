//! Prometheus metrics recording and endpoint.

use agora_core::model::ToolCallStatus;
use agora_jobs::JobUpdate;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

pub fn record_stream_open() {
    metrics::gauge!("chat_streams_active").increment(1.0);
}

pub fn record_stream_close() {
    metrics::gauge!("chat_streams_active").decrement(1.0);
}

/// Record one emitted SSE frame by type.
pub fn record_frame(kind: &'static str) {
    metrics::counter!("chat_frames_total", "type" => kind).increment(1);
}

/// Record an error frame by its code.
pub fn record_error(code: &str) {
    let labels = [("code", code.to_string())];
    metrics::counter!("chat_errors_total", &labels).increment(1);
}

/// Record a tool job reaching a terminal status.
pub fn record_job_outcome(status: ToolCallStatus) {
    let labels = [("outcome", status.to_string())];
    metrics::counter!("tool_jobs_total", &labels).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    metrics::gauge!("tool_job_queue_depth").set(depth as f64);
}

/// Count terminal job updates until the worker's channel closes.
pub fn spawn_job_recorder(mut updates: broadcast::Receiver<JobUpdate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) if update.status.is_terminal() => record_job_outcome(update.status),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Job metrics recorder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder can be installed per process
        let handle = install_prometheus_recorder().unwrap();
        record_frame("content");
        record_error("NETWORK_ERROR");
        record_job_outcome(ToolCallStatus::Completed);
        let output = handle.render();
        assert!(output.contains("chat_frames_total"));
        assert!(output.contains("tool_jobs_total"));
    }

    #[test]
    fn test_stream_gauges_do_not_panic() {
        record_stream_open();
        record_stream_close();
        record_queue_depth(3);
    }
}
