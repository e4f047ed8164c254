//! Gateway shared state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agora_agent::Orchestrator;
use agora_core::config::Config;
use agora_jobs::JobQueue;
use agora_tools::ConnectionManager;

/// Shared state accessible from all handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<JobQueue>,
    pub tools: Arc<ConnectionManager>,
    active_streams: AtomicUsize,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        orchestrator: Arc<Orchestrator>,
        queue: Arc<JobQueue>,
        tools: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            queue,
            tools,
            active_streams: AtomicUsize::new(0),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Chat streams currently held open by clients.
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_opened(&self) -> usize {
        self.active_streams.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn stream_closed(&self) -> usize {
        self.active_streams.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }
}
