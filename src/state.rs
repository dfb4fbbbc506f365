use crate::error::PipelineError;
use crate::market::connection::ConnectionManager;
use crate::market::history::{HistorySource, NoHistory, RestHistorySource};
use crate::market::metrics::{run_metrics_reporter, MetricsSnapshot, ObservabilitySink, PipelineMetrics};
use crate::market::pipeline::{ChartHandle, ChartWiring, ConsumerSettings, RenderSink};
use crate::market::topics::{SharedTopicRegistry, TopicRegistry, TopicSubscription};
use crate::market::types::{ConnectionState, PipelineConfig, Topic};
use crate::market::TOPIC_BROADCAST_CAPACITY;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the shared transport, the topic registry and the metrics counter for
/// the lifetime of the application. Cheap to clone.
#[derive(Clone)]
pub struct MarketContext {
    inner: Arc<MarketContextInner>,
}

struct MarketContextInner {
    started_at: Instant,
    config: PipelineConfig,
    registry: SharedTopicRegistry,
    metrics: Arc<PipelineMetrics>,
    connection: ConnectionManager,
    history: Arc<dyn HistorySource>,
    cancel_token: CancellationToken,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl MarketContext {
    /// Spawns the connection driver and the metrics reporter. Must be called
    /// inside a Tokio runtime.
    pub fn start(
        config: PipelineConfig,
        history: Arc<dyn HistorySource>,
        observability: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let registry: SharedTopicRegistry =
            Arc::new(Mutex::new(TopicRegistry::new(TOPIC_BROADCAST_CAPACITY)));
        let metrics = Arc::new(PipelineMetrics::default());
        let connection = ConnectionManager::spawn(
            &config,
            Arc::clone(&registry),
            Arc::clone(&metrics),
            cancel_token.child_token(),
        );
        let reporter = tokio::spawn(run_metrics_reporter(
            Arc::clone(&metrics),
            observability,
            config.metrics_interval_ms,
            cancel_token.child_token(),
        ));

        tracing::info!(ws_url = %config.ws_url, history = config.api_base.is_some(), "market context started");
        Self {
            inner: Arc::new(MarketContextInner {
                started_at: Instant::now(),
                config,
                registry,
                metrics,
                connection,
                history,
                cancel_token,
                reporter: Mutex::new(Some(reporter)),
            }),
        }
    }

    /// REST backfill when an API base is configured, otherwise none.
    pub fn history_for(config: &PipelineConfig) -> Arc<dyn HistorySource> {
        match config.api_base.as_deref() {
            Some(api_base) => Arc::new(RestHistorySource::new(api_base)),
            None => Arc::new(NoHistory),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Adds a listener for `symbol`/`interval` and makes sure the transport is up.
    pub fn subscribe(&self, symbol: &str, interval: &str) -> Result<TopicSubscription, PipelineError> {
        let topic = Topic::parse(symbol, interval)?;
        let subscription = TopicSubscription::register(
            &self.inner.registry,
            self.inner.connection.command_sender(),
            topic,
        );
        self.ensure_connected();
        Ok(subscription)
    }

    pub fn ensure_connected(&self) {
        self.inner.connection.ensure_connected();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn active_topics(&self) -> Vec<Topic> {
        self.inner.registry.lock().topics()
    }

    /// Starts a chart consumer: backfill, then live data flushed to `sink`.
    pub fn open_chart(
        &self,
        symbol: &str,
        interval: &str,
        sink: Arc<dyn RenderSink>,
    ) -> Result<ChartHandle, PipelineError> {
        let topic = Topic::parse(symbol, interval)?;
        let wiring = ChartWiring {
            registry: Arc::clone(&self.inner.registry),
            commands: self.inner.connection.command_sender().clone(),
            metrics: Arc::clone(&self.inner.metrics),
            history: Arc::clone(&self.inner.history),
            history_page_size: self.inner.config.history_page_size,
        };
        Ok(ChartHandle::spawn(
            topic,
            ConsumerSettings::from(&self.inner.config),
            wiring,
            sink,
            self.inner.cancel_token.child_token(),
        ))
    }

    /// Stops every task, disconnects the transport and clears all topics.
    pub async fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        self.inner.connection.shutdown().await;

        let reporter = self.inner.reporter.lock().take();
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        let cleared = self.inner.registry.lock().clear();
        tracing::info!(topics = cleared.len(), "market context shut down");
    }
}
