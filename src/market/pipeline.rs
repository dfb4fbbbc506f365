//! Per-chart consumer: ingest buffer on the producer side, a time-paced flush
//! on the consumer side, and the render sink the sanitized series goes to.

use crate::market::buffer::IngestBuffer;
use crate::market::connection::ConnectionCommand;
use crate::market::history::HistorySource;
use crate::market::metrics::PipelineMetrics;
use crate::market::sanitize::{sanitize, sanitize_with_report};
use crate::market::topics::{SharedTopicRegistry, TopicSubscription};
use crate::market::types::{Candle, PipelineConfig, Topic};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub trait RenderSink: Send + Sync {
    /// Receives the whole sanitized series after every non-empty flush.
    fn render(&self, topic: &Topic, series: &[Candle]);
}

/// Publishes each rendered series on a watch channel.
pub struct WatchRenderSink {
    sender: watch::Sender<Arc<Vec<Candle>>>,
}

impl WatchRenderSink {
    pub fn new() -> (Self, watch::Receiver<Arc<Vec<Candle>>>) {
        let (sender, receiver) = watch::channel(Arc::new(Vec::new()));
        (Self { sender }, receiver)
    }
}

impl RenderSink for WatchRenderSink {
    fn render(&self, _topic: &Topic, series: &[Candle]) {
        self.sender.send_replace(Arc::new(series.to_vec()));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRenderSink;

impl RenderSink for TracingRenderSink {
    fn render(&self, topic: &Topic, series: &[Candle]) {
        let Some(last) = series.last() else {
            return;
        };
        tracing::info!(
            topic = %topic,
            len = series.len(),
            time = last.time,
            open = last.open,
            high = last.high,
            low = last.low,
            close = last.close,
            "series updated"
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub max_buffer: usize,
    pub max_series_len: usize,
    pub flush_interval: Duration,
    pub noise_threshold: usize,
}

impl From<&PipelineConfig> for ConsumerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_buffer: config.max_buffer,
            max_series_len: config.max_series_len,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            noise_threshold: config.noise_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Buffered,
    /// Buffered after evicting the oldest pending candle.
    Evicted,
    CrossTalk,
    Inactive,
}

pub struct CandleSeriesConsumer {
    topic: Topic,
    settings: ConsumerSettings,
    buffer: IngestBuffer,
    series: Vec<Candle>,
    active: Arc<AtomicBool>,
    metrics: Arc<PipelineMetrics>,
}

impl CandleSeriesConsumer {
    pub fn new(
        topic: Topic,
        settings: ConsumerSettings,
        active: Arc<AtomicBool>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            buffer: IngestBuffer::new(settings.max_buffer),
            topic,
            settings,
            series: Vec::new(),
            active,
            metrics,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn series(&self) -> &[Candle] {
        &self.series
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn dropped(&self) -> u64 {
        self.buffer.dropped()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Backfill goes through the same aggregator as live data.
    pub fn seed(&mut self, history: &[Candle]) {
        self.series = sanitize(
            history,
            self.topic.interval.seconds(),
            self.settings.max_series_len,
        );
    }

    pub fn ingest(&mut self, candle: Candle) -> IngestOutcome {
        if !self.is_active() {
            return IngestOutcome::Inactive;
        }
        if let Some(symbol) = candle.symbol.as_deref() {
            if !self.topic.matches_symbol(symbol) {
                self.metrics.record_cross_talk();
                return IngestOutcome::CrossTalk;
            }
        }

        if self.buffer.push(candle) {
            self.metrics.record_dropped(1);
            IngestOutcome::Evicted
        } else {
            self.metrics.buffer_grew(1);
            IngestOutcome::Buffered
        }
    }

    /// Candles the topic channel discarded before this consumer could read them.
    pub fn record_lag(&mut self, skipped: u64) {
        self.buffer.record_external_drops(skipped);
        self.metrics.record_dropped(skipped);
    }

    /// Drains the buffer into the series and re-sanitizes all of it. `None`
    /// when the consumer is inactive or nothing was pending.
    pub fn flush(&mut self) -> Option<&[Candle]> {
        if !self.is_active() || self.buffer.is_empty() {
            return None;
        }

        let started_at = Instant::now();
        let drained = self.buffer.drain_all();
        self.metrics.buffer_shrank(drained.len());
        self.series.extend(drained);

        let (series, report) = sanitize_with_report(
            &self.series,
            self.topic.interval.seconds(),
            self.settings.max_series_len,
        );
        if report.rejected() > self.settings.noise_threshold {
            tracing::warn!(
                topic = %self.topic,
                invalid = report.invalid,
                misaligned = report.misaligned,
                "sanitizer removed an unusual number of candles"
            );
        }
        self.series = series;
        self.metrics.record_flush(started_at.elapsed());
        Some(&self.series)
    }

    /// Returns pending candles to the buffer gauge; nothing is flushed afterwards.
    fn release(&mut self) {
        self.metrics.buffer_shrank(self.buffer.len());
        self.buffer.drain_all();
    }
}

/// Everything a chart task needs to attach itself to the shared transport.
#[derive(Clone)]
pub struct ChartWiring {
    pub registry: SharedTopicRegistry,
    pub commands: mpsc::UnboundedSender<ConnectionCommand>,
    pub metrics: Arc<PipelineMetrics>,
    pub history: Arc<dyn HistorySource>,
    pub history_page_size: u16,
}

/// Handle to a running chart consumer.
pub struct ChartHandle {
    topic: Topic,
    active: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChartHandle {
    pub fn spawn(
        topic: Topic,
        settings: ConsumerSettings,
        wiring: ChartWiring,
        sink: Arc<dyn RenderSink>,
        cancel_token: CancellationToken,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let consumer = CandleSeriesConsumer::new(
            topic.clone(),
            settings,
            Arc::clone(&active),
            Arc::clone(&wiring.metrics),
        );
        let task = tokio::spawn(run_chart(
            consumer,
            settings.flush_interval,
            wiring,
            sink,
            cancel_token.clone(),
        ));

        Self {
            topic,
            active,
            cancel_token,
            task: Some(task),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the consumer inactive, stops its ticker and releases its subscription.
    pub async fn close(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::warn!(topic = %self.topic, error = %error, "chart task ended abnormally");
            }
        }
    }

    fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.cancel_token.cancel();
    }
}

impl Drop for ChartHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_chart(
    mut consumer: CandleSeriesConsumer,
    flush_interval: Duration,
    wiring: ChartWiring,
    sink: Arc<dyn RenderSink>,
    cancel_token: CancellationToken,
) {
    let topic = consumer.topic().clone();
    let history = tokio::select! {
        _ = cancel_token.cancelled() => return,
        history = wiring.history.fetch_history(&topic, wiring.history_page_size) => history,
    };
    match history {
        Ok(candles) => {
            consumer.seed(&candles);
            tracing::info!(topic = %topic, fetched = candles.len(), kept = consumer.series().len(), "history loaded");
            if consumer.is_active() && !consumer.series().is_empty() {
                sink.render(&topic, consumer.series());
            }
        }
        Err(error) => {
            tracing::warn!(topic = %topic, error = %error, "history unavailable, starting with an empty series");
        }
    }

    let mut subscription =
        TopicSubscription::register(&wiring.registry, &wiring.commands, topic.clone());
    let _ = wiring.commands.send(ConnectionCommand::EnsureConnected);
    run_consumer_loop(&mut consumer, &mut subscription, flush_interval, &wiring.metrics, sink.as_ref(), &cancel_token).await;

    consumer.release();
    drop(subscription);
    tracing::debug!(topic = %topic, "chart consumer stopped");
}

async fn run_consumer_loop(
    consumer: &mut CandleSeriesConsumer,
    subscription: &mut TopicSubscription,
    flush_interval: Duration,
    metrics: &PipelineMetrics,
    sink: &dyn RenderSink,
    cancel_token: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    metrics.consumer_started();

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                metrics.record_tick();
                if let Some(series) = consumer.flush() {
                    sink.render(subscription.topic(), series);
                }
            }
            received = subscription.recv() => match received {
                Ok(candle) => {
                    consumer.ingest(candle);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(topic = %subscription.key(), skipped, "consumer lagged behind topic channel");
                    consumer.record_lag(skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    metrics.consumer_stopped();
}
