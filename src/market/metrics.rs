//! Process-wide pipeline counters. Purely observational: nothing in the
//! admission path reads these values back.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const FLUSH_WINDOW_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_per_sec: u64,
    pub buffer_size: usize,
    pub dropped: u64,
    /// Flush cadence of one consumer: period ticks averaged over `consumers`.
    pub ticks_per_sec: u64,
    pub consumers: usize,
    pub flushes_per_sec: u64,
    pub decode_failures: u64,
    pub cross_talk_dropped: u64,
    pub reconnects: u64,
    pub flush_p50_us: Option<u32>,
    pub flush_p95_us: Option<u32>,
    pub flush_p99_us: Option<u32>,
}

pub trait ObservabilitySink: Send + Sync {
    fn publish(&self, snapshot: &MetricsSnapshot);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObservabilitySink;

impl ObservabilitySink for TracingObservabilitySink {
    fn publish(&self, snapshot: &MetricsSnapshot) {
        tracing::info!(
            messages_per_sec = snapshot.messages_per_sec,
            buffer_size = snapshot.buffer_size,
            dropped = snapshot.dropped,
            ticks_per_sec = snapshot.ticks_per_sec,
            consumers = snapshot.consumers,
            flushes_per_sec = snapshot.flushes_per_sec,
            decode_failures = snapshot.decode_failures,
            cross_talk_dropped = snapshot.cross_talk_dropped,
            reconnects = snapshot.reconnects,
            flush_p95_us = ?snapshot.flush_p95_us,
            "pipeline metrics"
        );
    }
}

#[derive(Debug, Clone)]
struct RollingWindowU32 {
    values: [u32; FLUSH_WINDOW_CAPACITY],
    len: usize,
    cursor: usize,
}

impl Default for RollingWindowU32 {
    fn default() -> Self {
        Self {
            values: [0; FLUSH_WINDOW_CAPACITY],
            len: 0,
            cursor: 0,
        }
    }
}

impl RollingWindowU32 {
    fn push(&mut self, value: u32) {
        self.values[self.cursor] = value;
        self.cursor = (self.cursor + 1) % FLUSH_WINDOW_CAPACITY;
        if self.len < FLUSH_WINDOW_CAPACITY {
            self.len += 1;
        }
    }

    fn percentiles(&self) -> (Option<u32>, Option<u32>, Option<u32>) {
        if self.len == 0 {
            return (None, None, None);
        }

        let mut sorted = self.values[..self.len].to_vec();
        sorted.sort_unstable();
        (
            percentile_from_sorted(&sorted, 50),
            percentile_from_sorted(&sorted, 95),
            percentile_from_sorted(&sorted, 99),
        )
    }
}

fn percentile_from_sorted(sorted_values: &[u32], percentile: usize) -> Option<u32> {
    let max_index = sorted_values.len().checked_sub(1)?;
    let index = max_index.saturating_mul(percentile) / 100;
    sorted_values.get(index).copied()
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    period_messages: AtomicU64,
    period_ticks: AtomicU64,
    period_flushes: AtomicU64,
    buffered: AtomicUsize,
    consumers: AtomicUsize,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
    cross_talk_dropped: AtomicU64,
    reconnects: AtomicU64,
    flush_us: Mutex<RollingWindowU32>,
    last: Mutex<MetricsSnapshot>,
}

impl PipelineMetrics {
    pub fn record_message(&self) {
        self.period_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cross_talk(&self) {
        self.cross_talk_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn buffer_grew(&self, count: usize) {
        self.buffered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn buffer_shrank(&self, count: usize) {
        // Saturating: a consumer never releases more than it added.
        let _ = self
            .buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(count))
            });
    }

    pub fn consumer_started(&self) {
        self.consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_stopped(&self) {
        let _ = self
            .consumers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub fn record_tick(&self) {
        self.period_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, elapsed: Duration) {
        self.period_flushes.fetch_add(1, Ordering::Relaxed);
        let micros = elapsed.as_micros().min(u32::MAX as u128) as u32;
        self.flush_us.lock().push(micros);
    }

    /// Closes the current reporting period and rates its counters over `elapsed`.
    pub fn roll_period(&self, elapsed: Duration) -> MetricsSnapshot {
        let elapsed_ms = elapsed.as_millis().max(1) as u64;
        let per_second = |count: u64| count.saturating_mul(1_000) / elapsed_ms;
        let (flush_p50_us, flush_p95_us, flush_p99_us) = self.flush_us.lock().percentiles();
        let consumers = self.consumers.load(Ordering::Relaxed);
        let ticks = self.period_ticks.swap(0, Ordering::Relaxed);

        let snapshot = MetricsSnapshot {
            messages_per_sec: per_second(self.period_messages.swap(0, Ordering::Relaxed)),
            buffer_size: self.buffered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ticks_per_sec: per_second(ticks) / consumers.max(1) as u64,
            consumers,
            flushes_per_sec: per_second(self.period_flushes.swap(0, Ordering::Relaxed)),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            cross_talk_dropped: self.cross_talk_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            flush_p50_us,
            flush_p95_us,
            flush_p99_us,
        };
        *self.last.lock() = snapshot;
        snapshot
    }

    /// Last published snapshot with the live gauges refreshed.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = *self.last.lock();
        snapshot.buffer_size = self.buffered.load(Ordering::Relaxed);
        snapshot.consumers = self.consumers.load(Ordering::Relaxed);
        snapshot.dropped = self.dropped.load(Ordering::Relaxed);
        snapshot.decode_failures = self.decode_failures.load(Ordering::Relaxed);
        snapshot.cross_talk_dropped = self.cross_talk_dropped.load(Ordering::Relaxed);
        snapshot.reconnects = self.reconnects.load(Ordering::Relaxed);
        snapshot
    }
}

pub async fn run_metrics_reporter(
    metrics: Arc<PipelineMetrics>,
    sink: Arc<dyn ObservabilitySink>,
    interval_ms: u64,
    cancel_token: CancellationToken,
) {
    let period = Duration::from_millis(interval_ms);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut period_started_at = Instant::now();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.roll_period(period_started_at.elapsed());
                period_started_at = Instant::now();
                sink.publish(&snapshot);
            }
        }
    }
}
