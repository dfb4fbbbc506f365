use anyhow::{bail, Context, Result};
use candle_relay::market::indicators::{ema, sma};
use candle_relay::{
    Candle, ChartHandle, Interval, MarketContext, PipelineArgs, RenderSink, Topic,
    TracingObservabilitySink, TracingRenderSink,
};
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Subscriber};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_SYMBOLS: &str = "BTCUSDT";
const DEFAULT_INTERVAL: &str = "1m";
const DEFAULT_SMA_PERIOD: usize = 20;
const DEFAULT_EMA_PERIOD: usize = 50;

struct Config {
    args: PipelineArgs,
    symbols: Vec<String>,
    interval: Interval,
    sma_period: usize,
    ema_period: usize,
}

impl Config {
    fn from_env() -> Result<Self> {
        let symbols = std::env::var("CANDLE_SYMBOLS")
            .unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string())
            .split(',')
            .map(|symbol| symbol.trim().to_ascii_uppercase())
            .filter(|symbol| !symbol.is_empty())
            .collect::<Vec<_>>();
        if symbols.is_empty() {
            bail!("CANDLE_SYMBOLS must name at least one symbol");
        }

        let interval_value =
            std::env::var("CANDLE_INTERVAL").unwrap_or_else(|_| DEFAULT_INTERVAL.to_string());
        let interval = Interval::parse_str(&interval_value)
            .with_context(|| format!("invalid CANDLE_INTERVAL value: {interval_value}"))?;

        let args = PipelineArgs {
            ws_url: optional_string("CANDLE_WS_URL"),
            api_base: optional_string("CANDLE_API_BASE"),
            disable_history: optional_parsed("CANDLE_DISABLE_HISTORY")?,
            max_buffer: optional_parsed("CANDLE_MAX_BUFFER")?,
            max_series_len: optional_parsed("CANDLE_MAX_SERIES_LEN")?,
            flush_interval_ms: optional_parsed("CANDLE_FLUSH_INTERVAL_MS")?,
            metrics_interval_ms: optional_parsed("CANDLE_METRICS_INTERVAL_MS")?,
            reconnect_base_ms: optional_parsed("CANDLE_RECONNECT_BASE_MS")?,
            reconnect_cap_ms: optional_parsed("CANDLE_RECONNECT_CAP_MS")?,
            heartbeat_ms: optional_parsed("CANDLE_HEARTBEAT_MS")?,
            connect_timeout_ms: optional_parsed("CANDLE_CONNECT_TIMEOUT_MS")?,
            history_page_size: optional_parsed("CANDLE_HISTORY_PAGE_SIZE")?,
            noise_threshold: optional_parsed("CANDLE_NOISE_THRESHOLD")?,
        };

        Ok(Self {
            args,
            symbols,
            interval,
            sma_period: optional_parsed("CANDLE_SMA_PERIOD")?.unwrap_or(DEFAULT_SMA_PERIOD),
            ema_period: optional_parsed("CANDLE_EMA_PERIOD")?.unwrap_or(DEFAULT_EMA_PERIOD),
        })
    }
}

fn optional_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn optional_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_string(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {name} value: {value}")),
        None => Ok(None),
    }
}

/// Logs the latest candle plus moving averages over the rendered series.
struct IndicatorLogSink {
    sma_period: usize,
    ema_period: usize,
}

impl RenderSink for IndicatorLogSink {
    fn render(&self, topic: &Topic, series: &[Candle]) {
        TracingRenderSink.render(topic, series);
        let sma_last = sma(series, self.sma_period).last().map(|point| point.value);
        let ema_last = ema(series, self.ema_period).last().map(|point| point.value);
        tracing::debug!(topic = %topic, sma = ?sma_last, ema = ?ema_last, "indicators updated");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    let pipeline_config = config
        .args
        .normalize()
        .context("invalid pipeline configuration")?;

    let history = MarketContext::history_for(&pipeline_config);
    let context = MarketContext::start(
        pipeline_config,
        history,
        Arc::new(TracingObservabilitySink),
    );

    let sink: Arc<dyn RenderSink> = Arc::new(IndicatorLogSink {
        sma_period: config.sma_period,
        ema_period: config.ema_period,
    });
    let mut charts: Vec<ChartHandle> = Vec::with_capacity(config.symbols.len());
    for symbol in &config.symbols {
        let chart = context
            .open_chart(symbol, config.interval.as_str(), Arc::clone(&sink))
            .with_context(|| format!("failed to open chart for {symbol}"))?;
        info!(topic = %chart.topic(), "chart opened");
        charts.push(chart);
    }

    shutdown_signal().await;

    for chart in charts {
        chart.close().await;
    }
    context.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    log_subscriber(filter).init();
}

fn log_subscriber(filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    fmt().with_env_filter(filter).finish()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c signal");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal_stream) => {
                signal_stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for terminate signal");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
