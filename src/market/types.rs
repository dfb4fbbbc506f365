use crate::error::PipelineError;
use crate::market::CANDLE_DESTINATION_PREFIX;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_INTERVAL: Interval = Interval::M1;
pub const DEFAULT_WS_URL: &str = "ws://localhost/ws";
pub const DEFAULT_API_BASE: &str = "http://localhost:8082/api/v1";
pub const DEFAULT_MAX_BUFFER: usize = 2_000;
pub const DEFAULT_MAX_SERIES_LEN: usize = 1_000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;
pub const DEFAULT_METRICS_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_MS: u64 = 4_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HISTORY_PAGE_SIZE: u16 = 500;
pub const DEFAULT_NOISE_THRESHOLD: usize = 50;
pub const MIN_MAX_BUFFER: usize = 16;
pub const MAX_MAX_BUFFER: usize = 100_000;
pub const MIN_SERIES_LEN: usize = 10;
pub const MAX_SERIES_LEN: usize = 10_000;
pub const MIN_FLUSH_INTERVAL_MS: u64 = 4;
pub const MAX_FLUSH_INTERVAL_MS: u64 = 1_000;
pub const MIN_METRICS_INTERVAL_MS: u64 = 100;
pub const MAX_METRICS_INTERVAL_MS: u64 = 60_000;
pub const MIN_RECONNECT_BASE_MS: u64 = 10;
pub const MAX_RECONNECT_BASE_MS: u64 = 60_000;
pub const MAX_RECONNECT_CAP_MS: u64 = 300_000;
pub const MIN_HEARTBEAT_MS: u64 = 1_000;
pub const MAX_HEARTBEAT_MS: u64 = 60_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 100;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;
pub const MIN_HISTORY_PAGE_SIZE: u16 = 1;
pub const MAX_HISTORY_PAGE_SIZE: u16 = 1_000;

/// Prices must sit strictly inside this band to be accepted.
pub const PRICE_FLOOR_EXCLUSIVE: f64 = -1e6;
pub const PRICE_CEILING_EXCLUSIVE: f64 = 1e9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    pub const ALL: [Interval; 6] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Bucket width in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    /// Exact match on the canonical lowercase label; `1M` is a month elsewhere.
    pub fn parse_str(value: &str) -> Result<Self, PipelineError> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str() == trimmed)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unsupported interval '{value}'")))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription unit. Identity is `SYMBOL:interval`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub symbol: String,
    pub interval: Interval,
}

impl Topic {
    pub fn new(symbol: &str, interval: Interval) -> Result<Self, PipelineError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(PipelineError::InvalidArgument(
                "symbol must be non-empty alphanumeric ASCII".to_string(),
            ));
        }
        Ok(Self { symbol, interval })
    }

    pub fn parse(symbol: &str, interval: &str) -> Result<Self, PipelineError> {
        Self::new(symbol, Interval::parse_str(interval)?)
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.symbol, self.interval.as_str())
    }

    pub fn destination(&self) -> String {
        format!(
            "{CANDLE_DESTINATION_PREFIX}{}.{}",
            self.symbol,
            self.interval.as_str()
        )
    }

    pub fn from_destination(destination: &str) -> Option<Self> {
        let rest = destination.trim().strip_prefix(CANDLE_DESTINATION_PREFIX)?;
        let (symbol, interval) = rest.rsplit_once('.')?;
        Self::parse(symbol, interval).ok()
    }

    pub fn matches_symbol(&self, symbol: &str) -> bool {
        self.symbol.eq_ignore_ascii_case(symbol.trim())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.interval.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Bucket open time, unix seconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume: None,
            symbol: None,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Finite prices inside the sane band and `high >= low`.
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .into_iter()
            .all(is_sane_price)
            && self.high >= self.low
    }
}

fn is_sane_price(value: f64) -> bool {
    value.is_finite() && value > PRICE_FLOOR_EXCLUSIVE && value < PRICE_CEILING_EXCLUSIVE
}

/// Decoded, not yet validated update straight off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUpdate {
    pub candle: Candle,
    pub interval: Option<String>,
}

impl RawUpdate {
    pub fn symbol(&self) -> Option<&str> {
        self.candle.symbol.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineArgs {
    pub ws_url: Option<String>,
    pub api_base: Option<String>,
    pub disable_history: Option<bool>,
    pub max_buffer: Option<usize>,
    pub max_series_len: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub metrics_interval_ms: Option<u64>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_cap_ms: Option<u64>,
    pub heartbeat_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub history_page_size: Option<u16>,
    pub noise_threshold: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ws_url: String,
    pub api_base: Option<String>,
    pub max_buffer: usize,
    pub max_series_len: usize,
    pub flush_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub heartbeat_ms: u64,
    pub connect_timeout_ms: u64,
    pub history_page_size: u16,
    pub noise_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_base: Some(DEFAULT_API_BASE.to_string()),
            max_buffer: DEFAULT_MAX_BUFFER,
            max_series_len: DEFAULT_MAX_SERIES_LEN,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            metrics_interval_ms: DEFAULT_METRICS_INTERVAL_MS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_cap_ms: DEFAULT_RECONNECT_CAP_MS,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            noise_threshold: DEFAULT_NOISE_THRESHOLD,
        }
    }
}

impl PipelineArgs {
    pub fn normalize(self) -> Result<PipelineConfig, PipelineError> {
        let ws_url = self
            .ws_url
            .unwrap_or_else(|| DEFAULT_WS_URL.to_string())
            .trim()
            .to_string();
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(PipelineError::InvalidArgument(
                "wsUrl must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let api_base = if self.disable_history.unwrap_or(false) {
            None
        } else {
            let api_base = self
                .api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim()
                .trim_end_matches('/')
                .to_string();
            if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
                return Err(PipelineError::InvalidArgument(
                    "apiBase must use the http:// or https:// scheme".to_string(),
                ));
            }
            Some(api_base)
        };

        let max_buffer = self.max_buffer.unwrap_or(DEFAULT_MAX_BUFFER);
        if !(MIN_MAX_BUFFER..=MAX_MAX_BUFFER).contains(&max_buffer) {
            return Err(PipelineError::InvalidArgument(format!(
                "maxBuffer must be between {MIN_MAX_BUFFER} and {MAX_MAX_BUFFER}"
            )));
        }

        let max_series_len = self.max_series_len.unwrap_or(DEFAULT_MAX_SERIES_LEN);
        if !(MIN_SERIES_LEN..=MAX_SERIES_LEN).contains(&max_series_len) {
            return Err(PipelineError::InvalidArgument(format!(
                "maxSeriesLen must be between {MIN_SERIES_LEN} and {MAX_SERIES_LEN}"
            )));
        }

        let flush_interval_ms = self.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
        if !(MIN_FLUSH_INTERVAL_MS..=MAX_FLUSH_INTERVAL_MS).contains(&flush_interval_ms) {
            return Err(PipelineError::InvalidArgument(format!(
                "flushIntervalMs must be between {MIN_FLUSH_INTERVAL_MS} and {MAX_FLUSH_INTERVAL_MS}"
            )));
        }

        let metrics_interval_ms = self
            .metrics_interval_ms
            .unwrap_or(DEFAULT_METRICS_INTERVAL_MS);
        if !(MIN_METRICS_INTERVAL_MS..=MAX_METRICS_INTERVAL_MS).contains(&metrics_interval_ms) {
            return Err(PipelineError::InvalidArgument(format!(
                "metricsIntervalMs must be between {MIN_METRICS_INTERVAL_MS} and {MAX_METRICS_INTERVAL_MS}"
            )));
        }

        let reconnect_base_ms = self.reconnect_base_ms.unwrap_or(DEFAULT_RECONNECT_BASE_MS);
        if !(MIN_RECONNECT_BASE_MS..=MAX_RECONNECT_BASE_MS).contains(&reconnect_base_ms) {
            return Err(PipelineError::InvalidArgument(format!(
                "reconnectBaseMs must be between {MIN_RECONNECT_BASE_MS} and {MAX_RECONNECT_BASE_MS}"
            )));
        }

        let reconnect_cap_ms = self
            .reconnect_cap_ms
            .unwrap_or(DEFAULT_RECONNECT_CAP_MS.max(reconnect_base_ms));
        if !(reconnect_base_ms..=MAX_RECONNECT_CAP_MS).contains(&reconnect_cap_ms) {
            return Err(PipelineError::InvalidArgument(format!(
                "reconnectCapMs must be between reconnectBaseMs and {MAX_RECONNECT_CAP_MS}"
            )));
        }

        let heartbeat_ms = self.heartbeat_ms.unwrap_or(DEFAULT_HEARTBEAT_MS);
        if heartbeat_ms != 0 && !(MIN_HEARTBEAT_MS..=MAX_HEARTBEAT_MS).contains(&heartbeat_ms) {
            return Err(PipelineError::InvalidArgument(format!(
                "heartbeatMs must be 0 or between {MIN_HEARTBEAT_MS} and {MAX_HEARTBEAT_MS}"
            )));
        }

        let connect_timeout_ms = self
            .connect_timeout_ms
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_CONNECT_TIMEOUT_MS..=MAX_CONNECT_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(PipelineError::InvalidArgument(format!(
                "connectTimeoutMs must be between {MIN_CONNECT_TIMEOUT_MS} and {MAX_CONNECT_TIMEOUT_MS}"
            )));
        }

        let history_page_size = self.history_page_size.unwrap_or(DEFAULT_HISTORY_PAGE_SIZE);
        if !(MIN_HISTORY_PAGE_SIZE..=MAX_HISTORY_PAGE_SIZE).contains(&history_page_size) {
            return Err(PipelineError::InvalidArgument(format!(
                "historyPageSize must be between {MIN_HISTORY_PAGE_SIZE} and {MAX_HISTORY_PAGE_SIZE}"
            )));
        }

        let noise_threshold = self.noise_threshold.unwrap_or(DEFAULT_NOISE_THRESHOLD);

        Ok(PipelineConfig {
            ws_url,
            api_base,
            max_buffer,
            max_series_len,
            flush_interval_ms,
            metrics_interval_ms,
            reconnect_base_ms,
            reconnect_cap_ms,
            heartbeat_ms,
            connect_timeout_ms,
            history_page_size,
            noise_threshold,
        })
    }
}
