use crate::error::PipelineError;
use crate::market::codec::decode_value;
use crate::market::types::{Candle, Topic};
use crate::market::RECENT_CANDLES_PATH;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

/// Keys a gateway may wrap the candle list in.
const LIST_ENVELOPE_KEYS: &[&str] = &["data", "candles", "items", "content"];

/// Backfill collaborator, queried once per chart before live data starts.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_history(&self, topic: &Topic, page_size: u16) -> Result<Vec<Candle>, PipelineError>;
}

pub struct NoHistory;

#[async_trait]
impl HistorySource for NoHistory {
    async fn fetch_history(&self, _topic: &Topic, _page_size: u16) -> Result<Vec<Candle>, PipelineError> {
        Ok(Vec::new())
    }
}

pub struct RestHistorySource {
    client: Client,
    api_base: String,
}

impl RestHistorySource {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_client(Client::new(), api_base)
    }

    pub fn with_client(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl HistorySource for RestHistorySource {
    async fn fetch_history(&self, topic: &Topic, page_size: u16) -> Result<Vec<Candle>, PipelineError> {
        let endpoint = recent_candles_endpoint(&self.api_base, topic, page_size);
        tracing::debug!(topic = %topic, endpoint = %endpoint, "fetching history");
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let mut body = response.bytes().await?.to_vec();
        let payload = simd_json::serde::from_slice::<Value>(body.as_mut_slice())?;
        parse_history_payload(&payload, topic)
    }
}

fn recent_candles_endpoint(api_base: &str, topic: &Topic, limit: u16) -> String {
    format!(
        "{api_base}{RECENT_CANDLES_PATH}?symbol={}&interval={}&limit={limit}",
        topic.symbol,
        topic.interval.as_str()
    )
}

/// Accepts a bare array or an object wrapping one. Elements that do not decode,
/// or that name another symbol, are skipped.
fn parse_history_payload(payload: &Value, topic: &Topic) -> Result<Vec<Candle>, PipelineError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(_) => LIST_ENVELOPE_KEYS
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_array))
            .ok_or_else(|| {
                PipelineError::InvalidArgument("history payload has no candle list".to_string())
            })?,
        _ => {
            return Err(PipelineError::InvalidArgument(
                "history payload must be an array or object".to_string(),
            ))
        }
    };

    let mut candles = Vec::with_capacity(items.len());
    for item in items {
        let Some(update) = decode_value(item) else {
            continue;
        };
        if update.symbol().is_some_and(|symbol| !topic.matches_symbol(symbol)) {
            continue;
        }
        candles.push(update.candle);
    }
    Ok(candles)
}
