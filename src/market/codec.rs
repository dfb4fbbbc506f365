//! Wire codec: raw transport payloads into [`RawUpdate`]s.
//!
//! Decoding never fails loudly. Anything that cannot be turned into a candle
//! with four finite prices and a resolvable open time yields `None`.

use crate::market::types::{Candle, RawUpdate};
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

const OPEN_TIME_KEYS: &[&str] = &["openTime", "open_time", "t", "openTs", "timestamp", "time"];
const OPEN_KEYS: &[&str] = &["open", "o", "Open", "openPrice"];
const HIGH_KEYS: &[&str] = &["high", "h", "High", "highPrice"];
const LOW_KEYS: &[&str] = &["low", "l", "Low", "lowPrice"];
const CLOSE_KEYS: &[&str] = &["close", "c", "Close", "closePrice"];
const VOLUME_KEYS: &[&str] = &["volume", "v", "q", "quoteVolume", "qty", "quote_qty"];
const SYMBOL_KEYS: &[&str] = &["symbol", "ticker", "s", "symbolName"];
const INTERVAL_KEYS: &[&str] = &["interval", "i", "timeframe"];

const MILLIS_THRESHOLD: f64 = 1e12;
const MICROS_THRESHOLD: f64 = 1e15;
const NANOS_THRESHOLD: f64 = 1e18;

#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Text goes through simd-json; binary is tried as MessagePack first and
/// falls back to JSON bytes.
pub fn decode(payload: Payload<'_>) -> Option<RawUpdate> {
    match payload {
        Payload::Text(text) => parse_json_bytes(text.as_bytes().to_vec())
            .as_ref()
            .and_then(decode_value),
        Payload::Binary(bytes) => rmp_serde::from_slice::<Value>(bytes)
            .ok()
            .as_ref()
            .and_then(decode_value)
            .or_else(|| {
                parse_json_bytes(bytes.to_vec())
                    .as_ref()
                    .and_then(decode_value)
            }),
    }
}

fn parse_json_bytes(mut owned: Vec<u8>) -> Option<Value> {
    simd_json::serde::from_slice::<Value>(owned.as_mut_slice()).ok()
}

pub fn decode_value(value: &Value) -> Option<RawUpdate> {
    match value {
        Value::Array(fields) => decode_positional(fields),
        Value::Object(_) => decode_object(unwrap_envelope(value)),
        _ => None,
    }
}

fn unwrap_envelope(value: &Value) -> &Value {
    let mut current = value;
    // Exchange kline events nest the candle under `k`, some gateways under `data`.
    for key in ["data", "k"] {
        if let Some(inner) = current.get(key).filter(|inner| inner.is_object()) {
            current = inner;
        }
    }
    current
}

fn decode_positional(fields: &[Value]) -> Option<RawUpdate> {
    if fields.len() < 5 {
        return None;
    }
    let time = fields.first().and_then(parse_time_seconds)?;
    let mut candle = Candle::new(
        time,
        parse_f64_lossy(&fields[1])?,
        parse_f64_lossy(&fields[2])?,
        parse_f64_lossy(&fields[3])?,
        parse_f64_lossy(&fields[4])?,
    );
    candle.volume = fields.get(5).and_then(parse_volume);
    Some(RawUpdate {
        candle,
        interval: None,
    })
}

fn decode_object(object: &Value) -> Option<RawUpdate> {
    let time = first_field(object, OPEN_TIME_KEYS).and_then(parse_time_seconds)?;
    let mut candle = Candle::new(
        time,
        first_field(object, OPEN_KEYS).and_then(parse_f64_lossy)?,
        first_field(object, HIGH_KEYS).and_then(parse_f64_lossy)?,
        first_field(object, LOW_KEYS).and_then(parse_f64_lossy)?,
        first_field(object, CLOSE_KEYS).and_then(parse_f64_lossy)?,
    );
    candle.volume = first_field(object, VOLUME_KEYS).and_then(parse_volume);
    candle.symbol = first_field(object, SYMBOL_KEYS)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(str::to_ascii_uppercase);
    let interval = first_field(object, INTERVAL_KEYS)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|interval| !interval.is_empty())
        .map(ToString::to_string);

    Some(RawUpdate { candle, interval })
}

fn first_field<'a>(object: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

pub fn parse_f64_lossy(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn parse_volume(value: &Value) -> Option<f64> {
    parse_f64_lossy(value).filter(|volume| *volume >= 0.0)
}

fn parse_time_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_f64().and_then(normalize_epoch_seconds),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(numeric) = trimmed.parse::<f64>() {
                return normalize_epoch_seconds(numeric);
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(parsed.timestamp());
            }
            // Offset-less ISO local date-times are read as UTC.
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc().timestamp())
        }
        _ => None,
    }
}

/// Down-converts milli/micro/nanosecond epochs to whole seconds by magnitude.
pub fn normalize_epoch_seconds(raw: f64) -> Option<i64> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let seconds = if raw > NANOS_THRESHOLD {
        raw / 1e9
    } else if raw > MICROS_THRESHOLD {
        raw / 1e6
    } else if raw > MILLIS_THRESHOLD {
        raw / 1e3
    } else {
        raw
    };
    Some(seconds.floor() as i64)
}
