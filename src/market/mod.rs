pub mod buffer;
pub mod codec;
pub mod connection;
pub mod history;
pub mod indicators;
pub mod metrics;
pub mod pipeline;
pub mod sanitize;
pub mod stomp;
pub mod topics;
pub mod types;

pub const CANDLE_DESTINATION_PREFIX: &str = "/topic/candle.";
pub const SUBSCRIPTION_ID_PREFIX: &str = "sub-";
pub const RECENT_CANDLES_PATH: &str = "/candles/recent";
pub const TOPIC_BROADCAST_CAPACITY: usize = 1_024;
