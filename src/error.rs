use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("stomp protocol error: {0}")]
    Stomp(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("channel closed: {0}")]
    Closed(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
