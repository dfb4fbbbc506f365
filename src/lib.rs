pub mod error;
pub mod market;
pub mod state;

pub use error::PipelineError;
pub use market::metrics::{MetricsSnapshot, ObservabilitySink, TracingObservabilitySink};
pub use market::pipeline::{ChartHandle, RenderSink, TracingRenderSink, WatchRenderSink};
pub use market::topics::TopicSubscription;
pub use market::types::{Candle, ConnectionState, Interval, PipelineArgs, PipelineConfig, Topic};
pub use state::MarketContext;
