pub mod channels;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod stream_client;

pub use channels::{Channel, ChannelManager};
pub use connection::{
    Frame, FrameSink, FrameSource, StreamConnection, StreamConnector, TungsteniteConnector,
};
pub use error::StreamError;
pub use metrics::{StreamMetrics, StreamMetricsSnapshot};
pub use stream_client::{
    handler_fn, ConnectionState, ControlAction, ControlMessage, MessageHandler, SharedHandler,
    StreamClient, StreamConfig, StreamStats,
};
