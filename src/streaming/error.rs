use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream client already running")]
    AlreadyRunning,

    #[error("stream client gave up after exhausting reconnect attempts")]
    Failed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
