use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::error::StreamError;

/// Inbound frame, reduced to what the read loop cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Pong,
    Close,
    Other,
}

/// Write half of a stream connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError>;
    async fn send_ping(&mut self) -> Result<(), StreamError>;
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Read half of a stream connection. `None` means the connection ended.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>>;
}

pub struct StreamConnection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens authenticated stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str, api_key: &str) -> Result<StreamConnection, StreamError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl StreamConnector for TungsteniteConnector {
    async fn connect(&self, url: &str, api_key: &str) -> Result<StreamConnection, StreamError> {
        let connect_start = Instant::now();

        let mut request = url
            .into_client_request()
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| StreamError::Connect(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        info!("🔗 WebSocket connected in {:?}", connect_start.elapsed());

        let (write, read) = ws_stream.split();
        Ok(StreamConnection {
            sink: Box::new(WsSink(write)),
            source: Box::new(WsSource(read)),
        })
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamError::Send(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), StreamError> {
        self.0
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| StreamError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.0
            .close()
            .await
            .map_err(|e| StreamError::Send(e.to_string()))
    }
}

struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        let frame = match self.0.next().await? {
            Ok(Message::Text(text)) => Frame::Text(text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => Frame::Text(text),
                Err(_) => Frame::Other,
            },
            Ok(Message::Pong(_)) => {
                debug!("🏓 Pong received");
                Frame::Pong
            }
            Ok(Message::Close(_)) => Frame::Close,
            Ok(_) => Frame::Other,
            Err(e) => return Some(Err(StreamError::Transport(e.to_string()))),
        };
        Some(Ok(frame))
    }
}
