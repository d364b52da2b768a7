use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{Frame, FrameSink, FrameSource, StreamConnector, TungsteniteConnector};
use super::error::StreamError;
use super::metrics::{StreamMetrics, StreamMetricsSnapshot};
use crate::api::retry::Backoff;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub api_key: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub idle_timeout: Duration,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.unusualwhales.com/socket".to_string(),
            api_key: String::new(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            idle_timeout: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl StreamConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// Control frame sent to the server, e.g. `{"action":"subscribe","channel":"flow-alerts"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub channel: String,
}

/// Callback for messages on a subscribed channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Value) -> anyhow::Result<()>;
}

pub type SharedHandler = Arc<dyn MessageHandler>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Value) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: &Value) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> SharedHandler
where
    F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Default)]
struct Registry {
    channels: BTreeSet<String>,
    handlers: HashMap<String, Vec<SharedHandler>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub state: ConnectionState,
    pub running: bool,
    pub subscribed_channels: Vec<String>,
    pub reconnect_attempts: u32,
    #[serde(flatten)]
    pub metrics: StreamMetricsSnapshot,
}

enum LoopEvent {
    Shutdown,
    Frame(Option<Result<Frame, StreamError>>),
    Idle,
}

pub struct StreamClient {
    config: StreamConfig,
    connector: Arc<dyn StreamConnector>,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
    running_tx: watch::Sender<bool>,
    // Lock order: registry before sink.
    registry: RwLock<Registry>,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    // Bumped under the sink lock each time a new connection is installed.
    generation: AtomicU64,
    pending_source: Mutex<Option<(u64, Box<dyn FrameSource>)>>,
    connect_lock: Mutex<()>,
    reconnect_attempts: AtomicU32,
    metrics: StreamMetrics,
}

impl StreamClient {
    pub fn new(config: StreamConfig) -> Self {
        let connector = Arc::new(TungsteniteConnector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: StreamConfig, connector: Arc<dyn StreamConnector>) -> Self {
        let backoff = Backoff::new(config.reconnect_delay, config.max_reconnect_delay);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (running_tx, _) = watch::channel(false);

        Self {
            config,
            connector,
            backoff,
            state_tx,
            running_tx,
            registry: RwLock::new(Registry::default()),
            sink: Mutex::new(None),
            generation: AtomicU64::new(0),
            pending_source: Mutex::new(None),
            connect_lock: Mutex::new(()),
            reconnect_attempts: AtomicU32::new(0),
            metrics: StreamMetrics::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt.saturating_sub(1))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("🔀 Stream state {:?} -> {:?}", previous, state);
        }
    }

    /// Open a connection and re-send every retained subscription.
    pub async fn connect(&self) -> Result<(), StreamError> {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked(ConnectionState::Disconnected).await
    }

    /// `connect` with the reconnect backoff between failed tries. Exhausting
    /// `max_reconnect_attempts` retries leaves the client `Failed`.
    pub async fn connect_with_retry(&self) -> Result<(), StreamError> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt = 0;

        loop {
            if self.is_connected() {
                return Ok(());
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(StreamError::Failed) => return Err(StreamError::Failed),
                Err(e) if attempt < max_attempts => {
                    attempt += 1;
                    let delay = self.reconnect_delay(attempt);
                    warn!(
                        "⏳ Initial connect failed ({}), retrying in {:?} (attempt {}/{})",
                        e, delay, attempt, max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("🛑 Could not connect after {} retries: {}", max_attempts, e);
                    self.set_state(ConnectionState::Failed);
                    return Err(StreamError::Failed);
                }
            }
        }
    }

    // Caller holds `connect_lock`.
    async fn connect_locked(&self, on_failure: ConnectionState) -> Result<(), StreamError> {
        if self.state() == ConnectionState::Failed {
            return Err(StreamError::Failed);
        }

        self.set_state(ConnectionState::Connecting);
        info!("🔌 Connecting to stream: {}", self.config.url);

        let connection = match self
            .connector
            .connect(&self.config.url, &self.config.api_key)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                error!("❌ Stream connection failed: {}", e);
                self.set_state(on_failure);
                return Err(e);
            }
        };

        let mut sink = connection.sink;
        let registry = self.registry.read().await;
        for channel in &registry.channels {
            if let Err(e) = send_control(sink.as_mut(), ControlAction::Subscribe, channel).await {
                error!("❌ Failed to resubscribe to {}: {}", channel, e);
                let _ = sink.close().await;
                self.set_state(on_failure);
                return Err(e);
            }
            debug!("📡 Resubscribed to {}", channel);
        }

        // Install while still holding the registry so no subscribe slips between
        // the resubscribe pass and the new sink.
        let (generation, previous) = {
            let mut slot = self.sink.lock().await;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (generation, slot.replace(sink))
        };
        drop(registry);
        if let Some(mut old) = previous {
            let _ = old.close().await;
        }
        *self.pending_source.lock().await = Some((generation, connection.source));

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!("✅ Stream connected");
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), StreamError> {
        loop {
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => return Err(StreamError::Failed),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    let mut rx = self.state_tx.subscribe();
                    let _ = rx
                        .wait_for(|state| {
                            matches!(
                                state,
                                ConnectionState::Connected
                                    | ConnectionState::Failed
                                    | ConnectionState::Disconnected
                            )
                        })
                        .await;
                }
                ConnectionState::Disconnected => {
                    let _guard = self.connect_lock.lock().await;
                    if self.state() == ConnectionState::Disconnected {
                        return self.connect_locked(ConnectionState::Disconnected).await;
                    }
                }
            }
        }
    }

    /// Subscribe to `channel`, connecting first if needed. A handler, if given,
    /// is added to the channel's handler list.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.ensure_connected().await?;

        let mut registry = self.registry.write().await;
        {
            let mut sink = self.sink.lock().await;
            let sink = sink.as_mut().ok_or(StreamError::NotConnected)?;
            send_control(sink.as_mut(), ControlAction::Subscribe, channel).await?;
        }

        registry.channels.insert(channel.to_string());
        if let Some(handler) = handler {
            registry
                .handlers
                .entry(channel.to_string())
                .or_default()
                .push(handler);
        }
        info!("📡 Subscribed to channel: {}", channel);
        Ok(())
    }

    /// Drop `channel` and its handlers. No-op for unknown channels.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), StreamError> {
        let mut registry = self.registry.write().await;
        if !registry.channels.contains(channel) {
            return Ok(());
        }

        {
            let mut sink = self.sink.lock().await;
            if let Some(sink) = sink.as_mut() {
                if let Err(e) =
                    send_control(sink.as_mut(), ControlAction::Unsubscribe, channel).await
                {
                    warn!("⚠️ Unsubscribe frame for {} not delivered: {}", channel, e);
                }
            }
        }

        registry.channels.remove(channel);
        registry.handlers.remove(channel);
        info!("🔕 Unsubscribed from channel: {}", channel);
        Ok(())
    }

    /// Add a handler without sending a subscribe frame.
    pub async fn register_handler(&self, channel: &str, handler: SharedHandler) {
        self.registry
            .write()
            .await
            .handlers
            .entry(channel.to_string())
            .or_default()
            .push(handler);
    }

    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.registry.read().await.channels.iter().cloned().collect()
    }

    /// Run the read loop until `disconnect` is called or reconnects are exhausted.
    pub async fn start(&self) -> Result<(), StreamError> {
        if self.is_running() {
            return Err(StreamError::AlreadyRunning);
        }
        self.ensure_connected().await?;

        let (mut generation, mut source) = match self.pending_source.lock().await.take() {
            Some(pending) => pending,
            None => return Err(StreamError::NotConnected),
        };

        let mut running_rx = self.running_tx.subscribe();
        self.running_tx.send_replace(true);
        info!("🚀 Stream client started");

        let mut awaiting_pong = false;

        loop {
            if !*running_rx.borrow_and_update() {
                break;
            }

            let wait = if awaiting_pong {
                self.config.ping_timeout
            } else {
                self.config.idle_timeout
            };

            let event = tokio::select! {
                _ = running_rx.changed() => LoopEvent::Shutdown,
                frame = tokio::time::timeout(wait, source.next_frame()) => match frame {
                    Ok(frame) => LoopEvent::Frame(frame),
                    Err(_) => LoopEvent::Idle,
                },
            };

            let lost = match event {
                LoopEvent::Shutdown => continue,
                LoopEvent::Frame(Some(Ok(Frame::Text(text)))) => {
                    awaiting_pong = false;
                    self.handle_text(&text).await;
                    None
                }
                LoopEvent::Frame(Some(Ok(Frame::Pong | Frame::Other))) => {
                    awaiting_pong = false;
                    None
                }
                LoopEvent::Frame(Some(Ok(Frame::Close)) | None) => {
                    Some("connection closed by server".to_string())
                }
                LoopEvent::Frame(Some(Err(e))) => {
                    self.metrics.increment_errors();
                    Some(e.to_string())
                }
                LoopEvent::Idle if awaiting_pong => Some("ping timed out".to_string()),
                LoopEvent::Idle => {
                    debug!("🏓 No traffic for {:?}, sending ping", wait);
                    match self.send_ping().await {
                        Ok(()) => {
                            awaiting_pong = true;
                            None
                        }
                        Err(e) => Some(e.to_string()),
                    }
                }
            };

            if let Some(reason) = lost {
                if !*running_rx.borrow() {
                    break;
                }
                warn!("🔌 Stream connection lost: {}", reason);
                match self.reconnect(generation, &mut running_rx).await {
                    Some((new_generation, new_source)) => {
                        generation = new_generation;
                        source = new_source;
                        awaiting_pong = false;
                    }
                    None => break,
                }
            }
        }

        // A newer connection (e.g. a subscribe after `disconnect`) is left alone.
        if self.release_connection(generation).await {
            self.running_tx.send_replace(false);
            if self.state() != ConnectionState::Failed {
                self.set_state(ConnectionState::Disconnected);
            }
        }
        info!("🛑 Stream client stopped");
        Ok(())
    }

    /// Run `start` on a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!("❌ Stream client exited with error: {}", e);
            }
        })
    }

    async fn reconnect(
        &self,
        generation: u64,
        running_rx: &mut watch::Receiver<bool>,
    ) -> Option<(u64, Box<dyn FrameSource>)> {
        if !self.release_connection(generation).await {
            return None;
        }
        self.set_state(ConnectionState::Reconnecting);

        let max_attempts = self.config.max_reconnect_attempts;
        while self.reconnect_attempts.load(Ordering::SeqCst) < max_attempts {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.reconnect_delay(attempt);
            warn!(
                "⏳ Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, max_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = running_rx.wait_for(|running| !*running) => return None,
            }

            let _guard = self.connect_lock.lock().await;
            if !*running_rx.borrow() {
                return None;
            }
            match self.connect_locked(ConnectionState::Reconnecting).await {
                Ok(()) => {
                    self.metrics.increment_reconnections();
                    info!("🔄 Stream reconnected after {} attempt(s)", attempt);
                    return self.pending_source.lock().await.take();
                }
                Err(e) => error!("❌ Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        error!(
            "🛑 Max reconnection attempts ({}) reached, giving up",
            max_attempts
        );
        self.set_state(ConnectionState::Failed);
        self.running_tx.send_replace(false);
        None
    }

    /// Stop the read loop and close the connection. Safe from any state.
    pub async fn disconnect(&self) {
        self.running_tx.send_replace(false);
        let _guard = self.connect_lock.lock().await;
        self.close_sink().await;
        self.pending_source.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
        info!("👋 Stream disconnected");
    }

    /// Close the sink if it still belongs to `generation`. Returns false when
    /// a newer connection has replaced it.
    async fn release_connection(&self, generation: u64) -> bool {
        let mut slot = self.sink.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        if let Some(mut sink) = slot.take() {
            if let Err(e) = sink.close().await {
                debug!("Close frame not delivered: {}", e);
            }
        }
        true
    }

    async fn close_sink(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("Close frame not delivered: {}", e);
            }
        }
    }

    async fn send_ping(&self) -> Result<(), StreamError> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send_ping().await,
            None => Err(StreamError::NotConnected),
        }
    }

    async fn handle_text(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(message) => self.dispatch(&message).await,
            Err(e) => {
                error!("❌ Invalid JSON received: {}", e);
                self.metrics.increment_errors();
            }
        }
    }

    async fn dispatch(&self, message: &Value) {
        let channel = message.get("channel").and_then(Value::as_str);
        self.metrics.record_message(channel).await;

        let Some(channel) = channel else {
            return;
        };

        // Snapshot so handlers can (un)subscribe without deadlocking.
        let handlers = self
            .registry
            .read()
            .await
            .handlers
            .get(channel)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("❌ Handler error on {}: {:#}", channel, e);
                    self.metrics.increment_errors();
                }
                Err(_) => {
                    error!("❌ Handler panicked on {}", channel);
                    self.metrics.increment_errors();
                }
            }
        }
    }

    pub async fn stats(&self) -> StreamStats {
        StreamStats {
            state: self.state(),
            running: self.is_running(),
            subscribed_channels: self.subscribed_channels().await,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            metrics: self.metrics.snapshot().await,
        }
    }

    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        info!(
            "📊 Stream: {:?} | messages: {} | errors: {} | reconnections: {} | channels: {}",
            stats.state,
            stats.metrics.messages_received,
            stats.metrics.errors,
            stats.metrics.reconnections,
            stats.subscribed_channels.len()
        );
    }
}

async fn send_control(
    sink: &mut dyn FrameSink,
    action: ControlAction,
    channel: &str,
) -> Result<(), StreamError> {
    let frame = serde_json::to_string(&ControlMessage {
        action,
        channel: channel.to_string(),
    })?;
    sink.send_text(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::connection::StreamConnection;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    const CLOSED: &str = "<closed>";

    struct RecordingSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
            self.0
                .send(text)
                .map_err(|e| StreamError::Send(e.to_string()))
        }
        async fn send_ping(&mut self) -> Result<(), StreamError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), StreamError> {
            let _ = self.0.send(CLOSED.to_string());
            Ok(())
        }
    }

    struct SilentSource;

    #[async_trait]
    impl FrameSource for SilentSource {
        async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
            std::future::pending().await
        }
    }

    struct SingleConnector {
        sent: mpsc::UnboundedSender<String>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl StreamConnector for SingleConnector {
        async fn connect(&self, _url: &str, _key: &str) -> Result<StreamConnection, StreamError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(StreamConnection {
                sink: Box::new(RecordingSink(self.sent.clone())),
                source: Box::new(SilentSource),
            })
        }
    }

    fn client() -> (StreamClient, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(SingleConnector {
            sent: tx,
            connects: AtomicUsize::new(0),
        });
        (
            StreamClient::with_connector(StreamConfig::new("wss://test", "key"), connector),
            rx,
        )
    }

    #[test]
    fn control_message_wire_format() {
        let json = serde_json::to_string(&ControlMessage {
            action: ControlAction::Subscribe,
            channel: "flow-alerts".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"action":"subscribe","channel":"flow-alerts"}"#);
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let (client, _rx) = client();
        assert_eq!(client.reconnect_delay(1), Duration::from_secs(5));
        assert_eq!(client.reconnect_delay(2), Duration::from_secs(10));
        assert_eq!(client.reconnect_delay(3), Duration::from_secs(20));
        assert_eq!(client.reconnect_delay(5), Duration::from_secs(60));
        assert_eq!(client.reconnect_delay(50), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn subscribe_connects_lazily() {
        let (client, mut rx) = client();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.subscribe("flow-alerts", None).await.unwrap();

        assert!(client.is_connected());
        let frame: ControlMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.action, ControlAction::Subscribe);
        assert_eq!(frame.channel, "flow-alerts");
        assert_eq!(client.subscribed_channels().await, vec!["flow-alerts"]);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_channel_is_noop() {
        let (client, mut rx) = client();
        client.unsubscribe("price:SPY").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_channel_and_handlers() {
        let (client, mut rx) = client();
        client
            .subscribe("gex:SPY", Some(handler_fn(|_| Ok(()))))
            .await
            .unwrap();
        let _ = rx.recv().await;

        client.unsubscribe("gex:SPY").await.unwrap();

        let frame: ControlMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.action, ControlAction::Unsubscribe);
        assert!(client.subscribed_channels().await.is_empty());
        assert!(client.registry.read().await.handlers.is_empty());
    }

    #[tokio::test]
    async fn dispatch_isolates_failing_handlers() {
        let (client, _rx) = client();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        client
            .register_handler("flow-alerts", handler_fn(|_| anyhow::bail!("boom")))
            .await;
        client
            .register_handler(
                "flow-alerts",
                handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        client
            .handle_text(r#"{"channel":"flow-alerts","data":{"ticker":"SPY"}}"#)
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = client.stats().await;
        assert_eq!(stats.metrics.errors, 1);
        assert_eq!(stats.metrics.messages_received, 1);
    }

    #[tokio::test]
    async fn dispatch_survives_panicking_handler() {
        let (client, _rx) = client();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        client
            .register_handler("price:SPY", handler_fn(|_| panic!("handler bug")))
            .await;
        client
            .register_handler(
                "price:SPY",
                handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        client.handle_text(r#"{"channel":"price:SPY"}"#).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(client.stats().await.metrics.errors, 1);
    }

    #[tokio::test]
    async fn invalid_json_counts_as_error() {
        let (client, _rx) = client();
        client.handle_text("not json").await;

        let stats = client.stats().await;
        assert_eq!(stats.metrics.errors, 1);
        assert_eq!(stats.metrics.messages_received, 0);
    }

    #[tokio::test]
    async fn message_without_channel_is_counted_only() {
        let (client, _rx) = client();
        client.handle_text(r#"{"type":"heartbeat"}"#).await;

        let stats = client.stats().await;
        assert_eq!(stats.metrics.messages_received, 1);
        assert!(stats.metrics.messages_by_channel.is_empty());
    }

    #[tokio::test]
    async fn start_without_pending_connection_reports_not_connected() {
        let (client, _rx) = client();
        client.connect().await.unwrap();
        client.pending_source.lock().await.take();

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, StreamError::NotConnected));
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn exiting_loop_leaves_newer_connection_open() {
        let (client, mut rx) = client();
        let client = Arc::new(client);
        client.subscribe("flow-alerts", None).await.unwrap();

        let task = client.spawn();
        while !client.is_running() {
            tokio::task::yield_now().await;
        }

        // The read loop has not observed the shutdown yet when the new
        // subscribe reconnects.
        client.disconnect().await;
        client.subscribe("price:SPY", None).await.unwrap();
        task.await.unwrap();

        assert!(client.is_connected());
        assert!(client.sink.lock().await.is_some());
        assert!(client.pending_source.lock().await.is_some());

        let mut closed = 0;
        while let Ok(frame) = rx.try_recv() {
            if frame == CLOSED {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn disconnect_is_safe_when_idle() {
        let (client, _rx) = client();
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_running());
    }
}
