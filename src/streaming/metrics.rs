use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;

/// Counters for the stream read loop. Each observed event bumps exactly one
/// counter once.
#[derive(Debug)]
pub struct StreamMetrics {
    messages_received: AtomicU64,
    errors_count: AtomicU64,
    reconnections: AtomicU64,
    messages_by_channel: RwLock<HashMap<String, u64>>,
    last_message_at: RwLock<Option<DateTime<Utc>>>,
    start_time: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMetricsSnapshot {
    pub messages_received: u64,
    pub messages_by_channel: HashMap<String, u64>,
    pub errors: u64,
    pub reconnections: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub message_rate_per_sec: f64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            messages_by_channel: RwLock::new(HashMap::new()),
            last_message_at: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    /// Count one inbound message, attributing it to `channel` when present.
    pub async fn record_message(&self, channel: Option<&str>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_message_at.write().await = Some(Utc::now());

        if let Some(channel) = channel {
            let mut by_channel = self.messages_by_channel.write().await;
            *by_channel.entry(channel.to_string()).or_insert(0) += 1;
        }
    }

    pub fn increment_errors(&self) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnections(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn get_errors_count(&self) -> u64 {
        self.errors_count.load(Ordering::Relaxed)
    }

    pub fn get_reconnections(&self) -> u64 {
        self.reconnections.load(Ordering::Relaxed)
    }

    pub fn get_uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn get_message_rate(&self) -> f64 {
        let uptime = self.get_uptime_secs();
        if uptime == 0 {
            0.0
        } else {
            self.get_messages_received() as f64 / uptime as f64
        }
    }

    pub async fn snapshot(&self) -> StreamMetricsSnapshot {
        StreamMetricsSnapshot {
            messages_received: self.get_messages_received(),
            messages_by_channel: self.messages_by_channel.read().await.clone(),
            errors: self.get_errors_count(),
            reconnections: self.get_reconnections(),
            last_message_at: *self.last_message_at.read().await,
            uptime_secs: self.get_uptime_secs(),
            message_rate_per_sec: self.get_message_rate(),
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_initialization() {
        let metrics = StreamMetrics::new();
        let snapshot = metrics.snapshot().await;

        assert_eq!(snapshot.messages_received, 0);
        assert!(snapshot.messages_by_channel.is_empty());
        assert!(snapshot.last_message_at.is_none());
    }

    #[tokio::test]
    async fn test_message_counts_by_channel() {
        let metrics = StreamMetrics::new();
        metrics.record_message(Some("flow-alerts")).await;
        metrics.record_message(Some("flow-alerts")).await;
        metrics.record_message(Some("price:SPY")).await;
        metrics.record_message(None).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.messages_received, 4);
        assert_eq!(snapshot.messages_by_channel.get("flow-alerts"), Some(&2));
        assert_eq!(snapshot.messages_by_channel.get("price:SPY"), Some(&1));
        assert!(snapshot.last_message_at.is_some());
    }

    #[test]
    fn test_error_and_reconnect_counters() {
        let metrics = StreamMetrics::new();
        metrics.increment_errors();
        metrics.increment_reconnections();
        metrics.increment_reconnections();

        assert_eq!(metrics.get_errors_count(), 1);
        assert_eq!(metrics.get_reconnections(), 2);
    }
}
