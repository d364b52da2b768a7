use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::api::{Backoff, ClientConfig, RateLimiterConfig, RetryConfig};
use crate::streaming::StreamConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub stream: StreamSettings,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub rate_limit_per_minute: u32,
    pub burst_limit: u32,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    pub url: String,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub idle_timeout_secs: u64,
    pub ping_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub health_port: u16,
    pub log_level: String,
    pub stats_interval_secs: u64,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("UW_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .context("UW_API_KEY must be set")?;

        Ok(Config {
            api: ApiConfig {
                api_key,
                base_url: lookup("UW_BASE_URL")
                    .unwrap_or_else(|| "https://api.unusualwhales.com".to_string()),
                request_timeout_secs: parse_or(&lookup, "REQUEST_TIMEOUT", 30),
                rate_limit_per_minute: parse_or(&lookup, "API_RATE_LIMIT", 100),
                burst_limit: parse_or(&lookup, "API_BURST_LIMIT", 20),
                cache_enabled: parse_or(&lookup, "CACHE_ENABLED", true),
                cache_ttl_secs: parse_or(&lookup, "CACHE_TTL", 300),
                max_retries: parse_or(&lookup, "API_MAX_RETRIES", 3),
            },
            stream: StreamSettings {
                url: lookup("UW_WS_URL")
                    .unwrap_or_else(|| "wss://api.unusualwhales.com/socket".to_string()),
                reconnect_delay_secs: parse_or(&lookup, "WS_RECONNECT_DELAY", 5),
                max_reconnect_delay_secs: parse_or(&lookup, "WS_MAX_RECONNECT_DELAY", 60),
                max_reconnect_attempts: parse_or(&lookup, "WS_MAX_RECONNECT_ATTEMPTS", 10),
                idle_timeout_secs: parse_or(&lookup, "WS_IDLE_TIMEOUT", 60),
                ping_timeout_secs: parse_or(&lookup, "WS_PING_TIMEOUT", 10),
            },
            monitoring: MonitoringConfig {
                health_port: parse_or(&lookup, "HEALTH_PORT", 3000),
                log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                stats_interval_secs: parse_or(&lookup, "STATS_INTERVAL", 60),
            },
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_secs(self.api.request_timeout_secs),
            cache_enabled: self.api.cache_enabled,
            cache_ttl: Duration::from_secs(self.api.cache_ttl_secs),
            retry: RetryConfig {
                max_attempts: self.api.max_retries.max(1),
                backoff: Backoff::default(),
            },
            ..ClientConfig::new(&self.api.base_url, &self.api.api_key)
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: self.api.rate_limit_per_minute,
            burst: self.api.burst_limit,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            reconnect_delay: Duration::from_secs(self.stream.reconnect_delay_secs),
            max_reconnect_delay: Duration::from_secs(self.stream.max_reconnect_delay_secs),
            max_reconnect_attempts: self.stream.max_reconnect_attempts,
            idle_timeout: Duration::from_secs(self.stream.idle_timeout_secs),
            ping_timeout: Duration::from_secs(self.stream.ping_timeout_secs),
            ..StreamConfig::new(&self.stream.url, &self.api.api_key)
        }
    }
}
