use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentHealth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub rest_api: bool,
    pub stream: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, bool>,
}

impl ComponentHealth {
    pub fn get(&self, key: &str) -> Option<bool> {
        match key {
            "rest_api" => Some(self.rest_api),
            "stream" => Some(self.stream),
            _ => self.extra.get(key).copied(),
        }
    }

    fn all_healthy(&self) -> bool {
        self.rest_api && self.stream && self.extra.values().all(|healthy| *healthy)
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    status: Arc<RwLock<ComponentHealth>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
            status: Arc::new(RwLock::new(ComponentHealth::default())),
        }
    }

    /// `healthy` when every component is up, `degraded` when only some are,
    /// `unhealthy` when none are.
    pub async fn get_status(&self) -> HealthStatus {
        let components = self.status.read().await.clone();

        let status = if components.all_healthy() {
            "healthy"
        } else if components.rest_api || components.stream {
            "degraded"
        } else {
            "unhealthy"
        };

        HealthStatus {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
        }
    }

    pub async fn update_component(&self, component: &str, healthy: bool) {
        let mut status = self.status.write().await;
        match component {
            "rest_api" => status.rest_api = healthy,
            "stream" => status.stream = healthy,
            _ => {
                status.extra.insert(component.to_string(), healthy);
            }
        }
    }
}
