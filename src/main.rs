use anyhow::{anyhow, Context, Result};
use flow_gateway::api::{AdaptiveRateLimiter, RequestClient};
use flow_gateway::core::{logging, Config, HealthChecker};
use flow_gateway::streaming::{handler_fn, ChannelManager, ConnectionState, StreamClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    logging::init_logging(&config.monitoring.log_level);

    info!("🚀 Flow gateway starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Rate limit: {}/min (burst {})",
        config.api.rate_limit_per_minute, config.api.burst_limit
    );

    let health_checker = Arc::new(HealthChecker::new());

    // REST side
    let limiter = Arc::new(AdaptiveRateLimiter::new(config.rate_limiter_config()));
    let client = Arc::new(RequestClient::new(config.client_config(), limiter));

    match client.get_market_top_net_impact(None, Some(1), &[]).await {
        Ok(_) => {
            info!("✅ REST API reachable");
            health_checker.update_component("rest_api", true).await;
        }
        Err(e) => warn!("⚠️ REST API check failed: {}", e),
    }

    // Streaming side
    let stream = Arc::new(StreamClient::new(config.stream_config()));
    let channels = ChannelManager::new(stream.clone());

    let flow_handler = handler_fn(|message| {
        info!("🐋 Flow alert: {}", message);
        Ok(())
    });
    stream
        .connect_with_retry()
        .await
        .context("stream unreachable")?;
    channels
        .subscribe_flow_alerts(Some(flow_handler))
        .await
        .context("failed to subscribe to flow alerts")?;
    health_checker.update_component("stream", true).await;
    let mut stream_task = stream.spawn();

    // Health endpoint
    let health_clone = health_checker.clone();
    let health_port = config.monitoring.health_port;
    tokio::spawn(async move { start_health_server(health_clone, health_port).await });
    info!("✅ Health endpoint running on port {}", health_port);

    let mut ticker = tokio::time::interval(Duration::from_secs(
        config.monitoring.stats_interval_secs.max(1),
    ));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                health_checker
                    .update_component("stream", stream.state() == ConnectionState::Connected)
                    .await;
                client.log_stats().await;
                stream.log_stats().await;

                let status = health_checker.get_status().await;
                info!(
                    "Gateway status: {} (uptime: {}s)",
                    status.status, status.uptime_seconds
                );

                if stream.state() == ConnectionState::Failed {
                    error!("🛑 Stream permanently failed, shutting down");
                    break;
                }
            }
            _ = &mut stream_task => {
                error!("🛑 Stream client exited, shutting down");
                health_checker.update_component("stream", false).await;
                return Err(anyhow!("stream stopped in state {:?}", stream.state()));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    stream.disconnect().await;
    let _ = stream_task.await;
    info!("👋 Flow gateway stopped");
    Ok(())
}

async fn start_health_server(health_checker: Arc<HealthChecker>, port: u16) {
    use warp::Filter;

    let health = warp::path("health")
        .and(warp::any().map(move || health_checker.clone()))
        .and_then(|checker: Arc<HealthChecker>| async move {
            let status = checker.get_status().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    warp::serve(health).run(([0, 0, 0, 0], port)).await;
}
