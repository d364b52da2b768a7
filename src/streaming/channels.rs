use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::StreamError;
use super::stream_client::{SharedHandler, StreamClient};

/// Named stream channels. Ticker-scoped channels render as `{prefix}:{TICKER}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    FlowAlerts,
    Price(String),
    Gex(String),
    GexStrike(String),
    GexStrikeExpiry(String),
    LitTrades,
    OffLitTrades,
}

impl Channel {
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::FlowAlerts => write!(f, "flow-alerts"),
            Channel::Price(ticker) => write!(f, "price:{}", ticker),
            Channel::Gex(ticker) => write!(f, "gex:{}", ticker),
            Channel::GexStrike(ticker) => write!(f, "gex_strike:{}", ticker),
            Channel::GexStrikeExpiry(ticker) => write!(f, "gex_strike_expiry:{}", ticker),
            Channel::LitTrades => write!(f, "lit_trades"),
            Channel::OffLitTrades => write!(f, "off_lit_trades"),
        }
    }
}

/// Typed convenience layer over a shared `StreamClient`.
#[derive(Clone)]
pub struct ChannelManager {
    client: Arc<StreamClient>,
}

impl ChannelManager {
    pub fn new(client: Arc<StreamClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<StreamClient> {
        &self.client
    }

    pub async fn subscribe(
        &self,
        channel: &Channel,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.client.subscribe(&channel.name(), handler).await
    }

    pub async fn unsubscribe(&self, channel: &Channel) -> Result<(), StreamError> {
        self.client.unsubscribe(&channel.name()).await
    }

    pub async fn subscribe_flow_alerts(
        &self,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.subscribe(&Channel::FlowAlerts, handler).await
    }

    pub async fn subscribe_price(
        &self,
        ticker: &str,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.subscribe(&Channel::Price(ticker.to_string()), handler)
            .await
    }

    pub async fn subscribe_gex(
        &self,
        ticker: &str,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.subscribe(&Channel::Gex(ticker.to_string()), handler)
            .await
    }

    pub async fn subscribe_gex_strike(
        &self,
        ticker: &str,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.subscribe(&Channel::GexStrike(ticker.to_string()), handler)
            .await
    }

    pub async fn subscribe_gex_strike_expiry(
        &self,
        ticker: &str,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.subscribe(&Channel::GexStrikeExpiry(ticker.to_string()), handler)
            .await
    }

    pub async fn subscribe_lit_trades(
        &self,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.subscribe(&Channel::LitTrades, handler).await
    }

    pub async fn subscribe_off_lit_trades(
        &self,
        handler: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        self.subscribe(&Channel::OffLitTrades, handler).await
    }

    /// Subscribe to the intraday set for one ticker. Only channels with a
    /// handler are subscribed; the gex handler covers both `gex` and
    /// `gex_strike` for the ticker.
    pub async fn subscribe_intraday(
        &self,
        ticker: &str,
        price: Option<SharedHandler>,
        gex: Option<SharedHandler>,
        flow: Option<SharedHandler>,
    ) -> Result<(), StreamError> {
        let mut channels = Vec::new();

        if let Some(handler) = price {
            self.subscribe_price(ticker, Some(handler)).await?;
            channels.push(Channel::Price(ticker.to_string()));
        }
        if let Some(handler) = gex {
            self.subscribe_gex(ticker, Some(handler.clone())).await?;
            self.subscribe_gex_strike(ticker, Some(handler)).await?;
            channels.push(Channel::Gex(ticker.to_string()));
            channels.push(Channel::GexStrike(ticker.to_string()));
        }
        if let Some(handler) = flow {
            self.subscribe_flow_alerts(Some(handler)).await?;
            channels.push(Channel::FlowAlerts);
        }

        if channels.is_empty() {
            debug!("No intraday handlers given for {}", ticker);
        } else {
            info!(
                "📈 Intraday channels subscribed for {}: {}",
                ticker,
                channels
                    .iter()
                    .map(Channel::name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(())
    }
}
