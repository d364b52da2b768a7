use serde_json::Value;

use super::client::RequestClient;
use super::error::ApiError;

/// Owned query parameters, borrowed into `&[(&str, &str)]` at call time.
#[derive(Debug, Default, Clone)]
struct Query(Vec<(&'static str, String)>);

impl Query {
    fn new() -> Self {
        Self::default()
    }

    fn with(mut self, name: &'static str, value: impl ToString) -> Self {
        self.0.push((name, value.to_string()));
        self
    }

    fn with_opt(self, name: &'static str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    /// One pair per value, for array parameters such as `issue_types[]`.
    fn with_each(mut self, name: &'static str, values: &[&str]) -> Self {
        for value in values {
            self.0.push((name, value.to_string()));
        }
        self
    }

    fn pairs(&self) -> Vec<(&str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }
}

/// Filters for the options flow alert feed.
#[derive(Debug, Clone, Default)]
pub struct FlowAlertsQuery {
    pub ticker: Option<String>,
    pub min_premium: Option<f64>,
    pub older_than: Option<String>,
    pub newer_than: Option<String>,
    pub limit: Option<u32>,
}

const DEFAULT_LIMIT: u32 = 100;

impl RequestClient {
    // Options flow
    pub async fn get_flow_alerts(&self, query: &FlowAlertsQuery) -> Result<Value, ApiError> {
        let params = Query::new()
            .with("limit", query.limit.unwrap_or(DEFAULT_LIMIT))
            .with_opt("ticker", query.ticker.as_deref())
            .with_opt("min_premium", query.min_premium)
            .with_opt("older_than", query.older_than.as_deref())
            .with_opt("newer_than", query.newer_than.as_deref());
        self.get("/api/option-trades/flow-alerts", &params.pairs(), true)
            .await
    }

    // Gamma exposure
    pub async fn get_spot_exposures(
        &self,
        ticker: &str,
        date: Option<&str>,
    ) -> Result<Value, ApiError> {
        let params = Query::new().with_opt("date", date);
        self.get(
            &format!("/api/stock/{}/spot-exposures", ticker),
            &params.pairs(),
            true,
        )
        .await
    }

    pub async fn get_spot_exposures_by_strike(
        &self,
        ticker: &str,
        date: Option<&str>,
    ) -> Result<Value, ApiError> {
        let params = Query::new().with_opt("date", date);
        self.get(
            &format!("/api/stock/{}/spot-exposures/strike", ticker),
            &params.pairs(),
            true,
        )
        .await
    }

    pub async fn get_net_prem_ticks(
        &self,
        ticker: &str,
        date: Option<&str>,
    ) -> Result<Value, ApiError> {
        let params = Query::new().with_opt("date", date);
        self.get(
            &format!("/api/stock/{}/net-prem-ticks", ticker),
            &params.pairs(),
            true,
        )
        .await
    }

    pub async fn get_flow_per_strike_intraday(
        &self,
        ticker: &str,
        date: Option<&str>,
    ) -> Result<Value, ApiError> {
        let params = Query::new().with_opt("date", date);
        self.get(
            &format!("/api/stock/{}/flow-per-strike-intraday", ticker),
            &params.pairs(),
            true,
        )
        .await
    }

    // Dark pool
    pub async fn get_dark_pool(
        &self,
        ticker: &str,
        older_than: Option<&str>,
        newer_than: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Value, ApiError> {
        let params = Query::new()
            .with("limit", limit.unwrap_or(DEFAULT_LIMIT))
            .with_opt("older_than", older_than)
            .with_opt("newer_than", newer_than);
        self.get(&format!("/api/darkpool/{}", ticker), &params.pairs(), true)
            .await
    }

    // Market wide
    pub async fn get_market_top_net_impact(
        &self,
        date: Option<&str>,
        limit: Option<u32>,
        issue_types: &[&str],
    ) -> Result<Value, ApiError> {
        let params = Query::new()
            .with("limit", limit.unwrap_or(20))
            .with_opt("date", date)
            .with_each("issue_types[]", issue_types);
        self.get("/api/market/top-net-impact", &params.pairs(), true)
            .await
    }

    pub async fn get_market_correlations(
        &self,
        tickers: &[&str],
        interval: Option<&str>,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Value, ApiError> {
        let params = Query::new()
            .with("tickers", tickers.join(","))
            .with_opt("interval", interval)
            .with_opt("start_date", start_date)
            .with_opt("end_date", end_date);
        self.get("/api/market/correlations", &params.pairs(), true)
            .await
    }

    // Greeks and open interest
    pub async fn get_stock_greeks(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(&format!("/api/stock/{}/greeks", ticker), &[], true)
            .await
    }

    pub async fn get_greek_exposure_strike(
        &self,
        ticker: &str,
        expiry: Option<&str>,
    ) -> Result<Value, ApiError> {
        let params = Query::new().with_opt("expiry", expiry);
        self.get(
            &format!("/api/stock/{}/greek-exposure/strike", ticker),
            &params.pairs(),
            true,
        )
        .await
    }

    pub async fn get_oi_per_strike(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(&format!("/api/stock/{}/oi-per-strike", ticker), &[], true)
            .await
    }

    pub async fn get_oi_per_expiry(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(&format!("/api/stock/{}/oi-per-expiry", ticker), &[], true)
            .await
    }

    pub async fn get_realized_volatility(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(
            &format!("/api/stock/{}/volatility/realized", ticker),
            &[],
            true,
        )
        .await
    }

    // Institutions
    pub async fn get_institution_latest_filings(
        &self,
        limit: Option<u32>,
    ) -> Result<Value, ApiError> {
        let params = Query::new().with("limit", limit.unwrap_or(50));
        self.get("/api/institution/latest_filings", &params.pairs(), true)
            .await
    }

    pub async fn get_institution_ownership(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(&format!("/api/institution/{}/ownership", ticker), &[], true)
            .await
    }

    pub async fn get_institution_holdings(
        &self,
        name: &str,
        limit: Option<u32>,
    ) -> Result<Value, ApiError> {
        let params = Query::new().with("limit", limit.unwrap_or(DEFAULT_LIMIT));
        self.get(
            &format!("/api/institution/{}/holdings", name),
            &params.pairs(),
            true,
        )
        .await
    }

    // Congress, shorts, seasonality
    pub async fn get_congress_recent_trades(&self, limit: Option<u32>) -> Result<Value, ApiError> {
        let params = Query::new().with("limit", limit.unwrap_or(DEFAULT_LIMIT));
        self.get("/api/congress/recent-trades", &params.pairs(), true)
            .await
    }

    pub async fn get_shorts_data(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(&format!("/api/shorts/{}/data", ticker), &[], true)
            .await
    }

    pub async fn get_shorts_interest_float(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(&format!("/api/shorts/{}/interest-float", ticker), &[], true)
            .await
    }

    pub async fn get_seasonality_monthly(&self, ticker: &str) -> Result<Value, ApiError> {
        self.get(&format!("/api/seasonality/{}/monthly", ticker), &[], true)
            .await
    }

    // News
    pub async fn get_news_headlines(
        &self,
        ticker: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Value, ApiError> {
        let params = Query::new()
            .with("limit", limit.unwrap_or(50))
            .with_opt("ticker", ticker);
        self.get("/api/news/headlines", &params.pairs(), true).await
    }
}
