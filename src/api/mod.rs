pub mod cache;
pub mod client;
pub mod endpoints;
pub mod error;
pub mod rate_limiter;
pub mod retry;
pub mod transport;
pub mod types;

pub use cache::{cache_key, RequestCache};
pub use client::{ClientConfig, ClientStats, RequestClient};
pub use endpoints::FlowAlertsQuery;
pub use error::{ApiError, ApiErrorKind, TransportError};
pub use rate_limiter::{
    AdaptiveRateLimiter, Availability, RateLimiter, RateLimiterConfig, RateLimiterStats,
    ServerQuotaSnapshot,
};
pub use retry::{Backoff, RetryConfig};
pub use transport::{HttpTransport, ReqwestTransport};
pub use types::{HttpMethod, HttpRequest, HttpResponse};
