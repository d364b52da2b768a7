//! Rate-limited REST and streaming client for an options flow market-data service.

pub mod api;
pub mod core;
pub mod streaming;

pub use api::{AdaptiveRateLimiter, ApiError, RateLimiter, RequestCache, RequestClient};
pub use streaming::{ChannelManager, StreamClient};
