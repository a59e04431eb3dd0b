//! Resilient broker gateway: every outbound broker call goes through one
//! rate-limited, retry-aware envelope with uniform response classification.

mod client;
mod envelope;
mod models;
mod rate_limit;

pub use client::{quote_is_stale, stale_bar_max_age, BrokerGateway, ConnectionHealth, GatewayConfig};
pub use envelope::{classify_failure, is_success_status, ApiResponse, ErrorKind, PDT_ERROR_CODE};
pub use models::{
    Account, ActiveStock, Bar, MarketMover, MoverKind, NewsArticle, Order, OrderRequest,
    OrderSide, OrderType, Position, Quote, StopLossSpec, TakeProfitSpec, TimeInForce,
};
pub use rate_limit::{Priority, RateLimiter};
