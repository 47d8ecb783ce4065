pub mod bbo;
pub mod paper;
pub mod rest;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{FundingRateSample, MarketMetrics, VenueId, VenueMeta, VenueSymbol};

pub use bbo::{BboHub, BboSubscription};

// ── Errors ──────────────────────────────────────────────────────────

/// Typed venue failure taxonomy. Transient failures are retried inside the
/// adapter and only surface as `Unavailable` after exhaustion; everything
/// else surfaces immediately.
#[derive(Error, Debug)]
pub enum VenueError {
    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited")]
    RateLimited,

    #[error("order not found: {0}")]
    OrderNotFound(String),
}

impl VenueError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Unavailable(_) | VenueError::RateLimited)
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

// ── Wire-level types ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Time-in-force. Entries use `Ioc`; resting exits use `Gtc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tif {
    Ioc,
    Gtc,
}

pub type OrderId = String;

/// Best bid/ask for one symbol on one venue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbo {
    pub bid: f64,
    pub ask: f64,
    pub ts: i64,
}

impl Bbo {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct LimitOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub tif: Tif,
    pub post_only: bool,
    /// Fresh per attempt; venues dedup on it.
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected
        )
    }
}

/// Result of `query_order`. `filled_qty`/`avg_price`/`fees_usd` reflect
/// everything executed so far, including fills that raced a cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub fees_usd: f64,
    pub trade_ids: Vec<String>,
}

/// Live per-leg position snapshot from the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePosition {
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub liquidation_price: Option<f64>,
    pub leverage: f64,
    pub margin_used: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountBalance {
    pub equity_usd: f64,
    pub free_margin_usd: f64,
}

/// One settled funding payment as reported by the venue for our position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueFundingPayment {
    pub payment_time: i64,
    pub amount_usd: f64,
    pub rate: f64,
}

// ── Capability surface ──────────────────────────────────────────────

/// Uniform capability surface over one venue. Every adapter — live REST or
/// in-memory paper — implements this; strategy code never sees anything
/// more specific.
///
/// Failure contract: transient network errors are retried inside the
/// adapter with bounded exponential backoff (3 attempts) before surfacing
/// as `Unavailable`; validation and authorization errors surface
/// immediately.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn venue_id(&self) -> &VenueId;

    fn meta(&self) -> &VenueMeta;

    /// Current best bid/ask. Fails `Unavailable` when no fresh quote exists.
    async fn fetch_bbo(&self, symbol: &str) -> VenueResult<Bbo>;

    /// All funding rates the venue quotes, keyed by base symbol. Samples
    /// carry their native interval and the 8h-normalized rate; adapters with
    /// per-symbol intervals fetch them on first use and cache.
    async fn fetch_funding_rates(&self) -> VenueResult<HashMap<String, FundingRateSample>>;

    /// Liquidity metrics per base symbol.
    async fn fetch_market_data(&self) -> VenueResult<HashMap<String, MarketMetrics>>;

    /// Tradable symbol metadata (tick/step/min-notional, interval override).
    async fn fetch_symbols(&self) -> VenueResult<Vec<VenueSymbol>>;

    async fn place_limit(&self, order: &LimitOrderRequest) -> VenueResult<OrderId>;

    async fn place_market(&self, symbol: &str, side: Side, qty: f64) -> VenueResult<OrderId>;

    async fn cancel(&self, order_id: &OrderId) -> VenueResult<()>;

    async fn query_order(&self, order_id: &OrderId) -> VenueResult<OrderStatus>;

    /// Subscribe to the BBO stream for one symbol. Events for one
    /// subscription arrive in order; dropping the subscription unsubscribes.
    /// After a reconnect the current BBO is re-delivered at least once.
    async fn subscribe_bbo(&self, symbol: &str) -> VenueResult<BboSubscription>;

    /// `None` when the venue reports us flat on this symbol.
    async fn fetch_position(&self, symbol: &str) -> VenueResult<Option<LivePosition>>;

    async fn fetch_account_balance(&self) -> VenueResult<AccountBalance>;

    /// Most recent settled funding payment for our position on `symbol`,
    /// if the venue exposes it.
    async fn fetch_last_funding_payment(
        &self,
        symbol: &str,
    ) -> VenueResult<Option<VenueFundingPayment>>;
}

/// The set of venue clients one strategy instance trades against.
pub type VenueSet = HashMap<VenueId, Arc<dyn VenueClient>>;
