use serde::{Deserialize, Serialize};

use super::venue::VenueId;

/// Lifecycle of a paired position. Transitions are monotonic:
/// `Open → PendingClose → Closed`, with `Error` reserved for a close that
/// left a residual leg needing manual resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PendingClose,
    Closed,
    Error,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::PendingClose => "pending_close",
            PositionStatus::Closed => "closed",
            PositionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "pending_close" => Some(PositionStatus::PendingClose),
            "closed" => Some(PositionStatus::Closed),
            "error" => Some(PositionStatus::Error),
            _ => None,
        }
    }
}

/// Why a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    FundingFlip,
    ProfitErosion,
    TimeLimit,
    LiquidationRisk,
    Liquidated,
    LegImbalance,
    UserRequest,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::FundingFlip => "funding_flip",
            ExitReason::ProfitErosion => "profit_erosion",
            ExitReason::TimeLimit => "time_limit",
            ExitReason::LiquidationRisk => "liquidation_risk",
            ExitReason::Liquidated => "liquidated",
            ExitReason::LegImbalance => "leg_imbalance",
            ExitReason::UserRequest => "user_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "profit_target" => Some(ExitReason::ProfitTarget),
            "funding_flip" => Some(ExitReason::FundingFlip),
            "profit_erosion" => Some(ExitReason::ProfitErosion),
            "time_limit" => Some(ExitReason::TimeLimit),
            "liquidation_risk" => Some(ExitReason::LiquidationRisk),
            "liquidated" => Some(ExitReason::Liquidated),
            "leg_imbalance" => Some(ExitReason::LegImbalance),
            "user_request" => Some(ExitReason::UserRequest),
            _ => None,
        }
    }

    /// Critical reasons close with market orders on both legs.
    pub fn is_urgent(&self) -> bool {
        matches!(
            self,
            ExitReason::LiquidationRisk | ExitReason::Liquidated | ExitReason::LegImbalance
        )
    }
}

/// A matched long+short pair on two venues, treated as one logical position.
///
/// Both legs carry the same base-asset quantity at rest; `base_qty` is the
/// quantity each leg was filled at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedPosition {
    pub id: i64,
    pub account: String,
    pub strategy_name: String,
    pub symbol: String,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub size_usd: f64,
    pub base_qty: f64,
    pub entry_long_price: f64,
    pub entry_short_price: f64,
    pub entry_fees_usd: f64,
    pub entry_long_rate: f64,
    pub entry_short_rate: f64,
    pub entry_divergence: f64,
    pub opened_at: i64,
    pub status: PositionStatus,
    pub cumulative_funding_usd: f64,
    pub funding_payments_count: i64,
    pub closed_at: Option<i64>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl_usd: Option<f64>,
}

impl PairedPosition {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            PositionStatus::Open | PositionStatus::PendingClose
        )
    }
}

/// One funding settlement observed for a paired position.
/// `net_payment = long_payment + short_payment`, signed so positive is profit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub position_id: i64,
    pub payment_time: i64,
    pub long_payment: f64,
    pub short_payment: f64,
    pub net_payment: f64,
    pub long_rate: f64,
    pub short_rate: f64,
    pub divergence: f64,
}
