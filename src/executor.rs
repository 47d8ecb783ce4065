//! Atomic two-leg entry.
//!
//! Either both legs end up open at the requested quantity, or no new
//! exposure remains. The rollback path re-queries fills *after* cancel
//! acknowledgement; the pre-cancel snapshot is never trusted, because fills
//! race cancels on the wire.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::db::notify::NotificationKind;
use crate::db::positions::{CreateOutcome, NewPosition};
use crate::model::{PairedPosition, VenueSymbol};
use crate::venues::{
    LimitOrderRequest, OrderId, OrderState, OrderStatus, Side, Tif, VenueClient,
};

/// Fraction of free margin an entry may consume.
const MARGIN_SAFETY_FACTOR: f64 = 0.9;
/// Entry margin assumed recoverable before liquidation (isolated margin).
const MAINT_DISTANCE_FACTOR: f64 = 0.9;
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(200);
const ROLLBACK_FILL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub long_venue: String,
    pub short_venue: String,
    pub size_usd: f64,
    pub reference_price: f64,
    pub long_rate_8h: f64,
    pub short_rate_8h: f64,
}

/// Pre-flight rejections. Nothing was sent to any venue.
#[derive(Error, Debug)]
pub enum RejectReason {
    #[error(
        "size too small: {notional_usd:.2} USD on {venue} is below min notional \
         {min_notional_usd:.2} for {symbol}"
    )]
    SizeTooSmall {
        symbol: String,
        venue: String,
        notional_usd: f64,
        min_notional_usd: f64,
    },

    #[error("insufficient margin on {venue}: need {needed_usd:.2} USD, {free_usd:.2} free")]
    InsufficientMargin {
        venue: String,
        needed_usd: f64,
        free_usd: f64,
    },

    #[error("duplicate position: {symbol} {long_venue}/{short_venue} already active")]
    DuplicatePosition {
        symbol: String,
        long_venue: String,
        short_venue: String,
    },

    #[error(
        "liquidation risk on {venue}: estimated liquidation within {distance_pct:.3} of \
         reference (buffer {buffer_pct:.3})"
    )]
    LiquidationRisk {
        venue: String,
        distance_pct: f64,
        buffer_pct: f64,
    },
}

/// What it cost to flatten the partially-opened legs.
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub reason: String,
    pub long_unwound_qty: f64,
    pub short_unwound_qty: f64,
    /// Slippage + fees, positive means money lost.
    pub cost_usd: f64,
    /// A post-cancel fill query failed, so the unwound quantities are
    /// estimates from pre-cancel observations; residual exposure must be
    /// verified by an operator.
    pub needs_review: bool,
}

#[derive(Debug)]
pub enum EntryOutcome {
    Filled(PairedPosition),
    RolledBack(RollbackReport),
    Rejected(RejectReason),
}

struct Leg {
    venue: String,
    client: Arc<dyn VenueClient>,
    symbol_meta: VenueSymbol,
    side: Side,
}

pub struct AtomicTwoLegExecutor {
    ctx: Arc<Context>,
}

impl AtomicTwoLegExecutor {
    pub fn new(ctx: Arc<Context>) -> Self {
        AtomicTwoLegExecutor { ctx }
    }

    pub async fn execute(&self, req: &EntryRequest) -> Result<EntryOutcome> {
        let long = self.leg(&req.long_venue, &req.symbol, Side::Buy).await?;
        let short = self.leg(&req.short_venue, &req.symbol, Side::Sell).await?;

        // ── Pre-flight ──────────────────────────────────────────────
        let qty = match self.preflight_size(req, &long, &short) {
            Ok(qty) => qty,
            Err(reject) => return Ok(EntryOutcome::Rejected(reject)),
        };
        if let Err(reject) = self.preflight_margin(req, qty, &long, &short).await? {
            return Ok(EntryOutcome::Rejected(reject));
        }
        if self
            .ctx
            .positions
            .active_pair(&self.ctx.account, &req.symbol, &req.long_venue, &req.short_venue)
            .await?
            .is_some()
        {
            return Ok(EntryOutcome::Rejected(RejectReason::DuplicatePosition {
                symbol: req.symbol.clone(),
                long_venue: req.long_venue.clone(),
                short_venue: req.short_venue.clone(),
            }));
        }
        if let Err(reject) = self.preflight_liquidation(&long, &short) {
            return Ok(EntryOutcome::Rejected(reject));
        }

        // ── Execution ───────────────────────────────────────────────
        let offset = self.ctx.config.max_slippage_bps / 10_000.0;
        let long_order = aggressive_limit(&long, qty, req.reference_price * (1.0 + offset));
        let short_order = aggressive_limit(&short, qty, req.reference_price * (1.0 - offset));

        info!(
            symbol = %req.symbol,
            long = %req.long_venue,
            short = %req.short_venue,
            qty,
            "placing paired entry"
        );

        let (long_placed, short_placed) = tokio::join!(
            long.client.place_limit(&long_order),
            short.client.place_limit(&short_order),
        );

        let long_id = match long_placed {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(venue = %long.venue, %err, "long leg placement failed");
                None
            }
        };
        let short_id = match short_placed {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(venue = %short.venue, %err, "short leg placement failed");
                None
            }
        };

        let (long_id, short_id) = match (long_id, short_id) {
            (Some(long_id), Some(short_id)) => (long_id, short_id),
            (long_id, short_id) => {
                let report = self
                    .rollback(
                        req,
                        &long,
                        &short,
                        qty,
                        (long_id, None),
                        (short_id, None),
                        "leg placement failed",
                    )
                    .await?;
                return Ok(EntryOutcome::RolledBack(report));
            }
        };

        // ── Fill wait ───────────────────────────────────────────────
        let min_ok = qty * (1.0 - self.ctx.config.min_fill_ratio);
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.ctx.config.entry_timeout_sec);
        let (long_status, short_status) = tokio::join!(
            wait_for_fill(&long.client, &long_id, min_ok, deadline),
            wait_for_fill(&short.client, &short_id, min_ok, deadline),
        );

        let (long_status, short_status) = match (long_status, short_status) {
            (Ok(long_status), Ok(short_status))
                if long_status.filled_qty >= min_ok && short_status.filled_qty >= min_ok =>
            {
                (long_status, short_status)
            }
            (long_status, short_status) => {
                let report = self
                    .rollback(
                        req,
                        &long,
                        &short,
                        qty,
                        (Some(long_id), long_status.ok()),
                        (Some(short_id), short_status.ok()),
                        "entry timeout or partial fill below threshold",
                    )
                    .await?;
                return Ok(EntryOutcome::RolledBack(report));
            }
        };

        // ── Persist ─────────────────────────────────────────────────
        let base_qty = long_status.filled_qty.min(short_status.filled_qty);
        let new = NewPosition {
            account: self.ctx.account.clone(),
            strategy_name: self.ctx.strategy_name.clone(),
            symbol: req.symbol.clone(),
            long_venue: req.long_venue.clone(),
            short_venue: req.short_venue.clone(),
            size_usd: req.size_usd,
            base_qty,
            entry_long_price: long_status.avg_price,
            entry_short_price: short_status.avg_price,
            entry_fees_usd: long_status.fees_usd + short_status.fees_usd,
            entry_long_rate: req.long_rate_8h,
            entry_short_rate: req.short_rate_8h,
            entry_divergence: (req.short_rate_8h - req.long_rate_8h).abs(),
            opened_at: Utc::now().timestamp(),
        };

        match self.ctx.positions.create_open(&new).await? {
            CreateOutcome::Created(position) => {
                self.ctx
                    .notifier
                    .emit(
                        &self.ctx.account,
                        NotificationKind::PositionOpened,
                        format!(
                            "opened {} {}↗/{}↘ qty {:.6} size ${:.2} divergence {:.4}%",
                            position.symbol,
                            position.long_venue,
                            position.short_venue,
                            position.base_qty,
                            position.size_usd,
                            position.entry_divergence * 100.0
                        ),
                    )
                    .await?;
                info!(position = position.id, "paired entry filled");
                Ok(EntryOutcome::Filled(position))
            }
            CreateOutcome::Duplicate(_) => {
                // A concurrent entry beat us to the row. Our legs are fresh
                // double exposure on top of the recorded pair: flatten them.
                warn!(symbol = %req.symbol, "duplicate detected at persist, unwinding fresh legs");
                let report = self
                    .rollback(
                        req,
                        &long,
                        &short,
                        qty,
                        (Some(long_id), Some(long_status.clone())),
                        (Some(short_id), Some(short_status.clone())),
                        "duplicate position detected at persist",
                    )
                    .await?;
                Ok(EntryOutcome::RolledBack(report))
            }
        }
    }

    // ── Pre-flight pieces ───────────────────────────────────────────

    fn preflight_size(
        &self,
        req: &EntryRequest,
        long: &Leg,
        short: &Leg,
    ) -> Result<f64, RejectReason> {
        let raw_qty = req.size_usd / req.reference_price;
        // Round down on the coarser grid so both venues accept the quantity.
        let qty = short
            .symbol_meta
            .round_qty_down(long.symbol_meta.round_qty_down(raw_qty));
        for leg in [long, short] {
            let notional = qty * req.reference_price;
            if qty <= 0.0 || notional < leg.symbol_meta.min_notional_usd {
                return Err(RejectReason::SizeTooSmall {
                    symbol: req.symbol.clone(),
                    venue: leg.venue.clone(),
                    notional_usd: notional,
                    min_notional_usd: leg.symbol_meta.min_notional_usd,
                });
            }
        }
        Ok(qty)
    }

    async fn preflight_margin(
        &self,
        req: &EntryRequest,
        qty: f64,
        long: &Leg,
        short: &Leg,
    ) -> Result<Result<(), RejectReason>> {
        let (long_balance, short_balance) = tokio::join!(
            long.client.fetch_account_balance(),
            short.client.fetch_account_balance(),
        );
        for (leg, balance) in [(long, long_balance), (short, short_balance)] {
            let balance = balance
                .with_context(|| format!("fetching balance on {}", leg.venue))?;
            let needed = qty * req.reference_price / self.ctx.config.leverage_for(&leg.venue);
            if needed > balance.free_margin_usd * MARGIN_SAFETY_FACTOR {
                let reject = RejectReason::InsufficientMargin {
                    venue: leg.venue.clone(),
                    needed_usd: needed,
                    free_usd: balance.free_margin_usd,
                };
                self.ctx
                    .notifier
                    .emit(
                        &self.ctx.account,
                        NotificationKind::InsufficientMargin,
                        format!("{reject}: {} size ${:.2}", req.symbol, req.size_usd),
                    )
                    .await?;
                return Ok(Err(reject));
            }
        }
        Ok(Ok(()))
    }

    fn preflight_liquidation(&self, long: &Leg, short: &Leg) -> Result<(), RejectReason> {
        let buffer = self.ctx.config.liquidation_buffer_pct;
        for leg in [long, short] {
            let leverage = self.ctx.config.leverage_for(&leg.venue);
            // Worst-case adverse move before liquidation at this leverage.
            let distance_pct = MAINT_DISTANCE_FACTOR / leverage;
            if distance_pct <= buffer {
                return Err(RejectReason::LiquidationRisk {
                    venue: leg.venue.clone(),
                    distance_pct,
                    buffer_pct: buffer,
                });
            }
        }
        Ok(())
    }

    // ── Rollback ────────────────────────────────────────────────────

    /// Flatten whatever actually filled. The post-cancel re-query is the
    /// invariant that prevents a naked directional leg; each order travels
    /// with the last status observed before the cancel so a failed re-query
    /// never collapses to "nothing filled".
    async fn rollback(
        &self,
        req: &EntryRequest,
        long: &Leg,
        short: &Leg,
        qty: f64,
        long_order: (Option<OrderId>, Option<OrderStatus>),
        short_order: (Option<OrderId>, Option<OrderStatus>),
        reason: &str,
    ) -> Result<RollbackReport> {
        warn!(symbol = %req.symbol, reason, "rolling back entry");
        let (long_id, long_observed) = long_order;
        let (short_id, short_observed) = short_order;

        // 1. Cancel both orders.
        for (leg, id) in [(long, &long_id), (short, &short_id)] {
            if let Some(id) = id {
                if let Err(err) = leg.client.cancel(id).await {
                    warn!(venue = %leg.venue, %err, "cancel failed during rollback");
                }
            }
        }

        // 2. Re-query actual fills after the cancels acknowledged.
        let (long_status, long_degraded) =
            query_after_cancel(&long.client, &long_id, long_observed, qty, req.reference_price)
                .await;
        let (short_status, short_degraded) = query_after_cancel(
            &short.client,
            &short_id,
            short_observed,
            qty,
            req.reference_price,
        )
        .await;
        let needs_review = long_degraded || short_degraded;

        // 3. Flatten each leg at its actual post-cancel quantity.
        let mut cost_usd = long_status.fees_usd + short_status.fees_usd;
        let mut unwound = [0.0f64; 2];
        for (i, (leg, status)) in [(long, &long_status), (short, &short_status)]
            .into_iter()
            .enumerate()
        {
            if status.filled_qty <= 0.0 {
                continue;
            }
            let exit = flatten_leg(&leg.client, &leg.symbol_meta, leg.side, status.filled_qty)
                .await
                .with_context(|| {
                    format!("rollback could not flatten {} leg on {}", leg.side.as_str(), leg.venue)
                })?;
            unwound[i] = status.filled_qty;
            cost_usd += exit.fees_usd;
            // Long leg: bought at entry, sold at exit. Short leg: mirrored.
            let price_loss = match leg.side {
                Side::Buy => (status.avg_price - exit.avg_price) * status.filled_qty,
                Side::Sell => (exit.avg_price - status.avg_price) * status.filled_qty,
            };
            cost_usd += price_loss;
        }

        let report = RollbackReport {
            reason: reason.to_string(),
            long_unwound_qty: unwound[0],
            short_unwound_qty: unwound[1],
            cost_usd,
            needs_review,
        };
        let mut detail = format!(
            "{} {}/{}: {} (unwound long {:.6}, short {:.6}, cost ${:.2})",
            req.symbol,
            req.long_venue,
            req.short_venue,
            report.reason,
            report.long_unwound_qty,
            report.short_unwound_qty,
            report.cost_usd
        );
        if needs_review {
            detail.push_str("; post-cancel fill query failed, verify residual exposure");
            error!(
                symbol = %req.symbol,
                "rollback flattened estimated quantities, operator review required"
            );
        }
        self.ctx
            .runs
            .audit(&self.ctx.account, "entry_rollback", &detail)
            .await?;
        info!(cost_usd = report.cost_usd, needs_review, "rollback complete");
        Ok(report)
    }

    async fn leg(&self, venue: &str, symbol: &str, side: Side) -> Result<Leg> {
        let client = self
            .ctx
            .venue(venue)
            .with_context(|| format!("venue '{venue}' not configured"))?
            .clone();
        let symbol_meta = self.resolve_symbol(&client, venue, symbol).await?;
        Ok(Leg {
            venue: venue.to_string(),
            client,
            symbol_meta,
            side,
        })
    }

    async fn resolve_symbol(
        &self,
        client: &Arc<dyn VenueClient>,
        venue: &str,
        symbol: &str,
    ) -> Result<VenueSymbol> {
        if let Some(meta) = self.ctx.rates.venue_symbol(venue, symbol).await? {
            return Ok(meta);
        }
        let fetched = client
            .fetch_symbols()
            .await
            .with_context(|| format!("fetching symbols from {venue}"))?;
        let meta = fetched
            .into_iter()
            .find(|s| s.symbol == symbol)
            .with_context(|| format!("symbol '{symbol}' not listed on {venue}"))?;
        self.ctx.rates.upsert_venue_symbol(&meta).await?;
        Ok(meta)
    }
}

fn aggressive_limit(leg: &Leg, qty: f64, price: f64) -> LimitOrderRequest {
    LimitOrderRequest {
        symbol: leg.symbol_meta.symbol.clone(),
        side: leg.side,
        qty,
        price: leg.symbol_meta.round_price(price),
        tif: Tif::Ioc,
        post_only: false,
        client_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// Poll an order until it reaches `target_qty`, goes terminal, or the
/// deadline passes. Returns the last observed status.
async fn wait_for_fill(
    client: &Arc<dyn VenueClient>,
    order_id: &OrderId,
    target_qty: f64,
    deadline: Instant,
) -> Result<OrderStatus> {
    loop {
        let status = client
            .query_order(order_id)
            .await
            .with_context(|| format!("querying order {order_id}"))?;
        if status.filled_qty >= target_qty || status.state.is_terminal() {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            return Ok(status);
        }
        tokio::time::sleep(FILL_POLL_INTERVAL).await;
    }
}

/// Post-cancel fill query. A failed query is never zero fill: fall back to
/// the last pre-cancel observation, or the full requested quantity when the
/// order was never observed, and flag the rollback for operator review. The
/// second value reports that degradation.
async fn query_after_cancel(
    client: &Arc<dyn VenueClient>,
    order_id: &Option<OrderId>,
    observed: Option<OrderStatus>,
    requested_qty: f64,
    reference_price: f64,
) -> (OrderStatus, bool) {
    let Some(id) = order_id else {
        // Never placed: there is genuinely nothing to flatten.
        return (
            OrderStatus {
                state: OrderState::Canceled,
                filled_qty: 0.0,
                avg_price: 0.0,
                fees_usd: 0.0,
                trade_ids: Vec::new(),
            },
            false,
        );
    };
    match client.query_order(id).await {
        Ok(status) => (status, false),
        Err(err) => {
            error!(order = %id, %err, "post-cancel query failed, flattening last observed quantity");
            let fallback = observed.unwrap_or(OrderStatus {
                state: OrderState::Canceled,
                filled_qty: requested_qty,
                avg_price: reference_price,
                fees_usd: 0.0,
                trade_ids: Vec::new(),
            });
            (fallback, true)
        }
    }
}

struct LegExit {
    avg_price: f64,
    fees_usd: f64,
}

/// Close `qty` of one leg with a market order and wait for the fill.
async fn flatten_leg(
    client: &Arc<dyn VenueClient>,
    symbol_meta: &VenueSymbol,
    entry_side: Side,
    qty: f64,
) -> Result<LegExit> {
    let exit_side = entry_side.opposite();
    let order_id = client
        .place_market(&symbol_meta.symbol, exit_side, qty)
        .await
        .with_context(|| format!("placing rollback market order on {}", symbol_meta.venue))?;
    let deadline = Instant::now() + ROLLBACK_FILL_TIMEOUT;
    let status = wait_for_fill(client, &order_id, qty * 0.999, deadline).await?;
    if status.filled_qty < qty * 0.999 {
        bail!(
            "rollback order {} on {} filled {:.8} of {:.8}",
            order_id,
            symbol_meta.venue,
            status.filled_qty,
            qty
        );
    }
    Ok(LegExit {
        avg_price: status.avg_price,
        fees_usd: status.fees_usd,
    })
}
