//! Single-entry closing path.
//!
//! A process-local set gates every close: whichever caller (polling
//! monitor, real-time monitor, user command) inserts the position id first
//! performs the external close; everyone else returns immediately. The
//! guard releases on drop, so no error path can leak an entry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::db::notify::NotificationKind;
use crate::model::{ExitReason, PairedPosition, PositionStatus, VenueSymbol};
use crate::venues::{LimitOrderRequest, Side, Tif, VenueClient};

const CLOSE_RETRY_PAUSE: Duration = Duration::from_millis(500);
const MARKET_FILL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum CloseOutcome {
    Closed { realized_pnl_usd: f64 },
    /// Another caller holds the close lock; nothing was done.
    AlreadyClosing,
    /// One leg flattened, the other did not. Position left in `error` for
    /// manual resolution.
    Stuck { detail: String },
}

pub struct PositionCloser {
    ctx: Arc<Context>,
    closing: Mutex<HashSet<i64>>,
}

struct ClosingGuard<'a> {
    set: &'a Mutex<HashSet<i64>>,
    id: i64,
}

impl Drop for ClosingGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

impl PositionCloser {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(PositionCloser {
            ctx,
            closing: Mutex::new(HashSet::new()),
        })
    }

    /// Whether a close is currently in flight for this id.
    pub fn is_closing(&self, position_id: i64) -> bool {
        self.closing.lock().unwrap().contains(&position_id)
    }

    pub async fn close(&self, position_id: i64, reason: ExitReason) -> Result<CloseOutcome> {
        if !self.closing.lock().unwrap().insert(position_id) {
            return Ok(CloseOutcome::AlreadyClosing);
        }
        let _guard = ClosingGuard {
            set: &self.closing,
            id: position_id,
        };
        self.close_locked(position_id, reason).await
    }

    async fn close_locked(&self, position_id: i64, reason: ExitReason) -> Result<CloseOutcome> {
        let position = self
            .ctx
            .positions
            .get(position_id)
            .await?
            .with_context(|| format!("position {position_id} not found"))?;

        // Re-closing is a no-op returning the stored result.
        if position.status == PositionStatus::Closed {
            return Ok(CloseOutcome::Closed {
                realized_pnl_usd: position.realized_pnl_usd.unwrap_or(0.0),
            });
        }
        if position.status == PositionStatus::Error {
            return Ok(CloseOutcome::Stuck {
                detail: "position already in error state".into(),
            });
        }

        self.ctx.positions.mark_pending_close(position_id).await?;

        let long_client = self
            .ctx
            .venue(&position.long_venue)
            .with_context(|| format!("venue '{}' not configured", position.long_venue))?
            .clone();
        let short_client = self
            .ctx
            .venue(&position.short_venue)
            .with_context(|| format!("venue '{}' not configured", position.short_venue))?
            .clone();
        let long_meta = self.symbol_meta(&position.long_venue, &position.symbol).await?;
        let short_meta = self.symbol_meta(&position.short_venue, &position.symbol).await?;

        // Close the quantities the venues actually report, not the recorded
        // ones; a liquidated or imbalanced leg closes at what remains. A
        // fetch *error* is not "flat" — fall back to the recorded quantity
        // and let the failed close surface as Stuck.
        let (long_live, short_live) = tokio::join!(
            long_client.fetch_position(&position.symbol),
            short_client.fetch_position(&position.symbol),
        );
        let live_qty = |live: crate::venues::VenueResult<Option<crate::venues::LivePosition>>,
                        venue: &str| match live {
            Ok(leg) => leg.map(|p| p.qty).unwrap_or(0.0),
            Err(err) => {
                warn!(position = position_id, venue, %err, "leg query failed, closing recorded qty");
                position.base_qty
            }
        };
        let long_qty = live_qty(long_live, &position.long_venue);
        let short_qty = live_qty(short_live, &position.short_venue);

        let urgent = reason.is_urgent();
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.ctx.config.close_timeout_sec);

        info!(
            position = position_id,
            reason = reason.as_str(),
            urgent,
            long_qty,
            short_qty,
            "closing paired position"
        );

        let (long_exit, short_exit) = tokio::join!(
            close_leg(
                &long_client,
                &long_meta,
                Side::Buy,
                long_qty,
                urgent,
                deadline,
                self.ctx.config.max_slippage_bps,
            ),
            close_leg(
                &short_client,
                &short_meta,
                Side::Sell,
                short_qty,
                urgent,
                deadline,
                self.ctx.config.max_slippage_bps,
            ),
        );

        match (long_exit, short_exit) {
            (Ok(long_exit), Ok(short_exit)) => {
                let realized = realized_pnl(&position, &long_exit, &short_exit);
                let closed = self
                    .ctx
                    .positions
                    .close(position_id, reason, realized, Utc::now().timestamp())
                    .await?;
                self.ctx
                    .notifier
                    .emit(
                        &self.ctx.account,
                        NotificationKind::PositionClosed,
                        format!(
                            "closed {} {}/{} ({}): realized ${:.2} (funding ${:.2})",
                            closed.symbol,
                            closed.long_venue,
                            closed.short_venue,
                            reason.as_str(),
                            realized,
                            closed.cumulative_funding_usd
                        ),
                    )
                    .await?;
                info!(position = position_id, realized, "position closed");
                Ok(CloseOutcome::Closed {
                    realized_pnl_usd: realized,
                })
            }
            (long_result, short_result) => {
                let detail = format!(
                    "long leg: {}; short leg: {}",
                    describe(&long_result),
                    describe(&short_result)
                );
                error!(position = position_id, detail, "close left a residual leg");
                self.ctx.positions.mark_error(position_id).await?;
                self.ctx
                    .runs
                    .audit(
                        &self.ctx.account,
                        "close_stuck",
                        &format!("position {position_id}: {detail}"),
                    )
                    .await?;
                Ok(CloseOutcome::Stuck { detail })
            }
        }
    }

    async fn symbol_meta(&self, venue: &str, symbol: &str) -> Result<VenueSymbol> {
        self.ctx
            .rates
            .venue_symbol(venue, symbol)
            .await?
            .with_context(|| format!("no symbol metadata for {symbol} on {venue}"))
    }
}

fn describe(result: &Result<LegExit>) -> String {
    match result {
        Ok(exit) => format!("closed {:.8} @ {:.4}", exit.qty, exit.avg_price),
        Err(err) => format!("failed: {err:#}"),
    }
}

/// `fills + funding − fees`, per the position's recorded entries.
fn realized_pnl(position: &PairedPosition, long_exit: &LegExit, short_exit: &LegExit) -> f64 {
    let long_pnl = (long_exit.avg_price - position.entry_long_price) * long_exit.qty;
    let short_pnl = (position.entry_short_price - short_exit.avg_price) * short_exit.qty;
    long_pnl + short_pnl + position.cumulative_funding_usd
        - position.entry_fees_usd
        - long_exit.fees_usd
        - short_exit.fees_usd
}

#[derive(Debug, Default)]
pub struct LegExit {
    pub qty: f64,
    pub avg_price: f64,
    pub fees_usd: f64,
}

/// Flatten one leg. Critical reasons go straight to market; otherwise a
/// bounded aggressive-limit loop re-prices until `deadline`, then escalates
/// to market for the remainder.
async fn close_leg(
    client: &Arc<dyn VenueClient>,
    symbol_meta: &VenueSymbol,
    entry_side: Side,
    qty: f64,
    urgent: bool,
    deadline: Instant,
    max_slippage_bps: f64,
) -> Result<LegExit> {
    if qty <= 0.0 {
        return Ok(LegExit::default());
    }
    let exit_side = entry_side.opposite();
    let mut exit = LegExit::default();
    let mut remaining = qty;

    if !urgent {
        let offset = max_slippage_bps / 10_000.0;
        while remaining > qty * 1e-6 && Instant::now() < deadline {
            let bbo = match client.fetch_bbo(&symbol_meta.symbol).await {
                Ok(bbo) => bbo,
                Err(err) => {
                    warn!(venue = %symbol_meta.venue, %err, "no quote for close, escalating");
                    break;
                }
            };
            let price = match exit_side {
                Side::Sell => bbo.bid * (1.0 - offset),
                Side::Buy => bbo.ask * (1.0 + offset),
            };
            let order = LimitOrderRequest {
                symbol: symbol_meta.symbol.clone(),
                side: exit_side,
                qty: remaining,
                price: symbol_meta.round_price(price),
                tif: Tif::Ioc,
                post_only: false,
                client_id: uuid::Uuid::new_v4().to_string(),
            };
            let order_id = match client.place_limit(&order).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(venue = %symbol_meta.venue, %err, "close order failed, re-pricing");
                    tokio::time::sleep(CLOSE_RETRY_PAUSE).await;
                    continue;
                }
            };
            let status = client.query_order(&order_id).await?;
            if status.filled_qty > 0.0 {
                accumulate(&mut exit, status.filled_qty, status.avg_price, status.fees_usd);
                remaining -= status.filled_qty;
            }
            if remaining > qty * 1e-6 {
                tokio::time::sleep(CLOSE_RETRY_PAUSE).await;
            }
        }
    }

    // Market path: urgency, quote loss, or limit loop expiry.
    if remaining > qty * 1e-6 {
        let order_id = client
            .place_market(&symbol_meta.symbol, exit_side, remaining)
            .await
            .with_context(|| format!("market close on {}", symbol_meta.venue))?;
        let fill_deadline = Instant::now() + MARKET_FILL_TIMEOUT;
        loop {
            let status = client.query_order(&order_id).await?;
            if status.filled_qty >= remaining * 0.999 || status.state.is_terminal() {
                if status.filled_qty < remaining * 0.999 {
                    anyhow::bail!(
                        "market close on {} filled {:.8} of {:.8}",
                        symbol_meta.venue,
                        status.filled_qty,
                        remaining
                    );
                }
                accumulate(&mut exit, status.filled_qty, status.avg_price, status.fees_usd);
                break;
            }
            if Instant::now() >= fill_deadline {
                anyhow::bail!("market close on {} did not fill in time", symbol_meta.venue);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    Ok(exit)
}

fn accumulate(exit: &mut LegExit, qty: f64, price: f64, fees: f64) {
    let total = exit.qty + qty;
    if total > 0.0 {
        exit.avg_price = (exit.avg_price * exit.qty + price * qty) / total;
    }
    exit.qty = total;
    exit.fees_usd += fees;
}
