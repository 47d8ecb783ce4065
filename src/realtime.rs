//! Event-driven profit taking.
//!
//! One task per open position owns the BBO subscriptions for both legs and
//! re-evaluates profit on every quote, throttled per position. The closer's
//! single-close set keeps this path and the polling monitor from ever
//! closing the same position twice.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::closer::{CloseOutcome, PositionCloser};
use crate::context::Context;
use crate::model::{ExitReason, PairedPosition};
use crate::monitor::SnapshotCache;
use crate::venues::Bbo;

/// Fresh-BBO profit evaluation; falls back to the snapshot's unrealized PnL
/// when one leg's quote is missing. Returns true when it closed the
/// position.
pub async fn evaluate_profit_and_close(
    ctx: &Arc<Context>,
    closer: &Arc<PositionCloser>,
    position: &PairedPosition,
    long_bbo: Option<Bbo>,
    short_bbo: Option<Bbo>,
    fallback_upnl: Option<f64>,
) -> Result<bool> {
    if !ctx.config.enable_immediate_profit_taking || closer.is_closing(position.id) {
        return Ok(false);
    }

    let price_pnl = match (long_bbo, short_bbo) {
        (Some(long), Some(short)) => {
            // Long closes into the bid, short closes into the ask.
            let pnl_long = (long.bid - position.entry_long_price) * position.base_qty;
            let pnl_short = (position.entry_short_price - short.ask) * position.base_qty;
            pnl_long + pnl_short
        }
        _ => match fallback_upnl {
            Some(upnl) => upnl,
            None => return Ok(false),
        },
    };

    let total =
        price_pnl + position.cumulative_funding_usd - position.entry_fees_usd;
    let profit_pct = if position.size_usd > 0.0 {
        total / position.size_usd
    } else {
        0.0
    };

    if profit_pct < ctx.config.min_immediate_profit_taking_pct {
        return Ok(false);
    }

    info!(
        position = position.id,
        profit_pct = profit_pct * 100.0,
        total_usd = total,
        "profit target hit"
    );
    match closer.close(position.id, ExitReason::ProfitTarget).await? {
        CloseOutcome::Closed { .. } => Ok(true),
        CloseOutcome::AlreadyClosing => Ok(false),
        CloseOutcome::Stuck { detail } => {
            warn!(position = position.id, detail, "profit close got stuck");
            Ok(true)
        }
    }
}

pub struct RealTimeProfitMonitor {
    ctx: Arc<Context>,
    closer: Arc<PositionCloser>,
    cache: SnapshotCache,
    shutdown: watch::Receiver<bool>,
}

impl RealTimeProfitMonitor {
    pub fn new(
        ctx: Arc<Context>,
        closer: Arc<PositionCloser>,
        cache: SnapshotCache,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        RealTimeProfitMonitor {
            ctx,
            closer,
            cache,
            shutdown,
        }
    }

    /// Spawn the watcher task for one open position. The task ends (and
    /// unsubscribes by dropping its streams) when the position leaves the
    /// active set or shutdown is signalled.
    pub fn spawn_for_position(&self, position: &PairedPosition) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        let closer = self.closer.clone();
        let cache = self.cache.clone();
        let shutdown = self.shutdown.clone();
        let position_id = position.id;
        tokio::spawn(async move {
            if let Err(err) = watch_position(ctx, closer, cache, shutdown, position_id).await {
                warn!(position = position_id, %err, "realtime watcher exited with error");
            }
        })
    }
}

async fn watch_position(
    ctx: Arc<Context>,
    closer: Arc<PositionCloser>,
    cache: SnapshotCache,
    mut shutdown: watch::Receiver<bool>,
    position_id: i64,
) -> Result<()> {
    let Some(position) = ctx.positions.get(position_id).await? else {
        return Ok(());
    };
    if !position.is_active() {
        return Ok(());
    }

    let long_client = match ctx.venue(&position.long_venue) {
        Some(client) => client.clone(),
        None => return Ok(()),
    };
    let short_client = match ctx.venue(&position.short_venue) {
        Some(client) => client.clone(),
        None => return Ok(()),
    };

    let mut long_sub = long_client.subscribe_bbo(&position.symbol).await?;
    let mut short_sub = short_client.subscribe_bbo(&position.symbol).await?;
    debug!(position = position_id, "realtime watcher subscribed");

    let throttle = Duration::from_secs_f64(ctx.config.realtime_profit_check_interval_sec);
    let mut last_eval = Instant::now() - throttle;
    let mut last_long: Option<Bbo> = None;
    let mut last_short: Option<Bbo> = None;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(position = position_id, "realtime watcher stopping");
                    return Ok(());
                }
            }
            quote = long_sub.recv() => {
                match quote {
                    Some(bbo) => last_long = Some(bbo),
                    None => return Ok(()),
                }
            }
            quote = short_sub.recv() => {
                match quote {
                    Some(bbo) => last_short = Some(bbo),
                    None => return Ok(()),
                }
            }
        }

        if last_eval.elapsed() < throttle {
            continue;
        }
        last_eval = Instant::now();

        // Quotes queue up during the throttle window; evaluate on the
        // freshest one from each leg.
        if let Some(bbo) = long_sub.latest() {
            last_long = Some(bbo);
        }
        if let Some(bbo) = short_sub.latest() {
            last_short = Some(bbo);
        }

        // Re-read the row: cumulative funding moves, and the position may
        // have been closed by the polling loop.
        let Some(position) = ctx.positions.get(position_id).await? else {
            return Ok(());
        };
        if !position.is_active() {
            return Ok(());
        }

        // Snapshot fallback only matters when one BBO side is missing; a
        // stale snapshot forces a refetch rather than deciding on old data.
        let fallback_upnl = if last_long.is_none() || last_short.is_none() {
            match cache.get_fresh(position_id).await {
                Some(snapshot) => Some(snapshot.unrealized_pnl_usd),
                None => refetch_unrealized(&ctx, &position).await,
            }
        } else {
            None
        };

        let closed = evaluate_profit_and_close(
            &ctx,
            &closer,
            &position,
            last_long,
            last_short,
            fallback_upnl,
        )
        .await?;
        if closed {
            cache.remove(position_id).await;
            return Ok(());
        }
    }
}

async fn refetch_unrealized(ctx: &Arc<Context>, position: &PairedPosition) -> Option<f64> {
    let long_client = ctx.venue(&position.long_venue)?;
    let short_client = ctx.venue(&position.short_venue)?;
    let (long, short) = tokio::join!(
        long_client.fetch_position(&position.symbol),
        short_client.fetch_position(&position.symbol),
    );
    let long = long.ok()??;
    let short = short.ok()??;
    Some(long.unrealized_pnl + short.unrealized_pnl)
}
