//! Polling risk loop.
//!
//! One tick per `monitor_interval` per open position, with a strict
//! evaluation order: liquidation risk, already-liquidated reconciliation,
//! leg imbalance, profit pre-check, then the slower risk exits. Snapshots
//! are cached for the real-time monitor to reuse within one interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::closer::PositionCloser;
use crate::context::Context;
use crate::db::notify::NotificationKind;
use crate::model::{ExitReason, PairedPosition};
use crate::realtime;
use crate::venues::LivePosition;

/// Live view of one paired position, shared between the polling loop, the
/// real-time monitor, and the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub position_id: i64,
    pub long: Option<LivePosition>,
    pub short: Option<LivePosition>,
    /// Signed: rate(short venue) − rate(long venue), 8h basis.
    pub current_divergence: Option<f64>,
    pub unrealized_pnl_usd: f64,
    pub taken_at: i64,
}

struct CachedSnapshot {
    snapshot: PositionSnapshot,
    taken: Instant,
}

/// Snapshot cache with TTL = monitor interval.
#[derive(Clone)]
pub struct SnapshotCache {
    ttl: Duration,
    inner: Arc<RwLock<HashMap<i64, CachedSnapshot>>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        SnapshotCache {
            ttl,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn put(&self, snapshot: PositionSnapshot) {
        self.inner.write().await.insert(
            snapshot.position_id,
            CachedSnapshot {
                snapshot,
                taken: Instant::now(),
            },
        );
    }

    /// Fresh snapshot or nothing; stale entries are not returned.
    pub async fn get_fresh(&self, position_id: i64) -> Option<PositionSnapshot> {
        let inner = self.inner.read().await;
        let cached = inner.get(&position_id)?;
        if cached.taken.elapsed() > self.ttl {
            return None;
        }
        Some(cached.snapshot.clone())
    }

    pub async fn remove(&self, position_id: i64) {
        self.inner.write().await.remove(&position_id);
    }

    pub async fn all_fresh(&self) -> Vec<PositionSnapshot> {
        let inner = self.inner.read().await;
        inner
            .values()
            .filter(|c| c.taken.elapsed() <= self.ttl)
            .map(|c| c.snapshot.clone())
            .collect()
    }
}

pub struct PositionMonitor {
    ctx: Arc<Context>,
    closer: Arc<PositionCloser>,
    cache: SnapshotCache,
    /// When set, every open position is wound down (user pause).
    pause: Arc<AtomicBool>,
    /// Trailing high-watermark of total PnL per position.
    watermarks: RwLock<HashMap<i64, f64>>,
}

impl PositionMonitor {
    pub fn new(ctx: Arc<Context>, closer: Arc<PositionCloser>, cache: SnapshotCache) -> Self {
        PositionMonitor {
            ctx,
            closer,
            cache,
            pause: Arc::new(AtomicBool::new(false)),
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.pause.clone()
    }

    /// One pass over every open position. Driven by the strategy's manage
    /// cadence.
    pub async fn tick(&self) -> Result<()> {
        let positions = self.ctx.positions.list_open(&self.ctx.account).await?;
        for position in positions {
            if self.closer.is_closing(position.id) {
                continue;
            }
            if let Err(err) = self.evaluate(&position).await {
                warn!(position = position.id, %err, "position evaluation failed");
            }
        }
        Ok(())
    }

    /// One position, one pass, in the mandated order.
    pub async fn evaluate(&self, position: &PairedPosition) -> Result<()> {
        let snapshot = self.refresh_snapshot(position).await?;

        // 1. Liquidation risk: either leg's mark within the buffer.
        if let Some(venue) = self.liquidation_risk(&snapshot, position) {
            self.ctx
                .notifier
                .emit(
                    &self.ctx.account,
                    NotificationKind::LiquidationRisk,
                    format!(
                        "position {} ({}): {} leg near liquidation",
                        position.id, position.symbol, venue
                    ),
                )
                .await?;
            self.close(position, ExitReason::LiquidationRisk).await?;
            return Ok(());
        }

        // 2. Already liquidated: a leg the venue no longer reports (or
        // reports at a sliver of the recorded size) while the other stands.
        if self.is_liquidated(&snapshot, position) {
            warn!(position = position.id, "leg liquidated, force-closing survivor");
            self.close(position, ExitReason::Liquidated).await?;
            return Ok(());
        }

        // 3. Leg imbalance beyond step tolerance.
        if self.leg_imbalance(&snapshot, position).await? {
            self.close(position, ExitReason::LegImbalance).await?;
            return Ok(());
        }

        // 4. Profit-taking pre-check; skips the rest when it closes.
        if self.profit_precheck(position, &snapshot).await? {
            return Ok(());
        }

        // 5. Risk-based exits.
        if let Some(divergence) = snapshot.current_divergence {
            if divergence < self.ctx.config.funding_flip_threshold_pct {
                info!(position = position.id, divergence, "funding flip");
                self.close(position, ExitReason::FundingFlip).await?;
                return Ok(());
            }
        }
        if self.profit_erosion(position, &snapshot).await {
            self.close(position, ExitReason::ProfitErosion).await?;
            return Ok(());
        }
        if let Some(limit_hours) = self.ctx.config.hard_time_limit_hours {
            let age_hours = (Utc::now().timestamp() - position.opened_at) as f64 / 3600.0;
            if age_hours >= limit_hours {
                self.close(position, ExitReason::TimeLimit).await?;
                return Ok(());
            }
        }
        if self.pause.load(Ordering::Relaxed) {
            self.close(position, ExitReason::UserRequest).await?;
        }
        Ok(())
    }

    /// Fetch both legs in parallel and publish the snapshot.
    ///
    /// A venue fetch *error* aborts the evaluation for this tick — `None`
    /// in the snapshot always means the venue affirmatively reported us
    /// flat, so the liquidation reconciliation below can trust it.
    pub async fn refresh_snapshot(&self, position: &PairedPosition) -> Result<PositionSnapshot> {
        let long_client = self
            .ctx
            .venue(&position.long_venue)
            .with_context(|| format!("venue '{}' not configured", position.long_venue))?;
        let short_client = self
            .ctx
            .venue(&position.short_venue)
            .with_context(|| format!("venue '{}' not configured", position.short_venue))?;

        let (long, short) = tokio::join!(
            long_client.fetch_position(&position.symbol),
            short_client.fetch_position(&position.symbol),
        );
        let long = long.with_context(|| format!("long leg fetch on {}", position.long_venue))?;
        let short =
            short.with_context(|| format!("short leg fetch on {}", position.short_venue))?;

        let long_rate = self
            .ctx
            .rates
            .latest_rate(&position.long_venue, &position.symbol)
            .await?;
        let short_rate = self
            .ctx
            .rates
            .latest_rate(&position.short_venue, &position.symbol)
            .await?;
        let current_divergence = match (&long_rate, &short_rate) {
            (Some(l), Some(s)) => Some(s.rate_8h - l.rate_8h),
            _ => None,
        };

        let unrealized = long.as_ref().map(|p| p.unrealized_pnl).unwrap_or(0.0)
            + short.as_ref().map(|p| p.unrealized_pnl).unwrap_or(0.0);

        let snapshot = PositionSnapshot {
            position_id: position.id,
            long,
            short,
            current_divergence,
            unrealized_pnl_usd: unrealized,
            taken_at: Utc::now().timestamp(),
        };
        self.cache.put(snapshot.clone()).await;
        Ok(snapshot)
    }

    fn liquidation_risk(
        &self,
        snapshot: &PositionSnapshot,
        position: &PairedPosition,
    ) -> Option<String> {
        let buffer = self.ctx.config.liquidation_buffer_pct;
        for (leg, venue) in [
            (&snapshot.long, &position.long_venue),
            (&snapshot.short, &position.short_venue),
        ] {
            let Some(leg) = leg else { continue };
            let Some(liq) = leg.liquidation_price else { continue };
            if leg.qty <= 0.0 || leg.entry_price <= 0.0 {
                continue;
            }
            // Mark implied by the venue's own PnL figure.
            let mark = match leg.side {
                crate::venues::Side::Buy => leg.entry_price + leg.unrealized_pnl / leg.qty,
                crate::venues::Side::Sell => leg.entry_price - leg.unrealized_pnl / leg.qty,
            };
            if mark <= 0.0 {
                continue;
            }
            let distance = (mark - liq).abs() / mark;
            if distance <= buffer {
                return Some(venue.clone());
            }
        }
        None
    }

    fn is_liquidated(&self, snapshot: &PositionSnapshot, position: &PairedPosition) -> bool {
        let gone = |leg: &Option<LivePosition>| {
            leg.as_ref()
                .map(|p| p.qty < position.base_qty * 0.01)
                .unwrap_or(true)
        };
        // One leg vanished while the other survives. Both missing is a
        // fully-flat pair and also needs reconciling.
        gone(&snapshot.long) || gone(&snapshot.short)
    }

    async fn leg_imbalance(
        &self,
        snapshot: &PositionSnapshot,
        position: &PairedPosition,
    ) -> Result<bool> {
        let (Some(long), Some(short)) = (&snapshot.long, &snapshot.short) else {
            return Ok(false);
        };
        let long_step = self
            .ctx
            .rates
            .venue_symbol(&position.long_venue, &position.symbol)
            .await
            .ok()
            .flatten()
            .map(|s| s.step_size)
            .unwrap_or(0.0);
        let short_step = self
            .ctx
            .rates
            .venue_symbol(&position.short_venue, &position.symbol)
            .await
            .ok()
            .flatten()
            .map(|s| s.step_size)
            .unwrap_or(0.0);
        let tolerance = long_step + short_step;
        Ok((long.qty - short.qty).abs() > tolerance.max(position.base_qty * 1e-6))
    }

    async fn profit_precheck(
        &self,
        position: &PairedPosition,
        snapshot: &PositionSnapshot,
    ) -> Result<bool> {
        if !self.ctx.config.enable_immediate_profit_taking {
            return Ok(false);
        }
        let (long_bbo, short_bbo) = tokio::join!(
            async {
                match self.ctx.venue(&position.long_venue) {
                    Some(client) => client.fetch_bbo(&position.symbol).await.ok(),
                    None => None,
                }
            },
            async {
                match self.ctx.venue(&position.short_venue) {
                    Some(client) => client.fetch_bbo(&position.symbol).await.ok(),
                    None => None,
                }
            },
        );
        realtime::evaluate_profit_and_close(
            &self.ctx,
            &self.closer,
            position,
            long_bbo,
            short_bbo,
            Some(snapshot.unrealized_pnl_usd),
        )
        .await
    }

    async fn profit_erosion(&self, position: &PairedPosition, snapshot: &PositionSnapshot) -> bool {
        let total = snapshot.unrealized_pnl_usd + position.cumulative_funding_usd
            - position.entry_fees_usd;
        let mut marks = self.watermarks.write().await;
        let hwm = marks.entry(position.id).or_insert(total);
        if total > *hwm {
            *hwm = total;
        }
        let threshold = self.ctx.config.trailing_drawdown_pct * position.size_usd;
        *hwm > 0.0 && threshold > 0.0 && (*hwm - total) >= threshold
    }

    async fn close(&self, position: &PairedPosition, reason: ExitReason) -> Result<()> {
        let outcome = self.closer.close(position.id, reason).await?;
        if !matches!(outcome, crate::closer::CloseOutcome::AlreadyClosing) {
            self.cache.remove(position.id).await;
            self.watermarks.write().await.remove(&position.id);
        }
        Ok(())
    }
}
