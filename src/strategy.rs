//! Strategy composition: scan → open → monitor → close.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::closer::PositionCloser;
use crate::context::Context;
use crate::executor::{AtomicTwoLegExecutor, EntryOutcome, EntryRequest};
use crate::finder::OpportunityFinder;
use crate::model::{FundingPayment, Opportunity, OpportunityFilter, PairedPosition};
use crate::monitor::PositionMonitor;
use crate::realtime::{self, RealTimeProfitMonitor};
use crate::venues::Bbo;

/// Funding payments are polled on this fixed clock and matched against each
/// venue's own cadence via the payment timestamps.
const FUNDING_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// The runtime drives every strategy through this surface; monitors call
/// back through the closer, never through the strategy.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Look for a new entry, subject to caps. One entry at most per call.
    async fn scan(&self) -> Result<()>;

    /// One management pass over open positions.
    async fn manage(&self) -> Result<()>;

    /// A paired entry was confirmed.
    async fn on_fill(&self, position: &PairedPosition) -> Result<()>;

    /// A BBO event for a venue/symbol the strategy may care about.
    async fn on_bbo(&self, venue: &str, symbol: &str, bbo: Bbo) -> Result<()>;
}

pub struct FundingArbStrategy {
    ctx: Arc<Context>,
    finder: OpportunityFinder,
    executor: AtomicTwoLegExecutor,
    monitor: Arc<PositionMonitor>,
    realtime: RealTimeProfitMonitor,
    closer: Arc<PositionCloser>,
    /// Cleared at shutdown: no new entries, in-flight ones finish.
    accepting: AtomicBool,
    paused: Arc<AtomicBool>,
}

impl FundingArbStrategy {
    pub fn new(
        ctx: Arc<Context>,
        monitor: Arc<PositionMonitor>,
        realtime: RealTimeProfitMonitor,
        closer: Arc<PositionCloser>,
    ) -> Self {
        FundingArbStrategy {
            finder: OpportunityFinder::new(ctx.clone()),
            executor: AtomicTwoLegExecutor::new(ctx.clone()),
            paused: monitor.pause_flag(),
            ctx,
            monitor,
            realtime,
            closer,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Re-attach realtime watchers to positions that survived a restart.
    pub async fn bootstrap_watchers(&self) -> Result<()> {
        for position in self.ctx.positions.list_open(&self.ctx.account).await? {
            self.realtime.spawn_for_position(&position);
        }
        Ok(())
    }

    /// Main control loop. Shutdown is only observed between operations, so
    /// an in-flight entry always completes or rolls back before exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut scan_ticker =
            tokio::time::interval(Duration::from_secs_f64(self.ctx.config.scan_interval_sec));
        let mut manage_ticker =
            tokio::time::interval(Duration::from_secs_f64(self.ctx.config.monitor_interval_sec));
        let mut funding_ticker = tokio::time::interval(FUNDING_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = scan_ticker.tick() => {
                    if let Err(err) = self.scan().await {
                        warn!(%err, "scan failed");
                    }
                }
                _ = manage_ticker.tick() => {
                    if let Err(err) = self.manage().await {
                        warn!(%err, "manage pass failed");
                    }
                }
                _ = funding_ticker.tick() => {
                    if let Err(err) = self.sample_funding().await {
                        warn!(%err, "funding sampling failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.accepting.store(false, Ordering::SeqCst);
                        info!("strategy loop stopping");
                        return;
                    }
                }
            }
        }
    }

    fn entry_filter(&self) -> OpportunityFilter {
        let config = &self.ctx.config;
        OpportunityFilter {
            symbols: if config.symbols.is_empty() {
                None
            } else {
                Some(config.symbols.clone())
            },
            venue_whitelist: None,
            venue_blacklist: config.venue_blacklist.clone(),
            long_venue_whitelist: config.long_venue_whitelist.clone(),
            short_venue_whitelist: config.short_venue_whitelist.clone(),
            min_divergence: Some(config.min_divergence_pct),
            min_net_profit_pct: Some(config.min_profit_pct),
            ..OpportunityFilter::default()
        }
    }

    /// Candidate must clear every cap and not duplicate an active pair.
    fn pick_candidate(
        &self,
        candidates: Vec<Opportunity>,
        active: &[PairedPosition],
    ) -> Option<Opportunity> {
        let mut per_symbol: HashMap<&str, usize> = HashMap::new();
        let mut per_venue: HashMap<&str, usize> = HashMap::new();
        for position in active {
            *per_symbol.entry(position.symbol.as_str()).or_default() += 1;
            *per_venue.entry(position.long_venue.as_str()).or_default() += 1;
            *per_venue.entry(position.short_venue.as_str()).or_default() += 1;
        }

        let config = &self.ctx.config;
        candidates.into_iter().find(|c| {
            let held = active.iter().any(|p| {
                p.symbol == c.symbol && p.long_venue == c.long_venue && p.short_venue == c.short_venue
            });
            let symbol_ok = per_symbol.get(c.symbol.as_str()).copied().unwrap_or(0)
                < config.max_positions_per_symbol;
            let venues_ok = [c.long_venue.as_str(), c.short_venue.as_str()]
                .iter()
                .all(|v| per_venue.get(*v).copied().unwrap_or(0) < config.max_positions_per_venue);
            !held && symbol_ok && venues_ok
        })
    }

    async fn reference_price(&self, opportunity: &Opportunity) -> Option<f64> {
        for venue in [&opportunity.long_venue, &opportunity.short_venue] {
            if let Some(client) = self.ctx.venue(venue) {
                if let Ok(bbo) = client.fetch_bbo(&opportunity.symbol).await {
                    return Some(bbo.mid());
                }
            }
        }
        None
    }

    pub async fn sample_funding(&self) -> Result<()> {
        for position in self.ctx.positions.list_open(&self.ctx.account).await? {
            if let Err(err) = self.sample_position_funding(&position).await {
                warn!(position = position.id, %err, "funding sample failed");
            }
        }
        Ok(())
    }

    /// Poll both venues' settled-payment endpoints and append anything new.
    /// The unique `(position, payment_time)` key absorbs repeated polls.
    async fn sample_position_funding(&self, position: &PairedPosition) -> Result<()> {
        let Some(long_client) = self.ctx.venue(&position.long_venue) else {
            return Ok(());
        };
        let Some(short_client) = self.ctx.venue(&position.short_venue) else {
            return Ok(());
        };

        let (long_payment, short_payment) = tokio::join!(
            long_client.fetch_last_funding_payment(&position.symbol),
            short_client.fetch_last_funding_payment(&position.symbol),
        );
        let long_payment = long_payment.unwrap_or_default();
        let short_payment = short_payment.unwrap_or_default();

        let last_recorded = self
            .ctx
            .positions
            .funding_payments(position.id)
            .await?
            .last()
            .map(|p| p.payment_time)
            .unwrap_or(position.opened_at);

        let is_new =
            |p: &Option<crate::venues::VenueFundingPayment>| {
                p.as_ref().is_some_and(|p| p.payment_time > last_recorded)
            };
        if !is_new(&long_payment) && !is_new(&short_payment) {
            return Ok(());
        }

        let payment_time = [&long_payment, &short_payment]
            .iter()
            .filter_map(|p| p.as_ref().map(|p| p.payment_time))
            .max()
            .unwrap_or(last_recorded);

        let long_amount = long_payment
            .as_ref()
            .filter(|p| p.payment_time > last_recorded)
            .map(|p| p.amount_usd)
            .unwrap_or(0.0);
        let short_amount = short_payment
            .as_ref()
            .filter(|p| p.payment_time > last_recorded)
            .map(|p| p.amount_usd)
            .unwrap_or(0.0);
        let long_rate = long_payment.as_ref().map(|p| p.rate).unwrap_or(0.0);
        let short_rate = short_payment.as_ref().map(|p| p.rate).unwrap_or(0.0);

        let payment = FundingPayment {
            position_id: position.id,
            payment_time,
            long_payment: long_amount,
            short_payment: short_amount,
            net_payment: long_amount + short_amount,
            long_rate,
            short_rate,
            divergence: short_rate - long_rate,
        };
        if self.ctx.positions.append_funding_payment(&payment).await? {
            debug!(
                position = position.id,
                net = payment.net_payment,
                "funding payment recorded"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Strategy for FundingArbStrategy {
    async fn scan(&self) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) || self.paused.load(Ordering::Relaxed) {
            return Ok(());
        }
        let config = &self.ctx.config;

        let active = self.ctx.positions.list_active(Some(&self.ctx.account)).await?;
        if active.len() >= config.max_positions_total {
            return Ok(());
        }
        if let Some(cap) = config.max_account_exposure_usd {
            let exposure: f64 = active.iter().map(|p| p.size_usd).sum();
            if exposure + config.size_usd_per_position > cap {
                debug!(exposure, cap, "exposure cap reached");
                return Ok(());
            }
        }

        let candidates = self.finder.find(&self.entry_filter()).await?;
        let Some(candidate) = self.pick_candidate(candidates, &active) else {
            return Ok(());
        };
        let Some(reference_price) = self.reference_price(&candidate).await else {
            debug!(symbol = %candidate.symbol, "no reference price, skipping");
            return Ok(());
        };

        let request = EntryRequest {
            symbol: candidate.symbol.clone(),
            long_venue: candidate.long_venue.clone(),
            short_venue: candidate.short_venue.clone(),
            size_usd: config.size_usd_per_position,
            reference_price,
            long_rate_8h: candidate.long_rate_8h,
            short_rate_8h: candidate.short_rate_8h,
        };

        match self.executor.execute(&request).await? {
            EntryOutcome::Filled(position) => self.on_fill(&position).await?,
            EntryOutcome::RolledBack(report) => {
                warn!(
                    symbol = %request.symbol,
                    cost_usd = report.cost_usd,
                    reason = %report.reason,
                    needs_review = report.needs_review,
                    "entry rolled back"
                );
            }
            EntryOutcome::Rejected(reason) => {
                debug!(symbol = %request.symbol, %reason, "entry rejected");
            }
        }
        Ok(())
    }

    async fn manage(&self) -> Result<()> {
        self.monitor.tick().await
    }

    async fn on_fill(&self, position: &PairedPosition) -> Result<()> {
        self.realtime.spawn_for_position(position);
        Ok(())
    }

    async fn on_bbo(&self, venue: &str, symbol: &str, bbo: Bbo) -> Result<()> {
        // The dedicated watcher tasks normally handle this; the hook exists
        // for externally-driven quotes (tests, replay). The counterpart
        // leg's quote is read from its own venue.
        for position in self.ctx.positions.list_open(&self.ctx.account).await? {
            if position.symbol != symbol {
                continue;
            }
            let other_venue = if position.long_venue == venue {
                &position.short_venue
            } else if position.short_venue == venue {
                &position.long_venue
            } else {
                continue;
            };
            let other_bbo = match self.ctx.venue(other_venue) {
                Some(client) => client.fetch_bbo(symbol).await.ok(),
                None => None,
            };
            let (long_bbo, short_bbo) = if position.long_venue == venue {
                (Some(bbo), other_bbo)
            } else {
                (other_bbo, Some(bbo))
            };
            realtime::evaluate_profit_and_close(
                &self.ctx,
                &self.closer,
                &position,
                long_bbo,
                short_bbo,
                None,
            )
            .await?;
        }
        Ok(())
    }
}
