//! Strategy-instance process entrypoint.
//!
//! One OS process per instance: bootstrap the context, spawn the component
//! tasks, heartbeat into the run registry, and drain cleanly on SIGTERM —
//! no new scans, in-flight entries finish or roll back, subscriptions drop,
//! exit 0.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::closer::PositionCloser;
use crate::collector::FundingCollector;
use crate::config::{self, InstanceSpec};
use crate::context::Context;
use crate::control;
use crate::db::{self, Db};
use crate::db::accounts::AccountStore;
use crate::db::rates::RateStore;
use crate::model::{FeeSchedule, RunStatus, VenueMeta};
use crate::monitor::{PositionMonitor, SnapshotCache};
use crate::realtime::RealTimeProfitMonitor;
use crate::strategy::FundingArbStrategy;
use crate::supervisor::HEARTBEAT_INTERVAL;
use crate::venues::paper::PaperVenue;
use crate::venues::rest::RestVenue;
use crate::venues::VenueSet;

pub fn run_instance(spec_path: &Path) -> Result<()> {
    let spec = config::load_instance_spec(spec_path)?;
    let runtime = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    runtime.block_on(run_instance_async(spec))
}

async fn run_instance_async(spec: InstanceSpec) -> Result<()> {
    info!(
        run_id = spec.run_id,
        account = %spec.account,
        strategy = %spec.strategy_name,
        paper = spec.paper,
        "strategy instance starting"
    );

    let db = db::open(Path::new(&spec.db_path))?;
    let venues = build_venues(&spec, &db).await?;
    let run_id = spec.run_id;
    let ctx = Context::new(
        spec.account,
        spec.strategy_name,
        Some(run_id),
        spec.config,
        db,
        venues,
    );

    // Shutdown fan-out: signal handler flips the watch, tasks drain.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let cache = SnapshotCache::new(Duration::from_secs_f64(ctx.config.monitor_interval_sec));
    let closer = PositionCloser::new(ctx.clone());
    let monitor = Arc::new(PositionMonitor::new(ctx.clone(), closer.clone(), cache.clone()));
    let realtime = RealTimeProfitMonitor::new(
        ctx.clone(),
        closer.clone(),
        cache.clone(),
        shutdown_rx.clone(),
    );
    let strategy = FundingArbStrategy::new(ctx.clone(), monitor, realtime, closer);

    let collector = FundingCollector::new(ctx.clone());
    collector.sync_metadata().await?;
    if let Err(err) = collector.collect_once().await {
        warn!(%err, "initial collection failed, continuing");
    }
    strategy.bootstrap_watchers().await?;

    let started_at = Utc::now().timestamp();
    let (bbo_tx, _) = broadcast::channel::<control::BboPush>(256);

    let control_task = tokio::spawn(control::serve(
        ctx.clone(),
        cache.clone(),
        bbo_tx.clone(),
        started_at,
        shutdown_rx.clone(),
    ));
    let relay_task = tokio::spawn(control::run_bbo_relay(
        ctx.clone(),
        bbo_tx,
        shutdown_rx.clone(),
    ));
    let collector_task = tokio::spawn(collector.run(shutdown_rx.clone()));
    let heartbeat_task = tokio::spawn(heartbeat_loop(ctx.clone(), run_id, shutdown_rx.clone()));

    // The strategy loop is the instance's main thread of execution.
    strategy.run(shutdown_rx).await;

    // Drain: loop exits only after any in-flight scan completed or rolled
    // back. Remaining tasks watch the same shutdown signal.
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = collector_task.await;
        let _ = relay_task.await;
        let _ = heartbeat_task.await;
        let _ = control_task.await;
    })
    .await;

    if let Err(err) = ctx
        .runs
        .transition(run_id, RunStatus::Stopped, None)
        .await
    {
        // Already terminal (e.g. the control plane marked it) is fine.
        warn!(%err, "could not mark run stopped");
    }
    info!(run_id, "strategy instance exiting");
    Ok(())
}

async fn heartbeat_loop(ctx: Arc<Context>, run_id: i64, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = ctx.runs.heartbeat(run_id, Utc::now().timestamp()).await {
                    error!(%err, "heartbeat write failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Wire the venue set: paper venues for `--paper`, signed REST adapters
/// with per-account proxy binding otherwise.
async fn build_venues(spec: &InstanceSpec, db: &Db) -> Result<VenueSet> {
    if spec.config.venues.len() < 2 {
        bail!(
            "config: funding arbitrage needs at least two venues, got {}",
            spec.config.venues.len()
        );
    }

    let rates = RateStore::new(db.clone());
    let accounts = AccountStore::new(db.clone());
    let mut set = VenueSet::new();

    if spec.paper {
        for venue_id in spec.config.venues.keys() {
            let meta = rates
                .venue_meta(venue_id)
                .await?
                .unwrap_or_else(|| default_meta(venue_id));
            set.insert(venue_id.clone(), PaperVenue::new(meta));
        }
        return Ok(set);
    }

    let master_key = std::env::var(crate::db::crypto::MASTER_KEY_ENV)
        .with_context(|| format!("{} not set", crate::db::crypto::MASTER_KEY_ENV))?;
    let account = accounts
        .get(&spec.account)
        .await?
        .with_context(|| format!("unknown account '{}'", spec.account))?;
    let proxy = accounts.active_proxy(&spec.account).await?;

    for (venue_id, endpoint) in &spec.config.venues {
        let meta = rates
            .venue_meta(venue_id)
            .await?
            .unwrap_or_else(|| default_meta(venue_id));
        let creds = accounts
            .load_credentials(&spec.account, venue_id, &master_key)
            .await
            .with_context(|| format!("credentials for '{}' on '{venue_id}'", spec.account))?;
        let client = RestVenue::connect(
            meta,
            endpoint.base_url.clone(),
            endpoint.ws_url.clone(),
            creds,
            proxy.as_ref().map(|p| p.proxy_url.as_str()),
            account.is_admin,
            endpoint.rate_limit_per_sec,
        )
        .with_context(|| format!("building venue client '{venue_id}'"))?;
        set.insert(venue_id.clone(), client);
    }
    Ok(set)
}

fn default_meta(venue_id: &str) -> VenueMeta {
    VenueMeta {
        id: venue_id.to_string(),
        funding_interval_hours: 8.0,
        fees: FeeSchedule::default(),
        supports_post_only: true,
    }
}
