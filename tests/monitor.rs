//! Polling-loop risk evaluation and event-driven profit taking.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{LONG_VENUE, SHORT_VENUE};
use funding_flow::closer::PositionCloser;
use funding_flow::monitor::{PositionMonitor, SnapshotCache};
use funding_flow::model::{ExitReason, PositionStatus};
use funding_flow::realtime;

struct Rig {
    h: common::Harness,
    monitor: PositionMonitor,
    closer: Arc<PositionCloser>,
}

async fn rig() -> Rig {
    let h = common::harness().await;
    let closer = PositionCloser::new(h.ctx.clone());
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let monitor = PositionMonitor::new(h.ctx.clone(), closer.clone(), cache);
    Rig { h, monitor, closer }
}

async fn exit_reason(rig: &Rig, id: i64) -> Option<ExitReason> {
    rig.h.ctx.positions.get(id).await.unwrap().unwrap().exit_reason
}

#[tokio::test]
async fn healthy_position_stays_open() {
    let rig = rig().await;
    let position = rig.h.open_pair().await;
    rig.h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    rig.h.record_rate(LONG_VENUE, 0.0002, 8.0).await;

    rig.monitor.tick().await.unwrap();

    let reloaded = rig.h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PositionStatus::Open);
}

#[tokio::test]
async fn bbo_move_triggers_immediate_profit_close() {
    let rig = rig().await;
    let position = rig.h.open_pair().await;
    rig.h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    rig.h.record_rate(LONG_VENUE, 0.0002, 8.0).await;

    // Long venue bid jumps 600 USD: ~0.6% on a 1000 USD position, well
    // over the 0.2% immediate-profit threshold.
    rig.h.driftline.set_bbo("BTC", 100_600.0, 100_610.0).await;
    rig.h.hyperion.set_bbo("BTC", 99_995.0, 100_005.0).await;

    rig.monitor.tick().await.unwrap();

    let reloaded = rig.h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PositionStatus::Closed);
    assert_eq!(reloaded.exit_reason, Some(ExitReason::ProfitTarget));
    assert!(reloaded.realized_pnl_usd.unwrap() > 0.0);
    assert_eq!(rig.h.notification_count("position_closed").await, 1);
}

#[tokio::test]
async fn funding_flip_closes_non_urgently() {
    let rig = rig().await;
    let position = rig.h.open_pair().await;
    // Divergence flipped negative: the short venue now pays less than the
    // long one collects.
    rig.h.record_rate(SHORT_VENUE, 0.0004, 8.0).await;
    rig.h.record_rate(LONG_VENUE, 0.0005, 8.0).await;

    rig.monitor.tick().await.unwrap();
    assert_eq!(exit_reason(&rig, position.id).await, Some(ExitReason::FundingFlip));
}

#[tokio::test]
async fn leg_imbalance_forces_urgent_close() {
    let rig = rig().await;
    let position = rig.h.open_pair().await;
    rig.h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    rig.h.record_rate(LONG_VENUE, 0.0002, 8.0).await;

    // Half the short leg vanished (partial liquidation / manual meddling).
    rig.h.hyperion.force_position("BTC", -0.005, 99_995.0, 1.0);

    rig.monitor.tick().await.unwrap();
    assert_eq!(exit_reason(&rig, position.id).await, Some(ExitReason::LegImbalance));
    assert_eq!(rig.h.hyperion.net_position("BTC"), 0.0);
    assert_eq!(rig.h.driftline.net_position("BTC"), 0.0);
}

#[tokio::test]
async fn vanished_leg_reconciles_as_liquidated() {
    let rig = rig().await;
    let position = rig.h.open_pair().await;
    rig.h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    rig.h.record_rate(LONG_VENUE, 0.0002, 8.0).await;

    // The short venue reports us flat: that leg was liquidated away.
    rig.h.hyperion.force_position("BTC", 0.0, 0.0, 1.0);

    rig.monitor.tick().await.unwrap();
    let reloaded = rig.h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PositionStatus::Closed);
    assert_eq!(reloaded.exit_reason, Some(ExitReason::Liquidated));
    // Surviving long leg was force-closed.
    assert_eq!(rig.h.driftline.net_position("BTC"), 0.0);
}

#[tokio::test]
async fn venue_outage_skips_the_tick_without_closing() {
    let rig = rig().await;
    let position = rig.h.open_pair().await;
    rig.h
        .hyperion
        .script_failure(funding_flow::venues::paper::PaperOp::FetchPosition, "down");

    rig.monitor.tick().await.unwrap();

    let reloaded = rig.h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PositionStatus::Open, "outage must not close");
}

#[tokio::test]
async fn trailing_drawdown_closes_after_watermark_give_back() {
    let mut config = common::test_config();
    config.trailing_drawdown_pct = 0.005; // 5 USD on a 1000 USD position
    config.enable_immediate_profit_taking = false;
    let h = common::harness_with_config(config).await;
    let closer = PositionCloser::new(h.ctx.clone());
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let monitor = PositionMonitor::new(h.ctx.clone(), closer, cache);

    let position = h.open_pair().await;
    h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    h.record_rate(LONG_VENUE, 0.0002, 8.0).await;

    // Run up: +20 USD unrealized on the long leg.
    h.driftline.set_bbo("BTC", 102_000.0, 102_010.0).await;
    monitor.tick().await.unwrap();
    assert_eq!(
        h.ctx.positions.get(position.id).await.unwrap().unwrap().status,
        PositionStatus::Open
    );

    // Give most of it back: drawdown from the watermark exceeds 5 USD.
    h.driftline.set_bbo("BTC", 100_100.0, 100_110.0).await;
    monitor.tick().await.unwrap();
    assert_eq!(
        h.ctx.positions.get(position.id).await.unwrap().unwrap().exit_reason,
        Some(ExitReason::ProfitErosion)
    );
}

#[tokio::test]
async fn hard_time_limit_closes_old_positions() {
    let mut config = common::test_config();
    config.hard_time_limit_hours = Some(1.0);
    config.enable_immediate_profit_taking = false;
    let h = common::harness_with_config(config).await;
    let closer = PositionCloser::new(h.ctx.clone());
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let monitor = PositionMonitor::new(h.ctx.clone(), closer, cache);

    let position = h.open_pair().await;
    h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    h.record_rate(LONG_VENUE, 0.0002, 8.0).await;
    {
        // Age the position past the limit.
        let conn = h.db.lock().await;
        conn.execute(
            "UPDATE strategy_positions SET opened_at = opened_at - 7200 WHERE id = ?1",
            [position.id],
        )
        .unwrap();
    }

    monitor.tick().await.unwrap();
    assert_eq!(
        h.ctx.positions.get(position.id).await.unwrap().unwrap().exit_reason,
        Some(ExitReason::TimeLimit)
    );
}

#[tokio::test]
async fn profit_evaluation_falls_back_to_snapshot_when_bbo_is_partial() {
    let rig = rig().await;
    let position = rig.h.open_pair().await;

    // Only the long venue has a fresh quote; fallback uses the snapshot's
    // unrealized PnL (here +600 on the long leg).
    rig.h.driftline.set_bbo("BTC", 100_600.0, 100_610.0).await;
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let monitor = PositionMonitor::new(rig.h.ctx.clone(), rig.closer.clone(), cache);
    let snapshot = monitor.refresh_snapshot(&position).await.unwrap();

    use funding_flow::venues::VenueClient;
    let long_bbo = rig.h.driftline.fetch_bbo("BTC").await.unwrap();
    let closed = realtime::evaluate_profit_and_close(
        &rig.h.ctx,
        &rig.closer,
        &position,
        Some(long_bbo),
        None,
        Some(snapshot.unrealized_pnl_usd),
    )
    .await
    .unwrap();
    assert!(closed);
    assert_eq!(exit_reason(&rig, position.id).await, Some(ExitReason::ProfitTarget));
}
