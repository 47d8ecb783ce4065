//! Scan → open → monitor composition and funding-payment sampling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ACCOUNT, LONG_VENUE, SHORT_VENUE};
use funding_flow::closer::PositionCloser;
use funding_flow::monitor::{PositionMonitor, SnapshotCache};
use funding_flow::realtime::RealTimeProfitMonitor;
use funding_flow::strategy::{FundingArbStrategy, Strategy};
use funding_flow::model::{ExitReason, PositionStatus};
use funding_flow::venues::VenueFundingPayment;
use tokio::sync::watch;

fn build_strategy(h: &common::Harness) -> FundingArbStrategy {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let closer = PositionCloser::new(h.ctx.clone());
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let monitor = Arc::new(PositionMonitor::new(h.ctx.clone(), closer.clone(), cache.clone()));
    let realtime = RealTimeProfitMonitor::new(h.ctx.clone(), closer.clone(), cache, shutdown_rx);
    FundingArbStrategy::new(h.ctx.clone(), monitor, realtime, closer)
}

async fn seed_rates(h: &common::Harness) {
    h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    h.record_rate(LONG_VENUE, 0.0002, 8.0).await;
    h.record_metrics(SHORT_VENUE).await;
    h.record_metrics(LONG_VENUE).await;
}

#[tokio::test]
async fn scan_opens_the_top_candidate_once() {
    let h = common::harness().await;
    seed_rates(&h).await;
    let strategy = build_strategy(&h);

    strategy.scan().await.unwrap();

    let active = h.ctx.positions.list_active(Some(ACCOUNT)).await.unwrap();
    assert_eq!(active.len(), 1);
    let position = &active[0];
    assert_eq!(position.long_venue, LONG_VENUE);
    assert_eq!(position.short_venue, SHORT_VENUE);
    assert_eq!(position.status, PositionStatus::Open);

    // The same candidate is already held: a second scan adds nothing.
    strategy.scan().await.unwrap();
    assert_eq!(h.ctx.positions.list_active(Some(ACCOUNT)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn scan_respects_total_position_cap() {
    let mut config = common::test_config();
    config.max_positions_total = 1;
    config.symbols = vec!["BTC".into(), "ETH".into()];
    let h = common::harness_with_config(config).await;

    // A second tradable symbol with its own divergence.
    for (venue, name) in [(&h.hyperion, SHORT_VENUE), (&h.driftline, LONG_VENUE)] {
        let mut sym = common::btc_symbol(name);
        sym.symbol = "ETH".into();
        sym.native_symbol = format!("ETH-PERP-{name}");
        venue.add_symbol(sym);
        venue.set_bbo("ETH", 1999.5, 2000.5).await;
    }
    funding_flow::collector::FundingCollector::new(h.ctx.clone())
        .sync_metadata()
        .await
        .unwrap();
    seed_rates(&h).await;
    for (venue, rate, interval) in [(SHORT_VENUE, 0.0002, 1.0), (LONG_VENUE, 0.0001, 8.0)] {
        let sample = funding_flow::model::FundingRateSample::new(
            venue,
            "ETH",
            rate,
            interval,
            chrono::Utc::now().timestamp(),
        );
        h.ctx.rates.record_sample(&sample).await.unwrap();
        h.ctx
            .rates
            .update_market_metrics(
                venue,
                "ETH",
                &funding_flow::model::MarketMetrics {
                    volume_24h_usd: 1_000_000.0,
                    open_interest_usd: 5_000_000.0,
                    spread_bps: Some(2.0),
                },
            )
            .await
            .unwrap();
    }

    let strategy = build_strategy(&h);
    strategy.scan().await.unwrap();
    // A second candidate exists on ETH, but the total cap is already full.
    strategy.scan().await.unwrap();

    assert_eq!(h.ctx.positions.list_active(Some(ACCOUNT)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn paused_strategy_does_not_scan(){
    let h = common::harness().await;
    seed_rates(&h).await;
    let strategy = build_strategy(&h);
    strategy.pause();

    strategy.scan().await.unwrap();
    assert!(h.ctx.positions.list_active(Some(ACCOUNT)).await.unwrap().is_empty());

    strategy.resume();
    strategy.scan().await.unwrap();
    assert_eq!(h.ctx.positions.list_active(Some(ACCOUNT)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn funding_sampling_appends_new_settlements_once() {
    let h = common::harness().await;
    let position = h.open_pair().await;
    let strategy = build_strategy(&h);

    let settle_time = position.opened_at + 3600;
    h.driftline.set_last_funding_payment(
        "BTC",
        VenueFundingPayment {
            payment_time: settle_time,
            amount_usd: -0.5,
            rate: 0.0002,
        },
    );
    h.hyperion.set_last_funding_payment(
        "BTC",
        VenueFundingPayment {
            payment_time: settle_time,
            amount_usd: 2.5,
            rate: 0.0008,
        },
    );

    strategy.sample_funding().await.unwrap();
    // The venues still report the same settlement; nothing doubles.
    strategy.sample_funding().await.unwrap();

    let payments = h.ctx.positions.funding_payments(position.id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert!((payments[0].net_payment - 2.0).abs() < 1e-12);

    let reloaded = h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert!((reloaded.cumulative_funding_usd - 2.0).abs() < 1e-12);
    assert_eq!(reloaded.funding_payments_count, 1);
}

#[tokio::test]
async fn on_bbo_closes_when_profit_target_is_hit() {
    let h = common::harness().await;
    let position = h.open_pair().await;
    let strategy = build_strategy(&h);

    // A small move is not enough to clear the 0.2% threshold.
    let flat = funding_flow::venues::Bbo {
        bid: 100_010.0,
        ask: 100_020.0,
        ts: chrono::Utc::now().timestamp_millis(),
    };
    strategy.on_bbo(LONG_VENUE, "BTC", flat).await.unwrap();
    assert_eq!(
        h.ctx.positions.get(position.id).await.unwrap().unwrap().status,
        PositionStatus::Open
    );

    // The long venue's bid jumps 600 USD; the short leg's quote comes from
    // its own venue. ~0.5% net profit clears the threshold and closes.
    h.driftline.set_bbo("BTC", 100_600.0, 100_610.0).await;
    let jump = funding_flow::venues::Bbo {
        bid: 100_600.0,
        ask: 100_610.0,
        ts: chrono::Utc::now().timestamp_millis(),
    };
    strategy.on_bbo(LONG_VENUE, "BTC", jump).await.unwrap();

    let reloaded = h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PositionStatus::Closed);
    assert_eq!(reloaded.exit_reason, Some(ExitReason::ProfitTarget));
}
