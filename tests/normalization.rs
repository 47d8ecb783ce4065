//! Funding-rate normalization: everything at rest is on the 8-hour basis.

mod common;

use common::{LONG_VENUE, SHORT_VENUE};
use funding_flow::collector::FundingCollector;
use funding_flow::model::{FundingRateSample, normalize_rate_8h};

#[test]
fn hourly_rate_normalizes() {
    let sample = FundingRateSample::new("hyperion", "BTC", 0.0001, 1.0, 0);
    assert!((sample.rate_8h - 0.0008).abs() < 1e-12);
}

#[test]
fn eight_hour_rate_is_identity() {
    let sample = FundingRateSample::new("driftline", "BTC", 0.0002, 8.0, 0);
    assert_eq!(sample.rate_8h, 0.0002);
    assert_eq!(normalize_rate_8h(sample.rate_8h, 8.0), sample.rate_8h);
}

#[tokio::test]
async fn collector_stores_normalized_rates() {
    let h = common::harness().await;
    h.hyperion.set_funding_rate("BTC", 0.0001, 1.0);
    h.driftline.set_funding_rate("BTC", 0.0002, 8.0);

    let collector = FundingCollector::new(h.ctx.clone());
    collector.collect_once().await.unwrap();

    let short_rate = h
        .ctx
        .rates
        .latest_rate(SHORT_VENUE, "BTC")
        .await
        .unwrap()
        .expect("hyperion rate stored");
    assert!((short_rate.rate_8h - 0.0008).abs() < 1e-12);
    assert_eq!(short_rate.rate_native, 0.0001);
    assert_eq!(short_rate.interval_hours, 1.0);

    let long_rate = h
        .ctx
        .rates
        .latest_rate(LONG_VENUE, "BTC")
        .await
        .unwrap()
        .expect("driftline rate stored");
    assert_eq!(long_rate.rate_8h, 0.0002);
}

#[tokio::test]
async fn collector_counts_venue_health() {
    let h = common::harness().await;
    h.hyperion.set_funding_rate("BTC", 0.0001, 1.0);
    h.driftline.set_funding_rate("BTC", 0.0002, 8.0);

    let collector = FundingCollector::new(h.ctx.clone());
    h.hyperion
        .script_failure(funding_flow::venues::paper::PaperOp::FundingRates, "down");
    collector.collect_once().await.unwrap();

    let health = h.ctx.rates.venue_health(SHORT_VENUE).await.unwrap();
    assert_eq!(health.consecutive_errors, 1);

    // A clean cycle resets the streak.
    collector.collect_once().await.unwrap();
    let health = h.ctx.rates.venue_health(SHORT_VENUE).await.unwrap();
    assert_eq!(health.consecutive_errors, 0);
    assert!(health.last_success_at.is_some());
}

#[tokio::test]
async fn symbol_interval_override_is_persisted() {
    let h = common::harness().await;
    let mut sym = common::btc_symbol(SHORT_VENUE);
    sym.symbol = "DOGE".into();
    sym.native_symbol = "DOGE-PERP".into();
    sym.funding_interval_hours = Some(4.0);
    h.hyperion.add_symbol(sym);

    FundingCollector::new(h.ctx.clone())
        .sync_metadata()
        .await
        .unwrap();

    let stored = h
        .ctx
        .rates
        .venue_symbol(SHORT_VENUE, "DOGE")
        .await
        .unwrap()
        .expect("DOGE mapping stored");
    assert_eq!(stored.funding_interval_hours, Some(4.0));
}
