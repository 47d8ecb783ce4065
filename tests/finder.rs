//! Opportunity ranking: pair construction, fee math, cold-start exclusion,
//! filters.

mod common;

use common::{LONG_VENUE, SHORT_VENUE};
use funding_flow::finder::OpportunityFinder;
use funding_flow::model::{OpportunityFilter, SortKey};

#[tokio::test]
async fn ranks_divergence_with_correct_sides_and_fees() {
    let h = common::harness().await;
    // venue_A quotes 0.0001/1h (0.0008 normalized), venue_B 0.0002/8h.
    h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    h.record_rate(LONG_VENUE, 0.0002, 8.0).await;
    h.record_metrics(SHORT_VENUE).await;
    h.record_metrics(LONG_VENUE).await;

    let finder = OpportunityFinder::new(h.ctx.clone());
    let opportunities = finder.find(&OpportunityFilter::default()).await.unwrap();
    assert_eq!(opportunities.len(), 1);

    let opp = &opportunities[0];
    assert_eq!(opp.symbol, "BTC");
    // Lower normalized rate goes long, higher goes short.
    assert_eq!(opp.long_venue, LONG_VENUE);
    assert_eq!(opp.short_venue, SHORT_VENUE);
    assert!((opp.divergence - 0.0006).abs() < 1e-12);
    // Entry + exit taker fees on both legs.
    assert!((opp.est_fees - 0.002).abs() < 1e-12);
    assert!((opp.net_profit_pct - (0.0006 - 0.002)).abs() < 1e-12);
    assert!((opp.annualized_apy - 0.0006 * 3.0 * 365.0).abs() < 1e-9);
    assert_eq!(opp.min_oi_usd, 20_000_000.0);
}

#[tokio::test]
async fn cold_start_venue_without_market_data_is_excluded() {
    let h = common::harness().await;
    h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    h.record_rate(LONG_VENUE, 0.0002, 8.0).await;
    // Only one venue has liquidity metrics.
    h.record_metrics(LONG_VENUE).await;

    let finder = OpportunityFinder::new(h.ctx.clone());
    let opportunities = finder.find(&OpportunityFilter::default()).await.unwrap();
    assert!(opportunities.is_empty());
}

#[tokio::test]
async fn single_venue_is_never_a_candidate() {
    let h = common::harness().await;
    h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    h.record_metrics(SHORT_VENUE).await;

    let finder = OpportunityFinder::new(h.ctx.clone());
    assert!(finder.find(&OpportunityFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn filters_apply() {
    let h = common::harness().await;
    h.record_rate(SHORT_VENUE, 0.0001, 1.0).await;
    h.record_rate(LONG_VENUE, 0.0002, 8.0).await;
    h.record_metrics(SHORT_VENUE).await;
    h.record_metrics(LONG_VENUE).await;

    let finder = OpportunityFinder::new(h.ctx.clone());

    let blacklisted = OpportunityFilter {
        venue_blacklist: vec![SHORT_VENUE.to_string()],
        ..OpportunityFilter::default()
    };
    assert!(finder.find(&blacklisted).await.unwrap().is_empty());

    let wrong_long = OpportunityFilter {
        long_venue_whitelist: Some(vec![SHORT_VENUE.to_string()]),
        ..OpportunityFilter::default()
    };
    assert!(finder.find(&wrong_long).await.unwrap().is_empty());

    let too_much_divergence = OpportunityFilter {
        max_divergence: Some(0.0001),
        ..OpportunityFilter::default()
    };
    assert!(finder.find(&too_much_divergence).await.unwrap().is_empty());

    let volume_floor = OpportunityFilter {
        min_volume_24h: Some(10_000_000.0),
        ..OpportunityFilter::default()
    };
    assert!(finder.find(&volume_floor).await.unwrap().is_empty());

    let sorted = OpportunityFilter {
        sort: SortKey::Apy,
        ..OpportunityFilter::default()
    };
    assert_eq!(finder.find(&sorted).await.unwrap().len(), 1);
}
