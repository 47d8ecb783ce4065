//! Atomic two-leg entry: pre-flight rejections, happy path, and the
//! fill-aware rollback.

mod common;

use common::{ACCOUNT, LONG_VENUE, SHORT_VENUE};
use funding_flow::db::positions::NewPosition;
use funding_flow::executor::{AtomicTwoLegExecutor, EntryOutcome, EntryRequest, RejectReason};
use funding_flow::model::PositionStatus;
use funding_flow::venues::{AccountBalance, Side};

fn entry(size_usd: f64, reference_price: f64) -> EntryRequest {
    EntryRequest {
        symbol: "BTC".to_string(),
        long_venue: LONG_VENUE.to_string(),
        short_venue: SHORT_VENUE.to_string(),
        size_usd,
        reference_price,
        long_rate_8h: 0.0002,
        short_rate_8h: 0.0008,
    }
}

#[tokio::test]
async fn happy_path_opens_and_persists_pair() {
    let h = common::harness().await;
    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());

    let outcome = executor.execute(&entry(1000.0, 100_000.0)).await.unwrap();
    let EntryOutcome::Filled(position) = outcome else {
        panic!("expected fill, got {outcome:?}");
    };

    assert_eq!(position.status, PositionStatus::Open);
    assert!((position.base_qty - 0.01).abs() < 1e-9);
    // Long crossed the ask, short crossed the bid.
    assert_eq!(position.entry_long_price, 100_005.0);
    assert_eq!(position.entry_short_price, 99_995.0);
    assert!(position.entry_fees_usd > 0.0);
    assert!((position.entry_divergence - 0.0006).abs() < 1e-12);

    // Both venues hold equal and opposite base quantity.
    assert!((h.driftline.net_position("BTC") - 0.01).abs() < 1e-9);
    assert!((h.hyperion.net_position("BTC") + 0.01).abs() < 1e-9);

    assert_eq!(h.notification_count("position_opened").await, 1);
    let pending = h.ctx.notifier.undelivered(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, "position_opened");
}

#[tokio::test]
async fn size_below_min_notional_rejects_without_orders() {
    let h = common::harness().await;
    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());
    h.driftline.set_bbo("BTC", 99.0, 101.0).await;
    h.hyperion.set_bbo("BTC", 99.0, 101.0).await;

    // 5 USD at a 100 reference is under the 10 USD min notional.
    let outcome = executor.execute(&entry(5.0, 100.0)).await.unwrap();
    assert!(matches!(
        outcome,
        EntryOutcome::Rejected(RejectReason::SizeTooSmall { .. })
    ));
    assert_eq!(h.driftline.open_order_count(), 0);
    assert_eq!(h.hyperion.open_order_count(), 0);
    assert_eq!(h.driftline.net_position("BTC"), 0.0);
}

#[tokio::test]
async fn insufficient_margin_rejects_and_notifies() {
    let h = common::harness().await;
    h.hyperion.set_balance(AccountBalance {
        equity_usd: 100.0,
        free_margin_usd: 100.0,
    });
    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());

    let outcome = executor.execute(&entry(1000.0, 100_000.0)).await.unwrap();
    assert!(matches!(
        outcome,
        EntryOutcome::Rejected(RejectReason::InsufficientMargin { .. })
    ));
    assert_eq!(h.notification_count("insufficient_margin").await, 1);
    assert_eq!(h.hyperion.net_position("BTC"), 0.0);
}

#[tokio::test]
async fn duplicate_active_pair_rejects() {
    let h = common::harness().await;
    h.ctx
        .positions
        .create_open(&NewPosition {
            account: ACCOUNT.to_string(),
            strategy_name: "fundarb-test".to_string(),
            symbol: "BTC".to_string(),
            long_venue: LONG_VENUE.to_string(),
            short_venue: SHORT_VENUE.to_string(),
            size_usd: 1000.0,
            base_qty: 0.01,
            entry_long_price: 100_000.0,
            entry_short_price: 100_000.0,
            entry_fees_usd: 1.0,
            entry_long_rate: 0.0002,
            entry_short_rate: 0.0008,
            entry_divergence: 0.0006,
            opened_at: chrono::Utc::now().timestamp(),
        })
        .await
        .unwrap();

    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());
    let outcome = executor.execute(&entry(1000.0, 100_000.0)).await.unwrap();
    assert!(matches!(
        outcome,
        EntryOutcome::Rejected(RejectReason::DuplicatePosition { .. })
    ));
}

#[tokio::test]
async fn tight_liquidation_buffer_rejects_high_leverage() {
    let mut config = common::test_config();
    config
        .leverage_by_venue
        .insert(SHORT_VENUE.to_string(), 20.0);
    let h = common::harness_with_config(config).await;

    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());
    let outcome = executor.execute(&entry(1000.0, 100_000.0)).await.unwrap();
    assert!(matches!(
        outcome,
        EntryOutcome::Rejected(RejectReason::LiquidationRisk { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn partial_fill_rolls_back_at_post_cancel_quantities() {
    let h = common::harness().await;
    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());

    // Short leg fills 0.3 of 1.0, then another 0.05 races the cancel: the
    // rollback must flatten 0.35, not the 0.3 seen at the decision point.
    h.hyperion.script_partial_fill("BTC", Side::Sell, 0.3);
    h.hyperion.script_late_fill("BTC", Side::Sell, 0.05);

    let outcome = executor.execute(&entry(100_000.0, 100_000.0)).await.unwrap();
    let EntryOutcome::RolledBack(report) = outcome else {
        panic!("expected rollback, got {outcome:?}");
    };

    assert!((report.long_unwound_qty - 1.0).abs() < 1e-9);
    assert!((report.short_unwound_qty - 0.35).abs() < 1e-9);
    assert!(report.cost_usd > 0.0);
    assert!(!report.needs_review, "post-cancel queries succeeded");

    // No exposure remains on either venue and no position row exists.
    assert_eq!(h.driftline.net_position("BTC"), 0.0);
    assert_eq!(h.hyperion.net_position("BTC"), 0.0);
    assert!(
        h.ctx
            .positions
            .active_pair(ACCOUNT, "BTC", LONG_VENUE, SHORT_VENUE)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(h.audit_count("entry_rollback").await, 1);
    assert_eq!(h.notification_count("position_opened").await, 0);
}

#[tokio::test(start_paused = true)]
async fn placement_failure_flattens_the_other_leg() {
    let h = common::harness().await;
    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());

    h.hyperion
        .script_failure(funding_flow::venues::paper::PaperOp::PlaceLimit, "rejected");

    let outcome = executor.execute(&entry(1000.0, 100_000.0)).await.unwrap();
    let EntryOutcome::RolledBack(report) = outcome else {
        panic!("expected rollback, got {outcome:?}");
    };
    assert!(!report.needs_review);
    assert_eq!(h.driftline.net_position("BTC"), 0.0);
    assert_eq!(h.hyperion.net_position("BTC"), 0.0);
}

#[tokio::test(start_paused = true)]
async fn failed_post_cancel_query_flattens_estimate_and_flags_review() {
    let h = common::harness().await;
    let executor = AtomicTwoLegExecutor::new(h.ctx.clone());

    // Short leg never places, so the rollback has no pre-cancel observation
    // for the long leg; its post-cancel query then fails too. The rollback
    // must flatten the full requested quantity, never assume zero.
    h.hyperion
        .script_failure(funding_flow::venues::paper::PaperOp::PlaceLimit, "rejected");
    h.driftline
        .script_failure(funding_flow::venues::paper::PaperOp::QueryOrder, "query down");

    let outcome = executor.execute(&entry(1000.0, 100_000.0)).await.unwrap();
    let EntryOutcome::RolledBack(report) = outcome else {
        panic!("expected rollback, got {outcome:?}");
    };

    assert!(report.needs_review);
    assert!((report.long_unwound_qty - 0.01).abs() < 1e-9);
    // The long leg really did fill and really was flattened.
    assert_eq!(h.driftline.net_position("BTC"), 0.0);
    assert_eq!(h.hyperion.net_position("BTC"), 0.0);

    // The audit trail carries the review marker.
    let flagged: i64 = {
        let conn = h.db.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM audit_log
             WHERE action = 'entry_rollback' AND detail LIKE '%verify residual exposure%'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    };
    assert_eq!(flagged, 1);
}

#[tokio::test]
async fn concurrent_entries_leave_exactly_one_pair() {
    let h = common::harness().await;
    let executor_a = AtomicTwoLegExecutor::new(h.ctx.clone());
    let executor_b = AtomicTwoLegExecutor::new(h.ctx.clone());
    let request = entry(1000.0, 100_000.0);

    let (a, b) = tokio::join!(executor_a.execute(&request), executor_b.execute(&request));
    let outcomes = [a.unwrap(), b.unwrap()];

    let fills = outcomes
        .iter()
        .filter(|o| matches!(o, EntryOutcome::Filled(_)))
        .count();
    assert_eq!(fills, 1, "exactly one entry may win: {outcomes:?}");

    // The loser either rejected pre-flight or rolled its fresh legs back;
    // net exposure is one pair's worth.
    assert!((h.driftline.net_position("BTC") - 0.01).abs() < 1e-9);
    assert!((h.hyperion.net_position("BTC") + 0.01).abs() < 1e-9);
    let active = h.ctx.positions.list_active(Some(ACCOUNT)).await.unwrap();
    assert_eq!(active.len(), 1);
}
