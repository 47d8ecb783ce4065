//! Single-close invariant and close accounting.

mod common;

use funding_flow::closer::{CloseOutcome, PositionCloser};
use funding_flow::model::{ExitReason, PositionStatus};
use funding_flow::venues::paper::PaperOp;

#[tokio::test]
async fn concurrent_close_attempts_execute_once() {
    let h = common::harness().await;
    let position = h.open_pair().await;
    let closer = PositionCloser::new(h.ctx.clone());

    // Polling monitor and BBO monitor ask at the same instant.
    let (a, b) = tokio::join!(
        closer.close(position.id, ExitReason::ProfitTarget),
        closer.close(position.id, ExitReason::FundingFlip),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let closed = outcomes
        .iter()
        .filter(|o| matches!(o, CloseOutcome::Closed { .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, CloseOutcome::AlreadyClosing))
        .count();
    assert_eq!((closed, skipped), (1, 1), "{outcomes:?}");

    // Position ended up closed exactly once, one notification row.
    let reloaded = h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PositionStatus::Closed);
    assert_eq!(h.notification_count("position_closed").await, 1);

    // Both venues are flat.
    assert_eq!(h.driftline.net_position("BTC"), 0.0);
    assert_eq!(h.hyperion.net_position("BTC"), 0.0);
}

#[tokio::test]
async fn reclose_returns_stored_outcome() {
    let h = common::harness().await;
    let position = h.open_pair().await;
    let closer = PositionCloser::new(h.ctx.clone());

    let first = closer.close(position.id, ExitReason::ProfitTarget).await.unwrap();
    let CloseOutcome::Closed { realized_pnl_usd } = first else {
        panic!("expected close, got {first:?}");
    };

    let second = closer.close(position.id, ExitReason::UserRequest).await.unwrap();
    let CloseOutcome::Closed { realized_pnl_usd: cached } = second else {
        panic!("expected cached outcome, got {second:?}");
    };
    assert_eq!(cached, realized_pnl_usd);
    assert_eq!(h.notification_count("position_closed").await, 1);
}

#[tokio::test]
async fn realized_pnl_is_fills_plus_funding_minus_fees() {
    let h = common::harness().await;
    let position = h.open_pair().await;

    // One recorded funding settlement of +4 USD.
    h.ctx
        .positions
        .append_funding_payment(&funding_flow::model::FundingPayment {
            position_id: position.id,
            payment_time: position.opened_at + 3600,
            long_payment: 1.0,
            short_payment: 3.0,
            net_payment: 4.0,
            long_rate: 0.0002,
            short_rate: 0.0008,
            divergence: 0.0006,
        })
        .await
        .unwrap();

    // Market moves up 1%: long gains, short loses, spread costs stay.
    h.driftline.set_bbo("BTC", 100_995.0, 101_005.0).await;
    h.hyperion.set_bbo("BTC", 100_995.0, 101_005.0).await;

    let closer = PositionCloser::new(h.ctx.clone());
    let outcome = closer.close(position.id, ExitReason::FundingFlip).await.unwrap();
    let CloseOutcome::Closed { realized_pnl_usd } = outcome else {
        panic!("expected close, got {outcome:?}");
    };

    // Exit prices: long sells into 100_995 bid (entered 100_005), short
    // buys the 101_005 ask (entered 99_995).
    let qty = position.base_qty;
    let price_pnl = (100_995.0 - 100_005.0) * qty + (99_995.0 - 101_005.0) * qty;
    let exit_fees = (100_995.0 + 101_005.0) * qty * 0.0005;
    let expected = price_pnl + 4.0 - position.entry_fees_usd - exit_fees;
    assert!(
        (realized_pnl_usd - expected).abs() < 1e-6,
        "got {realized_pnl_usd}, expected {expected}"
    );

    let reloaded = h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.exit_reason, Some(ExitReason::FundingFlip));
    assert_eq!(reloaded.realized_pnl_usd, Some(realized_pnl_usd));
    assert!(reloaded.closed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn one_sided_failure_marks_error_and_reports_stuck() {
    let h = common::harness().await;
    let position = h.open_pair().await;
    let closer = PositionCloser::new(h.ctx.clone());

    // The short venue refuses everything: limit loop, then market.
    h.hyperion.script_failure(PaperOp::FetchBbo, "quote feed down");
    h.hyperion.script_failure(PaperOp::PlaceMarket, "order gateway down");

    let outcome = closer.close(position.id, ExitReason::TimeLimit).await.unwrap();
    assert!(matches!(outcome, CloseOutcome::Stuck { .. }), "{outcome:?}");

    let reloaded = h.ctx.positions.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PositionStatus::Error);
    assert_eq!(h.audit_count("close_stuck").await, 1);

    // The long leg did flatten; the short residual awaits the operator.
    assert_eq!(h.driftline.net_position("BTC"), 0.0);
    assert!(h.hyperion.net_position("BTC") < 0.0);
}
