//! PositionStore and RunStore invariants: idempotent creation, funding
//! accounting, status monotonicity.

mod common;

use common::{ACCOUNT, LONG_VENUE, SHORT_VENUE};
use funding_flow::db::positions::{CreateOutcome, NewPosition};
use funding_flow::db::runs::{RunStore, SafetyLimits};
use funding_flow::model::{ExitReason, FundingPayment, PositionStatus, RunStatus};

fn new_position() -> NewPosition {
    NewPosition {
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
        opened_at: 1_700_000_000,
    }
}

fn payment(position_id: i64, payment_time: i64, net: f64) -> FundingPayment {
    FundingPayment {
        position_id,
        payment_time,
        long_payment: -0.1,
        short_payment: net + 0.1,
        net_payment: net,
        long_rate: 0.0002,
        short_rate: 0.0008,
        divergence: 0.0006,
    }
}

#[tokio::test]
async fn create_is_idempotent_per_active_tuple() {
    let h = common::harness().await;
    let store = &h.ctx.positions;

    let first = store.create_open(&new_position()).await.unwrap();
    let CreateOutcome::Created(created) = first else {
        panic!("first insert must create");
    };

    let second = store.create_open(&new_position()).await.unwrap();
    let CreateOutcome::Duplicate(existing) = second else {
        panic!("second insert must dedup");
    };
    assert_eq!(existing.id, created.id);
    assert_eq!(store.list_active(Some(ACCOUNT)).await.unwrap().len(), 1);

    // Closing frees the tuple for a fresh pair.
    store.mark_pending_close(created.id).await.unwrap();
    store
        .close(created.id, ExitReason::FundingFlip, 1.0, 1_700_000_100)
        .await
        .unwrap();
    let third = store.create_open(&new_position()).await.unwrap();
    assert!(matches!(third, CreateOutcome::Created(_)));
}

#[tokio::test]
async fn funding_payments_are_unique_and_sum_to_cumulative() {
    let h = common::harness().await;
    let store = &h.ctx.positions;
    let CreateOutcome::Created(position) = store.create_open(&new_position()).await.unwrap()
    else {
        panic!("create");
    };

    assert!(store.append_funding_payment(&payment(position.id, 100, 2.0)).await.unwrap());
    assert!(store.append_funding_payment(&payment(position.id, 200, 3.0)).await.unwrap());
    // Re-observing the same settlement is a no-op.
    assert!(!store.append_funding_payment(&payment(position.id, 200, 3.0)).await.unwrap());

    let rows = store.funding_payments(position.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    let sum: f64 = rows.iter().map(|p| p.net_payment).sum();

    let reloaded = store.get(position.id).await.unwrap().unwrap();
    assert_eq!(reloaded.funding_payments_count, 2);
    assert!((reloaded.cumulative_funding_usd - sum).abs() < 1e-12);
    assert!((reloaded.cumulative_funding_usd - 5.0).abs() < 1e-12);
}

#[tokio::test]
async fn close_is_idempotent_and_monotonic() {
    let h = common::harness().await;
    let store = &h.ctx.positions;
    let CreateOutcome::Created(position) = store.create_open(&new_position()).await.unwrap()
    else {
        panic!("create");
    };

    assert!(store.mark_pending_close(position.id).await.unwrap());
    // A second pending-close attempt reports "someone got here first".
    assert!(!store.mark_pending_close(position.id).await.unwrap());

    let closed = store
        .close(position.id, ExitReason::ProfitTarget, 12.5, 1_700_000_100)
        .await
        .unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::ProfitTarget));
    assert_eq!(closed.realized_pnl_usd, Some(12.5));

    // Re-close returns the stored row untouched.
    let again = store
        .close(position.id, ExitReason::FundingFlip, -99.0, 1_700_000_999)
        .await
        .unwrap();
    assert_eq!(again.realized_pnl_usd, Some(12.5));
    assert_eq!(again.exit_reason, Some(ExitReason::ProfitTarget));
}

#[tokio::test]
async fn run_state_machine_is_enforced() {
    let h = common::harness().await;
    let runs = RunStore::new(h.db.clone());

    let run = runs.create("user-1", ACCOUNT, "cfg", 8766, 1_700_000_000).await.unwrap();
    assert_eq!(run.status, RunStatus::Starting);
    assert_eq!(run.program_name, format!("fundarb-{}", run.id));

    // First heartbeat flips starting → running.
    runs.heartbeat(run.id, 1_700_000_010).await.unwrap();
    let run = runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let paused = runs.transition(run.id, RunStatus::Paused, None).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    let resumed = runs.transition(run.id, RunStatus::Running, None).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);

    let stopped = runs
        .transition(run.id, RunStatus::Stopped, Some("requested stop"))
        .await
        .unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);

    // Terminal is sticky.
    assert!(runs.transition(run.id, RunStatus::Running, None).await.is_err());
}

#[tokio::test]
async fn safety_limits_round_trip_and_error_rate() {
    let h = common::harness().await;
    let runs = RunStore::new(h.db.clone());

    let defaults = runs.safety_limits("user-1").await.unwrap();
    assert_eq!(defaults.daily_start_limit, 10);
    assert_eq!(defaults.cooldown_secs, 300);

    runs.set_safety_limits(
        "user-1",
        &SafetyLimits {
            daily_start_limit: 3,
            cooldown_secs: 0,
            max_error_rate: 0.5,
            error_rate_window: 10,
        },
    )
    .await
    .unwrap();
    assert_eq!(runs.safety_limits("user-1").await.unwrap().daily_start_limit, 3);

    // Two error finishes out of three: 66% error rate.
    for expect_error in [true, true, false] {
        let run = runs
            .create("user-1", ACCOUNT, "cfg", 8766, 1_700_000_000)
            .await
            .unwrap();
        let next = if expect_error { RunStatus::Error } else { RunStatus::Stopped };
        runs.transition(run.id, next, None).await.unwrap();
    }
    let rate = runs.recent_error_rate("user-1", 10).await.unwrap();
    assert!((rate - 2.0 / 3.0).abs() < 1e-9);
}
