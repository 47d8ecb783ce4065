use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_stream::Stream;

use super::AppState;
use super::auth::{ApiError, AuthUser};

pub async fn status(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let open = state
        .ctx
        .positions
        .list_active(Some(&state.ctx.account))
        .await?;
    let run = match state.ctx.run_id {
        Some(id) => state.ctx.runs.get(id).await?,
        None => None,
    };

    Ok(Json(json!({
        "account": state.ctx.account,
        "strategy": state.ctx.strategy_name,
        "run_id": state.ctx.run_id,
        "status": run.as_ref().map(|r| r.status.as_str()),
        "health": run.as_ref().map(|r| r.health.as_str()),
        "open_positions": open.len(),
        "started_at": state.started_at,
        "uptime_secs": Utc::now().timestamp() - state.started_at,
    })))
}

pub async fn positions(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let active = state
        .ctx
        .positions
        .list_active(Some(&state.ctx.account))
        .await?;
    let snapshots = state.cache.all_fresh().await;

    let rows: Vec<Value> = active
        .iter()
        .map(|p| {
            let snapshot = snapshots.iter().find(|s| s.position_id == p.id);
            json!({
                "position": p,
                "snapshot": snapshot,
            })
        })
        .collect();
    Ok(Json(json!({ "positions": rows })))
}

pub async fn limits(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let config = &state.ctx.config;
    let safety = state.ctx.runs.safety_limits(&auth.user).await?;
    Ok(Json(json!({
        "max_positions_total": config.max_positions_total,
        "max_positions_per_symbol": config.max_positions_per_symbol,
        "max_positions_per_venue": config.max_positions_per_venue,
        "max_account_exposure_usd": config.max_account_exposure_usd,
        "size_usd_per_position": config.size_usd_per_position,
        "safety": {
            "daily_start_limit": safety.daily_start_limit,
            "cooldown_secs": safety.cooldown_secs,
            "max_error_rate": safety.max_error_rate,
        },
    })))
}

/// Live BBO push for the instance's open positions.
pub async fn bbo_stream(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.bbo_tx.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(push) => {
                    let json = serde_json::to_string(&push).unwrap_or_default();
                    yield Ok(Event::default().data(json));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    yield Ok(Event::default().data(format!("{{\"lagged\":{missed}}}")));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream)
}
