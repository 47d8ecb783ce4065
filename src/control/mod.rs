//! Per-instance control surface: read-only JSON endpoints plus a live BBO
//! push stream, authorized by per-user API keys.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::routing::get;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::monitor::SnapshotCache;

/// One BBO event pushed to control clients.
#[derive(Debug, Clone, Serialize)]
pub struct BboPush {
    pub venue: String,
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub ts: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<Context>,
    pub cache: SnapshotCache,
    pub bbo_tx: broadcast::Sender<BboPush>,
    pub started_at: i64,
}

pub async fn serve(
    ctx: Arc<Context>,
    cache: SnapshotCache,
    bbo_tx: broadcast::Sender<BboPush>,
    started_at: i64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let port = ctx.config.control_api_port;
    let state = AppState {
        ctx,
        cache,
        bbo_tx,
        started_at,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(handlers::status))
        .route("/positions", get(handlers::positions))
        .route("/limits", get(handlers::limits))
        .route("/bbo", get(handlers::bbo_stream))
        .layer(cors)
        .with_state(state);

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding control api to {addr}"))?;
    info!(%addr, "control api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("running control api")
}

/// Keep BBO subscriptions for every open position's legs and fan quotes
/// into the control broadcast. Re-syncs the subscription set periodically
/// as positions open and close.
pub async fn run_bbo_relay(
    ctx: Arc<Context>,
    bbo_tx: broadcast::Sender<BboPush>,
    mut shutdown: watch::Receiver<bool>,
) {
    use std::collections::HashSet;

    let mut tasks: std::collections::HashMap<(String, String), tokio::task::JoinHandle<()>> =
        std::collections::HashMap::new();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    for (_, task) in tasks.drain() {
                        task.abort();
                    }
                    debug!("bbo relay stopping");
                    return;
                }
            }
        }

        let positions = match ctx.positions.list_open(&ctx.account).await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(%err, "bbo relay could not list positions");
                continue;
            }
        };

        let mut wanted: HashSet<(String, String)> = HashSet::new();
        for position in &positions {
            wanted.insert((position.long_venue.clone(), position.symbol.clone()));
            wanted.insert((position.short_venue.clone(), position.symbol.clone()));
        }

        tasks.retain(|key, task| {
            let keep = wanted.contains(key) && !task.is_finished();
            if !keep {
                task.abort();
            }
            keep
        });

        for key in wanted {
            if tasks.contains_key(&key) {
                continue;
            }
            let (venue, symbol) = key.clone();
            let Some(client) = ctx.venue(&venue).cloned() else {
                continue;
            };
            let tx = bbo_tx.clone();
            let handle = tokio::spawn(async move {
                let mut sub = match client.subscribe_bbo(&symbol).await {
                    Ok(sub) => sub,
                    Err(err) => {
                        warn!(%venue, %symbol, %err, "relay subscription failed");
                        return;
                    }
                };
                while let Some(bbo) = sub.recv().await {
                    let _ = tx.send(BboPush {
                        venue: venue.clone(),
                        symbol: symbol.clone(),
                        bid: bbo.bid,
                        ask: bbo.ask,
                        ts: bbo.ts,
                    });
                }
            });
            tasks.insert(key, handle);
        }
    }
}
