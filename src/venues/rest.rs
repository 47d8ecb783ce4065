//! Generic signed-REST perp-DEX adapter.
//!
//! Venue-specific SDKs live outside this crate; every venue we integrate
//! speaks a small REST+WebSocket surface that this adapter covers. Symbol
//! metadata is fetched once and cached, per-symbol funding intervals are
//! applied during normalization, and all egress goes through the account's
//! proxy — a non-admin account without an active proxy cannot construct a
//! client at all.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::retry::{TokenBucket, with_retry};
use super::{
    AccountBalance, Bbo, BboHub, BboSubscription, LimitOrderRequest, LivePosition, OrderId,
    OrderState, OrderStatus, Side, VenueClient, VenueError, VenueFundingPayment, VenueResult,
};
use crate::model::{
    FundingRateSample, MarketMetrics, VenueId, VenueMeta, VenueSymbol, effective_interval_hours,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_RECONNECT_BASE: Duration = Duration::from_secs(1);
const WS_RECONNECT_MAX: Duration = Duration::from_secs(60);

/// API key pair, decrypted from the opaque credential blob at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

pub struct RestVenue {
    meta: VenueMeta,
    base_url: String,
    http: reqwest::Client,
    creds: ApiCredentials,
    bucket: TokenBucket,
    hub: Arc<BboHub>,
    /// base symbol → metadata; filled on first use.
    symbols: RwLock<HashMap<String, VenueSymbol>>,
    /// venue-native symbol → base symbol.
    native_to_base: Arc<RwLock<HashMap<String, String>>>,
    ws: WsHandle,
}

struct WsHandle {
    ws_url: String,
    sub_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl RestVenue {
    /// Build a client for one `(account, venue)` pair.
    ///
    /// `proxy` is the account's active egress proxy URL; passing `None` is
    /// only legal for admin accounts.
    pub fn connect(
        meta: VenueMeta,
        base_url: impl Into<String>,
        ws_url: impl Into<String>,
        creds: ApiCredentials,
        proxy: Option<&str>,
        is_admin: bool,
        rate_limit_per_sec: f64,
    ) -> VenueResult<Arc<Self>> {
        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        match proxy {
            Some(url) => {
                let proxy = reqwest::Proxy::all(url).map_err(|e| {
                    VenueError::Validation(format!("invalid proxy url {url}: {e}"))
                })?;
                builder = builder.proxy(proxy);
            }
            None if is_admin => {}
            None => {
                return Err(VenueError::Unauthorized(
                    "account has no active proxy assignment".into(),
                ));
            }
        }
        let http = builder
            .build()
            .map_err(|e| VenueError::Unavailable(format!("building http client: {e}")))?;

        let id = meta.id.clone();
        Ok(Arc::new(RestVenue {
            hub: BboHub::new(id),
            base_url: base_url.into(),
            http,
            creds,
            bucket: TokenBucket::new(
                (rate_limit_per_sec.ceil() as u32).max(1) * 2,
                rate_limit_per_sec.max(0.1),
            ),
            symbols: RwLock::new(HashMap::new()),
            native_to_base: Arc::new(RwLock::new(HashMap::new())),
            ws: WsHandle {
                ws_url: ws_url.into(),
                sub_tx: Mutex::new(None),
            },
            meta,
        }))
    }

    // ── Signed HTTP plumbing ────────────────────────────────────────

    fn sign(&self, ts_ms: i64, method: &Method, path: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(format!("{ts_ms}{method}{path}{body}").as_bytes());
        let digest = mac.finalize().into_bytes();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> VenueResult<T> {
        self.bucket.acquire().await;

        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let ts_ms = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(ts_ms, &method, path, &body_str);

        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("X-FF-KEY", &self.creds.api_key)
            .header("X-FF-TS", ts_ms.to_string())
            .header("X-FF-SIGN", signature);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| VenueError::Unavailable(format!("{url}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| VenueError::Unavailable(format!("{url}: bad payload: {e}")));
        }

        let detail = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VenueError::Unauthorized(detail),
            StatusCode::TOO_MANY_REQUESTS => VenueError::RateLimited,
            StatusCode::NOT_FOUND => VenueError::OrderNotFound(detail),
            s if s.is_client_error() => VenueError::Validation(detail),
            _ => VenueError::Unavailable(format!("{url}: http {status}: {detail}")),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> VenueResult<T> {
        with_retry(path, || self.request(Method::GET, path, None)).await
    }

    // ── Symbol cache ────────────────────────────────────────────────

    async fn ensure_symbols(&self) -> VenueResult<()> {
        if !self.symbols.read().await.is_empty() {
            return Ok(());
        }
        let wire: Vec<WireSymbol> = self.get("/v1/symbols").await?;
        let mut by_base = HashMap::new();
        let mut reverse = HashMap::new();
        for ws in wire {
            if let Some(interval) = ws.funding_interval_hours {
                if (interval - self.meta.funding_interval_hours).abs() > f64::EPSILON {
                    warn!(
                        venue = %self.meta.id,
                        symbol = %ws.base,
                        interval,
                        venue_default = self.meta.funding_interval_hours,
                        "symbol funding interval deviates from venue default"
                    );
                }
            }
            reverse.insert(ws.symbol.clone(), ws.base.clone());
            by_base.insert(
                ws.base.clone(),
                VenueSymbol {
                    venue: self.meta.id.clone(),
                    symbol: ws.base,
                    native_symbol: ws.symbol,
                    tick_size: ws.tick_size,
                    step_size: ws.step_size,
                    min_notional_usd: ws.min_notional_usd,
                    funding_interval_hours: ws.funding_interval_hours,
                },
            );
        }
        info!(venue = %self.meta.id, count = by_base.len(), "loaded symbol metadata");
        *self.symbols.write().await = by_base;
        *self.native_to_base.write().await = reverse;
        Ok(())
    }

    async fn native_symbol(&self, symbol: &str) -> VenueResult<String> {
        self.ensure_symbols().await?;
        self.symbols
            .read()
            .await
            .get(symbol)
            .map(|s| s.native_symbol.clone())
            .ok_or_else(|| {
                VenueError::Validation(format!("unknown symbol {symbol} on {}", self.meta.id))
            })
    }

    // ── WebSocket task ──────────────────────────────────────────────

    async fn ensure_ws_task(&self) -> mpsc::UnboundedSender<String> {
        let mut guard = self.ws.sub_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx.clone());

        let hub = self.hub.clone();
        let ws_url = self.ws.ws_url.clone();
        let venue = self.meta.id.clone();
        let native_to_base = self.native_to_base.clone();
        tokio::spawn(async move {
            ws_loop(venue, ws_url, hub, native_to_base, rx).await;
        });
        tx
    }
}

// One connection lifetime after another, with backoff and subscription
// replay. Mirrors the managed-provider semantics: after every reconnect the
// current BBO for each topic is re-delivered from the hub cache.
async fn ws_loop(
    venue: VenueId,
    ws_url: String,
    hub: Arc<BboHub>,
    native_to_base: Arc<RwLock<HashMap<String, String>>>,
    mut sub_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut wanted: HashSet<String> = HashSet::new();
    let mut delay = WS_RECONNECT_BASE;
    let mut first_connect = true;

    loop {
        // Pick up subscriptions requested while disconnected.
        while let Ok(sym) = sub_rx.try_recv() {
            wanted.insert(sym);
        }

        let (stream, _) = match connect_async(ws_url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(%venue, %e, "bbo websocket connect failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(WS_RECONNECT_MAX);
                continue;
            }
        };
        delay = WS_RECONNECT_BASE;
        let (mut write, mut read) = stream.split();

        let mut replay_failed = false;
        for sym in &wanted {
            if write.send(subscribe_frame(sym)).await.is_err() {
                replay_failed = true;
                break;
            }
        }
        if replay_failed {
            continue;
        }
        if !first_connect {
            info!(%venue, subscriptions = wanted.len(), "bbo websocket reconnected");
            hub.replay_last().await;
        }
        first_connect = false;

        let mut ping = tokio::time::interval(WS_PING_INTERVAL);
        ping.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                cmd = sub_rx.recv() => {
                    let Some(sym) = cmd else { return };
                    if wanted.insert(sym.clone())
                        && write.send(subscribe_frame(&sym)).await.is_err()
                    {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if write.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Ok(quote) = serde_json::from_str::<WireBboEvent>(&text) {
                                let base = native_to_base
                                    .read()
                                    .await
                                    .get(&quote.symbol)
                                    .cloned();
                                if let Some(base) = base {
                                    hub.publish(&base, Bbo {
                                        bid: quote.bid,
                                        ask: quote.ask,
                                        ts: quote.ts,
                                    }).await;
                                } else {
                                    debug!(%venue, symbol = %quote.symbol, "bbo for unmapped symbol");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%venue, %e, "bbo websocket read error");
                            break;
                        }
                    }
                }
            }
        }
        warn!(%venue, "bbo websocket disconnected, reconnecting");
    }
}

fn subscribe_frame(native_symbol: &str) -> WsMessage {
    WsMessage::Text(
        serde_json::json!({
            "op": "subscribe",
            "channel": "bbo",
            "symbol": native_symbol,
        })
        .to_string()
        .into(),
    )
}

// ── Wire DTOs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireSymbol {
    symbol: String,
    base: String,
    tick_size: f64,
    step_size: f64,
    min_notional_usd: f64,
    funding_interval_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireBbo {
    bid: f64,
    ask: f64,
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct WireBboEvent {
    symbol: String,
    bid: f64,
    ask: f64,
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct WireFundingRate {
    symbol: String,
    rate: f64,
    interval_hours: Option<f64>,
    next_payment_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireMarket {
    symbol: String,
    volume_24h_usd: f64,
    open_interest_usd: f64,
    spread_bps: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireOrderAck {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct WireOrderStatus {
    status: String,
    filled_qty: f64,
    avg_price: f64,
    fees_usd: f64,
    #[serde(default)]
    trade_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    side: String,
    qty: f64,
    entry_price: f64,
    unrealized_pnl: f64,
    liquidation_price: Option<f64>,
    leverage: f64,
    margin_used: f64,
}

#[derive(Debug, Deserialize)]
struct WireBalance {
    equity_usd: f64,
    free_margin_usd: f64,
}

#[derive(Debug, Deserialize)]
struct WireFundingPayment {
    time: i64,
    amount_usd: f64,
    rate: f64,
}

fn parse_order_state(s: &str) -> OrderState {
    match s {
        "new" | "open" => OrderState::New,
        "partially_filled" => OrderState::PartiallyFilled,
        "filled" => OrderState::Filled,
        "canceled" | "cancelled" => OrderState::Canceled,
        _ => OrderState::Rejected,
    }
}

// ── Capability surface ──────────────────────────────────────────────

#[async_trait]
impl VenueClient for RestVenue {
    fn venue_id(&self) -> &VenueId {
        &self.meta.id
    }

    fn meta(&self) -> &VenueMeta {
        &self.meta
    }

    async fn fetch_bbo(&self, symbol: &str) -> VenueResult<Bbo> {
        let native = self.native_symbol(symbol).await?;
        let wire: WireBbo = self.get(&format!("/v1/bbo?symbol={native}")).await?;
        if wire.bid <= 0.0 || wire.ask <= 0.0 {
            return Err(VenueError::Unavailable(format!("no fresh quote for {symbol}")));
        }
        Ok(Bbo {
            bid: wire.bid,
            ask: wire.ask,
            ts: wire.ts,
        })
    }

    async fn fetch_funding_rates(&self) -> VenueResult<HashMap<String, FundingRateSample>> {
        self.ensure_symbols().await?;
        let wire: Vec<WireFundingRate> = self.get("/v1/funding").await?;
        let symbols = self.symbols.read().await;
        let reverse = self.native_to_base.read().await;
        let now = chrono::Utc::now().timestamp();

        let mut out = HashMap::new();
        for rate in wire {
            let Some(base) = reverse.get(&rate.symbol) else {
                continue;
            };
            let symbol_override = rate
                .interval_hours
                .or_else(|| symbols.get(base).and_then(|s| s.funding_interval_hours));
            let interval = effective_interval_hours(
                symbol_override,
                Some(self.meta.funding_interval_hours),
            );
            let mut sample = FundingRateSample::new(
                self.meta.id.clone(),
                base.clone(),
                rate.rate,
                interval,
                now,
            );
            sample.next_payment_at = rate.next_payment_at;
            out.insert(base.clone(), sample);
        }
        Ok(out)
    }

    async fn fetch_market_data(&self) -> VenueResult<HashMap<String, MarketMetrics>> {
        self.ensure_symbols().await?;
        let wire: Vec<WireMarket> = self.get("/v1/markets").await?;
        let reverse = self.native_to_base.read().await;
        Ok(wire
            .into_iter()
            .filter_map(|m| {
                let base = reverse.get(&m.symbol)?.clone();
                Some((
                    base,
                    MarketMetrics {
                        volume_24h_usd: m.volume_24h_usd,
                        open_interest_usd: m.open_interest_usd,
                        spread_bps: m.spread_bps,
                    },
                ))
            })
            .collect())
    }

    async fn fetch_symbols(&self) -> VenueResult<Vec<VenueSymbol>> {
        self.ensure_symbols().await?;
        Ok(self.symbols.read().await.values().cloned().collect())
    }

    async fn place_limit(&self, order: &LimitOrderRequest) -> VenueResult<OrderId> {
        let native = self.native_symbol(&order.symbol).await?;
        let body = serde_json::json!({
            "client_id": order.client_id,
            "symbol": native,
            "side": order.side.as_str(),
            "type": "limit",
            "qty": order.qty,
            "price": order.price,
            "tif": match order.tif {
                super::Tif::Ioc => "ioc",
                super::Tif::Gtc => "gtc",
            },
            "post_only": order.post_only,
        });
        // Safe to retry: the venue dedups on client_id.
        let ack: WireOrderAck = with_retry("place_limit", || {
            self.request(Method::POST, "/v1/orders", Some(body.clone()))
        })
        .await?;
        Ok(ack.order_id)
    }

    async fn place_market(&self, symbol: &str, side: Side, qty: f64) -> VenueResult<OrderId> {
        let native = self.native_symbol(symbol).await?;
        let body = serde_json::json!({
            "client_id": uuid::Uuid::new_v4().to_string(),
            "symbol": native,
            "side": side.as_str(),
            "type": "market",
            "qty": qty,
        });
        let ack: WireOrderAck = with_retry("place_market", || {
            self.request(Method::POST, "/v1/orders", Some(body.clone()))
        })
        .await?;
        Ok(ack.order_id)
    }

    async fn cancel(&self, order_id: &OrderId) -> VenueResult<()> {
        let path = format!("/v1/orders/{order_id}");
        let _: serde_json::Value = with_retry("cancel", || {
            self.request(Method::DELETE, &path, None)
        })
        .await?;
        Ok(())
    }

    async fn query_order(&self, order_id: &OrderId) -> VenueResult<OrderStatus> {
        let wire: WireOrderStatus = self.get(&format!("/v1/orders/{order_id}")).await?;
        Ok(OrderStatus {
            state: parse_order_state(&wire.status),
            filled_qty: wire.filled_qty,
            avg_price: wire.avg_price,
            fees_usd: wire.fees_usd,
            trade_ids: wire.trade_ids,
        })
    }

    async fn subscribe_bbo(&self, symbol: &str) -> VenueResult<BboSubscription> {
        let native = self.native_symbol(symbol).await?;
        let tx = self.ensure_ws_task().await;
        let _ = tx.send(native);
        Ok(self.hub.subscribe(symbol).await)
    }

    async fn fetch_position(&self, symbol: &str) -> VenueResult<Option<LivePosition>> {
        let native = self.native_symbol(symbol).await?;
        let wire: Option<WirePosition> =
            self.get(&format!("/v1/positions?symbol={native}")).await?;
        Ok(wire.map(|p| LivePosition {
            side: if p.side == "sell" || p.side == "short" {
                Side::Sell
            } else {
                Side::Buy
            },
            qty: p.qty,
            entry_price: p.entry_price,
            unrealized_pnl: p.unrealized_pnl,
            liquidation_price: p.liquidation_price,
            leverage: p.leverage,
            margin_used: p.margin_used,
        }))
    }

    async fn fetch_account_balance(&self) -> VenueResult<AccountBalance> {
        let wire: WireBalance = self.get("/v1/account").await?;
        Ok(AccountBalance {
            equity_usd: wire.equity_usd,
            free_margin_usd: wire.free_margin_usd,
        })
    }

    async fn fetch_last_funding_payment(
        &self,
        symbol: &str,
    ) -> VenueResult<Option<VenueFundingPayment>> {
        let native = self.native_symbol(symbol).await?;
        let wire: Vec<WireFundingPayment> = self
            .get(&format!("/v1/funding/payments?symbol={native}&limit=1"))
            .await?;
        Ok(wire.into_iter().next().map(|p| VenueFundingPayment {
            payment_time: p.time,
            amount_usd: p.amount_usd,
            rate: p.rate,
        }))
    }
}

