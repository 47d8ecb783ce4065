//! Deterministic in-memory venue.
//!
//! Backs `--paper` runs and the integration tests. The book is whatever the
//! test (or paper feed) sets it to; aggressive limits that cross the book
//! fill immediately at the touch, post-only orders that would cross are
//! rejected, and scripted partial/late fills reproduce the racy conditions
//! the executor's rollback path has to survive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AccountBalance, Bbo, BboHub, BboSubscription, LimitOrderRequest, LivePosition, OrderId,
    OrderState, OrderStatus, Side, Tif, VenueClient, VenueError, VenueFundingPayment, VenueResult,
};
use crate::model::{FundingRateSample, MarketMetrics, VenueId, VenueMeta, VenueSymbol};

/// Operations that support one-shot failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    FetchBbo,
    FundingRates,
    MarketData,
    PlaceLimit,
    PlaceMarket,
    Cancel,
    QueryOrder,
    FetchPosition,
    Balance,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    side: Side,
    qty: f64,
    state: OrderState,
    filled_qty: f64,
    avg_price: f64,
    fees_usd: f64,
    /// Extra quantity that "races" the cancel: applied when the cancel
    /// lands, so post-cancel queries see more filled than the decision
    /// point did.
    late_fill_qty: f64,
    trade_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    /// Signed base quantity; positive is long.
    qty: f64,
    entry_price: f64,
    leverage: f64,
}

#[derive(Default)]
struct Inner {
    books: HashMap<String, Bbo>,
    symbols: HashMap<String, VenueSymbol>,
    funding: HashMap<String, FundingRateSample>,
    metrics: HashMap<String, MarketMetrics>,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<OrderId, PaperOrder>,
    last_funding_payment: HashMap<String, VenueFundingPayment>,
    balance: Option<AccountBalance>,
    /// Next order on (symbol, side) fills only this fraction of its qty.
    fill_ratio_scripts: HashMap<(String, Side), f64>,
    /// Next cancel on (symbol, side) first applies this extra fill.
    late_fill_scripts: HashMap<(String, Side), f64>,
    fail_scripts: HashMap<PaperOp, String>,
    next_order_id: u64,
}

pub struct PaperVenue {
    id: VenueId,
    meta: VenueMeta,
    hub: Arc<BboHub>,
    inner: Mutex<Inner>,
}

impl PaperVenue {
    pub fn new(meta: VenueMeta) -> Arc<Self> {
        let id = meta.id.clone();
        Arc::new(PaperVenue {
            hub: BboHub::new(id.clone()),
            id,
            meta,
            inner: Mutex::new(Inner {
                balance: Some(AccountBalance {
                    equity_usd: 1_000_000.0,
                    free_margin_usd: 1_000_000.0,
                }),
                ..Inner::default()
            }),
        })
    }

    // ── Test/paper-feed controls ────────────────────────────────────

    pub async fn set_bbo(&self, symbol: &str, bid: f64, ask: f64) {
        let bbo = Bbo {
            bid,
            ask,
            ts: Utc::now().timestamp_millis(),
        };
        self.inner.lock().unwrap().books.insert(symbol.to_string(), bbo);
        self.hub.publish(symbol, bbo).await;
    }

    pub fn add_symbol(&self, sym: VenueSymbol) {
        let mut inner = self.inner.lock().unwrap();
        inner.symbols.insert(sym.symbol.clone(), sym);
    }

    pub fn set_funding_rate(&self, symbol: &str, rate_native: f64, interval_hours: f64) {
        let sample = FundingRateSample::new(
            self.id.clone(),
            symbol,
            rate_native,
            interval_hours,
            Utc::now().timestamp(),
        );
        self.inner
            .lock()
            .unwrap()
            .funding
            .insert(symbol.to_string(), sample);
    }

    pub fn set_market_metrics(&self, symbol: &str, metrics: MarketMetrics) {
        self.inner
            .lock()
            .unwrap()
            .metrics
            .insert(symbol.to_string(), metrics);
    }

    pub fn set_balance(&self, balance: AccountBalance) {
        self.inner.lock().unwrap().balance = Some(balance);
    }

    pub fn set_last_funding_payment(&self, symbol: &str, payment: VenueFundingPayment) {
        self.inner
            .lock()
            .unwrap()
            .last_funding_payment
            .insert(symbol.to_string(), payment);
    }

    /// Force a synthetic position (e.g. to emulate a liquidated leg).
    pub fn force_position(&self, symbol: &str, signed_qty: f64, entry_price: f64, leverage: f64) {
        let mut inner = self.inner.lock().unwrap();
        if signed_qty == 0.0 {
            inner.positions.remove(symbol);
        } else {
            inner.positions.insert(
                symbol.to_string(),
                PaperPosition {
                    qty: signed_qty,
                    entry_price,
                    leverage,
                },
            );
        }
    }

    /// The next order on `(symbol, side)` fills only `ratio` of its size.
    pub fn script_partial_fill(&self, symbol: &str, side: Side, ratio: f64) {
        self.inner
            .lock()
            .unwrap()
            .fill_ratio_scripts
            .insert((symbol.to_string(), side), ratio.clamp(0.0, 1.0));
    }

    /// The next cancel on `(symbol, side)` first applies `extra_qty` of
    /// fill, as if the fill raced the cancel on the wire.
    pub fn script_late_fill(&self, symbol: &str, side: Side, extra_qty: f64) {
        self.inner
            .lock()
            .unwrap()
            .late_fill_scripts
            .insert((symbol.to_string(), side), extra_qty);
    }

    /// The next call of `op` fails `Unavailable` with `message`.
    pub fn script_failure(&self, op: PaperOp, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_scripts
            .insert(op, message.to_string());
    }

    pub fn open_order_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .count()
    }

    /// Signed base position for assertions (0.0 when flat).
    pub fn net_position(&self, symbol: &str) -> f64 {
        self.inner
            .lock()
            .unwrap()
            .positions
            .get(symbol)
            .map(|p| p.qty)
            .unwrap_or(0.0)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn check_fail(inner: &mut Inner, op: PaperOp) -> VenueResult<()> {
        if let Some(msg) = inner.fail_scripts.remove(&op) {
            return Err(VenueError::Unavailable(msg));
        }
        Ok(())
    }

    fn apply_fill(inner: &mut Inner, symbol: &str, side: Side, qty: f64, price: f64) {
        let pos = inner.positions.entry(symbol.to_string()).or_default();
        let signed = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let new_qty = pos.qty + signed;
        if pos.qty == 0.0 || pos.qty.signum() == signed.signum() {
            // Opening or increasing: weighted-average entry.
            let total = pos.qty.abs() + qty;
            if total > 0.0 {
                pos.entry_price = (pos.entry_price * pos.qty.abs() + price * qty) / total;
            }
        }
        pos.qty = new_qty;
        if pos.leverage == 0.0 {
            pos.leverage = 1.0;
        }
        if pos.qty.abs() < 1e-12 {
            inner.positions.remove(symbol);
        }
    }

    fn execute_order(
        &self,
        inner: &mut Inner,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: Option<f64>,
        tif: Tif,
        post_only: bool,
    ) -> VenueResult<OrderId> {
        let book = inner
            .books
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::Unavailable(format!("no quote for {symbol}")))?;

        let touch = match side {
            Side::Buy => book.ask,
            Side::Sell => book.bid,
        };
        let crosses = match (side, limit_price) {
            (_, None) => true,
            (Side::Buy, Some(px)) => px >= book.ask,
            (Side::Sell, Some(px)) => px <= book.bid,
        };

        if post_only && crosses {
            return Err(VenueError::Validation(format!(
                "post-only order would cross the book on {symbol}"
            )));
        }

        inner.next_order_id += 1;
        let order_id = format!("paper-{}-{}", self.id, inner.next_order_id);

        let mut order = PaperOrder {
            symbol: symbol.to_string(),
            side,
            qty,
            state: OrderState::New,
            filled_qty: 0.0,
            avg_price: 0.0,
            fees_usd: 0.0,
            late_fill_qty: 0.0,
            trade_ids: Vec::new(),
        };

        if crosses {
            let ratio = inner
                .fill_ratio_scripts
                .remove(&(symbol.to_string(), side))
                .unwrap_or(1.0);
            let fill_qty = qty * ratio;
            if fill_qty > 0.0 {
                order.filled_qty = fill_qty;
                order.avg_price = touch;
                order.fees_usd = fill_qty * touch * self.meta.fees.taker;
                order.trade_ids.push(format!("{order_id}-t1"));
                Self::apply_fill(inner, symbol, side, fill_qty, touch);
            }
            order.state = if (fill_qty - qty).abs() < 1e-12 {
                OrderState::Filled
            } else if matches!(tif, Tif::Ioc) {
                // Unfilled remainder of an IOC is gone, but the order stays
                // queryable with its partial fill until cancel confirms it.
                order.late_fill_qty = inner
                    .late_fill_scripts
                    .remove(&(symbol.to_string(), side))
                    .unwrap_or(0.0);
                OrderState::PartiallyFilled
            } else {
                OrderState::PartiallyFilled
            };
        }

        inner.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    fn venue_id(&self) -> &VenueId {
        &self.id
    }

    fn meta(&self) -> &VenueMeta {
        &self.meta
    }

    async fn fetch_bbo(&self, symbol: &str) -> VenueResult<Bbo> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::FetchBbo)?;
        inner
            .books
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::Unavailable(format!("no quote for {symbol}")))
    }

    async fn fetch_funding_rates(&self) -> VenueResult<HashMap<String, FundingRateSample>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::FundingRates)?;
        Ok(inner.funding.clone())
    }

    async fn fetch_market_data(&self) -> VenueResult<HashMap<String, MarketMetrics>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::MarketData)?;
        Ok(inner.metrics.clone())
    }

    async fn fetch_symbols(&self) -> VenueResult<Vec<VenueSymbol>> {
        Ok(self.inner.lock().unwrap().symbols.values().cloned().collect())
    }

    async fn place_limit(&self, order: &LimitOrderRequest) -> VenueResult<OrderId> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::PlaceLimit)?;
        if order.qty <= 0.0 {
            return Err(VenueError::Validation("quantity must be positive".into()));
        }
        self.execute_order(
            &mut inner,
            &order.symbol,
            order.side,
            order.qty,
            Some(order.price),
            order.tif,
            order.post_only,
        )
    }

    async fn place_market(&self, symbol: &str, side: Side, qty: f64) -> VenueResult<OrderId> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::PlaceMarket)?;
        if qty <= 0.0 {
            return Err(VenueError::Validation("quantity must be positive".into()));
        }
        self.execute_order(&mut inner, symbol, side, qty, None, Tif::Ioc, false)
    }

    async fn cancel(&self, order_id: &OrderId) -> VenueResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::Cancel)?;
        let Some(mut order) = inner.orders.get(order_id).cloned() else {
            return Err(VenueError::OrderNotFound(order_id.clone()));
        };
        if order.state.is_terminal() {
            return Ok(());
        }
        if order.late_fill_qty > 0.0 {
            let extra = order
                .late_fill_qty
                .min(order.qty - order.filled_qty)
                .max(0.0);
            if extra > 0.0 {
                let price = if order.avg_price > 0.0 {
                    order.avg_price
                } else {
                    inner
                        .books
                        .get(&order.symbol)
                        .map(|b| match order.side {
                            Side::Buy => b.ask,
                            Side::Sell => b.bid,
                        })
                        .unwrap_or(0.0)
                };
                let total = order.filled_qty + extra;
                order.avg_price = (order.avg_price * order.filled_qty + price * extra) / total;
                order.filled_qty = total;
                order.fees_usd += extra * price * self.meta.fees.taker;
                order.trade_ids.push(format!("{order_id}-late"));
                let (symbol, side) = (order.symbol.clone(), order.side);
                Self::apply_fill(&mut inner, &symbol, side, extra, price);
            }
            order.late_fill_qty = 0.0;
        }
        order.state = if (order.filled_qty - order.qty).abs() < 1e-12 {
            OrderState::Filled
        } else {
            OrderState::Canceled
        };
        inner.orders.insert(order_id.clone(), order);
        Ok(())
    }

    async fn query_order(&self, order_id: &OrderId) -> VenueResult<OrderStatus> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::QueryOrder)?;
        let order = inner
            .orders
            .get(order_id)
            .ok_or_else(|| VenueError::OrderNotFound(order_id.clone()))?;
        Ok(OrderStatus {
            state: order.state,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
            fees_usd: order.fees_usd,
            trade_ids: order.trade_ids.clone(),
        })
    }

    async fn subscribe_bbo(&self, symbol: &str) -> VenueResult<BboSubscription> {
        Ok(self.hub.subscribe(symbol).await)
    }

    async fn fetch_position(&self, symbol: &str) -> VenueResult<Option<LivePosition>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::FetchPosition)?;
        let Some(pos) = inner.positions.get(symbol) else {
            return Ok(None);
        };
        let mark = inner.books.get(symbol).map(|b| b.mid()).unwrap_or(pos.entry_price);
        let side = if pos.qty > 0.0 { Side::Buy } else { Side::Sell };
        let unrealized = (mark - pos.entry_price) * pos.qty;
        let leverage = if pos.leverage > 0.0 { pos.leverage } else { 1.0 };
        // Crude isolated-margin liquidation estimate, good enough for risk
        // distance checks against a synthetic book.
        let liq = match side {
            Side::Buy => pos.entry_price * (1.0 - 0.9 / leverage),
            Side::Sell => pos.entry_price * (1.0 + 0.9 / leverage),
        };
        Ok(Some(LivePosition {
            side,
            qty: pos.qty.abs(),
            entry_price: pos.entry_price,
            unrealized_pnl: unrealized,
            liquidation_price: Some(liq),
            leverage,
            margin_used: pos.entry_price * pos.qty.abs() / leverage,
        }))
    }

    async fn fetch_account_balance(&self) -> VenueResult<AccountBalance> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner, PaperOp::Balance)?;
        inner
            .balance
            .ok_or_else(|| VenueError::Unavailable("no balance".into()))
    }

    async fn fetch_last_funding_payment(
        &self,
        symbol: &str,
    ) -> VenueResult<Option<VenueFundingPayment>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .last_funding_payment
            .get(symbol)
            .cloned())
    }
}
