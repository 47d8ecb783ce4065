//! Shared fixtures: two paper venues, an in-memory database, and a wired
//! context.

use std::sync::Arc;

use funding_flow::collector::FundingCollector;
use funding_flow::config::StrategyConfig;
use funding_flow::context::Context;
use funding_flow::db::{self, Db};
use funding_flow::model::{FeeSchedule, FundingRateSample, MarketMetrics, VenueMeta, VenueSymbol};
use funding_flow::venues::paper::PaperVenue;
use funding_flow::venues::{VenueClient, VenueSet};

pub const LONG_VENUE: &str = "driftline";
pub const SHORT_VENUE: &str = "hyperion";
pub const ACCOUNT: &str = "acct-1";

pub struct Harness {
    pub ctx: Arc<Context>,
    pub db: Db,
    /// 1h funding interval, plays venue_A / the short leg in most tests.
    pub hyperion: Arc<PaperVenue>,
    /// 8h funding interval, plays venue_B / the long leg.
    pub driftline: Arc<PaperVenue>,
}

pub fn venue_meta(id: &str, funding_interval_hours: f64) -> VenueMeta {
    VenueMeta {
        id: id.to_string(),
        funding_interval_hours,
        fees: FeeSchedule {
            maker: 0.0002,
            taker: 0.0005,
        },
        supports_post_only: true,
    }
}

pub fn btc_symbol(venue: &str) -> VenueSymbol {
    VenueSymbol {
        venue: venue.to_string(),
        symbol: "BTC".to_string(),
        native_symbol: format!("BTC-PERP-{venue}"),
        tick_size: 0.5,
        step_size: 0.001,
        min_notional_usd: 10.0,
        funding_interval_hours: None,
    }
}

pub fn test_config() -> StrategyConfig {
    serde_json::from_value(serde_json::json!({
        "strategy_type": "funding_arbitrage",
        "symbols": ["BTC"],
        "size_usd_per_position": 1000.0,
        "control_api_port": 8766,
        "entry_timeout_sec": 2.0,
        "close_timeout_sec": 2.0,
        "min_divergence_pct": 0.0001,
        "min_profit_pct": -1.0,
    }))
    .expect("test config is valid")
}

pub async fn harness() -> Harness {
    harness_with_config(test_config()).await
}

pub async fn harness_with_config(config: StrategyConfig) -> Harness {
    let db = db::open_in_memory().expect("in-memory db");

    let hyperion = PaperVenue::new(venue_meta(SHORT_VENUE, 1.0));
    let driftline = PaperVenue::new(venue_meta(LONG_VENUE, 8.0));
    for venue in [&hyperion, &driftline] {
        venue.add_symbol(btc_symbol(venue.venue_id()));
        venue.set_bbo("BTC", 99_995.0, 100_005.0).await;
    }

    let mut venues = VenueSet::new();
    venues.insert(
        SHORT_VENUE.to_string(),
        hyperion.clone() as Arc<dyn VenueClient>,
    );
    venues.insert(
        LONG_VENUE.to_string(),
        driftline.clone() as Arc<dyn VenueClient>,
    );

    let ctx = Context::new(ACCOUNT, "fundarb-test", None, config, db.clone(), venues);

    // Seed venues + venue_symbols tables from the adapters.
    FundingCollector::new(ctx.clone())
        .sync_metadata()
        .await
        .expect("metadata sync");

    Harness {
        ctx,
        db,
        hyperion,
        driftline,
    }
}

impl Harness {
    /// Open a real 0.01 BTC pair through the executor (long driftline,
    /// short hyperion) so both paper venues hold the legs.
    pub async fn open_pair(&self) -> funding_flow::model::PairedPosition {
        let executor = funding_flow::executor::AtomicTwoLegExecutor::new(self.ctx.clone());
        let outcome = executor
            .execute(&funding_flow::executor::EntryRequest {
                symbol: "BTC".to_string(),
                long_venue: LONG_VENUE.to_string(),
                short_venue: SHORT_VENUE.to_string(),
                size_usd: 1000.0,
                reference_price: 100_000.0,
                long_rate_8h: 0.0002,
                short_rate_8h: 0.0008,
            })
            .await
            .expect("entry");
        match outcome {
            funding_flow::executor::EntryOutcome::Filled(position) => position,
            other => panic!("expected fill, got {other:?}"),
        }
    }

    /// Record one normalized funding sample in the latest-rates store.
    pub async fn record_rate(&self, venue: &str, rate_native: f64, interval_hours: f64) {
        let sample = FundingRateSample::new(
            venue,
            "BTC",
            rate_native,
            interval_hours,
            chrono::Utc::now().timestamp(),
        );
        self.ctx.rates.record_sample(&sample).await.expect("record rate");
    }

    pub async fn record_metrics(&self, venue: &str) {
        self.ctx
            .rates
            .update_market_metrics(
                venue,
                "BTC",
                &MarketMetrics {
                    volume_24h_usd: 5_000_000.0,
                    open_interest_usd: 20_000_000.0,
                    spread_bps: Some(1.0),
                },
            )
            .await
            .expect("record metrics");
    }

    pub async fn notification_count(&self, kind: &str) -> i64 {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM strategy_notifications WHERE notification_type = ?1",
            [kind],
            |row| row.get(0),
        )
        .expect("counting notifications")
    }

    pub async fn audit_count(&self, action: &str) -> i64 {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE action = ?1",
            [action],
            |row| row.get(0),
        )
        .expect("counting audit rows")
    }
}
