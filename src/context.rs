//! Per-instance dependency bundle.
//!
//! Everything cross-cutting (db handles, venue clients, config, notifier)
//! travels through this value; there is no module-level mutable state.

use std::sync::Arc;

use crate::config::StrategyConfig;
use crate::db::accounts::AccountStore;
use crate::db::notify::Notifier;
use crate::db::positions::PositionStore;
use crate::db::rates::RateStore;
use crate::db::runs::RunStore;
use crate::db::Db;
use crate::venues::VenueSet;

pub struct Context {
    pub account: String,
    pub strategy_name: String,
    pub run_id: Option<i64>,
    pub config: StrategyConfig,
    pub db: Db,
    pub venues: VenueSet,
    pub positions: PositionStore,
    pub rates: RateStore,
    pub runs: RunStore,
    pub accounts: AccountStore,
    pub notifier: Notifier,
}

impl Context {
    pub fn new(
        account: impl Into<String>,
        strategy_name: impl Into<String>,
        run_id: Option<i64>,
        config: StrategyConfig,
        db: Db,
        venues: VenueSet,
    ) -> Arc<Self> {
        Arc::new(Context {
            account: account.into(),
            strategy_name: strategy_name.into(),
            run_id,
            config,
            db: db.clone(),
            venues,
            positions: PositionStore::new(db.clone()),
            rates: RateStore::new(db.clone()),
            runs: RunStore::new(db.clone()),
            accounts: AccountStore::new(db.clone()),
            notifier: Notifier::new(db, run_id),
        })
    }

    pub fn venue(&self, id: &str) -> Option<&Arc<dyn crate::venues::VenueClient>> {
        self.venues.get(id)
    }
}
