//! Strategy-instance configuration.
//!
//! The key set is sealed: unknown keys reject at load. Fractions are used
//! for every rate-like field (0.002 = 0.2%).

use std::path::Path;

use anyhow::{Context, Result, bail};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::VenueId;

/// Control ports are assigned from this pool, one per running instance.
pub const CONTROL_PORT_MIN: u16 = 8766;
pub const CONTROL_PORT_MAX: u16 = 8799;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    FundingArbitrage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SymbolsUniverse {
    All,
}

/// Wire endpoints for one venue, resolved by the control plane when it
/// materializes the instance config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VenueEndpoint {
    pub base_url: String,
    pub ws_url: String,
    /// REST requests per second budget for the token bucket.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_sec: f64,
}

fn default_rate_limit() -> f64 {
    10.0
}

/// Sealed configuration for one funding-arbitrage strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub strategy_type: StrategyType,

    /// Symbols to trade. Empty plus `symbols_universe: all` means every
    /// symbol quoted on at least two venues.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols_universe: Option<SymbolsUniverse>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_venue_whitelist: Option<Vec<VenueId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_venue_whitelist: Option<Vec<VenueId>>,
    #[serde(default)]
    pub venue_blacklist: Vec<VenueId>,

    pub size_usd_per_position: f64,

    #[serde(default = "default_max_positions_total")]
    pub max_positions_total: usize,
    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: usize,
    #[serde(default = "default_max_positions_per_venue")]
    pub max_positions_per_venue: usize,
    /// Account-level cap on summed position notional, USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_account_exposure_usd: Option<f64>,

    /// Entry threshold on estimated net profit (divergence − fees).
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: f64,
    /// Entry threshold on raw 8h-normalized divergence.
    #[serde(default)]
    pub min_divergence_pct: f64,

    /// Close when divergence crosses below this (8h-normalized).
    #[serde(default)]
    pub funding_flip_threshold_pct: f64,
    /// Close when PnL gives back this fraction of position size from its
    /// high watermark.
    #[serde(default = "default_trailing_drawdown_pct")]
    pub trailing_drawdown_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_time_limit_hours: Option<f64>,

    #[serde(default = "default_true")]
    pub enable_immediate_profit_taking: bool,
    #[serde(default = "default_realtime_interval")]
    pub realtime_profit_check_interval_sec: f64,
    #[serde(default = "default_min_immediate_profit")]
    pub min_immediate_profit_taking_pct: f64,

    #[serde(default = "default_entry_timeout")]
    pub entry_timeout_sec: f64,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_sec: f64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_sec: f64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_sec: f64,

    /// Reject entries whose estimated liquidation sits within this fraction
    /// of the reference price.
    #[serde(default = "default_liquidation_buffer")]
    pub liquidation_buffer_pct: f64,
    #[serde(default)]
    pub leverage_by_venue: HashMap<VenueId, f64>,

    /// Worst acceptable fill deviation from reference, basis points.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,
    /// Fill tolerance: a leg counts as filled at
    /// `requested × (1 − min_fill_ratio)` or more.
    #[serde(default = "default_min_fill_ratio")]
    pub min_fill_ratio: f64,

    pub control_api_port: u16,

    /// Endpoints per venue; the set of keys is the venue set the instance
    /// trades. Ignored in paper mode.
    #[serde(default)]
    pub venues: HashMap<VenueId, VenueEndpoint>,
}

fn default_max_positions_total() -> usize {
    5
}
fn default_max_positions_per_symbol() -> usize {
    1
}
fn default_max_positions_per_venue() -> usize {
    3
}
fn default_min_profit_pct() -> f64 {
    0.0005
}
fn default_trailing_drawdown_pct() -> f64 {
    0.01
}
fn default_true() -> bool {
    true
}
fn default_realtime_interval() -> f64 {
    1.0
}
fn default_min_immediate_profit() -> f64 {
    0.002
}
fn default_entry_timeout() -> f64 {
    10.0
}
fn default_close_timeout() -> f64 {
    30.0
}
fn default_monitor_interval() -> f64 {
    60.0
}
fn default_scan_interval() -> f64 {
    60.0
}
fn default_liquidation_buffer() -> f64 {
    0.10
}
fn default_max_slippage_bps() -> f64 {
    20.0
}
fn default_min_fill_ratio() -> f64 {
    0.05
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() && self.symbols_universe.is_none() {
            bail!("config: either `symbols` or `symbols_universe: all` is required");
        }
        if self.size_usd_per_position <= 0.0 {
            bail!("config: size_usd_per_position must be positive");
        }
        if self.max_positions_total == 0 {
            bail!("config: max_positions_total must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_fill_ratio) {
            bail!("config: min_fill_ratio must be within [0, 1]");
        }
        if self.entry_timeout_sec <= 0.0
            || self.close_timeout_sec <= 0.0
            || self.monitor_interval_sec <= 0.0
            || self.scan_interval_sec <= 0.0
        {
            bail!("config: timeouts and intervals must be positive");
        }
        if !(CONTROL_PORT_MIN..=CONTROL_PORT_MAX).contains(&self.control_api_port) {
            bail!(
                "config: control_api_port {} outside pool {}-{}",
                self.control_api_port,
                CONTROL_PORT_MIN,
                CONTROL_PORT_MAX
            );
        }
        for (venue, lev) in &self.leverage_by_venue {
            if *lev < 1.0 {
                bail!("config: leverage_by_venue[{venue}] must be >= 1");
            }
        }
        if self.liquidation_buffer_pct < 0.0 || self.liquidation_buffer_pct >= 1.0 {
            bail!("config: liquidation_buffer_pct must be within [0, 1)");
        }
        Ok(())
    }

    pub fn leverage_for(&self, venue: &str) -> f64 {
        self.leverage_by_venue.get(venue).copied().unwrap_or(1.0)
    }
}

/// What the control plane materializes on disk for one spawned instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    pub run_id: i64,
    pub user: String,
    pub account: String,
    pub strategy_name: String,
    /// Path to the shared sqlite database.
    pub db_path: String,
    /// Wire paper venues instead of live adapters.
    #[serde(default)]
    pub paper: bool,
    pub config: StrategyConfig,
}

pub fn load_strategy_config(path: &Path) -> Result<StrategyConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: StrategyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

pub fn load_instance_spec(path: &Path) -> Result<InstanceSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading instance spec {}", path.display()))?;
    let spec: InstanceSpec = serde_json::from_str(&raw)
        .with_context(|| format!("parsing instance spec {}", path.display()))?;
    spec.config.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "strategy_type": "funding_arbitrage",
            "symbols": ["BTC"],
            "size_usd_per_position": 1000.0,
            "control_api_port": 8766,
        })
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: StrategyConfig = serde_json::from_value(minimal()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.monitor_interval_sec, 60.0);
        assert_eq!(config.min_immediate_profit_taking_pct, 0.002);
        assert_eq!(config.leverage_for("anything"), 1.0);
    }

    #[test]
    fn unknown_keys_reject() {
        let mut value = minimal();
        value["surprise_knob"] = serde_json::json!(1);
        assert!(serde_json::from_value::<StrategyConfig>(value).is_err());
    }

    #[test]
    fn port_outside_pool_rejects() {
        let mut value = minimal();
        value["control_api_port"] = serde_json::json!(9000);
        let config: StrategyConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn symbols_or_universe_required() {
        let mut value = minimal();
        value["symbols"] = serde_json::json!([]);
        let config: StrategyConfig = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());

        let mut value = minimal();
        value["symbols"] = serde_json::json!([]);
        value["symbols_universe"] = serde_json::json!("all");
        let config: StrategyConfig = serde_json::from_value(value).unwrap();
        config.validate().unwrap();
    }
}
