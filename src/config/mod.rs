//! Configuration management for the rebalancer.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bithumb API credentials and endpoint settings
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Signal routing and sequencing parameters
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// Lot aging and forced liquidation
    #[serde(default)]
    pub expiry: ExpiryConfig,
    /// Trade history storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Periodic fixed-amount accumulation buy
    #[serde(default)]
    pub accumulation: AccumulationConfig,
    /// Alerting
    #[serde(default)]
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API access key
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing JWTs
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Quote currency of every traded market (e.g. "KRW" in "KRW-ETH")
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    /// Currencies dropped from account snapshots (delisted / point balances)
    #[serde(default = "default_ignored_currencies")]
    pub ignored_currencies: Vec<String>,
    /// Rejection names treated as business-rule outcomes instead of errors
    #[serde(default = "default_non_fatal_rejections")]
    pub non_fatal_rejections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Training window handed to the prediction source (days)
    #[serde(default = "default_train_window_days")]
    pub train_window_days: u32,
    /// Date whose predictions are routed (None = yesterday in exchange time)
    #[serde(default)]
    pub inference_date: Option<NaiveDate>,
    /// Markets never bought or sold by the rebalance phases
    #[serde(default = "default_excluded_markets")]
    pub excluded_markets: BTreeSet<String>,
    /// Scores at or above this quantile go long
    #[serde(default = "default_long_quantile")]
    pub long_quantile: f64,
    /// Scores at or below this quantile go short
    #[serde(default = "default_short_quantile")]
    pub short_quantile: f64,
    /// Fixed wait between the sell and budget phases
    #[serde(default = "default_settlement_wait")]
    pub settlement_wait_secs: u64,
    /// Per-market buy budget is floored to a multiple of this amount
    #[serde(default = "default_budget_unit")]
    pub budget_unit: u64,
    /// Upper bound for polling submitted sells before budgeting.
    /// None keeps the plain fixed wait.
    #[serde(default)]
    pub settlement_poll_timeout_secs: Option<u64>,
    #[serde(default = "default_settlement_poll_interval")]
    pub settlement_poll_interval_secs: u64,
}

/// How the reconciler sizes forced liquidations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedSellMode {
    /// Sell `balance - expired_volume`, the non-expired remainder.
    Remainder,
    /// Sell `min(expired_volume, balance)`.
    ExpiredOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lots older than this many days are eligible for liquidation
    #[serde(default = "default_expire_range_days")]
    pub expire_range_days: u32,
    #[serde(default = "default_forced_sell_mode")]
    pub forced_sell_mode: ForcedSellMode,
    /// Exchange local time offset used for calendar dates (KST = +9)
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_accumulation_market")]
    pub market: String,
    /// KRW spent per accumulation buy
    #[serde(default = "default_trade_unit")]
    pub trade_unit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Slack incoming webhook; notifications go to the log when unset
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
}

// Default value functions
fn default_base_url() -> String {
    "https://api.bithumb.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_quote_currency() -> String {
    "KRW".to_string()
}

fn default_ignored_currencies() -> Vec<String> {
    vec!["P".to_string(), "LUNA2".to_string(), "LUNC".to_string()]
}

fn default_non_fatal_rejections() -> Vec<String> {
    vec![
        "under_min_total_ask".to_string(),
        "under_min_total_bid".to_string(),
    ]
}

fn default_train_window_days() -> u32 {
    365 * 2
}

fn default_excluded_markets() -> BTreeSet<String> {
    BTreeSet::from(["KRW-BTC".to_string()])
}

fn default_long_quantile() -> f64 {
    0.8
}

fn default_short_quantile() -> f64 {
    0.2
}

fn default_settlement_wait() -> u64 {
    30
}

fn default_budget_unit() -> u64 {
    1000
}

fn default_settlement_poll_interval() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_expire_range_days() -> u32 {
    40
}

fn default_forced_sell_mode() -> ForcedSellMode {
    ForcedSellMode::Remainder
}

fn default_utc_offset_hours() -> i32 {
    9
}

fn default_db_path() -> String {
    "data/trade_history.db".to_string()
}

fn default_accumulation_market() -> String {
    "KRW-BTC".to_string()
}

fn default_trade_unit() -> u64 {
    10_000
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("REB")
                    .list_separator(",")
                    .with_list_parse_key("exchange.ignored_currencies")
                    .with_list_parse_key("exchange.non_fatal_rejections")
                    .with_list_parse_key("rebalance.excluded_markets")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let r = &self.rebalance;
        anyhow::ensure!(
            (0.0..=1.0).contains(&r.long_quantile) && (0.0..=1.0).contains(&r.short_quantile),
            "long_quantile and short_quantile must be between 0 and 1"
        );
        anyhow::ensure!(
            r.short_quantile <= r.long_quantile,
            "short_quantile must not exceed long_quantile"
        );
        anyhow::ensure!(r.budget_unit > 0, "budget_unit must be positive");
        anyhow::ensure!(
            r.settlement_poll_timeout_secs.is_none() || r.settlement_poll_interval_secs > 0,
            "settlement_poll_interval_secs must be positive when polling is enabled"
        );
        anyhow::ensure!(
            self.expiry.expire_range_days > 0,
            "expire_range_days must be positive"
        );
        anyhow::ensure!(
            (-12..=14).contains(&self.expiry.utc_offset_hours),
            "utc_offset_hours must be a valid UTC offset"
        );

        Ok(())
    }
}

impl RebalanceConfig {
    pub fn settlement_wait(&self) -> Duration {
        Duration::from_secs(self.settlement_wait_secs)
    }

    /// Configured inference date, or the day before `today`.
    pub fn resolve_inference_date(&self, today: NaiveDate) -> NaiveDate {
        self.inference_date
            .unwrap_or_else(|| today - ChronoDuration::days(1))
    }

    pub fn is_excluded(&self, market: &str) -> bool {
        self.excluded_markets.contains(market)
    }
}

impl ExpiryConfig {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    /// Current calendar date in exchange local time.
    pub fn local_today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset()).date_naive()
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            quote_currency: default_quote_currency(),
            ignored_currencies: default_ignored_currencies(),
            non_fatal_rejections: default_non_fatal_rejections(),
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            train_window_days: default_train_window_days(),
            inference_date: None,
            excluded_markets: default_excluded_markets(),
            long_quantile: default_long_quantile(),
            short_quantile: default_short_quantile(),
            settlement_wait_secs: default_settlement_wait(),
            budget_unit: default_budget_unit(),
            settlement_poll_timeout_secs: None,
            settlement_poll_interval_secs: default_settlement_poll_interval(),
        }
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_range_days: default_expire_range_days(),
            forced_sell_mode: default_forced_sell_mode(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            market: default_accumulation_market(),
            trade_unit: default_trade_unit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.rebalance.is_excluded("KRW-BTC"));
        assert_eq!(config.expiry.forced_sell_mode, ForcedSellMode::Remainder);
    }

    #[test]
    fn test_inverted_quantiles_rejected() {
        let mut config = Config::default();
        config.rebalance.long_quantile = 0.1;
        config.rebalance.short_quantile = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected_only_when_polling() {
        let mut config = Config::default();
        config.rebalance.settlement_poll_interval_secs = 0;
        assert!(config.validate().is_ok());

        config.rebalance.settlement_poll_timeout_secs = Some(60);
        assert!(config.validate().is_err());

        config.rebalance.settlement_poll_interval_secs = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inference_date_defaults_to_yesterday() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut rebalance = RebalanceConfig::default();
        assert_eq!(
            rebalance.resolve_inference_date(today),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );

        let pinned = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        rebalance.inference_date = Some(pinned);
        assert_eq!(rebalance.resolve_inference_date(today), pinned);
    }

    #[test]
    fn test_forced_sell_mode_deserializes_snake_case() {
        let mode: ForcedSellMode = serde_json::from_str("\"expired_only\"").unwrap();
        assert_eq!(mode, ForcedSellMode::ExpiredOnly);
    }
}
