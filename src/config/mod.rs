//! Configuration management for the cycle farmer.
//!
//! Loads settings from environment variables and config files. The
//! `tunables` section is additionally editable at runtime through
//! [`ConfigHandle`]; every other section is fixed for the process lifetime.

mod live;

pub use live::{ConfigHandle, SettingChange, SettingError};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Live-editable strategy parameters
    #[serde(default)]
    pub tunables: Tunables,
    /// Poll cadences, settle waits and backoffs
    #[serde(default)]
    pub timing: TimingConfig,
    /// Safety thresholds and tolerances
    #[serde(default)]
    pub risk: RiskConfig,
    /// Traded instrument precision
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Push alert delivery
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Where accepted live overrides are persisted
    #[serde(default = "default_overrides_path")]
    pub overrides_path: String,
}

/// Inclusive range sampled uniformly once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds<T> {
    pub min: T,
    pub max: T,
}

impl<T> Bounds<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: PartialOrd> Bounds<T> {
    /// Whether the range is well-formed (min <= max).
    pub fn is_ordered(&self) -> bool {
        self.min <= self.max
    }
}

/// Strategy parameters that an operator may change while the bot runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunables {
    /// Notional per cycle in USD
    #[serde(default = "default_order_size_usd")]
    pub order_size_usd: Bounds<Decimal>,
    /// Hold duration in seconds
    #[serde(default = "default_hold_secs")]
    pub hold_secs: Bounds<u64>,
    /// Cooldown between cycles in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: Bounds<u64>,
    /// Cancel an unfilled opening order after this many seconds
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    /// Re-quote cadence for remainder and close orders
    #[serde(default = "default_reprice_interval_secs")]
    pub reprice_interval_secs: u64,
    /// Distance outside the maker BBO for close orders (USD)
    /// Higher = safer maker, slower fill
    #[serde(default = "default_close_buffer_usd")]
    pub close_buffer_usd: Decimal,
    /// Opening quote offset from the taker mid (bps)
    #[serde(default = "default_spread_offset_bps")]
    pub spread_offset_bps: Decimal,
    /// Max slippage for taker hedges (bps)
    #[serde(default = "default_hedge_slippage_bps")]
    pub hedge_slippage_bps: u32,
    /// Leverage used on both venues (margin and liquidation estimates)
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Replace venue-mutating calls with logged simulations
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How often to poll positions for fills
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How often to log status while waiting
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// Re-check interval while paused
    #[serde(default = "default_pause_poll_secs")]
    pub pause_poll_secs: u64,
    /// Sleep after a cycle-level failure before the loop resumes
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Sleep after the taker BBO could not be read
    #[serde(default = "default_bbo_backoff_secs")]
    pub bbo_backoff_secs: u64,
    /// Wait before retrying when both opening quotes crossed the book
    #[serde(default = "default_cross_retry_secs")]
    pub cross_retry_secs: u64,
    /// Wait before retrying a single-sided quote that crossed the book
    #[serde(default = "default_post_only_retry_secs")]
    pub post_only_retry_secs: u64,
    /// Wait before re-reading the maker position for dual fills
    #[serde(default = "default_corrective_settle_secs")]
    pub corrective_settle_secs: u64,
    /// Wait after cancelling at timeout before the final fill check
    #[serde(default = "default_cancel_settle_secs")]
    pub cancel_settle_secs: u64,
    /// First wait before trusting the taker position at unwind
    #[serde(default = "default_unwind_settle_secs")]
    pub unwind_settle_secs: u64,
    /// Second wait when the first unwind read is non-flat
    #[serde(default = "default_unwind_recheck_secs")]
    pub unwind_recheck_secs: u64,
    /// How long to poll for flatness after an unwind order
    #[serde(default = "default_unwind_verify_window_secs")]
    pub unwind_verify_window_secs: u64,
    /// Wait after the single unwind retry before the last check
    #[serde(default = "default_unwind_retry_settle_secs")]
    pub unwind_retry_settle_secs: u64,
    /// Liquidation risk check cadence during the hold
    #[serde(default = "default_liquidation_check_secs")]
    pub liquidation_check_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Leveraged leg return that forces an early exit (e.g. -0.80 = -80%)
    #[serde(default = "default_liquidation_threshold")]
    pub liquidation_threshold: Decimal,
    /// Position delta treated as a fill (base units)
    #[serde(default = "default_fill_dust")]
    pub fill_dust: Decimal,
    /// Residual treated as flat at unwind (base units)
    #[serde(default = "default_unwind_dust")]
    pub unwind_dust: Decimal,
    /// Fraction of the target that ends accumulation
    #[serde(default = "default_fill_ratio")]
    pub fill_ratio: Decimal,
    /// Maximum opening attempts per cycle
    #[serde(default = "default_max_fill_attempts")]
    pub max_fill_attempts: u32,
    /// Free collateral must exceed factor * (max order size / leverage)
    #[serde(default = "default_collateral_safety_factor")]
    pub collateral_safety_factor: Decimal,
    /// Slippage allowed when force-closing the taker leg (bps)
    #[serde(default = "default_emergency_slippage_bps")]
    pub emergency_slippage_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Display symbol
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Decimal places for order sizes
    #[serde(default = "default_size_decimals")]
    pub size_decimals: u32,
    /// Maker venue price tick
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Telegram bot token for push alerts
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    /// Telegram chat receiving alerts
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

// Default value functions
fn default_order_size_usd() -> Bounds<Decimal> {
    Bounds::new(Decimal::new(1000, 0), Decimal::new(1300, 0))
}

fn default_hold_secs() -> Bounds<u64> {
    Bounds::new(10 * 60, 15 * 60)
}

fn default_cooldown_secs() -> Bounds<u64> {
    Bounds::new(3 * 60, 5 * 60)
}

fn default_order_timeout_secs() -> u64 {
    5 * 60
}

fn default_reprice_interval_secs() -> u64 {
    30
}

fn default_close_buffer_usd() -> Decimal {
    Decimal::new(20, 0)
}

fn default_spread_offset_bps() -> Decimal {
    Decimal::new(4, 0)
}

fn default_hedge_slippage_bps() -> u32 {
    10
}

fn default_leverage() -> u32 {
    40
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_status_interval_secs() -> u64 {
    30
}

fn default_pause_poll_secs() -> u64 {
    1
}

fn default_error_backoff_secs() -> u64 {
    10
}

fn default_bbo_backoff_secs() -> u64 {
    10
}

fn default_cross_retry_secs() -> u64 {
    3
}

fn default_post_only_retry_secs() -> u64 {
    2
}

fn default_corrective_settle_secs() -> u64 {
    1
}

fn default_cancel_settle_secs() -> u64 {
    1
}

fn default_unwind_settle_secs() -> u64 {
    5
}

fn default_unwind_recheck_secs() -> u64 {
    3
}

fn default_unwind_verify_window_secs() -> u64 {
    20
}

fn default_unwind_retry_settle_secs() -> u64 {
    5
}

fn default_liquidation_check_secs() -> u64 {
    15
}

fn default_liquidation_threshold() -> Decimal {
    // At 40x this is roughly a 2% adverse move; exits before bankruptcy at -100%
    Decimal::new(-80, 2)
}

fn default_fill_dust() -> Decimal {
    Decimal::new(1, 5) // 0.00001
}

fn default_unwind_dust() -> Decimal {
    Decimal::new(5, 6) // 0.000005
}

fn default_fill_ratio() -> Decimal {
    Decimal::new(95, 2)
}

fn default_max_fill_attempts() -> u32 {
    10
}

fn default_collateral_safety_factor() -> Decimal {
    Decimal::new(15, 1)
}

fn default_emergency_slippage_bps() -> u32 {
    50
}

fn default_symbol() -> String {
    "BTC".to_string()
}

fn default_size_decimals() -> u32 {
    5
}

fn default_price_tick() -> Decimal {
    Decimal::new(1, 1)
}

fn default_overrides_path() -> String {
    "config_overrides.json".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from a specific file stem (extension optional).
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__").prefix("CYCLE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.tunables.validate()?;

        anyhow::ensure!(
            self.risk.liquidation_threshold < Decimal::ZERO
                && self.risk.liquidation_threshold > -Decimal::ONE,
            "liquidation_threshold must be between -1 and 0"
        );

        anyhow::ensure!(
            self.risk.fill_ratio > Decimal::ZERO && self.risk.fill_ratio <= Decimal::ONE,
            "fill_ratio must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.fill_dust > Decimal::ZERO && self.risk.unwind_dust > Decimal::ZERO,
            "dust tolerances must be positive"
        );

        anyhow::ensure!(self.risk.max_fill_attempts >= 1, "max_fill_attempts must be >= 1");

        anyhow::ensure!(
            self.timing.poll_interval_secs >= 1 && self.timing.liquidation_check_secs >= 1,
            "poll and liquidation check intervals must be >= 1s"
        );

        anyhow::ensure!(
            self.instrument.price_tick > Decimal::ZERO,
            "price_tick must be positive"
        );

        Ok(())
    }
}

impl Tunables {
    /// Validate a complete tunables value.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.order_size_usd.min > Decimal::ZERO && self.order_size_usd.is_ordered(),
            "order_size_usd must be positive with min <= max"
        );
        anyhow::ensure!(self.hold_secs.is_ordered(), "hold_secs min must be <= max");
        anyhow::ensure!(
            self.cooldown_secs.is_ordered(),
            "cooldown_secs min must be <= max"
        );
        anyhow::ensure!(self.order_timeout_secs > 0, "order_timeout_secs must be > 0");
        anyhow::ensure!(
            self.reprice_interval_secs > 0,
            "reprice_interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.close_buffer_usd >= Decimal::ZERO,
            "close_buffer_usd must be >= 0"
        );
        anyhow::ensure!(
            self.spread_offset_bps >= Decimal::ZERO,
            "spread_offset_bps must be >= 0"
        );
        anyhow::ensure!(
            self.leverage >= 1 && self.leverage <= 200,
            "leverage must be between 1 and 200"
        );
        Ok(())
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn reprice_interval(&self) -> Duration {
        Duration::from_secs(self.reprice_interval_secs)
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn liquidation_check(&self) -> Duration {
        Duration::from_secs(self.liquidation_check_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunables: Tunables::default(),
            timing: TimingConfig::default(),
            risk: RiskConfig::default(),
            instrument: InstrumentConfig::default(),
            alerts: AlertConfig::default(),
            overrides_path: default_overrides_path(),
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            order_size_usd: default_order_size_usd(),
            hold_secs: default_hold_secs(),
            cooldown_secs: default_cooldown_secs(),
            order_timeout_secs: default_order_timeout_secs(),
            reprice_interval_secs: default_reprice_interval_secs(),
            close_buffer_usd: default_close_buffer_usd(),
            spread_offset_bps: default_spread_offset_bps(),
            hedge_slippage_bps: default_hedge_slippage_bps(),
            leverage: default_leverage(),
            dry_run: false,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            status_interval_secs: default_status_interval_secs(),
            pause_poll_secs: default_pause_poll_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            bbo_backoff_secs: default_bbo_backoff_secs(),
            cross_retry_secs: default_cross_retry_secs(),
            post_only_retry_secs: default_post_only_retry_secs(),
            corrective_settle_secs: default_corrective_settle_secs(),
            cancel_settle_secs: default_cancel_settle_secs(),
            unwind_settle_secs: default_unwind_settle_secs(),
            unwind_recheck_secs: default_unwind_recheck_secs(),
            unwind_verify_window_secs: default_unwind_verify_window_secs(),
            unwind_retry_settle_secs: default_unwind_retry_settle_secs(),
            liquidation_check_secs: default_liquidation_check_secs(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            liquidation_threshold: default_liquidation_threshold(),
            fill_dust: default_fill_dust(),
            unwind_dust: default_unwind_dust(),
            fill_ratio: default_fill_ratio(),
            max_fill_attempts: default_max_fill_attempts(),
            collateral_safety_factor: default_collateral_safety_factor(),
            emergency_slippage_bps: default_emergency_slippage_bps(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            size_decimals: default_size_decimals(),
            price_tick: default_price_tick(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = Config::default();
        config.tunables.order_size_usd = Bounds::new(dec!(1500), dec!(1000));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_positive_liquidation_threshold_rejected() {
        let mut config = Config::default();
        config.risk.liquidation_threshold = dec!(0.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_match_empirical_constants() {
        let config = Config::default();
        assert_eq!(config.risk.unwind_dust, dec!(0.000005));
        assert_eq!(config.risk.fill_dust, dec!(0.00001));
        assert_eq!(config.risk.liquidation_threshold, dec!(-0.80));
        assert_eq!(config.timing.liquidation_check(), Duration::from_secs(15));
    }
}
