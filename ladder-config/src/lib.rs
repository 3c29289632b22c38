//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    /// Seconds between monitor sweeps over open positions.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EntryConfig {
    /// Signals below this conviction are refused.
    #[serde(default = "default_min_signal_strength")]
    pub min_signal_strength: Decimal,
    /// Premium over best ask applied per entry phase (index 0 = phase 1).
    /// Later phases pay up more to raise fill probability.
    #[serde(default = "default_phase_premiums")]
    pub phase_premiums: [Decimal; 3],
    /// Drop vs. the blended average required before phase 2 / phase 3 adds.
    #[serde(default = "default_phase2_drop")]
    pub phase2_drop_rate: Decimal,
    #[serde(default = "default_phase3_drop")]
    pub phase3_drop_rate: Decimal,
    #[serde(default = "default_stop_atr_mult")]
    pub stop_atr_mult: Decimal,
    /// Stop distance is never tighter than this fraction of entry.
    #[serde(default = "default_min_stop_rate")]
    pub min_stop_rate: Decimal,
    #[serde(default = "default_target_atr_mult")]
    pub target_atr_mult: Decimal,
    /// Target distance is never tighter than this fraction of entry.
    #[serde(default = "default_min_target_rate")]
    pub min_target_rate: Decimal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExitConfig {
    /// Unrealized return that triggers the partial take-profit.
    #[serde(default = "default_partial_tp_rate")]
    pub partial_tp_rate: Decimal,
    /// Fraction of the position sold by the partial take-profit.
    #[serde(default = "default_partial_exit_ratio")]
    pub partial_exit_ratio: Decimal,
    /// Unrealized return required before the trailing stop arms.
    #[serde(default = "default_trailing_activation_rate")]
    pub trailing_activation_rate: Decimal,
    #[serde(default = "default_trailing_atr_mult")]
    pub trailing_atr_mult: Decimal,
    /// Trailing distance is never tighter than this fraction of the high.
    #[serde(default = "default_trailing_min_rate")]
    pub trailing_min_rate: Decimal,
    /// Discount below best bid for urgent exits (stop-loss, trailing).
    #[serde(default = "default_urgent_discount_rate")]
    pub urgent_discount_rate: Decimal,
    /// Discount below best bid for non-urgent exits.
    #[serde(default = "default_normal_discount_rate")]
    pub normal_discount_rate: Decimal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionConfig {
    /// Unfavorable distance from the market, as a fraction, beyond which an
    /// order is refused before any exchange call.
    #[serde(default = "default_max_slippage_rate")]
    pub max_slippage_rate: Decimal,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_fill_timeout_secs")]
    pub fill_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Fraction by which the requested price shifts toward the market on
    /// each retry.
    #[serde(default = "default_retry_price_adjust_rate")]
    pub retry_price_adjust_rate: Decimal,
    /// When true a partial fill is a qualified success; otherwise polling
    /// continues toward a full fill until the timeout.
    #[serde(default = "default_accept_partial_fills")]
    pub accept_partial_fills: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RiskConfig {
    /// Cap on total capital committed to one position, as a balance fraction.
    #[serde(default = "default_max_position_ratio")]
    pub max_position_ratio: Decimal,
    /// Per-phase share of the position budget (index 0 = phase 1).
    #[serde(default = "default_phase_ratios")]
    pub phase_ratios: [Decimal; 3],
    /// Re-entry lockout after a losing trade.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Unrealized loss fraction that forces a full exit regardless of stops.
    #[serde(default = "default_force_exit_loss_rate")]
    pub force_exit_loss_rate: Decimal,
    /// Unrealized loss on one position, as a fraction of the free account
    /// balance, that forces a full exit regardless of stops.
    #[serde(default = "default_account_drawdown_rate")]
    pub account_drawdown_rate: Decimal,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            entry: EntryConfig::default(),
            exit: ExitConfig::default(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            quote_currency: default_quote_currency(),
        }
    }
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            min_signal_strength: default_min_signal_strength(),
            phase_premiums: default_phase_premiums(),
            phase2_drop_rate: default_phase2_drop(),
            phase3_drop_rate: default_phase3_drop(),
            stop_atr_mult: default_stop_atr_mult(),
            min_stop_rate: default_min_stop_rate(),
            target_atr_mult: default_target_atr_mult(),
            min_target_rate: default_min_target_rate(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            partial_tp_rate: default_partial_tp_rate(),
            partial_exit_ratio: default_partial_exit_ratio(),
            trailing_activation_rate: default_trailing_activation_rate(),
            trailing_atr_mult: default_trailing_atr_mult(),
            trailing_min_rate: default_trailing_min_rate(),
            urgent_discount_rate: default_urgent_discount_rate(),
            normal_discount_rate: default_normal_discount_rate(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_slippage_rate: default_max_slippage_rate(),
            poll_interval_ms: default_poll_interval_ms(),
            fill_timeout_secs: default_fill_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_price_adjust_rate: default_retry_price_adjust_rate(),
            accept_partial_fills: default_accept_partial_fills(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_ratio: default_max_position_ratio(),
            phase_ratios: default_phase_ratios(),
            cooldown_secs: default_cooldown_secs(),
            max_consecutive_losses: default_max_consecutive_losses(),
            force_exit_loss_rate: default_force_exit_loss_rate(),
            account_drawdown_rate: default_account_drawdown_rate(),
            max_open_positions: default_max_open_positions(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl EntryConfig {
    /// Ask premium for the given entry phase (1-based).
    #[must_use]
    pub fn phase_premium(&self, phase: u8) -> Decimal {
        let idx = usize::from(phase.clamp(1, 3)) - 1;
        self.phase_premiums[idx]
    }

    /// Required drop vs. the blended average for an add at `phase`.
    #[must_use]
    pub fn drop_threshold(&self, phase: u8) -> Decimal {
        if phase <= 2 {
            self.phase2_drop_rate
        } else {
            self.phase3_drop_rate
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_min_signal_strength() -> Decimal {
    Decimal::new(6, 1) // 0.6
}

fn default_phase_premiums() -> [Decimal; 3] {
    [Decimal::new(5, 4), Decimal::new(1, 3), Decimal::new(15, 4)]
}

fn default_phase2_drop() -> Decimal {
    Decimal::new(15, 3) // 1.5%
}

fn default_phase3_drop() -> Decimal {
    Decimal::new(25, 3) // 2.5%
}

fn default_stop_atr_mult() -> Decimal {
    Decimal::new(15, 1)
}

fn default_min_stop_rate() -> Decimal {
    Decimal::new(2, 2)
}

fn default_target_atr_mult() -> Decimal {
    Decimal::from(2)
}

fn default_min_target_rate() -> Decimal {
    Decimal::new(3, 2)
}

fn default_partial_tp_rate() -> Decimal {
    Decimal::new(25, 3) // 2.5%
}

fn default_partial_exit_ratio() -> Decimal {
    Decimal::new(5, 1)
}

fn default_trailing_activation_rate() -> Decimal {
    Decimal::new(4, 2)
}

fn default_trailing_atr_mult() -> Decimal {
    Decimal::ONE
}

fn default_trailing_min_rate() -> Decimal {
    Decimal::new(15, 3)
}

fn default_urgent_discount_rate() -> Decimal {
    Decimal::new(3, 3) // 0.3%
}

fn default_normal_discount_rate() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_max_slippage_rate() -> Decimal {
    Decimal::new(5, 3) // 0.5%
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_fill_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_retry_price_adjust_rate() -> Decimal {
    Decimal::new(2, 3) // 0.2%
}

fn default_accept_partial_fills() -> bool {
    true
}

fn default_max_position_ratio() -> Decimal {
    Decimal::new(2, 1) // 20%
}

fn default_phase_ratios() -> [Decimal; 3] {
    [Decimal::new(3, 1), Decimal::new(35, 2), Decimal::new(35, 2)]
}

fn default_cooldown_secs() -> u64 {
    1_800
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_force_exit_loss_rate() -> Decimal {
    Decimal::new(5, 2)
}

fn default_account_drawdown_rate() -> Decimal {
    Decimal::new(3, 2)
}

fn default_max_open_positions() -> usize {
    5
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/ladder.db")
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `LADDER_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("LADDER")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_rates() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.entry.phase2_drop_rate, Decimal::new(15, 3));
        assert_eq!(cfg.exit.partial_exit_ratio, Decimal::new(5, 1));
        assert_eq!(cfg.risk.max_position_ratio, Decimal::new(2, 1));
        assert_eq!(cfg.risk.phase_ratios[0], Decimal::new(3, 1));
        assert!(cfg.execution.accept_partial_fills);
    }

    #[test]
    fn phase_helpers_pick_correct_band() {
        let entry = EntryConfig::default();
        assert_eq!(entry.drop_threshold(2), entry.phase2_drop_rate);
        assert_eq!(entry.drop_threshold(3), entry.phase3_drop_rate);
        assert!(entry.phase_premium(3) > entry.phase_premium(1));
    }
}
