//! Configuration management for the backtester.
//!
//! Loads settings from an optional config file and environment variables.
//! Every field has a default, so an empty source yields a runnable setup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::TimeframeStack;

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Replay scope: capital, symbols, timeframes
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Fill model: slippage and fees
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Account-wide risk limits and sizing
    #[serde(default)]
    pub risk: RiskConfig,
    /// Exit management beyond the candidate's own stop and targets
    #[serde(default)]
    pub exits: ExitConfig,
    /// Reference strategy parameters
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Data loading and quality tolerances
    #[serde(default)]
    pub data: DataConfig,
    /// Performance metric conventions
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Train/test split and verdict tolerances
    #[serde(default)]
    pub walk_forward: WalkForwardSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSettings {
    /// Starting account equity in quote currency
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Symbols to replay
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Benchmark symbol limited to a single open position system-wide
    #[serde(default = "default_primary_symbol")]
    pub primary_symbol: Option<String>,
    /// Trend / setup / entry granularities
    #[serde(default)]
    pub timeframes: TimeframeStack,
    /// Maximum candles per timeframe handed to the oracle
    #[serde(default = "default_view_depth")]
    pub view_depth: usize,
    /// Optional replay start (inclusive, by tick close time)
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// Optional replay end (exclusive, by tick close time)
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Adverse slippage applied to every fill (0.0005 = 0.05%)
    #[serde(default = "default_slippage")]
    pub slippage: Decimal,
    /// Extra adverse slippage on stop-triggered exits
    #[serde(default = "default_stop_slippage")]
    pub stop_slippage: Decimal,
    /// Taker fee rate on notional, charged on entry and every exit
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
    /// Max relative distance between a candidate's entry price and the tick close
    #[serde(default = "default_max_entry_deviation")]
    pub max_entry_deviation: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade (0.01 = 1%)
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: Decimal,
    /// Notional cap as a multiple of equity; also sets margin per position
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// Smallest notional worth opening
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Open positions allowed across all symbols
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Losing trades in a row that start a cooldown
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Cooldown length in hours
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u32,
    /// Weekly loss cap as a fraction of week-start equity
    #[serde(default = "default_max_weekly_loss")]
    pub max_weekly_loss: Decimal,
    /// Optional daily loss cap as a fraction of day-start equity
    #[serde(default)]
    pub max_daily_loss: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Stop ratchet after the n-th take-profit, in R behind entry.
    /// `[0.5, 0.0]` moves the stop to -0.5R after TP1 and breakeven after TP2.
    #[serde(default)]
    pub stop_ratchet: Vec<Decimal>,
    #[serde(default)]
    pub adaptive: AdaptiveStopConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveStopConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unrealized profit, in R, required before protection may arm
    #[serde(default = "default_min_profit_r")]
    pub min_profit_r: Decimal,
    /// Current ATR / entry ATR ratio that counts as a volatility spike
    #[serde(default = "default_volatility_spike")]
    pub volatility_spike: Decimal,
    /// Arm on a trending -> ranging regime change
    #[serde(default = "default_true")]
    pub regime_change: bool,
    /// Protected stop offset from entry (0.0015 = 0.15%)
    #[serde(default = "default_breakeven_buffer")]
    pub breakeven_buffer: Decimal,
    /// Exit only part of the position at the protected stop
    #[serde(default = "default_true")]
    pub partial_protection: bool,
    /// Share of the original size closed by a partial-protection exit
    #[serde(default = "default_protection_fraction")]
    pub protection_fraction: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_htf_ema")]
    pub htf_ema: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_adx_period")]
    pub adx_period: usize,
    /// ADX above this is trending
    #[serde(default = "default_adx_trending")]
    pub adx_trending: f64,
    /// ATR / ATR-average above this is high volatility
    #[serde(default = "default_high_vol_ratio")]
    pub high_vol_ratio: f64,
    /// ATR / ATR-average below this is low volatility
    #[serde(default = "default_low_vol_ratio")]
    pub low_vol_ratio: f64,
    /// Initial stop distance in ATR
    #[serde(default = "default_atr_stop_multiplier")]
    pub atr_stop_multiplier: Decimal,
    /// Hard cap on stop distance in ATR
    #[serde(default = "default_max_stop_atr")]
    pub max_stop_atr: Decimal,
    /// Take-profit distances in R
    #[serde(default = "default_tp_r_multiples")]
    pub tp_r_multiples: Vec<Decimal>,
    /// Share of the original size closed at each take-profit
    #[serde(default = "default_tp_fractions")]
    pub tp_fractions: Vec<Decimal>,
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    /// Stricter threshold while the account is in drawdown
    #[serde(default = "default_drawdown_min_score")]
    pub drawdown_min_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding `<SYMBOL>_<tf>.csv` files
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Consecutive missing candles tolerated before a gap is a fault
    #[serde(default = "default_max_gap_candles")]
    pub max_gap_candles: u32,
    /// Per-load timeout for the pre-loading stage
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
}

/// Return series used for the Sharpe ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharpeBasis {
    /// Per-tick equity returns
    #[default]
    Equity,
    /// Per-trade returns on equity at entry
    Trade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Annual risk-free rate (0.04 = 4%)
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Annualization factor; derived from the return basis when unset
    #[serde(default)]
    pub periods_per_year: Option<f64>,
    #[serde(default)]
    pub sharpe_basis: SharpeBasis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardSettings {
    /// Share of the timeline used for training (by time, not trades)
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,
    /// Test return must reach this share of a positive train return
    #[serde(default = "default_return_tolerance")]
    pub return_tolerance: f64,
    /// Allowed win-rate drop, absolute (0.10 = 10 points)
    #[serde(default = "default_win_rate_tolerance")]
    pub win_rate_tolerance: f64,
    /// Test profit factor must reach this share of train
    #[serde(default = "default_profit_factor_tolerance")]
    pub profit_factor_tolerance: f64,
    /// Test drawdown may be at most this multiple of train
    #[serde(default = "default_drawdown_tolerance")]
    pub drawdown_tolerance: f64,
    /// Train return at or above this counts as strongly positive
    #[serde(default = "default_strong_train_return")]
    pub strong_train_return: f64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_initial_capital() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_primary_symbol() -> Option<String> {
    Some("BTCUSDT".to_string())
}

fn default_view_depth() -> usize {
    200
}

fn default_slippage() -> Decimal {
    Decimal::new(5, 4) // 0.05%
}

fn default_stop_slippage() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_taker_fee() -> Decimal {
    Decimal::new(55, 5) // 0.055%
}

fn default_max_entry_deviation() -> Decimal {
    Decimal::new(5, 3) // 0.5%
}

fn default_risk_per_trade() -> Decimal {
    Decimal::new(1, 2) // 1%
}

fn default_max_leverage() -> Decimal {
    Decimal::new(15, 0)
}

fn default_min_notional() -> Decimal {
    Decimal::new(5, 0)
}

fn default_max_open_positions() -> usize {
    3
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_cooldown_hours() -> u32 {
    12
}

fn default_max_weekly_loss() -> Decimal {
    Decimal::new(6, 2) // 6%
}

fn default_min_profit_r() -> Decimal {
    Decimal::new(4, 1)
}

fn default_volatility_spike() -> Decimal {
    Decimal::new(16, 1)
}

fn default_breakeven_buffer() -> Decimal {
    Decimal::new(15, 4) // 0.15%
}

fn default_protection_fraction() -> Decimal {
    Decimal::new(5, 1)
}

fn default_ema_fast() -> usize {
    21
}

fn default_ema_slow() -> usize {
    50
}

fn default_htf_ema() -> usize {
    50
}

fn default_atr_period() -> usize {
    14
}

fn default_adx_period() -> usize {
    14
}

fn default_adx_trending() -> f64 {
    25.0
}

fn default_high_vol_ratio() -> f64 {
    1.5
}

fn default_low_vol_ratio() -> f64 {
    0.7
}

fn default_atr_stop_multiplier() -> Decimal {
    Decimal::new(25, 1)
}

fn default_max_stop_atr() -> Decimal {
    Decimal::new(2, 0)
}

fn default_tp_r_multiples() -> Vec<Decimal> {
    vec![Decimal::new(15, 1), Decimal::new(25, 1), Decimal::new(35, 1)]
}

fn default_tp_fractions() -> Vec<Decimal> {
    vec![Decimal::new(5, 1), Decimal::new(3, 1), Decimal::new(2, 1)]
}

fn default_min_score() -> u32 {
    70
}

fn default_drawdown_min_score() -> u32 {
    85
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_max_gap_candles() -> u32 {
    2
}

fn default_load_timeout_secs() -> u64 {
    60
}

fn default_train_fraction() -> f64 {
    0.7
}

fn default_return_tolerance() -> f64 {
    0.5
}

fn default_win_rate_tolerance() -> f64 {
    0.10
}

fn default_profit_factor_tolerance() -> f64 {
    0.7
}

fn default_drawdown_tolerance() -> f64 {
    1.5
}

fn default_strong_train_return() -> f64 {
    0.05
}

impl Config {
    /// Load configuration from environment variables and config files.
    ///
    /// Environment keys use the `MTF` prefix and `__` as section separator,
    /// e.g. `MTF_RISK__MAX_WEEKLY_LOSS=0.05`.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("MTF")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("backtest.symbols")
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
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;
        let non_negative_rate = |v: Decimal| v >= Decimal::ZERO && v < Decimal::ONE;

        anyhow::ensure!(
            self.backtest.initial_capital > Decimal::ZERO,
            "initial_capital must be positive"
        );
        anyhow::ensure!(!self.backtest.symbols.is_empty(), "at least one symbol is required");
        anyhow::ensure!(
            self.backtest.timeframes.is_ordered(),
            "timeframes must satisfy entry < primary < htf"
        );
        anyhow::ensure!(self.backtest.view_depth > 0, "view_depth must be positive");
        if let (Some(start), Some(end)) = (self.backtest.start, self.backtest.end) {
            anyhow::ensure!(start < end, "backtest start must be before end");
        }

        anyhow::ensure!(
            non_negative_rate(self.execution.slippage)
                && non_negative_rate(self.execution.stop_slippage)
                && non_negative_rate(self.execution.taker_fee),
            "slippage, stop_slippage and taker_fee must be in [0, 1)"
        );
        anyhow::ensure!(
            self.execution.max_entry_deviation >= Decimal::ZERO,
            "max_entry_deviation must be non-negative"
        );

        anyhow::ensure!(
            unit(self.risk.risk_per_trade),
            "risk_per_trade must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.max_leverage >= Decimal::ONE,
            "max_leverage must be >= 1"
        );
        anyhow::ensure!(
            self.risk.max_open_positions >= 1,
            "max_open_positions must be >= 1"
        );
        anyhow::ensure!(
            self.risk.max_consecutive_losses >= 1,
            "max_consecutive_losses must be >= 1"
        );
        anyhow::ensure!(
            unit(self.risk.max_weekly_loss),
            "max_weekly_loss must be between 0 and 1"
        );
        if let Some(daily) = self.risk.max_daily_loss {
            anyhow::ensure!(unit(daily), "max_daily_loss must be between 0 and 1");
        }

        anyhow::ensure!(
            self.exits.stop_ratchet.iter().all(|r| *r >= Decimal::ZERO && *r <= Decimal::ONE),
            "stop_ratchet entries must be in [0, 1] R"
        );
        let adaptive = &self.exits.adaptive;
        anyhow::ensure!(
            adaptive.min_profit_r >= Decimal::ZERO,
            "adaptive.min_profit_r must be non-negative"
        );
        anyhow::ensure!(
            adaptive.volatility_spike > Decimal::ONE,
            "adaptive.volatility_spike must exceed 1"
        );
        anyhow::ensure!(
            non_negative_rate(adaptive.breakeven_buffer),
            "adaptive.breakeven_buffer must be in [0, 1)"
        );
        anyhow::ensure!(
            unit(adaptive.protection_fraction),
            "adaptive.protection_fraction must be between 0 and 1"
        );

        let strategy = &self.strategy;
        anyhow::ensure!(
            strategy.ema_fast > 0 && strategy.ema_fast < strategy.ema_slow,
            "ema_fast must be positive and below ema_slow"
        );
        anyhow::ensure!(
            strategy.tp_r_multiples.len() == strategy.tp_fractions.len()
                && !strategy.tp_fractions.is_empty(),
            "tp_r_multiples and tp_fractions must have the same non-zero length"
        );
        anyhow::ensure!(
            strategy.tp_r_multiples.windows(2).all(|w| w[0] < w[1]),
            "tp_r_multiples must be strictly ascending"
        );
        let fraction_sum: Decimal = strategy.tp_fractions.iter().sum();
        anyhow::ensure!(
            strategy.tp_fractions.iter().all(|f| *f > Decimal::ZERO) && fraction_sum <= Decimal::ONE,
            "tp_fractions must be positive and sum to at most 1"
        );

        anyhow::ensure!(
            self.data.load_timeout_secs > 0,
            "load_timeout_secs must be positive"
        );

        anyhow::ensure!(
            self.metrics.periods_per_year.map_or(true, |p| p > 0.0),
            "periods_per_year must be positive"
        );

        let wf = &self.walk_forward;
        anyhow::ensure!(
            wf.train_fraction > 0.0 && wf.train_fraction < 1.0,
            "train_fraction must be between 0 and 1 (exclusive)"
        );
        anyhow::ensure!(
            wf.return_tolerance >= 0.0 && wf.win_rate_tolerance >= 0.0,
            "walk-forward tolerances must be non-negative"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backtest: BacktestSettings::default(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            exits: ExitConfig::default(),
            strategy: StrategyConfig::default(),
            data: DataConfig::default(),
            metrics: MetricsConfig::default(),
            walk_forward: WalkForwardSettings::default(),
        }
    }
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            symbols: default_symbols(),
            primary_symbol: default_primary_symbol(),
            timeframes: TimeframeStack::default(),
            view_depth: default_view_depth(),
            start: None,
            end: None,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage: default_slippage(),
            stop_slippage: default_stop_slippage(),
            taker_fee: default_taker_fee(),
            max_entry_deviation: default_max_entry_deviation(),
        }
    }
}

impl ExecutionConfig {
    /// Frictionless fills, mostly for scenario tests.
    pub fn frictionless() -> Self {
        Self {
            slippage: Decimal::ZERO,
            stop_slippage: Decimal::ZERO,
            taker_fee: Decimal::ZERO,
            max_entry_deviation: default_max_entry_deviation(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: default_risk_per_trade(),
            max_leverage: default_max_leverage(),
            min_notional: default_min_notional(),
            max_open_positions: default_max_open_positions(),
            max_consecutive_losses: default_max_consecutive_losses(),
            cooldown_hours: default_cooldown_hours(),
            max_weekly_loss: default_max_weekly_loss(),
            max_daily_loss: None,
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_ratchet: Vec::new(),
            adaptive: AdaptiveStopConfig::default(),
        }
    }
}

impl Default for AdaptiveStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_profit_r: default_min_profit_r(),
            volatility_spike: default_volatility_spike(),
            regime_change: true,
            breakeven_buffer: default_breakeven_buffer(),
            partial_protection: true,
            protection_fraction: default_protection_fraction(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            htf_ema: default_htf_ema(),
            atr_period: default_atr_period(),
            adx_period: default_adx_period(),
            adx_trending: default_adx_trending(),
            high_vol_ratio: default_high_vol_ratio(),
            low_vol_ratio: default_low_vol_ratio(),
            atr_stop_multiplier: default_atr_stop_multiplier(),
            max_stop_atr: default_max_stop_atr(),
            tp_r_multiples: default_tp_r_multiples(),
            tp_fractions: default_tp_fractions(),
            min_score: default_min_score(),
            drawdown_min_score: default_drawdown_min_score(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_gap_candles: default_max_gap_candles(),
            load_timeout_secs: default_load_timeout_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            periods_per_year: None,
            sharpe_basis: SharpeBasis::Equity,
        }
    }
}

impl Default for WalkForwardSettings {
    fn default() -> Self {
        Self {
            train_fraction: default_train_fraction(),
            return_tolerance: default_return_tolerance(),
            win_rate_tolerance: default_win_rate_tolerance(),
            profit_factor_tolerance: default_profit_factor_tolerance(),
            drawdown_tolerance: default_drawdown_tolerance(),
            strong_train_return: default_strong_train_return(),
        }
    }
}
