//! # MTF Backtest
//!
//! A deterministic candle-replay backtester for multi-timeframe crypto
//! perpetual strategies.
//!
//! ## Architecture
//!
//! - `market`: Candles, timeframes, and per-symbol series
//! - `backtest`: Data pre-loading, timeline merging, the replay engine, metrics, and walk-forward validation
//! - `position`: Position state machine, fill costs, and the trade ledger
//! - `risk`: Risk governor, position sizing, exposure limits, and drawdown tracking
//! - `strategy`: The strategy oracle interface and a reference trend-pullback oracle
//! - `notify`: Trade event notification sinks
//! - `persistence`: JSON and SQLite result sinks
//! - `config`: Configuration management and validation
//! - `utils`: Shared decimal arithmetic

pub mod backtest;
pub mod config;
pub mod market;
pub mod notify;
pub mod persistence;
pub mod position;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
