//! Backtesting: replaying multi-timeframe history through a strategy oracle.
//!
//! This module provides:
//! - Concurrent pre-loading and validation of candle data
//! - A globally ordered tick timeline across symbols and timeframes
//! - The simulation engine driving positions and the risk governor
//! - Performance metrics calculation
//! - Walk-forward train/test validation
//!
//! # Example
//!
//! ```rust,ignore
//! use mtf_backtest::backtest::{preload, BacktestEngine, CsvCandleProvider, LoadRequest};
//!
//! let provider = CsvCandleProvider::new("data");
//! let outcome = preload(&provider, &LoadRequest::from_config(&config)).await;
//! let engine = BacktestEngine::new(config, TrendPullbackOracle::new(config.strategy.clone()))?;
//! let result = engine.run(&outcome.data)?;
//! println!("Return: {:.2}%", result.metrics.total_return * 100.0);
//! ```

mod data;
mod engine;
mod metrics;
mod timeline;
mod validation;
mod walk_forward;

#[cfg(test)]
pub(crate) mod testkit;

pub use data::{
    preload, CandleProvider, CsvCandleProvider, InMemoryProvider, LoadOutcome, LoadRequest,
};
pub use engine::{
    BacktestEngine, BacktestReport, BacktestResult, EngineError, RunStats, SkipStage,
    SkippedSignal,
};
pub use metrics::{BacktestMetrics, EquityPoint, GroupStats, MetricsSettings, ProfitFactor};
pub use timeline::{ReplayWindow, Tick, TickIter, Timeline};
pub use validation::{validate_series, DataFault, DataFaultKind};
pub use walk_forward::{
    assess, Assessment, Segment, Verdict, WalkForwardError, WalkForwardReport,
    WalkForwardValidator,
};
