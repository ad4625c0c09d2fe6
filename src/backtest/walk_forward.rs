//! Walk-forward validation: chronological train/test split.
//!
//! The replay span is split by time, not by trade count. Each segment runs
//! on a fresh engine state; the test segment may read candles before the
//! split as history but never replays a tick before it.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::backtest::engine::{BacktestEngine, BacktestResult, EngineError};
use crate::backtest::metrics::BacktestMetrics;
use crate::backtest::timeline::ReplayWindow;
use crate::config::{Config, WalkForwardSettings};
use crate::market::MarketData;
use crate::strategy::StrategyOracle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Train,
    Test,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Train => write!(f, "train"),
            Segment::Test => write!(f, "test"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalkForwardError {
    #[error("not enough data to split: {0}")]
    InsufficientData(String),
    #[error("{segment} segment failed: {source}")]
    Segment {
        segment: Segment,
        #[source]
        source: EngineError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Test metrics within tolerance of train
    Pass,
    /// Degraded but still positive
    Concerns,
    /// Test negative, or a strong train edge collapsed
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Concerns => write!(f, "CONCERNS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Train vs test comparison outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub verdict: Verdict,
    pub issues: Vec<String>,
    pub interpretation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub split: DateTime<Utc>,
    pub train: BacktestResult,
    pub test: BacktestResult,
    pub assessment: Assessment,
}

impl WalkForwardReport {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "WALK-FORWARD (split at {})\n\n[TRAIN]\n{}\n\n[TEST]\n{}\n\nVERDICT: {}\n",
            self.split.format("%Y-%m-%d %H:%M"),
            self.train.metrics.summary(),
            self.test.metrics.summary(),
            self.assessment.verdict,
        );
        for issue in &self.assessment.issues {
            out.push_str(&format!("  - {}\n", issue));
        }
        out.push_str(&self.assessment.interpretation);
        out
    }
}

/// Runs the engine over a train and a test segment and compares them.
pub struct WalkForwardValidator<O: StrategyOracle> {
    engine: BacktestEngine<O>,
    settings: WalkForwardSettings,
}

impl<O: StrategyOracle> WalkForwardValidator<O> {
    pub fn new(config: Config, oracle: O) -> Result<Self, EngineError> {
        Ok(Self::from_engine(BacktestEngine::new(config, oracle)?))
    }

    /// Validate with an engine that is already configured, e.g. with a notifier.
    pub fn from_engine(engine: BacktestEngine<O>) -> Self {
        let settings = engine.config().walk_forward.clone();
        Self { engine, settings }
    }

    pub fn engine(&self) -> &BacktestEngine<O> {
        &self.engine
    }

    /// Split timestamp: `train_fraction` of the replay span after its first tick.
    pub fn split_point(&self, data: &MarketData) -> Result<DateTime<Utc>, WalkForwardError> {
        let (first, last) = data
            .range()
            .ok_or_else(|| WalkForwardError::InsufficientData("no candles".to_string()))?;
        let backtest = &self.engine.config().backtest;
        let first = backtest.start.map_or(first, |s| s.max(first));
        let last = backtest.end.map_or(last, |e| e.min(last));

        let span = (last - first).num_seconds();
        if span <= 0 {
            return Err(WalkForwardError::InsufficientData(format!(
                "replay span {} to {} is empty",
                first, last
            )));
        }
        let train_seconds = (span as f64 * self.settings.train_fraction).round() as i64;
        Ok(first + Duration::seconds(train_seconds))
    }

    pub fn run(&self, data: &MarketData) -> Result<WalkForwardReport, WalkForwardError> {
        let split = self.split_point(data)?;
        let backtest = &self.engine.config().backtest;
        info!(split = %split, train_fraction = self.settings.train_fraction, "Walk-forward split");

        let train = self
            .engine
            .run_window(data, ReplayWindow::new(backtest.start, Some(split)))
            .map_err(|source| WalkForwardError::Segment {
                segment: Segment::Train,
                source,
            })?;
        let test = self
            .engine
            .run_window(data, ReplayWindow::new(Some(split), backtest.end))
            .map_err(|source| WalkForwardError::Segment {
                segment: Segment::Test,
                source,
            })?;

        let assessment = assess(&train.metrics, &test.metrics, &self.settings);
        match assessment.verdict {
            Verdict::Pass => info!(verdict = %assessment.verdict, "Walk-forward complete"),
            _ => warn!(
                verdict = %assessment.verdict,
                issues = assessment.issues.len(),
                "Walk-forward complete"
            ),
        }

        Ok(WalkForwardReport {
            split,
            train,
            test,
            assessment,
        })
    }
}

/// Compare test-segment metrics against train-segment metrics.
pub fn assess(train: &BacktestMetrics, test: &BacktestMetrics, settings: &WalkForwardSettings) -> Assessment {
    let mut issues = Vec::new();

    let return_ok = train.total_return <= 0.0 || test.total_return >= train.total_return * settings.return_tolerance;
    if !return_ok {
        issues.push(format!(
            "test return {:.2}% below {:.0}% of train return {:.2}%",
            test.total_return * 100.0,
            settings.return_tolerance * 100.0,
            train.total_return * 100.0
        ));
    }

    let win_rate_ok = test.win_rate >= train.win_rate - settings.win_rate_tolerance;
    if !win_rate_ok {
        issues.push(format!(
            "test win rate {:.1}% dropped more than {:.0} points from {:.1}%",
            test.win_rate * 100.0,
            settings.win_rate_tolerance * 100.0,
            train.win_rate * 100.0
        ));
    }

    if let (Some(train_pf), Some(test_pf)) = (train.profit_factor.as_f64(), test.profit_factor.as_f64()) {
        if test_pf < train_pf * settings.profit_factor_tolerance {
            issues.push(format!(
                "test profit factor {} below {:.0}% of train {}",
                test.profit_factor,
                settings.profit_factor_tolerance * 100.0,
                train.profit_factor
            ));
        }
    }

    if test.expectancy < Decimal::ZERO && train.expectancy > Decimal::ZERO {
        issues.push(format!(
            "test expectancy turned negative ({} vs {})",
            test.expectancy.round_dp(2),
            train.expectancy.round_dp(2)
        ));
    }

    if train.max_drawdown > 0.0 && test.max_drawdown > train.max_drawdown * settings.drawdown_tolerance {
        issues.push(format!(
            "test drawdown {:.2}% worse than {:.1}x train {:.2}%",
            test.max_drawdown * 100.0,
            settings.drawdown_tolerance,
            train.max_drawdown * 100.0
        ));
    }

    let train_strong = train.total_return >= settings.strong_train_return;
    let verdict = if test.total_return < 0.0 || (train_strong && !(return_ok && win_rate_ok)) {
        Verdict::Fail
    } else if return_ok && win_rate_ok && issues.is_empty() {
        Verdict::Pass
    } else {
        Verdict::Concerns
    };

    let interpretation = match verdict {
        Verdict::Pass => "Test results are consistent with train results".to_string(),
        Verdict::Concerns => "Degraded on unseen data: possible overfitting or regime shift".to_string(),
        Verdict::Fail if train.total_trades == 0 => {
            "No train trades to compare against; test segment lost money".to_string()
        }
        Verdict::Fail => "Edge did not survive unseen data: overfitting or regime shift".to_string(),
    };

    Assessment {
        verdict,
        issues,
        interpretation,
    }
}
