//! Performance metrics for a finished replay.
//!
//! A pure post-pass over the trade ledger and the equity curve. Trade
//! statistics and curve statistics are computed on separate rayon tasks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{MetricsConfig, SharpeBasis};
use crate::market::Timeframe;
use crate::position::TradeRecord;
use crate::risk::DrawdownTracker;
use crate::utils::decimal::{safe_div, to_f64};

/// A point on the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    /// Realized equity
    pub balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_equity: Decimal,
    /// Decline from the running peak, as a fraction of the peak
    pub drawdown: Decimal,
    pub position_count: usize,
}

impl EquityPoint {
    pub fn new(
        timestamp: DateTime<Utc>,
        balance: Decimal,
        unrealized_pnl: Decimal,
        position_count: usize,
        peak_equity: Decimal,
    ) -> Self {
        let total_equity = balance + unrealized_pnl;
        let drawdown = if peak_equity > total_equity && peak_equity > Decimal::ZERO {
            (peak_equity - total_equity) / peak_equity
        } else {
            Decimal::ZERO
        };

        Self {
            timestamp,
            balance,
            unrealized_pnl,
            total_equity,
            drawdown,
            position_count,
        }
    }
}

/// Gross profit over gross loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfitFactor {
    /// No trades, or neither profit nor loss
    Undefined,
    /// Profit without any loss
    Infinite,
    Value(f64),
}

impl ProfitFactor {
    fn from_gross(profit: Decimal, loss: Decimal) -> Self {
        if loss.is_zero() {
            if profit > Decimal::ZERO {
                ProfitFactor::Infinite
            } else {
                ProfitFactor::Undefined
            }
        } else {
            ProfitFactor::Value(to_f64(profit / loss))
        }
    }

    /// Numeric value; `Infinite` maps to `f64::INFINITY`.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            ProfitFactor::Undefined => None,
            ProfitFactor::Infinite => Some(f64::INFINITY),
            ProfitFactor::Value(v) => Some(v),
        }
    }
}

impl fmt::Display for ProfitFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfitFactor::Undefined => write!(f, "n/a"),
            ProfitFactor::Infinite => write!(f, "inf"),
            ProfitFactor::Value(v) => write!(f, "{:.2}", v),
        }
    }
}

/// Group-by statistics for one regime, symbol or exit reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub trades: usize,
    pub wins: usize,
    pub total_pnl: Decimal,
    pub mean_pnl: Decimal,
    pub win_rate: f64,
}

impl GroupStats {
    fn add(&mut self, trade: &TradeRecord) {
        self.trades += 1;
        if trade.is_win() {
            self.wins += 1;
        }
        self.total_pnl += trade.pnl;
        self.mean_pnl = self.total_pnl / Decimal::from(self.trades);
        self.win_rate = self.wins as f64 / self.trades as f64;
    }
}

/// Conventions for the risk-adjusted ratios.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSettings {
    pub risk_free_rate: f64,
    pub periods_per_year: Option<f64>,
    pub basis: SharpeBasis,
    /// Tick granularity; sets the default equity-basis annualization
    pub entry_timeframe: Timeframe,
}

impl MetricsSettings {
    pub fn new(config: &MetricsConfig, entry_timeframe: Timeframe) -> Self {
        Self {
            risk_free_rate: config.risk_free_rate,
            periods_per_year: config.periods_per_year,
            basis: config.sharpe_basis,
            entry_timeframe,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self::new(&MetricsConfig::default(), Timeframe::M5)
    }
}

/// Backtest performance summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Activity
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Wins / total; 0 without trades
    pub win_rate: f64,
    pub avg_duration_hours: f64,

    // P&L
    pub gross_profit: Decimal,
    /// Magnitude of the summed losing trades
    pub gross_loss: Decimal,
    pub profit_factor: ProfitFactor,
    /// Mean net P&L per trade
    pub expectancy: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub avg_r_multiple: Decimal,
    pub total_fees: Decimal,

    // Streaks
    pub longest_win_streak: usize,
    pub longest_loss_streak: usize,

    // Returns and risk
    pub initial_equity: Decimal,
    pub final_equity: Decimal,
    /// (final - initial) / initial
    pub total_return: f64,
    /// Fraction of peak
    pub max_drawdown: f64,
    pub longest_underwater_hours: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,
    pub duration_days: f64,

    // Breakdowns
    pub by_regime: BTreeMap<String, GroupStats>,
    pub by_symbol: BTreeMap<String, GroupStats>,
    pub by_exit_reason: BTreeMap<String, GroupStats>,
}

struct TradeStats {
    total_trades: usize,
    winning_trades: usize,
    losing_trades: usize,
    win_rate: f64,
    avg_duration_hours: f64,
    gross_profit: Decimal,
    gross_loss: Decimal,
    expectancy: Decimal,
    avg_win: Decimal,
    avg_loss: Decimal,
    largest_win: Decimal,
    largest_loss: Decimal,
    avg_r_multiple: Decimal,
    total_fees: Decimal,
    longest_win_streak: usize,
    longest_loss_streak: usize,
    total_pnl: Decimal,
    by_regime: BTreeMap<String, GroupStats>,
    by_symbol: BTreeMap<String, GroupStats>,
    by_exit_reason: BTreeMap<String, GroupStats>,
}

struct CurveStats {
    final_equity: Option<Decimal>,
    max_drawdown: Decimal,
    longest_underwater_hours: f64,
    duration_days: f64,
    equity_returns: Vec<f64>,
}

impl BacktestMetrics {
    /// Calculate metrics from a chronological ledger and equity curve.
    pub fn calculate(
        trades: &[TradeRecord],
        equity_curve: &[EquityPoint],
        initial_equity: Decimal,
        settings: &MetricsSettings,
    ) -> Self {
        let (trade_stats, curve) = rayon::join(|| trade_stats(trades), || curve_stats(equity_curve));

        let final_equity = curve
            .final_equity
            .unwrap_or(initial_equity + trade_stats.total_pnl);
        let total_return = safe_div(final_equity - initial_equity, initial_equity);
        let max_drawdown = to_f64(curve.max_drawdown);

        let (returns, default_periods) = match settings.basis {
            SharpeBasis::Equity => (curve.equity_returns, settings.entry_timeframe.periods_per_year()),
            SharpeBasis::Trade => {
                let returns: Vec<f64> = trades.iter().map(|t| to_f64(t.return_on_equity())).collect();
                let years = curve.duration_days / 365.0;
                let per_year = if years > 0.0 { returns.len() as f64 / years } else { 0.0 };
                (returns, per_year)
            }
        };
        let periods = settings.periods_per_year.unwrap_or(default_periods);

        let calmar_ratio = if max_drawdown > 0.0 {
            Some(to_f64(total_return) / max_drawdown)
        } else {
            None
        };

        Self {
            total_trades: trade_stats.total_trades,
            winning_trades: trade_stats.winning_trades,
            losing_trades: trade_stats.losing_trades,
            win_rate: trade_stats.win_rate,
            avg_duration_hours: trade_stats.avg_duration_hours,
            gross_profit: trade_stats.gross_profit,
            gross_loss: trade_stats.gross_loss,
            profit_factor: ProfitFactor::from_gross(trade_stats.gross_profit, trade_stats.gross_loss),
            expectancy: trade_stats.expectancy,
            avg_win: trade_stats.avg_win,
            avg_loss: trade_stats.avg_loss,
            largest_win: trade_stats.largest_win,
            largest_loss: trade_stats.largest_loss,
            avg_r_multiple: trade_stats.avg_r_multiple,
            total_fees: trade_stats.total_fees,
            longest_win_streak: trade_stats.longest_win_streak,
            longest_loss_streak: trade_stats.longest_loss_streak,
            initial_equity,
            final_equity,
            total_return: to_f64(total_return),
            max_drawdown,
            longest_underwater_hours: curve.longest_underwater_hours,
            sharpe_ratio: sharpe(&returns, settings.risk_free_rate, periods),
            sortino_ratio: sortino(&returns, settings.risk_free_rate, periods),
            calmar_ratio,
            duration_days: curve.duration_days,
            by_regime: trade_stats.by_regime,
            by_symbol: trade_stats.by_symbol,
            by_exit_reason: trade_stats.by_exit_reason,
        }
    }

    /// Metrics of a run that never traded nor ticked.
    pub fn empty(initial_equity: Decimal) -> Self {
        Self::calculate(&[], &[], initial_equity, &MetricsSettings::default())
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        let ratio = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| format!("{:.3}", v));
        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
RETURNS
  Initial Equity:    ${:.2}
  Final Equity:      ${:.2}
  Total Return:      {:.2}%

RISK
  Max Drawdown:      {:.2}%
  Longest Underwater: {:.1}h

RISK-ADJUSTED
  Sharpe Ratio:      {}
  Sortino Ratio:     {}
  Calmar Ratio:      {}

TRADES
  Total Trades:      {}
  Win Rate:          {:.1}% ({}W / {}L)
  Profit Factor:     {}
  Expectancy:        ${:.2}
  Avg Win / Loss:    ${:.2} / ${:.2}
  Avg R:             {:.2}
  Fees Paid:         ${:.2}
  Streaks (W / L):   {} / {}
═══════════════════════════════════════════════"#,
            self.duration_days,
            self.initial_equity,
            self.final_equity,
            self.total_return * 100.0,
            self.max_drawdown * 100.0,
            self.longest_underwater_hours,
            ratio(self.sharpe_ratio),
            ratio(self.sortino_ratio),
            ratio(self.calmar_ratio),
            self.total_trades,
            self.win_rate * 100.0,
            self.winning_trades,
            self.losing_trades,
            self.profit_factor,
            self.expectancy,
            self.avg_win,
            self.avg_loss,
            self.avg_r_multiple,
            self.total_fees,
            self.longest_win_streak,
            self.longest_loss_streak,
        )
    }
}

fn trade_stats(trades: &[TradeRecord]) -> TradeStats {
    let mut ordered: Vec<&TradeRecord> = trades.iter().collect();
    ordered.sort_by_key(|t| (t.exit_time, t.id));

    let mut gross_profit = Decimal::ZERO;
    let mut gross_loss = Decimal::ZERO;
    let mut winning_trades = 0usize;
    let mut losing_trades = 0usize;
    let mut largest_win = Decimal::ZERO;
    let mut largest_loss = Decimal::ZERO;
    let mut total_fees = Decimal::ZERO;
    let mut total_r = Decimal::ZERO;
    let mut total_hours = 0.0;
    let (mut win_run, mut loss_run) = (0usize, 0usize);
    let (mut longest_win_streak, mut longest_loss_streak) = (0usize, 0usize);
    let mut by_regime: BTreeMap<String, GroupStats> = BTreeMap::new();
    let mut by_symbol: BTreeMap<String, GroupStats> = BTreeMap::new();
    let mut by_exit_reason: BTreeMap<String, GroupStats> = BTreeMap::new();

    for trade in &ordered {
        if trade.is_win() {
            winning_trades += 1;
            gross_profit += trade.pnl;
            largest_win = largest_win.max(trade.pnl);
            win_run += 1;
            loss_run = 0;
        } else if trade.is_loss() {
            losing_trades += 1;
            gross_loss += -trade.pnl;
            largest_loss = largest_loss.min(trade.pnl);
            loss_run += 1;
            win_run = 0;
        } else {
            win_run = 0;
            loss_run = 0;
        }
        longest_win_streak = longest_win_streak.max(win_run);
        longest_loss_streak = longest_loss_streak.max(loss_run);

        total_fees += trade.fees;
        total_r += trade.r_multiple;
        total_hours += trade.duration().num_seconds() as f64 / 3600.0;

        by_regime.entry(trade.entry_regime.as_str().to_string()).or_default().add(trade);
        by_symbol.entry(trade.symbol.clone()).or_default().add(trade);
        by_exit_reason.entry(trade.exit_reason.label()).or_default().add(trade);
    }

    let total_trades = ordered.len();
    let count = Decimal::from(total_trades);
    let total_pnl = gross_profit - gross_loss;

    TradeStats {
        total_trades,
        winning_trades,
        losing_trades,
        win_rate: if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        },
        avg_duration_hours: if total_trades > 0 {
            total_hours / total_trades as f64
        } else {
            0.0
        },
        gross_profit,
        gross_loss,
        expectancy: safe_div(total_pnl, count),
        avg_win: safe_div(gross_profit, Decimal::from(winning_trades)),
        avg_loss: -safe_div(gross_loss, Decimal::from(losing_trades)),
        largest_win,
        largest_loss,
        avg_r_multiple: safe_div(total_r, count),
        total_fees,
        longest_win_streak,
        longest_loss_streak,
        total_pnl,
        by_regime,
        by_symbol,
        by_exit_reason,
    }
}

fn curve_stats(curve: &[EquityPoint]) -> CurveStats {
    let tracker = DrawdownTracker::from_curve(curve.iter().map(|p| (p.timestamp, p.total_equity)));
    let (max_drawdown, longest_underwater_hours) = tracker
        .map(|t| {
            let stats = t.statistics();
            (stats.max_drawdown, stats.longest_underwater_hours)
        })
        .unwrap_or((Decimal::ZERO, 0.0));

    let duration_days = match (curve.first(), curve.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_seconds() as f64 / 86_400.0,
        _ => 0.0,
    };

    CurveStats {
        final_equity: curve.last().map(|p| p.total_equity),
        max_drawdown,
        longest_underwater_hours,
        duration_days,
        equity_returns: period_returns(curve),
    }
}

/// Returns between consecutive timestamps. Several symbols closing at the
/// same instant append several points; only the last one per timestamp counts.
fn period_returns(curve: &[EquityPoint]) -> Vec<f64> {
    let mut settled: Vec<Decimal> = Vec::with_capacity(curve.len());
    for (i, point) in curve.iter().enumerate() {
        let next_same = curve
            .get(i + 1)
            .is_some_and(|next| next.timestamp == point.timestamp);
        if !next_same {
            settled.push(point.total_equity);
        }
    }

    settled
        .windows(2)
        .map(|w| {
            if w[0] > Decimal::ZERO {
                to_f64((w[1] - w[0]) / w[0])
            } else {
                0.0
            }
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Annualized Sharpe ratio of per-period returns, sample standard deviation.
fn sharpe(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> Option<f64> {
    if returns.len() < 2 || periods_per_year <= 0.0 {
        return None;
    }
    let rf = risk_free_rate / periods_per_year;
    let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
    let m = mean(&excess);
    let variance = excess.iter().map(|r| (r - m).powi(2)).sum::<f64>() / (excess.len() - 1) as f64;
    let std_dev = variance.sqrt();
    if std_dev < 1e-12 {
        return None;
    }
    Some(m / std_dev * periods_per_year.sqrt())
}

/// Annualized Sortino ratio; `None` without downside.
fn sortino(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> Option<f64> {
    if returns.len() < 2 || periods_per_year <= 0.0 {
        return None;
    }
    let rf = risk_free_rate / periods_per_year;
    let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
    let downside = (excess.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / excess.len() as f64).sqrt();
    if downside < 1e-12 {
        return None;
    }
    Some(mean(&excess) / downside * periods_per_year.sqrt())
}
