//! The strategy oracle boundary.
//!
//! The engine hands an oracle a time-bounded view of closed candles and a
//! snapshot of the account; the oracle answers with at most one entry
//! candidate. The same trait serves live and simulated callers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::{Candle, Direction, Regime};

/// Closed candles visible to the oracle at one tick.
///
/// Every slice holds only candles whose close time is <= `as_of`.
#[derive(Debug, Clone, Copy)]
pub struct MarketView<'a> {
    pub symbol: &'a str,
    pub as_of: DateTime<Utc>,
    pub htf: &'a [Candle],
    pub primary: &'a [Candle],
    pub entry: &'a [Candle],
}

impl<'a> MarketView<'a> {
    /// Close of the latest entry candle.
    pub fn last_close(&self) -> Option<Decimal> {
        self.entry.last().map(|c| c.close)
    }
}

/// Coarse account condition used to tighten entry thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountMode {
    Normal,
    Drawdown,
    HotStreak,
}

/// Read-only account state handed to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub initial_equity: Decimal,
    pub open_positions: usize,
    pub consecutive_losses: u32,
    pub weekly_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub mode: AccountMode,
}

/// A target price and the share of the original size closed there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub price: Decimal,
    pub fraction: Decimal,
}

/// A proposed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryCandidate {
    pub direction: Direction,
    /// Reference price the levels were computed from
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    /// Ordered nearest first
    pub take_profits: Vec<TakeProfitLevel>,
    pub regime: Regime,
    pub score: u32,
    /// Volatility at decision time, kept as the position's entry ATR
    pub atr: Decimal,
    pub reason: String,
}

/// Oracle answer for one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    NoSignal,
    Candidate(EntryCandidate),
}

/// Volatility and regime at the current tick, used by adaptive protection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    pub atr: Decimal,
    pub regime: Regime,
}

/// Strategy decision interface.
///
/// Implementations must be pure with respect to data after `view.as_of`.
pub trait StrategyOracle: Send + Sync {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &str;

    /// Decide whether to enter at this tick.
    fn evaluate(&self, view: &MarketView<'_>, account: &AccountSnapshot) -> Signal;

    /// Current volatility and regime, or `None` when there is not enough history.
    fn conditions(&self, view: &MarketView<'_>) -> Option<MarketConditions>;
}

/// Why a candidate was refused before a position was opened.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateRejection {
    #[error("inconsistent candidate: {detail}")]
    Inconsistent { detail: String },
    #[error("zero stop distance")]
    ZeroStopDistance,
    #[error("insufficient equity: need margin {required}, free {available}")]
    InsufficientEquity { required: Decimal, available: Decimal },
    #[error("notional {notional} below minimum {minimum}")]
    BelowMinNotional { notional: Decimal, minimum: Decimal },
}

impl CandidateRejection {
    /// Inconsistent candidates point at an oracle defect rather than market state.
    pub fn is_logic_fault(&self) -> bool {
        matches!(self, CandidateRejection::Inconsistent { .. })
    }
}

impl EntryCandidate {
    /// Check internal consistency against the tick close.
    ///
    /// Never adjusts the candidate; any defect rejects it.
    pub fn validate(&self, close: Decimal, max_entry_deviation: Decimal) -> Result<(), CandidateRejection> {
        let fail = |detail: String| Err(CandidateRejection::Inconsistent { detail });
        let sign = self.direction.sign();

        if self.entry_price <= Decimal::ZERO || self.stop_loss <= Decimal::ZERO {
            return fail(format!(
                "non-positive price (entry {}, stop {})",
                self.entry_price, self.stop_loss
            ));
        }
        if self.atr <= Decimal::ZERO {
            return fail(format!("non-positive atr {}", self.atr));
        }
        if close > Decimal::ZERO {
            let deviation = ((self.entry_price - close) / close).abs();
            if deviation > max_entry_deviation {
                return fail(format!(
                    "entry {} deviates {} from close {}",
                    self.entry_price, deviation, close
                ));
            }
        }
        if self.stop_loss == self.entry_price {
            return Err(CandidateRejection::ZeroStopDistance);
        }
        // Loss side: (stop - entry) * sign < 0
        if (self.stop_loss - self.entry_price) * sign > Decimal::ZERO {
            return fail(format!(
                "{} stop {} on wrong side of entry {}",
                self.direction, self.stop_loss, self.entry_price
            ));
        }
        if self.take_profits.is_empty() {
            return fail("no take-profit levels".to_string());
        }

        let mut last_distance = Decimal::ZERO;
        let mut fraction_sum = Decimal::ZERO;
        for (i, tp) in self.take_profits.iter().enumerate() {
            let distance = (tp.price - self.entry_price) * sign;
            if distance <= Decimal::ZERO {
                return fail(format!(
                    "take-profit {} at {} on wrong side of entry {}",
                    i + 1,
                    tp.price,
                    self.entry_price
                ));
            }
            if distance <= last_distance {
                return fail(format!("take-profit {} not beyond take-profit {}", i + 1, i));
            }
            if tp.fraction <= Decimal::ZERO {
                return fail(format!("take-profit {} has non-positive fraction", i + 1));
            }
            last_distance = distance;
            fraction_sum += tp.fraction;
        }
        if fraction_sum > Decimal::ONE {
            return fail(format!("take-profit fractions sum to {}", fraction_sum));
        }

        Ok(())
    }

    /// Initial risk per unit: |entry - stop|.
    pub fn risk_per_unit(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }
}
