//! Position state machine.
//!
//! ```text
//! OpenFull --TP_i--> PartialOpen --...--> Closed
//!     \                  /
//!      +-- adaptive protection (one-shot, orthogonal) --+
//!          partial protection hit: exit share, restore stop, continue
//! ```
//!
//! Per-candle evaluation order is stop, then take-profits (nearest first),
//! then the adaptive trigger. A stop hit ends evaluation for that candle:
//! when both the stop and a target lie inside the candle's range the stop is
//! assumed to have traded first.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::costs::FillModel;
use crate::config::{AdaptiveStopConfig, Config};
use crate::market::{Candle, Direction, Regime};
use crate::strategy::{MarketConditions, TakeProfitLevel};

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    OpenFull,
    PartialOpen,
    Closed,
}

/// Why a slice of the position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// 1-based take-profit tier
    TakeProfit { level: usize },
    StopLoss,
    /// Stop hit after a take-profit ratchet moved it
    TrailingStop,
    /// Adaptive stop hit without partial protection
    ProtectedStop,
    /// Share closed at the protected stop; remainder continues
    PartialProtection,
    BacktestEnd,
}

impl ExitReason {
    pub fn is_stop(self) -> bool {
        matches!(
            self,
            ExitReason::StopLoss
                | ExitReason::TrailingStop
                | ExitReason::ProtectedStop
                | ExitReason::PartialProtection
        )
    }

    pub fn label(self) -> String {
        match self {
            ExitReason::TakeProfit { level } => format!("take_profit_{level}"),
            ExitReason::StopLoss => "stop_loss".to_string(),
            ExitReason::TrailingStop => "trailing_stop".to_string(),
            ExitReason::ProtectedStop => "protected_stop".to_string(),
            ExitReason::PartialProtection => "partial_protection".to_string(),
            ExitReason::BacktestEnd => "backtest_end".to_string(),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// One executed exit slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitFill {
    pub time: DateTime<Utc>,
    pub reason: ExitReason,
    /// Level that triggered the exit (stop, target, or close)
    pub trigger_price: Decimal,
    /// Price after slippage
    pub fill_price: Decimal,
    /// Share of the original size
    pub fraction: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    /// Net of this slice's exit fee
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    Ratchet,
    AdaptiveProtection,
    ProtectionRestore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopChange {
    pub time: DateTime<Utc>,
    pub from: Decimal,
    pub to: Decimal,
    pub cause: StopCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionTrigger {
    VolatilitySpike,
    RegimeDegraded,
}

/// Something that happened to a position while processing a candle.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Exit(ExitFill),
    StopMoved(StopChange),
    ProtectionArmed {
        time: DateTime<Utc>,
        trigger: ProtectionTrigger,
        profit_r: Decimal,
        stop_loss: Decimal,
        partial: bool,
    },
}

/// Exit management parameters shared by all positions of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitRules {
    pub fill: FillModel,
    pub stop_ratchet: Vec<Decimal>,
    pub adaptive: AdaptiveStopConfig,
}

impl ExitRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fill: FillModel::new(&config.execution),
            stop_ratchet: config.exits.stop_ratchet.clone(),
            adaptive: config.exits.adaptive.clone(),
        }
    }
}

/// Everything needed to open a position.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub time: DateTime<Utc>,
    /// Entry fill after slippage
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_fee: Decimal,
    pub stop_loss: Decimal,
    pub take_profits: Vec<TakeProfitLevel>,
    pub atr: Decimal,
    pub regime: Regime,
    pub score: u32,
    pub margin: Decimal,
    pub equity_at_entry: Decimal,
}

/// One open trade, from entry to full close.
///
/// Fields are private so that every mutation goes through the transitions
/// below, which maintain the stop, fraction, and one-shot invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    id: u64,
    symbol: String,
    direction: Direction,
    entry_time: DateTime<Utc>,
    entry_price: Decimal,
    quantity: Decimal,
    entry_fee: Decimal,
    entry_atr: Decimal,
    entry_regime: Regime,
    score: u32,
    margin: Decimal,
    equity_at_entry: Decimal,
    original_stop_loss: Decimal,
    stop_loss: Decimal,
    take_profits: Vec<TakeProfitLevel>,
    targets_hit: usize,
    remaining_fraction: Decimal,
    realized_pnl: Decimal,
    adaptive_stop_triggered: bool,
    partial_protection_active: bool,
    /// Stop in force before protection tightened it
    pre_protection_stop: Option<Decimal>,
    status: PositionStatus,
    last_price: Decimal,
    exits: Vec<ExitFill>,
    stop_history: Vec<StopChange>,
}

impl Position {
    pub fn open(params: OpenParams) -> Self {
        Self {
            id: params.id,
            symbol: params.symbol,
            direction: params.direction,
            entry_time: params.time,
            entry_price: params.entry_price,
            quantity: params.quantity,
            entry_fee: params.entry_fee,
            entry_atr: params.atr,
            entry_regime: params.regime,
            score: params.score,
            margin: params.margin,
            equity_at_entry: params.equity_at_entry,
            original_stop_loss: params.stop_loss,
            stop_loss: params.stop_loss,
            take_profits: params.take_profits,
            targets_hit: 0,
            remaining_fraction: Decimal::ONE,
            realized_pnl: -params.entry_fee,
            adaptive_stop_triggered: false,
            partial_protection_active: false,
            pre_protection_stop: None,
            status: PositionStatus::OpenFull,
            last_price: params.entry_price,
            exits: Vec::new(),
            stop_history: Vec::new(),
        }
    }

    // ---- accessors ---------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn entry_time(&self) -> DateTime<Utc> {
        self.entry_time
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn entry_fee(&self) -> Decimal {
        self.entry_fee
    }

    pub fn entry_atr(&self) -> Decimal {
        self.entry_atr
    }

    pub fn entry_regime(&self) -> Regime {
        self.entry_regime
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn margin(&self) -> Decimal {
        self.margin
    }

    pub fn equity_at_entry(&self) -> Decimal {
        self.equity_at_entry
    }

    pub fn original_stop_loss(&self) -> Decimal {
        self.original_stop_loss
    }

    pub fn stop_loss(&self) -> Decimal {
        self.stop_loss
    }

    pub fn take_profits(&self) -> &[TakeProfitLevel] {
        &self.take_profits
    }

    pub fn targets_hit(&self) -> usize {
        self.targets_hit
    }

    pub fn remaining_fraction(&self) -> Decimal {
        self.remaining_fraction
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn adaptive_stop_triggered(&self) -> bool {
        self.adaptive_stop_triggered
    }

    pub fn partial_protection_active(&self) -> bool {
        self.partial_protection_active
    }

    pub fn status(&self) -> PositionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status != PositionStatus::Closed
    }

    pub fn last_price(&self) -> Decimal {
        self.last_price
    }

    pub fn exits(&self) -> &[ExitFill] {
        &self.exits
    }

    pub fn stop_history(&self) -> &[StopChange] {
        &self.stop_history
    }

    /// Initial risk per unit (R).
    pub fn risk_per_unit(&self) -> Decimal {
        (self.entry_price - self.original_stop_loss).abs()
    }

    /// Unrealized profit at `price` in multiples of R.
    pub fn profit_r(&self, price: Decimal) -> Decimal {
        let r = self.risk_per_unit();
        if r.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) * self.direction.sign() / r
    }

    /// Realized P&L plus open P&L of the remaining size at `price`.
    pub fn mark_to_market(&self, price: Decimal) -> Decimal {
        let open_qty = self.quantity * self.remaining_fraction;
        self.realized_pnl + (price - self.entry_price) * self.direction.sign() * open_qty
    }

    // ---- per-candle transitions --------------------------------------------

    /// Process one closed entry-timeframe candle.
    ///
    /// `conditions` is only invoked when the adaptive trigger is evaluated.
    pub fn on_candle<F>(&mut self, candle: &Candle, rules: &ExitRules, conditions: F) -> Vec<PositionEvent>
    where
        F: FnOnce() -> Option<MarketConditions>,
    {
        let mut events = Vec::new();
        if !self.is_open() {
            return events;
        }
        let time = candle.close_time();
        self.last_price = candle.close;

        // 1. Stops
        if self.stop_crossed(candle, self.stop_loss) {
            self.resolve_stop(candle, rules, &mut events);
            return events;
        }

        // 2. Targets, nearest first
        while self.is_open() && self.targets_hit < self.take_profits.len() {
            let target = self.take_profits[self.targets_hit];
            if !self.target_reached(candle, target.price) {
                break;
            }
            self.targets_hit += 1;
            let fraction = target.fraction.min(self.remaining_fraction);
            // Targets fill at the target even when the candle gaps beyond it
            let fill = self.exit(
                time,
                target.price,
                fraction,
                ExitReason::TakeProfit { level: self.targets_hit },
                &rules.fill,
            );
            events.push(PositionEvent::Exit(fill));
            if self.is_open() {
                self.apply_ratchet(time, rules, &mut events);
            }
        }

        // 3. Adaptive protection
        if self.is_open() && rules.adaptive.enabled && !self.adaptive_stop_triggered {
            self.check_adaptive(time, candle.close, &rules.adaptive, conditions, &mut events);
        }

        events
    }

    /// Close whatever remains at `price` because the data ended.
    pub fn force_close(&mut self, time: DateTime<Utc>, price: Decimal, fill: &FillModel) -> Option<ExitFill> {
        if !self.is_open() {
            return None;
        }
        self.last_price = price;
        let remaining = self.remaining_fraction;
        Some(self.exit(time, price, remaining, ExitReason::BacktestEnd, fill))
    }

    fn resolve_stop(&mut self, candle: &Candle, rules: &ExitRules, events: &mut Vec<PositionEvent>) {
        let time = candle.close_time();

        if self.partial_protection_active {
            let trigger = self.stop_fill_level(candle, self.stop_loss);
            let fraction = rules.adaptive.protection_fraction.min(self.remaining_fraction);
            let fill = self.exit(time, trigger, fraction, ExitReason::PartialProtection, &rules.fill);
            events.push(PositionEvent::Exit(fill));
            self.partial_protection_active = false;

            if self.is_open() {
                let restored = self.pre_protection_stop.take().unwrap_or(self.original_stop_loss);
                let change = self.move_stop(time, restored, StopCause::ProtectionRestore);
                events.push(PositionEvent::StopMoved(change));

                // The same candle may also reach the restored stop
                if self.stop_crossed(candle, self.stop_loss) {
                    let trigger = self.stop_fill_level(candle, self.stop_loss);
                    let reason = self.stop_reason();
                    let remaining = self.remaining_fraction;
                    let fill = self.exit(time, trigger, remaining, reason, &rules.fill);
                    events.push(PositionEvent::Exit(fill));
                }
            }
            return;
        }

        let trigger = self.stop_fill_level(candle, self.stop_loss);
        let reason = self.stop_reason();
        let remaining = self.remaining_fraction;
        let fill = self.exit(time, trigger, remaining, reason, &rules.fill);
        events.push(PositionEvent::Exit(fill));
    }

    fn stop_reason(&self) -> ExitReason {
        if self.stop_loss == self.original_stop_loss {
            return ExitReason::StopLoss;
        }
        match self.stop_history.last().map(|c| c.cause) {
            Some(StopCause::AdaptiveProtection) => ExitReason::ProtectedStop,
            _ => ExitReason::TrailingStop,
        }
    }

    fn apply_ratchet(&mut self, time: DateTime<Utc>, rules: &ExitRules, events: &mut Vec<PositionEvent>) {
        let Some(r_behind) = rules.stop_ratchet.get(self.targets_hit - 1) else {
            return;
        };
        let level = self.entry_price - self.direction.sign() * self.risk_per_unit() * *r_behind;

        if self.partial_protection_active {
            // Earned ratchet survives the later restore
            let base = self.pre_protection_stop.unwrap_or(self.original_stop_loss);
            if self.is_tighter(level, base) {
                self.pre_protection_stop = Some(level);
            }
            return;
        }
        if self.is_tighter(level, self.stop_loss) {
            let change = self.move_stop(time, level, StopCause::Ratchet);
            events.push(PositionEvent::StopMoved(change));
        }
    }

    fn check_adaptive<F>(
        &mut self,
        time: DateTime<Utc>,
        close: Decimal,
        config: &AdaptiveStopConfig,
        conditions: F,
        events: &mut Vec<PositionEvent>,
    ) where
        F: FnOnce() -> Option<MarketConditions>,
    {
        let profit_r = self.profit_r(close);
        if profit_r < config.min_profit_r {
            return;
        }
        let Some(current) = conditions() else {
            return;
        };

        let volatility_spike = self.entry_atr > Decimal::ZERO
            && current.atr / self.entry_atr >= config.volatility_spike;
        let regime_degraded =
            config.regime_change && self.entry_regime.is_trending() && current.regime.is_ranging();

        let trigger = if volatility_spike {
            ProtectionTrigger::VolatilitySpike
        } else if regime_degraded {
            ProtectionTrigger::RegimeDegraded
        } else {
            return;
        };

        self.adaptive_stop_triggered = true;
        let prior = self.stop_loss;
        let buffer = Decimal::ONE + self.direction.sign() * config.breakeven_buffer;
        let protected = self.entry_price * buffer;
        if self.is_tighter(protected, self.stop_loss) {
            let change = self.move_stop(time, protected, StopCause::AdaptiveProtection);
            events.push(PositionEvent::StopMoved(change));
        }
        if config.partial_protection {
            self.partial_protection_active = true;
            self.pre_protection_stop = Some(prior);
        }

        events.push(PositionEvent::ProtectionArmed {
            time,
            trigger,
            profit_r,
            stop_loss: self.stop_loss,
            partial: config.partial_protection,
        });
    }

    // ---- primitives --------------------------------------------------------

    fn exit(
        &mut self,
        time: DateTime<Utc>,
        trigger: Decimal,
        fraction: Decimal,
        reason: ExitReason,
        fill: &FillModel,
    ) -> ExitFill {
        let fraction = fraction.min(self.remaining_fraction);
        let fill_price = fill.exit_price(self.direction, trigger, reason.is_stop());
        let quantity = self.quantity * fraction;
        let fee = fill.fee(fill_price, quantity);
        let pnl = (fill_price - self.entry_price) * self.direction.sign() * quantity - fee;

        self.remaining_fraction -= fraction;
        self.realized_pnl += pnl;
        self.status = if self.remaining_fraction.is_zero() {
            self.partial_protection_active = false;
            PositionStatus::Closed
        } else {
            PositionStatus::PartialOpen
        };

        let record = ExitFill {
            time,
            reason,
            trigger_price: trigger,
            fill_price,
            fraction,
            quantity,
            fee,
            pnl,
        };
        self.exits.push(record.clone());
        record
    }

    fn move_stop(&mut self, time: DateTime<Utc>, to: Decimal, cause: StopCause) -> StopChange {
        let change = StopChange {
            time,
            from: self.stop_loss,
            to,
            cause,
        };
        self.stop_loss = to;
        self.stop_history.push(change.clone());
        change
    }

    /// Whether `candidate` carries less risk than `current` for this direction.
    fn is_tighter(&self, candidate: Decimal, current: Decimal) -> bool {
        match self.direction {
            Direction::Long => candidate > current,
            Direction::Short => candidate < current,
        }
    }

    fn stop_crossed(&self, candle: &Candle, stop: Decimal) -> bool {
        match self.direction {
            Direction::Long => candle.low <= stop,
            Direction::Short => candle.high >= stop,
        }
    }

    fn target_reached(&self, candle: &Candle, target: Decimal) -> bool {
        match self.direction {
            Direction::Long => candle.high >= target,
            Direction::Short => candle.low <= target,
        }
    }

    /// A candle opening through the stop fills at the open.
    fn stop_fill_level(&self, candle: &Candle, stop: Decimal) -> Decimal {
        match self.direction {
            Direction::Long => stop.min(candle.open),
            Direction::Short => stop.max(candle.open),
        }
    }
}
