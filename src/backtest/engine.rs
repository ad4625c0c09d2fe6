//! Backtesting simulation engine.
//!
//! Replays pre-loaded market data tick by tick. For each tick the engine:
//! 1. Manages the symbol's open position against the closed entry candle
//! 2. Force-closes it when the symbol's data ends
//! 3. Otherwise asks the risk governor, the exposure limits and the oracle
//!    whether to open a new position
//! 4. Appends an equity point
//!
//! The position table and the risk state live in a per-run `RunState`, so
//! one engine can replay several windows without leaking state between them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backtest::metrics::{BacktestMetrics, EquityPoint, MetricsSettings};
use crate::backtest::timeline::{ReplayWindow, Tick, Timeline};
use crate::backtest::validation::DataFault;
use crate::config::Config;
use crate::market::{Direction, MarketData, SymbolSeries, TimeframeStack};
use crate::notify::{NotificationSink, TradeEvent};
use crate::position::{ExitRules, OpenParams, Position, PositionEvent, TradeRecord};
use crate::risk::{DrawdownTracker, ExposureLimits, PositionSizer, RiskEvent, RiskGovernor, RiskState};
use crate::strategy::{CandidateRejection, EntryCandidate, MarketView, Signal, StrategyOracle};

/// Fatal replay errors. Everything else is logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("no replayable market data")]
    NoData,
    #[error("market data timeframes {found:?} differ from configured {expected:?}")]
    TimeframeMismatch {
        expected: TimeframeStack,
        found: TimeframeStack,
    },
    #[error("timeline out of order: {symbol} at {timestamp} after {previous_symbol} at {previous}")]
    Timeline {
        symbol: String,
        timestamp: DateTime<Utc>,
        previous_symbol: String,
        previous: DateTime<Utc>,
    },
}

/// Stage at which an entry candidate was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipStage {
    Validation,
    Sizing,
}

/// An oracle candidate that did not become a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSignal {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub stage: SkipStage,
    pub direction: Direction,
    pub score: u32,
    pub reason: CandidateRejection,
}

/// Replay counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub ticks: usize,
    pub oracle_queries: usize,
    pub candidates: usize,
    /// Entry attempts refused by the risk governor
    pub vetoed_ticks: usize,
    pub positions_opened: usize,
}

/// Complete result of a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub config: Config,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub skipped_signals: Vec<SkippedSignal>,
    pub risk_events: Vec<RiskEvent>,
    pub final_risk_state: RiskState,
    pub metrics: BacktestMetrics,
    pub stats: RunStats,
}

impl BacktestResult {
    /// Export equity curve to CSV.
    pub fn equity_to_csv(&self, path: &str) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for point in &self.equity_curve {
            writer.serialize(point)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        let day = |t: Option<DateTime<Utc>>| t.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d").to_string());
        format!(
            "{}\n\nStrategy: {}\nBacktest Period: {} to {}\nTicks: {}\nOracle Queries: {}\nVetoed Entries: {}\nSkipped Signals: {}",
            self.metrics.summary(),
            self.strategy,
            day(self.start_time),
            day(self.end_time),
            self.stats.ticks,
            self.stats.oracle_queries,
            self.stats.vetoed_ticks,
            self.skipped_signals.len(),
        )
    }
}

/// A run result plus the data faults that excluded symbols before replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub result: BacktestResult,
    pub data_faults: Vec<DataFault>,
}

impl BacktestReport {
    pub fn new(result: BacktestResult, data_faults: Vec<DataFault>) -> Self {
        Self { result, data_faults }
    }
}

/// Mutable state of one replay.
struct RunState {
    governor: RiskGovernor,
    positions: BTreeMap<String, Position>,
    trades: Vec<TradeRecord>,
    equity_curve: Vec<EquityPoint>,
    skipped: Vec<SkippedSignal>,
    drawdown: DrawdownTracker,
    last_key: Option<(DateTime<Utc>, String)>,
    first_tick: Option<DateTime<Utc>>,
    next_id: u64,
    stats: RunStats,
}

impl RunState {
    fn new(config: &Config) -> Self {
        let capital = config.backtest.initial_capital;
        Self {
            governor: RiskGovernor::new(config.risk.clone(), capital),
            positions: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            skipped: Vec::new(),
            drawdown: DrawdownTracker::new(capital),
            last_key: None,
            first_tick: None,
            next_id: 1,
            stats: RunStats::default(),
        }
    }

    /// Ticks must arrive strictly ordered by `(timestamp, symbol)`.
    fn check_order(&mut self, tick: &Tick<'_>) -> Result<(), EngineError> {
        if let Some((previous, previous_symbol)) = &self.last_key {
            if (tick.timestamp, tick.symbol) <= (*previous, previous_symbol.as_str()) {
                error!(
                    symbol = tick.symbol,
                    timestamp = %tick.timestamp,
                    previous = %previous,
                    "Timeline ordering breach, aborting replay"
                );
                return Err(EngineError::Timeline {
                    symbol: tick.symbol.to_string(),
                    timestamp: tick.timestamp,
                    previous_symbol: previous_symbol.clone(),
                    previous: *previous,
                });
            }
        }
        self.last_key = Some((tick.timestamp, tick.symbol.to_string()));
        self.first_tick.get_or_insert(tick.timestamp);
        Ok(())
    }

    fn margin_in_use(&self) -> Decimal {
        self.positions.values().map(Position::margin).sum()
    }
}

/// The backtesting simulation engine.
pub struct BacktestEngine<O: StrategyOracle> {
    config: Config,
    oracle: O,
    rules: ExitRules,
    sizer: PositionSizer,
    limits: ExposureLimits,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl<O: StrategyOracle> BacktestEngine<O> {
    /// Create a new backtest engine.
    pub fn new(config: Config, oracle: O) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Config(format!("{e:#}")))?;

        Ok(Self {
            rules: ExitRules::from_config(&config),
            sizer: PositionSizer::new(&config.risk),
            limits: ExposureLimits::new(
                config.risk.max_open_positions,
                config.backtest.primary_symbol.clone(),
            ),
            config,
            oracle,
            notifier: None,
        })
    }

    /// Deliver trade events to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Replay the configured `[start, end)` window.
    pub fn run(&self, data: &MarketData) -> Result<BacktestResult, EngineError> {
        let window = ReplayWindow::new(self.config.backtest.start, self.config.backtest.end);
        self.run_window(data, window)
    }

    /// Replay ticks inside `window` with fresh risk state and an empty
    /// position table. Candles before the window stay visible as history.
    pub fn run_window(&self, data: &MarketData, window: ReplayWindow) -> Result<BacktestResult, EngineError> {
        if data.is_empty() {
            return Err(EngineError::NoData);
        }
        if data.timeframes() != self.config.backtest.timeframes {
            return Err(EngineError::TimeframeMismatch {
                expected: self.config.backtest.timeframes,
                found: data.timeframes(),
            });
        }

        info!(
            strategy = self.oracle.name(),
            symbols = data.len(),
            from = ?window.from,
            until = ?window.until,
            "Starting backtest"
        );

        let mut state = RunState::new(&self.config);
        let timeline = Timeline::with_window(data, window);
        for tick in &timeline {
            let Some(series) = data.get(tick.symbol) else {
                continue;
            };
            self.step(&mut state, series, &tick)?;
        }

        Ok(self.finish(state))
    }

    fn step<'a>(&self, state: &mut RunState, series: &'a SymbolSeries, tick: &Tick<'a>) -> Result<(), EngineError> {
        state.check_order(tick)?;
        state.stats.ticks += 1;

        let now = tick.timestamp;
        let symbol = tick.symbol;
        let candle = &series.entry.candles()[tick.entry_index];
        state.governor.on_tick(now);

        // 1. Manage the open position
        let closed = match state.positions.get_mut(symbol) {
            Some(position) => {
                let events = position.on_candle(candle, &self.rules, || {
                    self.oracle.conditions(&self.view(series, tick))
                });
                self.publish(position, &events);
                !position.is_open()
            }
            None => false,
        };
        if closed {
            self.settle(state, symbol, now);
        }

        // 2. Data exhausted for this symbol
        if tick.is_last {
            if let Some(position) = state.positions.get_mut(symbol) {
                if let Some(fill) = position.force_close(now, candle.close, &self.rules.fill) {
                    self.publish(position, &[PositionEvent::Exit(fill)]);
                }
                self.settle(state, symbol, now);
            }
        } else if !state.positions.contains_key(symbol) {
            // 3. New entry
            self.try_enter(state, series, tick);
        }

        // 4. Equity point
        let balance = state.governor.equity();
        let unrealized: Decimal = state
            .positions
            .values()
            .map(|p| {
                let price = if p.symbol() == symbol { candle.close } else { p.last_price() };
                p.mark_to_market(price)
            })
            .sum();
        state.drawdown.update(now, balance + unrealized);
        state.equity_curve.push(EquityPoint::new(
            now,
            balance,
            unrealized,
            state.positions.len(),
            state.drawdown.peak_equity(),
        ));

        Ok(())
    }

    /// Oracle view at `tick`: closed candles only, at most `view_depth` each.
    fn view<'a>(&self, series: &'a SymbolSeries, tick: &Tick<'a>) -> MarketView<'a> {
        let depth = self.config.backtest.view_depth;
        MarketView {
            symbol: tick.symbol,
            as_of: tick.timestamp,
            htf: series.htf.window(tick.htf_closed, depth),
            primary: series.primary.window(tick.primary_closed, depth),
            entry: series.entry.window(tick.entry_closed, depth),
        }
    }

    fn try_enter<'a>(&self, state: &mut RunState, series: &'a SymbolSeries, tick: &Tick<'a>) {
        let now = tick.timestamp;
        let symbol = tick.symbol;

        if let Err(veto) = state.governor.can_open(now) {
            debug!(symbol, timestamp = %now, %veto, "Entry vetoed by risk governor");
            state.stats.vetoed_ticks += 1;
            return;
        }
        if let Err(block) = self.limits.check(symbol, state.positions.keys().map(String::as_str)) {
            debug!(symbol, timestamp = %now, %block, "Entry blocked by exposure limits");
            return;
        }

        let view = self.view(series, tick);
        let Some(close) = view.last_close() else {
            return;
        };
        let account = state.governor.snapshot(state.positions.len());
        state.stats.oracle_queries += 1;
        let candidate = match self.oracle.evaluate(&view, &account) {
            Signal::NoSignal => return,
            Signal::Candidate(candidate) => candidate,
        };
        state.stats.candidates += 1;

        if let Err(rejection) = candidate.validate(close, self.config.execution.max_entry_deviation) {
            self.skip(state, now, symbol, &candidate, SkipStage::Validation, rejection);
            return;
        }

        let entry_price = self.rules.fill.entry_price(candidate.direction, close);
        if let Err(rejection) = check_fill_bracket(&candidate, entry_price) {
            self.skip(state, now, symbol, &candidate, SkipStage::Validation, rejection);
            return;
        }

        let equity = state.governor.equity();
        let sized = match self.sizer.size(equity, state.margin_in_use(), entry_price, candidate.stop_loss) {
            Ok(sized) => sized,
            Err(rejection) => {
                self.skip(state, now, symbol, &candidate, SkipStage::Sizing, rejection);
                return;
            }
        };

        let id = state.next_id;
        state.next_id += 1;
        let position = Position::open(OpenParams {
            id,
            symbol: symbol.to_string(),
            direction: candidate.direction,
            time: now,
            entry_price,
            quantity: sized.quantity,
            entry_fee: self.rules.fill.fee(entry_price, sized.quantity),
            stop_loss: candidate.stop_loss,
            take_profits: candidate.take_profits.clone(),
            atr: candidate.atr,
            regime: candidate.regime,
            score: candidate.score,
            margin: sized.margin,
            equity_at_entry: equity,
        });

        info!(
            symbol,
            timestamp = %now,
            direction = %candidate.direction,
            entry = %entry_price,
            stop = %candidate.stop_loss,
            quantity = %sized.quantity,
            regime = %candidate.regime,
            score = candidate.score,
            reason = %candidate.reason,
            "Opened position"
        );
        self.notify(&TradeEvent::Opened {
            symbol: symbol.to_string(),
            time: now,
            direction: candidate.direction,
            entry_price,
            quantity: sized.quantity,
            stop_loss: candidate.stop_loss,
            regime: candidate.regime,
            score: candidate.score,
        });

        state.positions.insert(symbol.to_string(), position);
        state.stats.positions_opened += 1;
    }

    fn skip(
        &self,
        state: &mut RunState,
        now: DateTime<Utc>,
        symbol: &str,
        candidate: &EntryCandidate,
        stage: SkipStage,
        reason: CandidateRejection,
    ) {
        if reason.is_logic_fault() {
            warn!(symbol, timestamp = %now, ?stage, %reason, "Oracle returned an inconsistent candidate");
        } else {
            debug!(symbol, timestamp = %now, ?stage, %reason, "Skipped entry signal");
        }
        state.skipped.push(SkippedSignal {
            timestamp: now,
            symbol: symbol.to_string(),
            stage,
            direction: candidate.direction,
            score: candidate.score,
            reason,
        });
    }

    /// Move a fully closed position into the ledger and book it.
    fn settle(&self, state: &mut RunState, symbol: &str, now: DateTime<Utc>) {
        let Some(position) = state.positions.remove(symbol) else {
            return;
        };
        let Some(record) = TradeRecord::from_position(&position) else {
            state.positions.insert(symbol.to_string(), position);
            return;
        };

        state.governor.record_close(record.pnl, now);
        info!(
            symbol,
            timestamp = %now,
            reason = %record.exit_reason,
            pnl = %record.pnl,
            r = %record.r_multiple.round_dp(2),
            equity = %state.governor.equity(),
            "Closed position"
        );
        self.notify(&TradeEvent::Closed {
            symbol: symbol.to_string(),
            time: record.exit_time,
            reason: record.exit_reason,
            exit_price: record.exit_price,
            pnl: record.pnl,
            r_multiple: record.r_multiple,
        });
        state.trades.push(record);
    }

    fn publish(&self, position: &Position, events: &[PositionEvent]) {
        let symbol = position.symbol();
        let exited: Decimal = events
            .iter()
            .filter_map(|e| match e {
                PositionEvent::Exit(fill) => Some(fill.fraction),
                _ => None,
            })
            .sum();
        let mut remaining = position.remaining_fraction() + exited;

        for event in events {
            match event {
                PositionEvent::Exit(fill) => {
                    remaining -= fill.fraction;
                    info!(
                        symbol,
                        timestamp = %fill.time,
                        reason = %fill.reason,
                        price = %fill.fill_price,
                        fraction = %fill.fraction,
                        pnl = %fill.pnl,
                        "Position exit"
                    );
                    // The closing slice is reported as `Closed` once settled
                    if remaining > Decimal::ZERO {
                        self.notify(&TradeEvent::PartialExit {
                            symbol: symbol.to_string(),
                            time: fill.time,
                            reason: fill.reason,
                            fill_price: fill.fill_price,
                            fraction: fill.fraction,
                            pnl: fill.pnl,
                            remaining_fraction: remaining,
                        });
                    }
                }
                PositionEvent::StopMoved(change) => {
                    debug!(
                        symbol,
                        timestamp = %change.time,
                        from = %change.from,
                        to = %change.to,
                        cause = ?change.cause,
                        "Stop moved"
                    );
                }
                PositionEvent::ProtectionArmed {
                    time,
                    trigger,
                    profit_r,
                    stop_loss,
                    partial,
                } => {
                    info!(
                        symbol,
                        timestamp = %time,
                        ?trigger,
                        profit_r = %profit_r.round_dp(2),
                        stop = %stop_loss,
                        partial,
                        "Adaptive protection armed"
                    );
                    self.notify(&TradeEvent::ProtectionArmed {
                        symbol: symbol.to_string(),
                        time: *time,
                        trigger: *trigger,
                        stop_loss: *stop_loss,
                        partial: *partial,
                    });
                }
            }
        }
    }

    fn notify(&self, event: &TradeEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(event);
        }
    }

    fn finish(&self, state: RunState) -> BacktestResult {
        let settings = MetricsSettings::new(&self.config.metrics, self.config.backtest.timeframes.entry);
        let metrics = BacktestMetrics::calculate(
            &state.trades,
            &state.equity_curve,
            self.config.backtest.initial_capital,
            &settings,
        );

        info!(
            trades = metrics.total_trades,
            final_equity = %metrics.final_equity,
            ticks = state.stats.ticks,
            skipped = state.skipped.len(),
            "Backtest complete"
        );

        let final_risk_state = state.governor.state().clone();
        BacktestResult {
            strategy: self.oracle.name().to_string(),
            config: self.config.clone(),
            start_time: state.first_tick,
            end_time: state.last_key.map(|(t, _)| t),
            trades: state.trades,
            equity_curve: state.equity_curve,
            skipped_signals: state.skipped,
            risk_events: state.governor.into_events(),
            final_risk_state,
            metrics,
            stats: state.stats,
        }
    }
}

/// The stop and the first target must still bracket the slipped entry fill.
fn check_fill_bracket(candidate: &EntryCandidate, entry_price: Decimal) -> Result<(), CandidateRejection> {
    let sign = candidate.direction.sign();
    if (entry_price - candidate.stop_loss) * sign <= Decimal::ZERO {
        return Err(CandidateRejection::Inconsistent {
            detail: format!("stop {} not below entry fill {}", candidate.stop_loss, entry_price),
        });
    }
    if let Some(first) = candidate.take_profits.first() {
        if (first.price - entry_price) * sign <= Decimal::ZERO {
            return Err(CandidateRejection::Inconsistent {
                detail: format!("take-profit {} not beyond entry fill {}", first.price, entry_price),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::testkit::*;
    use crate::notify::MockNotificationSink;
    use crate::position::ExitReason;
    use crate::risk::RiskEventKind;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    // =========================================================================
    // Exit Path Tests
    // =========================================================================

    #[test]
    fn test_take_profit_ladder_end_to_end() {
        let mut bars = vec![flat(dec!(100))];
        bars.push(ohlc(dec!(100), dec!(103.5), dec!(100), dec!(103)));
        bars.push(ohlc(dec!(103), dec!(106), dec!(102), dec!(105)));
        bars.push(ohlc(dec!(100), dec!(100.5), dec!(94), dec!(96)));
        bars.extend(std::iter::repeat(flat(dec!(96))).take(4));
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let oracle = ScriptedOracle::at_ticks(&[0], dec!(5), ladder());
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        let result = engine.run(&data).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        let reasons: Vec<_> = trade.exits.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![
                ExitReason::TakeProfit { level: 1 },
                ExitReason::TakeProfit { level: 2 },
                ExitReason::StopLoss,
            ]
        );
        // qty = 100 / 5 = 20: 10 @103, 6 @106, 4 @95
        assert_eq!(trade.quantity, dec!(20));
        assert_eq!(trade.pnl, dec!(46));
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(result.final_risk_state.equity, dec!(10046));
        assert_eq!(result.metrics.final_equity, dec!(10046));
    }

    #[test]
    fn test_forced_close_at_end_of_data() {
        let mut bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(3).collect();
        bars.push(flat(dec!(101)));
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let oracle = ScriptedOracle::at_ticks(&[0], dec!(5), ladder());
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        let result = engine.run(&data).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::BacktestEnd);
        assert_eq!(trade.exit_price, dec!(101));
        assert_eq!(trade.exit_time, tick_time(3));
        assert_eq!(trade.pnl, dec!(20));
    }

    #[test]
    fn test_equity_curve_one_point_per_tick_with_unrealized() {
        let mut bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(2).collect();
        bars.push(flat(dec!(102)));
        bars.push(flat(dec!(102)));
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let oracle = ScriptedOracle::at_ticks(&[0], dec!(5), ladder());
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        let result = engine.run(&data).unwrap();

        assert_eq!(result.equity_curve.len(), 4);
        assert_eq!(result.stats.ticks, 4);
        let third = &result.equity_curve[2];
        assert_eq!(third.balance, dec!(10000));
        assert_eq!(third.unrealized_pnl, dec!(40));
        assert_eq!(third.total_equity, dec!(10040));
        assert_eq!(third.position_count, 1);
        assert_eq!(result.equity_curve[3].position_count, 0);
    }

    #[test]
    fn test_equity_csv_export() {
        let bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(5).collect();
        let data = market(vec![path_series("BTCUSDT", &bars)]);
        let oracle = ScriptedOracle::at_ticks(&[0], dec!(5), ladder());
        let result = BacktestEngine::new(test_config(), oracle).unwrap().run(&data).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equity.csv");
        result.equity_to_csv(path.to_str().unwrap()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,balance"));
        assert_eq!(lines.count(), 5);
    }

    // =========================================================================
    // Risk Governor Integration Tests
    // =========================================================================

    #[test]
    fn test_cooldown_blocks_entries_until_expiry() {
        let bars: Vec<_> = std::iter::repeat(ohlc(dec!(100), dec!(100.5), dec!(98.5), dec!(100)))
            .take(160)
            .collect();
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let oracle = ScriptedOracle::always(dec!(1), vec![(dec!(150), dec!(1))]);
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        let result = engine.run(&data).unwrap();

        let third_loss = tick_time(3);
        let until = third_loss + Duration::hours(12);
        let exits: Vec<_> = result.trades.iter().take(3).map(|t| t.exit_time).collect();
        assert_eq!(exits, vec![tick_time(1), tick_time(2), third_loss]);
        assert!(result.trades[..3].iter().all(|t| t.is_loss()));

        assert!(result.risk_events.iter().any(|e| e.event
            == RiskEventKind::CooldownStarted { losses: 3, until }));

        // No oracle query and no entry inside the cooldown
        let queried = engine.oracle().query_times("BTCUSDT");
        assert!(queried.iter().all(|t| *t <= tick_time(2) || *t >= until));
        assert_eq!(result.trades[3].entry_time, until);
        assert!(result.stats.vetoed_ticks >= 143);
    }

    #[test]
    fn test_max_open_positions_limits_exposure() {
        let bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(6).collect();
        let data = market(vec![
            path_series("BTCUSDT", &bars),
            path_series("ETHUSDT", &bars),
        ]);

        let mut config = test_config();
        config.risk.max_open_positions = 1;
        let oracle = ScriptedOracle::always(dec!(5), ladder());
        let engine = BacktestEngine::new(config, oracle).unwrap();
        let result = engine.run(&data).unwrap();

        // BTCUSDT wins the first tie and holds until its data ends
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].symbol, "BTCUSDT");
        assert!(result.equity_curve.iter().all(|p| p.position_count <= 1));
        assert!(engine.oracle().query_times("ETHUSDT").is_empty());
    }

    // =========================================================================
    // Rejection Tests
    // =========================================================================

    #[test]
    fn test_inconsistent_candidate_is_skipped() {
        let bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(4).collect();
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        // Stop above a long entry
        let oracle = ScriptedOracle::at_ticks(&[0], dec!(-5), ladder());
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        let result = engine.run(&data).unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.skipped_signals.len(), 1);
        let skipped = &result.skipped_signals[0];
        assert_eq!(skipped.stage, SkipStage::Validation);
        assert!(skipped.reason.is_logic_fault());
        assert_eq!(skipped.timestamp, tick_time(0));
    }

    #[test]
    fn test_undersized_candidate_is_skipped() {
        let bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(4).collect();
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let mut config = test_config();
        config.risk.min_notional = dec!(1000000);
        let oracle = ScriptedOracle::at_ticks(&[0], dec!(5), ladder());
        let engine = BacktestEngine::new(config, oracle).unwrap();
        let result = engine.run(&data).unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.skipped_signals[0].stage, SkipStage::Sizing);
        assert!(matches!(
            result.skipped_signals[0].reason,
            CandidateRejection::BelowMinNotional { .. }
        ));
    }

    #[test]
    fn test_slipped_fill_must_stay_inside_levels() {
        let bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(4).collect();
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let mut config = test_config();
        config.execution.slippage = dec!(0.002);
        // Target at 100.1 sits below the slipped fill of 100.2
        let oracle = ScriptedOracle::at_ticks(&[0], dec!(5), vec![(dec!(0.1), dec!(1))]);
        let engine = BacktestEngine::new(config, oracle).unwrap();
        let result = engine.run(&data).unwrap();

        assert!(result.trades.is_empty());
        assert!(result.skipped_signals[0].reason.is_logic_fault());
    }

    // =========================================================================
    // Notification Tests
    // =========================================================================

    #[test]
    fn test_notifier_receives_lifecycle_events() {
        let mut bars = vec![flat(dec!(100))];
        bars.push(ohlc(dec!(100), dec!(103.5), dec!(100), dec!(103)));
        bars.push(ohlc(dec!(100), dec!(100.5), dec!(94), dec!(96)));
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut mock = MockNotificationSink::new();
        mock.expect_notify().returning(move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let oracle = ScriptedOracle::at_ticks(&[0], dec!(5), ladder());
        let engine = BacktestEngine::new(test_config(), oracle)
            .unwrap()
            .with_notifier(Arc::new(mock));
        engine.run(&data).unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TradeEvent::Opened { .. }));
        match &events[1] {
            TradeEvent::PartialExit { remaining_fraction, .. } => {
                assert_eq!(*remaining_fraction, dec!(0.5))
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[2] {
            TradeEvent::Closed { reason, .. } => assert_eq!(*reason, ExitReason::StopLoss),
            other => panic!("unexpected event {other:?}"),
        }
    }

    // =========================================================================
    // Run Isolation / Error Tests
    // =========================================================================

    #[test]
    fn test_runs_are_deterministic_and_isolated() {
        let bars: Vec<_> = std::iter::repeat(ohlc(dec!(100), dec!(100.5), dec!(98.5), dec!(100)))
            .take(20)
            .collect();
        let data = market(vec![
            path_series("BTCUSDT", &bars),
            path_series("ETHUSDT", &bars),
        ]);

        let oracle = ScriptedOracle::always(dec!(1), vec![(dec!(150), dec!(1))]);
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        let first = engine.run(&data).unwrap();
        let second = engine.run(&data).unwrap();

        assert_eq!(first.trades, second.trades);
        assert_eq!(first.equity_curve, second.equity_curve);
        assert_eq!(first.final_risk_state, second.final_risk_state);
    }

    #[test]
    fn test_window_limits_replay() {
        let bars: Vec<_> = std::iter::repeat(flat(dec!(100))).take(10).collect();
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let oracle = ScriptedOracle::always(dec!(5), ladder());
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        let window = ReplayWindow::new(Some(tick_time(4)), Some(tick_time(8)));
        let result = engine.run_window(&data, window).unwrap();

        assert_eq!(result.stats.ticks, 4);
        assert_eq!(result.start_time, Some(tick_time(4)));
        assert_eq!(result.end_time, Some(tick_time(7)));
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_time, tick_time(7));
    }

    #[test]
    fn test_empty_and_mismatched_data_rejected() {
        let engine = BacktestEngine::new(test_config(), ScriptedOracle::always(dec!(5), ladder())).unwrap();
        let empty = market(Vec::new());
        assert!(matches!(engine.run(&empty), Err(EngineError::NoData)));

        let mut config = test_config();
        config.backtest.timeframes.primary = crate::market::Timeframe::H1;
        let engine = BacktestEngine::new(config, ScriptedOracle::always(dec!(5), ladder())).unwrap();
        let bars = vec![flat(dec!(100))];
        let data = market(vec![path_series("BTCUSDT", &bars)]);
        assert!(matches!(
            engine.run(&data),
            Err(EngineError::TimeframeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.risk.risk_per_trade = dec!(2);
        let result = BacktestEngine::new(config, ScriptedOracle::always(dec!(5), ladder()));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_oracle_never_sees_future_candles() {
        let bars: Vec<_> = (0..30).map(|i| flat(dec!(100) + Decimal::from(i))).collect();
        let data = market(vec![path_series("BTCUSDT", &bars)]);

        let oracle = ScriptedOracle::always(dec!(5), ladder());
        let engine = BacktestEngine::new(test_config(), oracle).unwrap();
        engine.run(&data).unwrap();
        assert!(!engine.oracle().saw_future());
    }
}
