//! Property tests for replay invariants.
//!
//! Uses proptest to verify:
//! 1. Stop monotonicity: stops only tighten, except when a partial protection exit restores the earlier stop
//! 2. Fraction conservation: exited shares plus the remainder always sum to one
//! 3. Adaptive protection arms at most once per position
//! 4. Sizing never risks more than the configured share of equity
//! 5. Timeline order and visibility: ticks strictly ordered, no unclosed candle counted

use chrono::{DateTime, Duration, TimeZone, Utc};
use mtf_backtest::backtest::Timeline;
use mtf_backtest::config::{AdaptiveStopConfig, RiskConfig};
use mtf_backtest::market::{Candle, CandleSeries, Direction, MarketData, Regime, SymbolSeries, Timeframe, TimeframeStack};
use mtf_backtest::position::{ExitRules, FillModel, OpenParams, Position, PositionEvent, StopCause};
use mtf_backtest::risk::PositionSizer;
use mtf_backtest::strategy::{MarketConditions, TakeProfitLevel};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

// ── Fixtures ─────────────────────────────────────────────────────────

/// Candle path from 100 driven by (close move, upper wick, lower wick) in cents.
fn path(steps: &[(i64, i64, i64)]) -> Vec<Candle> {
    let mut open = dec!(100);
    steps
        .iter()
        .enumerate()
        .map(|(i, &(delta, up, down))| {
            let close = (open + Decimal::new(delta, 2)).max(dec!(50));
            let high = open.max(close) + Decimal::new(up, 2);
            let low = (open.min(close) - Decimal::new(down, 2)).max(dec!(1));
            let candle = Candle {
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::M5,
                timestamp: base() + Duration::minutes(5 * (i as i64 + 1)),
                open,
                high,
                low,
                close,
                volume: Decimal::ONE,
            };
            open = close;
            candle
        })
        .collect()
}

fn open_position(direction: Direction) -> Position {
    let sign = direction.sign();
    let targets = [(dec!(3), dec!(0.5)), (dec!(6), dec!(0.3)), (dec!(10), dec!(0.2))];
    Position::open(OpenParams {
        id: 1,
        symbol: "BTCUSDT".to_string(),
        direction,
        time: base(),
        entry_price: dec!(100),
        quantity: dec!(20),
        entry_fee: Decimal::ZERO,
        stop_loss: dec!(100) - sign * dec!(5),
        take_profits: targets
            .iter()
            .map(|&(offset, fraction)| TakeProfitLevel {
                price: dec!(100) + sign * offset,
                fraction,
            })
            .collect(),
        atr: Decimal::ONE,
        regime: Regime::Trending,
        score: 75,
        margin: dec!(400),
        equity_at_entry: dec!(10000),
    })
}

fn rules(partial_protection: bool) -> ExitRules {
    ExitRules {
        fill: FillModel::frictionless(),
        stop_ratchet: vec![dec!(0.5), Decimal::ZERO],
        adaptive: AdaptiveStopConfig {
            partial_protection,
            ..AdaptiveStopConfig::default()
        },
    }
}

// Always a spike in a degraded regime, so protection arms whenever profit allows.
fn hostile() -> Option<MarketConditions> {
    Some(MarketConditions {
        atr: dec!(3),
        regime: Regime::Choppy,
    })
}

fn arb_steps() -> impl Strategy<Value = Vec<(i64, i64, i64)>> {
    prop::collection::vec((-400i64..400, 0i64..300, 0i64..300), 1..80)
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Long), Just(Direction::Short)]
}

// ── 1-3. Position Invariants ─────────────────────────────────────────

proptest! {
    /// Stops only tighten; the one exception is the restore after a partial protection exit.
    #[test]
    fn stop_only_tightens(steps in arb_steps(), direction in arb_direction(), partial in any::<bool>()) {
        let mut position = open_position(direction);
        let rules = rules(partial);

        for candle in path(&steps) {
            for event in position.on_candle(&candle, &rules, hostile) {
                if let PositionEvent::StopMoved(change) = event {
                    if change.cause == StopCause::ProtectionRestore {
                        continue;
                    }
                    let tighter = match direction {
                        Direction::Long => change.to > change.from,
                        Direction::Short => change.to < change.from,
                    };
                    prop_assert!(tighter, "{:?} loosened the stop", change);
                }
            }
        }
    }

    /// Exited fractions plus the remainder always equal the original size.
    #[test]
    fn fractions_are_conserved(steps in arb_steps(), direction in arb_direction(), partial in any::<bool>()) {
        let mut position = open_position(direction);
        let rules = rules(partial);
        let mut previous = Decimal::ONE;

        for candle in path(&steps) {
            position.on_candle(&candle, &rules, hostile);
            let remaining = position.remaining_fraction();
            prop_assert!(remaining >= Decimal::ZERO && remaining <= previous);
            let exited: Decimal = position.exits().iter().map(|e| e.fraction).sum();
            prop_assert_eq!(exited + remaining, Decimal::ONE);
            previous = remaining;
        }

        if let Some(last) = position.exits().last() {
            prop_assert!(last.fraction > Decimal::ZERO);
        }
        if !position.is_open() {
            prop_assert!(position.remaining_fraction().is_zero());
        }
    }

    /// Adaptive protection arms at most once, however often conditions stay hostile.
    #[test]
    fn adaptive_arms_at_most_once(steps in arb_steps(), direction in arb_direction(), partial in any::<bool>()) {
        let mut position = open_position(direction);
        let rules = rules(partial);
        let mut armed = 0;

        for candle in path(&steps) {
            armed += position
                .on_candle(&candle, &rules, hostile)
                .iter()
                .filter(|e| matches!(e, PositionEvent::ProtectionArmed { .. }))
                .count();
        }

        prop_assert!(armed <= 1);
        prop_assert_eq!(armed == 1, position.adaptive_stop_triggered());
    }
}

// ── 4. Sizing ────────────────────────────────────────────────────────

proptest! {
    /// Accepted sizes lose at most `risk_per_trade` of equity at the stop and respect leverage.
    #[test]
    fn sizing_respects_risk_and_leverage(
        equity in 100i64..1_000_000,
        entry in 1i64..100_000,
        stop_bps in 1i64..2_000,
        risk_bps in 10i64..500,
        leverage in 1i64..20,
    ) {
        let config = RiskConfig {
            risk_per_trade: Decimal::new(risk_bps, 4),
            max_leverage: Decimal::from(leverage),
            min_notional: Decimal::ZERO,
            ..RiskConfig::default()
        };
        let equity = Decimal::from(equity);
        let entry = Decimal::from(entry);
        let stop = entry * (Decimal::ONE - Decimal::new(stop_bps, 4));

        if let Ok(sized) = PositionSizer::new(&config).size(equity, Decimal::ZERO, entry, stop) {
            let tolerance = dec!(0.000001);
            prop_assert!(sized.quantity * (entry - stop) <= equity * config.risk_per_trade + tolerance);
            prop_assert!(sized.notional <= equity * config.max_leverage + tolerance);
            prop_assert!(sized.margin <= equity + tolerance);
        }
    }
}

// ── 5. Timeline ──────────────────────────────────────────────────────

fn flat_series(symbol: &str, timeframe: Timeframe, offset: Duration, n: i32) -> CandleSeries {
    let candles = (0..n)
        .map(|i| Candle {
            symbol: symbol.to_string(),
            timeframe,
            timestamp: base() + offset + timeframe.duration() * i,
            open: dec!(10),
            high: dec!(10),
            low: dec!(10),
            close: dec!(10),
            volume: Decimal::ONE,
        })
        .collect();
    CandleSeries::new(timeframe, candles)
}

proptest! {
    /// Ticks are strictly ordered by (time, symbol) and only count closed candles.
    #[test]
    fn timeline_is_ordered_and_closed_only(
        layout in prop::collection::vec((0i64..24, 1i32..150), 1..4),
    ) {
        let names = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];
        let mut data = MarketData::new(TimeframeStack::default());
        let mut expected = 0usize;
        for (name, &(offset_bars, entries)) in names.iter().zip(&layout) {
            let offset = Duration::minutes(5 * offset_bars);
            data.insert(SymbolSeries {
                symbol: name.to_string(),
                htf: flat_series(name, Timeframe::H4, Duration::zero(), 3),
                primary: flat_series(name, Timeframe::M15, Duration::zero(), 60),
                entry: flat_series(name, Timeframe::M5, offset, entries),
            });
            expected += entries as usize;
        }

        let ticks: Vec<_> = Timeline::new(&data).iter().collect();
        prop_assert_eq!(ticks.len(), expected);

        for pair in ticks.windows(2) {
            prop_assert!((pair[0].timestamp, pair[0].symbol) < (pair[1].timestamp, pair[1].symbol));
        }

        for tick in &ticks {
            let Some(series) = data.get(tick.symbol) else {
                return Err(TestCaseError::fail("tick for unknown symbol"));
            };
            for (tf_series, visible) in [(&series.htf, tick.htf_closed), (&series.primary, tick.primary_closed)] {
                let candles = tf_series.candles();
                if visible > 0 {
                    prop_assert!(candles[visible - 1].close_time() <= tick.timestamp);
                }
                if visible < candles.len() {
                    prop_assert!(candles[visible].close_time() > tick.timestamp);
                }
            }
        }
    }
}
