//! Fixtures for replay tests: price paths, configs, and a scripted oracle.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::config::{Config, ExecutionConfig};
use crate::market::{Candle, CandleSeries, Direction, MarketData, Regime, SymbolSeries, Timeframe, TimeframeStack};
use crate::strategy::{
    AccountSnapshot, EntryCandidate, MarketConditions, MarketView, Signal, StrategyOracle, TakeProfitLevel,
};

pub type Bar = (Decimal, Decimal, Decimal, Decimal);

/// Monday 2024-01-01 00:00 UTC.
pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Close time of the `i`-th entry candle.
pub fn tick_time(i: i64) -> DateTime<Utc> {
    base() + Duration::minutes(5 * (i + 1))
}

pub fn ohlc(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
    (open, high, low, close)
}

pub fn flat(price: Decimal) -> Bar {
    (price, price, price, price)
}

fn series(symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> CandleSeries {
    let candles = bars
        .iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| Candle {
            symbol: symbol.to_string(),
            timeframe,
            timestamp: base() + timeframe.duration() * i as i32,
            open,
            high,
            low,
            close,
            volume: Decimal::ONE,
        })
        .collect();
    CandleSeries::new(timeframe, candles)
}

/// Aggregate consecutive entry bars into coarser bars.
fn aggregate(bars: &[Bar], per: usize) -> Vec<Bar> {
    bars.chunks_exact(per)
        .map(|chunk| {
            let high = chunk.iter().map(|b| b.1).max().unwrap_or_default();
            let low = chunk.iter().map(|b| b.2).min().unwrap_or_default();
            (chunk[0].0, high, low, chunk[per - 1].3)
        })
        .collect()
}

/// A symbol on the default 4h / 15m / 5m stack whose entry candles follow
/// `bars`; coarser candles are aggregated from complete groups.
pub fn path_series(symbol: &str, bars: &[Bar]) -> SymbolSeries {
    SymbolSeries {
        symbol: symbol.to_string(),
        htf: series(symbol, Timeframe::H4, &aggregate(bars, 48)),
        primary: series(symbol, Timeframe::M15, &aggregate(bars, 3)),
        entry: series(symbol, Timeframe::M5, bars),
    }
}

pub fn market(symbols: Vec<SymbolSeries>) -> MarketData {
    let mut data = MarketData::new(TimeframeStack::default());
    for series in symbols {
        data.insert(series);
    }
    data
}

/// Frictionless fills and no adaptive protection.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.execution = ExecutionConfig::frictionless();
    config.exits.adaptive.enabled = false;
    config
}

/// Targets at +3 / +6 / +10 for 50 / 30 / 20 percent.
pub fn ladder() -> Vec<(Decimal, Decimal)> {
    vec![
        (Decimal::from(3), Decimal::new(5, 1)),
        (Decimal::from(6), Decimal::new(3, 1)),
        (Decimal::from(10), Decimal::new(2, 1)),
    ]
}

/// Long candidate at `close` with a stop `stop_offset` below and targets at
/// the given offsets above.
pub fn long_candidate(close: Decimal, stop_offset: Decimal, targets: &[(Decimal, Decimal)]) -> EntryCandidate {
    EntryCandidate {
        direction: Direction::Long,
        entry_price: close,
        stop_loss: close - stop_offset,
        take_profits: targets
            .iter()
            .map(|&(offset, fraction)| TakeProfitLevel {
                price: close + offset,
                fraction,
            })
            .collect(),
        regime: Regime::Trending,
        score: 80,
        atr: Decimal::ONE,
        reason: "scripted".to_string(),
    }
}

/// Oracle that goes long on chosen ticks and records every query.
pub struct ScriptedOracle {
    ticks: Option<Vec<DateTime<Utc>>>,
    stop_offset: Decimal,
    targets: Vec<(Decimal, Decimal)>,
    queries: Mutex<Vec<(String, DateTime<Utc>)>>,
    saw_future: AtomicBool,
}

impl ScriptedOracle {
    /// Enter whenever asked.
    pub fn always(stop_offset: Decimal, targets: Vec<(Decimal, Decimal)>) -> Self {
        Self {
            ticks: None,
            stop_offset,
            targets,
            queries: Mutex::new(Vec::new()),
            saw_future: AtomicBool::new(false),
        }
    }

    /// Enter only at the given tick indices.
    pub fn at_ticks(indices: &[i64], stop_offset: Decimal, targets: Vec<(Decimal, Decimal)>) -> Self {
        Self {
            ticks: Some(indices.iter().map(|&i| tick_time(i)).collect()),
            ..Self::always(stop_offset, targets)
        }
    }

    pub fn query_times(&self, symbol: &str) -> Vec<DateTime<Utc>> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == symbol)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn saw_future(&self) -> bool {
        self.saw_future.load(Ordering::SeqCst)
    }

    fn inspect(&self, view: &MarketView<'_>) {
        let future = [view.htf, view.primary, view.entry]
            .iter()
            .flat_map(|s| s.iter())
            .any(|c| c.close_time() > view.as_of);
        if future {
            self.saw_future.store(true, Ordering::SeqCst);
        }
    }
}

impl StrategyOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    fn evaluate(&self, view: &MarketView<'_>, _account: &AccountSnapshot) -> Signal {
        self.inspect(view);
        self.queries
            .lock()
            .unwrap()
            .push((view.symbol.to_string(), view.as_of));

        let wanted = self.ticks.as_ref().map_or(true, |t| t.contains(&view.as_of));
        match view.last_close() {
            Some(close) if wanted => Signal::Candidate(long_candidate(close, self.stop_offset, &self.targets)),
            _ => Signal::NoSignal,
        }
    }

    fn conditions(&self, view: &MarketView<'_>) -> Option<MarketConditions> {
        self.inspect(view);
        None
    }
}
