//! Time-indexed candle storage.
//!
//! Series are immutable after construction. All lookups are by close time so
//! that nothing still forming at a given instant can be observed.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{Candle, Timeframe, TimeframeStack};

/// Ordered candles of one symbol at one timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleSeries {
    timeframe: Timeframe,
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// Wrap candles as-is. Ordering is checked by validation, not here.
    pub fn new(timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        Self { timeframe, candles }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Number of leading candles whose close time is <= `t`.
    pub fn closed_count(&self, t: DateTime<Utc>) -> usize {
        self.candles.partition_point(|c| c.close_time() <= t)
    }

    /// Up to `depth` most recent candles among the first `closed` ones.
    pub fn window(&self, closed: usize, depth: usize) -> &[Candle] {
        let end = closed.min(self.candles.len());
        let start = end.saturating_sub(depth);
        &self.candles[start..end]
    }

    /// Index of the candle closing exactly at `t`, if any.
    pub fn index_closing_at(&self, t: DateTime<Utc>) -> Option<usize> {
        let idx = self.closed_count(t);
        (idx > 0 && self.candles[idx - 1].close_time() == t).then(|| idx - 1)
    }

    pub fn first_close_time(&self) -> Option<DateTime<Utc>> {
        self.candles.first().map(Candle::close_time)
    }

    pub fn last_close_time(&self) -> Option<DateTime<Utc>> {
        self.candles.last().map(Candle::close_time)
    }

    /// Copy of the series holding only candles closed by `t`.
    pub fn truncated(&self, t: DateTime<Utc>) -> Self {
        let n = self.closed_count(t);
        Self::new(self.timeframe, self.candles[..n].to_vec())
    }
}

/// The three timeframes of one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSeries {
    pub symbol: String,
    pub htf: CandleSeries,
    pub primary: CandleSeries,
    pub entry: CandleSeries,
}

impl SymbolSeries {
    pub fn series(&self, timeframe: Timeframe) -> Option<&CandleSeries> {
        [&self.htf, &self.primary, &self.entry]
            .into_iter()
            .find(|s| s.timeframe() == timeframe)
    }

    pub fn truncated(&self, t: DateTime<Utc>) -> Self {
        Self {
            symbol: self.symbol.clone(),
            htf: self.htf.truncated(t),
            primary: self.primary.truncated(t),
            entry: self.entry.truncated(t),
        }
    }
}

/// Pre-loaded, validated market data for every symbol in a run.
///
/// Symbols are kept in lexicographic order, which is also the tie-break
/// order for ticks sharing a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    timeframes: TimeframeStack,
    symbols: BTreeMap<String, SymbolSeries>,
}

impl MarketData {
    pub fn new(timeframes: TimeframeStack) -> Self {
        Self {
            timeframes,
            symbols: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, series: SymbolSeries) {
        self.symbols.insert(series.symbol.clone(), series);
    }

    pub fn timeframes(&self) -> TimeframeStack {
        self.timeframes
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolSeries> {
        self.symbols.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolSeries> {
        self.symbols.values()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Earliest and latest entry-candle close across all symbols.
    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self
            .symbols
            .values()
            .filter_map(|s| s.entry.first_close_time())
            .min()?;
        let end = self
            .symbols
            .values()
            .filter_map(|s| s.entry.last_close_time())
            .max()?;
        Some((start, end))
    }

    /// Data as it would have been known at `t`.
    pub fn truncated(&self, t: DateTime<Utc>) -> Self {
        Self {
            timeframes: self.timeframes,
            symbols: self
                .symbols
                .iter()
                .map(|(k, v)| (k.clone(), v.truncated(t)))
                .collect(),
        }
    }
}
