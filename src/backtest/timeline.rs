//! Global tick ordering across symbols and timeframes.
//!
//! One tick per closed entry-timeframe candle, ordered by `(close_time,
//! symbol)`. Coarser candles never produce ticks of their own; a tick only
//! reports which coarser timeframes closed at the same instant and how many
//! candles of each timeframe are visible.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::market::{MarketData, SymbolSeries, Timeframe};

/// One simulation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick<'a> {
    /// Close time of the entry candle
    pub timestamp: DateTime<Utc>,
    pub symbol: &'a str,
    /// Index of the entry candle in its series
    pub entry_index: usize,
    /// Visible (closed) candle counts per timeframe at `timestamp`
    pub htf_closed: usize,
    pub primary_closed: usize,
    pub entry_closed: usize,
    /// Timeframes with a candle closing exactly at `timestamp`, finest first
    pub closing: Vec<Timeframe>,
    /// Last tick of this symbol inside the replay window
    pub is_last: bool,
}

/// Replay bounds on tick timestamps: `[from, until)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ReplayWindow {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { from, until }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from.map_or(true, |f| t >= f) && self.until.map_or(true, |u| t < u)
    }
}

/// Merged tick sequence over a `MarketData` set.
///
/// Cheap to construct; every call to [`Timeline::iter`] restarts from the
/// beginning.
#[derive(Debug, Clone, Copy)]
pub struct Timeline<'a> {
    data: &'a MarketData,
    window: ReplayWindow,
}

impl<'a> Timeline<'a> {
    pub fn new(data: &'a MarketData) -> Self {
        Self {
            data,
            window: ReplayWindow::full(),
        }
    }

    pub fn with_window(data: &'a MarketData, window: ReplayWindow) -> Self {
        Self { data, window }
    }

    pub fn iter(&self) -> TickIter<'a> {
        let symbols: Vec<&'a SymbolSeries> = self.data.iter().collect();
        let mut heap = BinaryHeap::with_capacity(symbols.len());
        let mut last_in_window = Vec::with_capacity(symbols.len());

        for (slot, series) in symbols.iter().enumerate() {
            let candles = series.entry.candles();
            let start = match self.window.from {
                Some(from) => candles.partition_point(|c| c.close_time() < from),
                None => 0,
            };
            let end = match self.window.until {
                Some(until) => candles.partition_point(|c| c.close_time() < until),
                None => candles.len(),
            };
            last_in_window.push(end);
            if start < end {
                heap.push(Reverse((candles[start].close_time(), series.symbol.as_str(), slot, start)));
            }
        }

        TickIter {
            symbols,
            heap,
            last_in_window,
        }
    }
}

impl<'a> IntoIterator for &Timeline<'a> {
    type Item = Tick<'a>;
    type IntoIter = TickIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

type HeapEntry<'a> = Reverse<(DateTime<Utc>, &'a str, usize, usize)>;

/// Lazy k-way merge over each symbol's entry series.
pub struct TickIter<'a> {
    symbols: Vec<&'a SymbolSeries>,
    heap: BinaryHeap<HeapEntry<'a>>,
    /// Exclusive end index per symbol slot
    last_in_window: Vec<usize>,
}

impl<'a> Iterator for TickIter<'a> {
    type Item = Tick<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((timestamp, symbol, slot, index)) = self.heap.pop()?;
        let series = self.symbols[slot];
        let end = self.last_in_window[slot];

        if index + 1 < end {
            let next_close = series.entry.candles()[index + 1].close_time();
            self.heap.push(Reverse((next_close, symbol, slot, index + 1)));
        }

        let closing = [&series.entry, &series.primary, &series.htf]
            .into_iter()
            .filter(|s| s.index_closing_at(timestamp).is_some())
            .map(|s| s.timeframe())
            .collect();

        Some(Tick {
            timestamp,
            symbol,
            entry_index: index,
            htf_closed: series.htf.closed_count(timestamp),
            primary_closed: series.primary.closed_count(timestamp),
            entry_closed: index + 1,
            closing,
            is_last: index + 1 == end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Candle, CandleSeries, TimeframeStack};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series(symbol: &str, timeframe: Timeframe, offset: Duration, n: i32) -> CandleSeries {
        let candles = (0..n)
            .map(|i| Candle {
                symbol: symbol.to_string(),
                timeframe,
                timestamp: base() + offset + timeframe.duration() * i,
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: dec!(1),
                volume: dec!(1),
            })
            .collect();
        CandleSeries::new(timeframe, candles)
    }

    fn symbol(name: &str, entry_offset: Duration, entries: i32) -> SymbolSeries {
        SymbolSeries {
            symbol: name.to_string(),
            htf: series(name, Timeframe::H4, Duration::zero(), 2),
            primary: series(name, Timeframe::M15, Duration::zero(), 32),
            entry: series(name, Timeframe::M5, entry_offset, entries),
        }
    }

    fn data(symbols: Vec<SymbolSeries>) -> MarketData {
        let mut data = MarketData::new(TimeframeStack::default());
        for s in symbols {
            data.insert(s);
        }
        data
    }

    // =========================================================================
    // Ordering Tests
    // =========================================================================

    #[test]
    fn test_ticks_globally_ordered_with_symbol_tiebreak() {
        let market = data(vec![
            symbol("SOLUSDT", Duration::zero(), 6),
            symbol("BTCUSDT", Duration::minutes(10), 4),
            symbol("ETHUSDT", Duration::zero(), 6),
        ]);
        let ticks: Vec<_> = Timeline::new(&market).iter().collect();
        assert_eq!(ticks.len(), 16);

        for pair in ticks.windows(2) {
            assert!((pair[0].timestamp, pair[0].symbol) < (pair[1].timestamp, pair[1].symbol));
        }
        let first: Vec<_> = ticks.iter().take(3).map(|t| t.symbol).collect();
        assert_eq!(first, vec!["ETHUSDT", "SOLUSDT", "ETHUSDT"]);

        let at_15: Vec<_> = ticks
            .iter()
            .filter(|t| t.timestamp == base() + Duration::minutes(15))
            .map(|t| t.symbol)
            .collect();
        assert_eq!(at_15, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
    }

    #[test]
    fn test_closing_sets_and_visible_counts() {
        let market = data(vec![symbol("BTCUSDT", Duration::zero(), 48)]);
        let ticks: Vec<_> = Timeline::new(&market).iter().collect();

        // 00:05 close: entry only
        assert_eq!(ticks[0].closing, vec![Timeframe::M5]);
        assert_eq!(ticks[0].primary_closed, 0);

        // 00:15 close: entry and primary
        assert_eq!(ticks[2].closing, vec![Timeframe::M5, Timeframe::M15]);
        assert_eq!(ticks[2].primary_closed, 1);
        assert_eq!(ticks[2].htf_closed, 0);

        // 04:00 close: all three
        let four = &ticks[47];
        assert_eq!(four.timestamp, base() + Duration::hours(4));
        assert_eq!(four.closing, vec![Timeframe::M5, Timeframe::M15, Timeframe::H4]);
        assert_eq!(four.htf_closed, 1);
        assert!(four.is_last);
        assert_eq!(four.entry_closed, 48);
    }

    #[test]
    fn test_is_last_per_symbol() {
        let market = data(vec![
            symbol("BTCUSDT", Duration::zero(), 3),
            symbol("ETHUSDT", Duration::zero(), 5),
        ]);
        let last: Vec<_> = Timeline::new(&market)
            .iter()
            .filter(|t| t.is_last)
            .map(|t| (t.symbol, t.entry_index))
            .collect();
        assert_eq!(last, vec![("BTCUSDT", 2), ("ETHUSDT", 4)]);
    }

    // =========================================================================
    // Window / Restart Tests
    // =========================================================================

    #[test]
    fn test_window_bounds_ticks() {
        let market = data(vec![symbol("BTCUSDT", Duration::zero(), 12)]);
        let window = ReplayWindow::new(
            Some(base() + Duration::minutes(20)),
            Some(base() + Duration::minutes(45)),
        );
        let ticks: Vec<_> = Timeline::with_window(&market, window).iter().collect();
        assert_eq!(ticks.len(), 5);
        assert_eq!(ticks[0].entry_index, 3);
        assert!(ticks[4].is_last);
        // History before the window stays visible
        assert_eq!(ticks[0].entry_closed, 4);
    }

    #[test]
    fn test_iteration_is_restartable() {
        let market = data(vec![symbol("BTCUSDT", Duration::zero(), 10)]);
        let timeline = Timeline::new(&market);
        let first: Vec<_> = timeline.iter().map(|t| t.timestamp).collect();
        let second: Vec<_> = (&timeline).into_iter().map(|t| t.timestamp).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
    }

    #[test]
    fn test_empty_market() {
        let market = data(Vec::new());
        assert_eq!(Timeline::new(&market).iter().count(), 0);
    }
}
