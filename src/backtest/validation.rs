//! Data-quality checks run before replay.
//!
//! Gaps are reported, never interpolated. Any fault excludes the symbol.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::market::{Candle, Timeframe};

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataFaultKind {
    #[error("no candles")]
    Empty,
    #[error("invalid OHLC (open {open}, high {high}, low {low}, close {close})")]
    InvalidOhlc {
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    },
    #[error("non-positive price {price}")]
    NonPositivePrice { price: Decimal },
    #[error("negative volume {volume}")]
    NegativeVolume { volume: Decimal },
    #[error("timestamp not after previous {previous}")]
    NonMonotonic { previous: DateTime<Utc> },
    #[error("timestamp not aligned to timeframe")]
    Misaligned,
    #[error("candle belongs to {found}")]
    WrongSeries { found: String },
    #[error("{missing} missing candles")]
    Gap { missing: i64 },
    #[error("load failed: {message}")]
    LoadFailed { message: String },
}

/// A data-quality problem that excludes `symbol` from the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{symbol} {timeframe}: {kind}")]
pub struct DataFault {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Affected span (candle open times), when known
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub kind: DataFaultKind,
}

impl DataFault {
    pub fn new(symbol: &str, timeframe: Timeframe, kind: DataFaultKind) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            from: None,
            to: None,
            kind,
        }
    }

    pub fn spanning(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn at(self, time: DateTime<Utc>) -> Self {
        self.spanning(time, time)
    }
}

/// Validate one (symbol, timeframe) series.
///
/// Checks OHLC consistency, positive prices, non-negative volume, strictly
/// increasing aligned timestamps, series identity, and gaps longer than
/// `max_gap_candles`. Returns every fault found.
pub fn validate_series(
    symbol: &str,
    timeframe: Timeframe,
    candles: &[Candle],
    max_gap_candles: u32,
) -> Vec<DataFault> {
    let mut faults = Vec::new();
    if candles.is_empty() {
        faults.push(DataFault::new(symbol, timeframe, DataFaultKind::Empty));
        return faults;
    }

    let step = timeframe.seconds();
    let fault = |kind: DataFaultKind| DataFault::new(symbol, timeframe, kind);

    for (i, candle) in candles.iter().enumerate() {
        let at = candle.timestamp;

        if candle.symbol != symbol || candle.timeframe != timeframe {
            faults.push(
                fault(DataFaultKind::WrongSeries {
                    found: format!("{} {}", candle.symbol, candle.timeframe),
                })
                .at(at),
            );
        }

        let lowest = candle.open.min(candle.close).min(candle.low);
        if lowest <= Decimal::ZERO {
            faults.push(fault(DataFaultKind::NonPositivePrice { price: lowest }).at(at));
        }
        if candle.low > candle.open.min(candle.close) || candle.high < candle.open.max(candle.close) {
            faults.push(
                fault(DataFaultKind::InvalidOhlc {
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                })
                .at(at),
            );
        }
        if candle.volume < Decimal::ZERO {
            faults.push(fault(DataFaultKind::NegativeVolume { volume: candle.volume }).at(at));
        }
        if at.timestamp() % step != 0 {
            faults.push(fault(DataFaultKind::Misaligned).at(at));
        }

        if i > 0 {
            let previous = candles[i - 1].timestamp;
            if at <= previous {
                faults.push(fault(DataFaultKind::NonMonotonic { previous }).at(at));
                continue;
            }
            let missing = (at - previous).num_seconds() / step - 1;
            if missing > i64::from(max_gap_candles) {
                faults.push(fault(DataFaultKind::Gap { missing }).spanning(previous, at));
            }
        }
    }

    if !faults.is_empty() {
        warn!(
            symbol,
            timeframe = %timeframe,
            faults = faults.len(),
            first = %faults[0],
            "Data quality faults detected"
        );
    }
    faults
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn candles(n: i64) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Candle {
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::M5,
                timestamp: base + Duration::minutes(5 * i),
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100.5),
                volume: dec!(10),
            })
            .collect()
    }

    fn kinds(faults: &[DataFault]) -> Vec<&DataFaultKind> {
        faults.iter().map(|f| &f.kind).collect()
    }

    #[test]
    fn test_clean_series_has_no_faults() {
        assert!(validate_series("BTCUSDT", Timeframe::M5, &candles(50), 2).is_empty());
    }

    #[test]
    fn test_empty_series() {
        let faults = validate_series("BTCUSDT", Timeframe::M5, &[], 2);
        assert_eq!(kinds(&faults), vec![&DataFaultKind::Empty]);
    }

    #[test]
    fn test_invalid_ohlc() {
        let mut series = candles(5);
        series[2].high = dec!(100);
        let faults = validate_series("BTCUSDT", Timeframe::M5, &series, 2);
        assert_eq!(faults.len(), 1);
        assert!(matches!(faults[0].kind, DataFaultKind::InvalidOhlc { .. }));
        assert_eq!(faults[0].from, Some(series[2].timestamp));
    }

    #[test]
    fn test_non_positive_price_and_negative_volume() {
        let mut series = candles(5);
        series[1].low = dec!(0);
        series[3].volume = dec!(-1);
        let faults = validate_series("BTCUSDT", Timeframe::M5, &series, 2);
        assert!(faults.iter().any(|f| matches!(f.kind, DataFaultKind::NonPositivePrice { .. })));
        assert!(faults.iter().any(|f| matches!(f.kind, DataFaultKind::NegativeVolume { .. })));
    }

    #[test]
    fn test_duplicate_timestamp() {
        let mut series = candles(5);
        series[3].timestamp = series[2].timestamp;
        let faults = validate_series("BTCUSDT", Timeframe::M5, &series, 2);
        assert!(faults.iter().any(|f| matches!(f.kind, DataFaultKind::NonMonotonic { .. })));
    }

    #[test]
    fn test_gap_tolerance() {
        let mut series = candles(10);
        // Drop two candles: tolerated
        series.drain(3..5);
        assert!(validate_series("BTCUSDT", Timeframe::M5, &series, 2).is_empty());

        // Drop three more in a row: fault, spanning the hole
        let mut series = candles(10);
        series.drain(3..6);
        let faults = validate_series("BTCUSDT", Timeframe::M5, &series, 2);
        assert_eq!(kinds(&faults), vec![&DataFaultKind::Gap { missing: 3 }]);
        assert_eq!(faults[0].from, Some(series[2].timestamp));
        assert_eq!(faults[0].to, Some(series[3].timestamp));
    }

    #[test]
    fn test_misaligned_and_wrong_series() {
        let mut series = candles(3);
        series[1].timestamp += Duration::minutes(1);
        series[2].symbol = "ETHUSDT".to_string();
        let faults = validate_series("BTCUSDT", Timeframe::M5, &series, 2);
        assert!(faults.iter().any(|f| f.kind == DataFaultKind::Misaligned));
        assert!(faults.iter().any(|f| matches!(f.kind, DataFaultKind::WrongSeries { .. })));
    }

    #[test]
    fn test_fault_display() {
        let fault = DataFault::new("BTCUSDT", Timeframe::M15, DataFaultKind::Gap { missing: 4 });
        assert_eq!(fault.to_string(), "BTCUSDT 15m: 4 missing candles");
    }
}
