//! Core market types shared by every stage of the replay.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
}

/// Error parsing a timeframe label such as `"15m"` or `"4h"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timeframe '{0}' (expected one of 1m,3m,5m,15m,30m,1h,2h,4h,6h,12h,1d)")]
pub struct ParseTimeframeError(pub String);

impl Timeframe {
    /// Length of one candle in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 180,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H2 => 7_200,
            Timeframe::H4 => 14_400,
            Timeframe::H6 => 21_600,
            Timeframe::H12 => 43_200,
            Timeframe::D1 => 86_400,
        }
    }

    /// Length of one candle.
    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Number of candles in a 365-day year, used to annualize per-candle returns.
    pub fn periods_per_year(self) -> f64 {
        365.0 * 86_400.0 / self.seconds() as f64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "2h" => Ok(Timeframe::H2),
            "4h" => Ok(Timeframe::H4),
            "6h" => Ok(Timeframe::H6),
            "12h" => Ok(Timeframe::H12),
            "1d" => Ok(Timeframe::D1),
            _ => Err(ParseTimeframeError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ParseTimeframeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// The three granularities a strategy reads: trend filter, setup, and entry timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeStack {
    /// Highest timeframe (trend filter)
    pub htf: Timeframe,
    /// Primary timeframe (setup / regime)
    pub primary: Timeframe,
    /// Entry timeframe; one simulation tick per closed candle
    pub entry: Timeframe,
}

impl TimeframeStack {
    /// True when entry < primary < htf.
    pub fn is_ordered(&self) -> bool {
        self.entry.seconds() < self.primary.seconds() && self.primary.seconds() < self.htf.seconds()
    }

    pub fn all(&self) -> [Timeframe; 3] {
        [self.htf, self.primary, self.entry]
    }
}

impl Default for TimeframeStack {
    fn default() -> Self {
        Self {
            htf: Timeframe::H4,
            primary: Timeframe::M15,
            entry: Timeframe::M5,
        }
    }
}

/// A single OHLCV candle. `timestamp` is the open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Moment the candle stops forming.
    pub fn close_time(&self) -> DateTime<Utc> {
        self.timestamp + self.timeframe.duration()
    }

    /// Whether the candle is fully formed at `t`.
    pub fn is_closed_by(&self, t: DateTime<Utc>) -> bool {
        self.close_time() <= t
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discrete market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trending,
    HighVolatility,
    LowVolatility,
    Choppy,
}

impl Regime {
    pub fn is_trending(self) -> bool {
        matches!(self, Regime::Trending)
    }

    /// Choppy or compressed markets.
    pub fn is_ranging(self) -> bool {
        matches!(self, Regime::Choppy | Regime::LowVolatility)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Trending => "trending",
            Regime::HighVolatility => "high_volatility",
            Regime::LowVolatility => "low_volatility",
            Regime::Choppy => "choppy",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
