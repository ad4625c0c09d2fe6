//! Maximum drawdown tracking over an equity curve.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tracks peak equity and the deepest peak-to-trough decline.
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    /// Peak equity value observed
    peak_equity: Decimal,
    peak_time: Option<DateTime<Utc>>,
    /// Current drawdown from peak (fraction of peak)
    current_drawdown: Decimal,
    /// Deepest drawdown observed
    max_drawdown: Decimal,
    max_drawdown_peak: Decimal,
    max_drawdown_trough: Decimal,
    max_drawdown_at: Option<DateTime<Utc>>,
    /// Longest stretch spent below a prior peak
    longest_underwater: Duration,
    last_equity: Decimal,
}

impl DrawdownTracker {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            peak_equity: initial_equity,
            peak_time: None,
            current_drawdown: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            max_drawdown_peak: initial_equity,
            max_drawdown_trough: initial_equity,
            max_drawdown_at: None,
            longest_underwater: Duration::zero(),
            last_equity: initial_equity,
        }
    }

    /// Build a tracker by replaying a whole curve.
    pub fn from_curve<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (DateTime<Utc>, Decimal)>,
    {
        let mut points = points.into_iter();
        let (first_time, first_equity) = points.next()?;
        let mut tracker = Self::new(first_equity);
        tracker.peak_time = Some(first_time);
        for (time, equity) in points {
            tracker.update(time, equity);
        }
        Some(tracker)
    }

    /// Update with a new equity value.
    ///
    /// Returns true when this point sets a new maximum drawdown.
    pub fn update(&mut self, timestamp: DateTime<Utc>, equity: Decimal) -> bool {
        self.last_equity = equity;
        if self.peak_time.is_none() {
            self.peak_time = Some(timestamp);
        }

        if equity >= self.peak_equity {
            self.peak_equity = equity;
            self.peak_time = Some(timestamp);
            self.current_drawdown = Decimal::ZERO;
            return false;
        }

        if let Some(peak_time) = self.peak_time {
            let underwater = timestamp - peak_time;
            if underwater > self.longest_underwater {
                self.longest_underwater = underwater;
            }
        }

        if self.peak_equity <= Decimal::ZERO {
            return false;
        }
        self.current_drawdown = (self.peak_equity - equity) / self.peak_equity;

        if self.current_drawdown > self.max_drawdown {
            self.max_drawdown = self.current_drawdown;
            self.max_drawdown_peak = self.peak_equity;
            self.max_drawdown_trough = equity;
            self.max_drawdown_at = Some(timestamp);
            debug!(
                mdd = %self.max_drawdown,
                peak = %self.peak_equity,
                current = %equity,
                "New maximum drawdown recorded"
            );
            return true;
        }
        false
    }

    /// Current drawdown as a fraction of peak (0.0-1.0).
    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    /// Deepest drawdown as a fraction of peak (0.0-1.0).
    pub fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }


    pub fn statistics(&self) -> DrawdownStats {
        DrawdownStats {
            peak_equity: self.peak_equity,
            current_equity: self.last_equity,
            current_drawdown: self.current_drawdown,
            max_drawdown: self.max_drawdown,
            max_drawdown_peak: self.max_drawdown_peak,
            max_drawdown_trough: self.max_drawdown_trough,
            max_drawdown_at: self.max_drawdown_at,
            longest_underwater_hours: self.longest_underwater.num_minutes() as f64 / 60.0,
        }
    }
}

/// Statistics from the drawdown tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownStats {
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub current_drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub max_drawdown_peak: Decimal,
    pub max_drawdown_trough: Decimal,
    pub max_drawdown_at: Option<DateTime<Utc>>,
    pub longest_underwater_hours: f64,
}
