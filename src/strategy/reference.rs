//! Trend-pullback strategy shared by live scanning and backtests.
//!
//! - HTF: close above/below its EMA sets the bias
//! - Primary: fast/slow EMA stack must agree; regime must be tradeable
//! - Entry: close reclaims the entry-timeframe EMA after a pullback
//!
//! Stops are ATR-based with a hard cap; targets are R multiples scaled by regime.

use rust_decimal::Decimal;
use tracing::trace;

use super::indicators::{closes, ema, last_valid};
use super::oracle::{
    AccountMode, AccountSnapshot, EntryCandidate, MarketConditions, MarketView, Signal,
    StrategyOracle, TakeProfitLevel,
};
use super::regime::{RegimeDetector, RegimeReading};
use crate::config::StrategyConfig;
use crate::market::{Direction, Regime};

pub struct TrendPullbackOracle {
    config: StrategyConfig,
    detector: RegimeDetector,
}

impl TrendPullbackOracle {
    pub fn new(config: StrategyConfig) -> Self {
        let detector = RegimeDetector::new(&config);
        Self { config, detector }
    }

    fn min_score(&self, account: &AccountSnapshot) -> u32 {
        match account.mode {
            AccountMode::Drawdown => self.config.drawdown_min_score,
            AccountMode::Normal | AccountMode::HotStreak => self.config.min_score,
        }
    }

    fn htf_bias(&self, view: &MarketView<'_>) -> Option<(Direction, f64)> {
        let closes = closes(view.htf);
        let ema = last_valid(&ema(&closes, self.config.htf_ema))?;
        let close = *closes.last()?;
        let distance = (close - ema) / ema;
        match distance {
            d if d > 0.0 => Some((Direction::Long, d)),
            d if d < 0.0 => Some((Direction::Short, -d)),
            _ => None,
        }
    }

    fn primary_stack(&self, view: &MarketView<'_>) -> Option<Direction> {
        let closes = closes(view.primary);
        let fast = last_valid(&ema(&closes, self.config.ema_fast))?;
        let slow = last_valid(&ema(&closes, self.config.ema_slow))?;
        if fast > slow {
            Some(Direction::Long)
        } else if fast < slow {
            Some(Direction::Short)
        } else {
            None
        }
    }

    /// Previous close on the far side of the entry EMA, latest close back through it.
    fn entry_trigger(&self, view: &MarketView<'_>, direction: Direction) -> bool {
        let closes = closes(view.entry);
        let line = ema(&closes, self.config.ema_fast);
        let n = closes.len();
        if n < 2 || line[n - 1].is_nan() || line[n - 2].is_nan() {
            return false;
        }
        match direction {
            Direction::Long => closes[n - 2] <= line[n - 2] && closes[n - 1] > line[n - 1],
            Direction::Short => closes[n - 2] >= line[n - 2] && closes[n - 1] < line[n - 1],
        }
    }

    fn score(&self, htf_distance: f64, reading: &RegimeReading) -> u32 {
        let mut score = 20; // stack aligned + trigger

        score += if htf_distance > 0.01 { 25 } else { 15 };
        score += match reading.regime {
            Regime::Trending => 20,
            Regime::HighVolatility => 10,
            Regime::LowVolatility | Regime::Choppy => 0,
        };
        score += if reading.adx > 35.0 {
            20
        } else if reading.adx > self.config.adx_trending {
            15
        } else {
            5
        };
        score.min(100)
    }

    fn build_candidate(
        &self,
        direction: Direction,
        entry_price: Decimal,
        atr: Decimal,
        regime: Regime,
        score: u32,
    ) -> EntryCandidate {
        let stop_distance = (atr * self.config.atr_stop_multiplier).min(atr * self.config.max_stop_atr);
        let sign = direction.sign();
        let stop_loss = entry_price - sign * stop_distance;
        let extension = RegimeDetector::tp_extension(regime);

        let take_profits = self
            .config
            .tp_r_multiples
            .iter()
            .zip(&self.config.tp_fractions)
            .map(|(r, fraction)| TakeProfitLevel {
                price: entry_price + sign * stop_distance * *r * extension,
                fraction: *fraction,
            })
            .collect();

        EntryCandidate {
            direction,
            entry_price,
            stop_loss,
            take_profits,
            regime,
            score,
            atr,
            reason: format!("{} pullback in {} regime", direction, regime),
        }
    }
}

impl StrategyOracle for TrendPullbackOracle {
    fn name(&self) -> &str {
        "trend_pullback"
    }

    fn evaluate(&self, view: &MarketView<'_>, account: &AccountSnapshot) -> Signal {
        let Some(reading) = self.detector.classify(view.primary) else {
            return Signal::NoSignal;
        };
        if !RegimeDetector::is_tradeable(reading.regime) {
            return Signal::NoSignal;
        }

        let Some((direction, htf_distance)) = self.htf_bias(view) else {
            return Signal::NoSignal;
        };
        if self.primary_stack(view) != Some(direction) || !self.entry_trigger(view, direction) {
            return Signal::NoSignal;
        }

        let score = self.score(htf_distance, &reading);
        let threshold = self.min_score(account);
        if score < threshold {
            trace!(symbol = view.symbol, score, threshold, "Score below threshold");
            return Signal::NoSignal;
        }

        let (Some(entry_price), Some(atr)) = (view.last_close(), reading.atr_decimal()) else {
            return Signal::NoSignal;
        };
        if atr <= Decimal::ZERO {
            return Signal::NoSignal;
        }

        Signal::Candidate(self.build_candidate(direction, entry_price, atr, reading.regime, score))
    }

    fn conditions(&self, view: &MarketView<'_>) -> Option<MarketConditions> {
        let reading = self.detector.classify(view.primary)?;
        Some(MarketConditions {
            atr: reading.atr_decimal()?,
            regime: reading.regime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Candle, Timeframe};
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn series(tf: Timeframe, closes: &[f64], half_range: f64) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let d = |v: f64| Decimal::from_f64_retain(v).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                symbol: "BTCUSDT".to_string(),
                timeframe: tf,
                timestamp: base + tf.duration() * i as i32,
                open: d(c),
                high: d(c + half_range),
                low: d(c - half_range),
                close: d(c),
                volume: Decimal::ONE,
            })
            .collect()
    }

    fn account(mode: AccountMode) -> AccountSnapshot {
        AccountSnapshot {
            equity: dec!(10000),
            initial_equity: dec!(10000),
            open_positions: 0,
            consecutive_losses: 0,
            weekly_pnl: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            mode,
        }
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn uptrend_views() -> (Vec<Candle>, Vec<Candle>, Vec<Candle>) {
        let htf: Vec<f64> = (0..80).map(|i| 100.0 + i as f64).collect();
        let primary: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 2.0).collect();
        // Flat entry series, dip below the EMA, then reclaim it on the last candle
        let mut entry: Vec<f64> = vec![260.0; 40];
        entry.push(258.0);
        entry.push(262.0);
        (
            series(Timeframe::H4, &htf, 1.0),
            series(Timeframe::M15, &primary, 1.5),
            series(Timeframe::M5, &entry, 0.5),
        )
    }

    #[test]
    fn test_long_candidate_in_uptrend() {
        let oracle = TrendPullbackOracle::new(StrategyConfig::default());
        let (htf, primary, entry) = uptrend_views();
        let view = MarketView {
            symbol: "BTCUSDT",
            as_of: as_of(),
            htf: &htf,
            primary: &primary,
            entry: &entry,
        };

        let Signal::Candidate(candidate) = oracle.evaluate(&view, &account(AccountMode::Normal)) else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.direction, Direction::Long);
        assert_eq!(candidate.regime, Regime::Trending);
        assert!(candidate.stop_loss < candidate.entry_price);
        assert_eq!(candidate.take_profits.len(), 3);
        assert!(candidate.validate(candidate.entry_price, dec!(0.005)).is_ok());
    }

    #[test]
    fn test_no_signal_without_trigger() {
        let oracle = TrendPullbackOracle::new(StrategyConfig::default());
        let (htf, primary, mut entry) = uptrend_views();
        entry.pop();
        let view = MarketView {
            symbol: "BTCUSDT",
            as_of: as_of(),
            htf: &htf,
            primary: &primary,
            entry: &entry,
        };
        assert_eq!(oracle.evaluate(&view, &account(AccountMode::Normal)), Signal::NoSignal);
    }

    #[test]
    fn test_drawdown_raises_threshold() {
        let config = StrategyConfig {
            min_score: 0,
            drawdown_min_score: 101,
            ..StrategyConfig::default()
        };
        let oracle = TrendPullbackOracle::new(config);
        let (htf, primary, entry) = uptrend_views();
        let view = MarketView {
            symbol: "BTCUSDT",
            as_of: as_of(),
            htf: &htf,
            primary: &primary,
            entry: &entry,
        };
        assert!(matches!(
            oracle.evaluate(&view, &account(AccountMode::Normal)),
            Signal::Candidate(_)
        ));
        assert_eq!(oracle.evaluate(&view, &account(AccountMode::Drawdown)), Signal::NoSignal);
    }

    #[test]
    fn test_take_profits_scaled_by_regime() {
        let oracle = TrendPullbackOracle::new(StrategyConfig::default());
        let trending = oracle.build_candidate(Direction::Long, dec!(100), dec!(1), Regime::Trending, 80);
        let volatile = oracle.build_candidate(Direction::Long, dec!(100), dec!(1), Regime::HighVolatility, 80);

        // Stop capped at 2 ATR
        assert_eq!(trending.stop_loss, dec!(98));
        assert_eq!(trending.take_profits[0].price, dec!(103.0));
        assert_eq!(volatile.take_profits[0].price, dec!(102.40));
    }

    #[test]
    fn test_conditions_report_regime() {
        let oracle = TrendPullbackOracle::new(StrategyConfig::default());
        let (htf, primary, entry) = uptrend_views();
        let view = MarketView {
            symbol: "BTCUSDT",
            as_of: as_of(),
            htf: &htf,
            primary: &primary,
            entry: &entry,
        };
        let conditions = oracle.conditions(&view).unwrap();
        assert_eq!(conditions.regime, Regime::Trending);
        assert!(conditions.atr > Decimal::ZERO);
    }
}
