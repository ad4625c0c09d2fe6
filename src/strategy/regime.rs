//! Market regime classification from volatility and trend strength.

use rust_decimal::Decimal;

use super::indicators::{adx, atr, last_valid, sma};
use crate::config::StrategyConfig;
use crate::market::{Candle, Regime};

/// Window of the ATR average the current ATR is compared against.
const ATR_AVERAGE_PERIOD: usize = 20;

/// Indicator values behind one classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeReading {
    pub regime: Regime,
    pub atr: f64,
    pub atr_ratio: f64,
    pub adx: f64,
}

impl RegimeReading {
    pub fn atr_decimal(&self) -> Option<Decimal> {
        Decimal::from_f64_retain(self.atr)
    }
}

/// Classifies a candle window as trending, choppy, or high/low volatility.
///
/// Volatility extremes take precedence over trend strength.
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    atr_period: usize,
    adx_period: usize,
    adx_trending: f64,
    high_vol_ratio: f64,
    low_vol_ratio: f64,
}

impl RegimeDetector {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            atr_period: config.atr_period,
            adx_period: config.adx_period,
            adx_trending: config.adx_trending,
            high_vol_ratio: config.high_vol_ratio,
            low_vol_ratio: config.low_vol_ratio,
        }
    }

    /// Candles needed before a reading is available.
    pub fn lookback(&self) -> usize {
        (self.atr_period + ATR_AVERAGE_PERIOD).max(2 * self.adx_period + 1)
    }

    /// Classify the window ending at its last candle.
    pub fn classify(&self, candles: &[Candle]) -> Option<RegimeReading> {
        if candles.len() < self.lookback() {
            return None;
        }

        let atr_series = atr(candles, self.atr_period);
        let current_atr = last_valid(&atr_series)?;
        let atr_avg = last_valid(&sma(&atr_series[self.atr_period.saturating_sub(1)..], ATR_AVERAGE_PERIOD))?;
        let adx_value = last_valid(&adx(candles, self.adx_period))?;

        let atr_ratio = if atr_avg > 0.0 { current_atr / atr_avg } else { 0.0 };
        let regime = if atr_avg == 0.0 {
            Regime::Choppy
        } else if atr_ratio > self.high_vol_ratio {
            Regime::HighVolatility
        } else if atr_ratio < self.low_vol_ratio {
            Regime::LowVolatility
        } else if adx_value > self.adx_trending {
            Regime::Trending
        } else {
            Regime::Choppy
        };

        Some(RegimeReading {
            regime,
            atr: current_atr,
            atr_ratio,
            adx: adx_value,
        })
    }

    /// Regimes worth trading.
    pub fn is_tradeable(regime: Regime) -> bool {
        matches!(regime, Regime::Trending | Regime::HighVolatility)
    }

    /// Take-profit distance scale per regime.
    pub fn tp_extension(regime: Regime) -> Decimal {
        match regime {
            Regime::Trending => Decimal::ONE,
            Regime::HighVolatility => Decimal::new(8, 1),
            Regime::LowVolatility | Regime::Choppy => Decimal::new(6, 1),
        }
    }
}
