//! Technical indicators over closed candles.
//!
//! Computed in `f64`; outputs are `NaN` until the lookback is satisfied.
//! Each function only reads the slice it is given, so a view truncated at
//! tick `t` can never see later candles.

use rust_decimal::prelude::ToPrimitive;

use crate::market::Candle;

fn to_f64(value: rust_decimal::Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// Closing prices as `f64`.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| to_f64(c.close)).collect()
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    result[period - 1] = seed;

    let mut prev = seed;
    for i in period..n {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

/// Simple moving average.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let mut sum: f64 = values[..period].iter().sum();
    result[period - 1] = sum / period as f64;
    for i in period..n {
        sum += values[i] - values[i - period];
        result[i] = sum / period as f64;
    }
    result
}

/// True range; the first candle uses high - low.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let (h, l) = (to_f64(c.high), to_f64(c.low));
            match i.checked_sub(1).map(|p| to_f64(candles[p].close)) {
                Some(pc) => (h - l).max((h - pc).abs()).max((l - pc).abs()),
                None => h - l,
            }
        })
        .collect()
}

/// Wilder smoothing (alpha = 1/period), seeded with the mean of the first
/// `period` non-NaN values.
pub fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 {
        return result;
    }

    let Some(start) = values.iter().position(|v| !v.is_nan()) else {
        return result;
    };
    let seed_end = start + period;
    if seed_end > n || values[start..seed_end].iter().any(|v| v.is_nan()) {
        return result;
    }

    let mut prev = values[start..seed_end].iter().sum::<f64>() / period as f64;
    result[seed_end - 1] = prev;

    let alpha = 1.0 / period as f64;
    for i in seed_end..n {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

/// Average true range.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    wilder_smooth(&true_range(candles), period)
}

/// Average directional index (Wilder).
pub fn adx(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    if n < 2 {
        return vec![f64::NAN; n];
    }

    let mut plus_dm = vec![f64::NAN; n];
    let mut minus_dm = vec![f64::NAN; n];
    for i in 1..n {
        let up = to_f64(candles[i].high) - to_f64(candles[i - 1].high);
        let down = to_f64(candles[i - 1].low) - to_f64(candles[i].low);
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
    }

    // Skip the first TR so all three series share the same seed window
    let mut tr = true_range(candles);
    tr[0] = f64::NAN;

    let smooth_tr = wilder_smooth(&tr, period);
    let smooth_plus = wilder_smooth(&plus_dm, period);
    let smooth_minus = wilder_smooth(&minus_dm, period);

    let dx: Vec<f64> = (0..n)
        .map(|i| {
            if smooth_tr[i].is_nan() || smooth_tr[i] == 0.0 {
                return f64::NAN;
            }
            let plus_di = 100.0 * smooth_plus[i] / smooth_tr[i];
            let minus_di = 100.0 * smooth_minus[i] / smooth_tr[i];
            let sum = plus_di + minus_di;
            if sum == 0.0 {
                0.0
            } else {
                100.0 * (plus_di - minus_di).abs() / sum
            }
        })
        .collect();

    wilder_smooth(&dx, period)
}

/// Last non-NaN value of a series.
pub fn last_valid(series: &[f64]) -> Option<f64> {
    series.last().copied().filter(|v| v.is_finite())
}
