//! Candle-window indicators powered by the `ta` crate
//!
//! The snapshot already carries the headline indicator values. The helpers
//! here cover the few places where a decision needs a short series derived
//! from the resident candles (RSI history for divergence, ATR over a range
//! window, true-range averages for volatility drift). All inputs are
//! in-memory slices; nothing here performs I/O.

use statrs::statistics::Statistics;
use ta::indicators::{BollingerBands as TaBB, RelativeStrengthIndex};
use ta::Next;

use crate::types::Candle;

/// Type alias for band indicators (upper, middle, lower)
pub type BandOutput = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

/// Calculate True Range for each bar
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if i == 0 {
                c.high - c.low
            } else {
                let prev_close = candles[i - 1].close;
                (c.high - c.low)
                    .max((c.high - prev_close).abs())
                    .max((c.low - prev_close).abs())
            }
        })
        .collect()
}

/// Average True Range with Wilder's smoothing
pub fn atr(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    if candles.is_empty() || period == 0 {
        return vec![];
    }

    let tr = true_range(candles);
    let mut result = Vec::with_capacity(tr.len());

    // Wilder's smoothing: ATR = (prev_ATR * (period - 1) + current_TR) / period
    let mut atr_value: Option<f64> = None;

    for i in 0..tr.len() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = tr[0..period].iter().sum();
            atr_value = Some(sum / period as f64);
            result.push(atr_value);
        } else if let Some(prev_atr) = atr_value {
            let new_atr = (prev_atr * (period - 1) as f64 + tr[i]) / period as f64;
            atr_value = Some(new_atr);
            result.push(atr_value);
        } else {
            result.push(None);
        }
    }

    result
}

/// Latest ATR value, if enough bars exist
pub fn latest_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr(candles, period).last().and_then(|&x| x)
}

/// Mean true range over the last `period` bars and the `period` bars before
/// them, as `(recent, prior)`
pub fn true_range_windows(candles: &[Candle], period: usize) -> Option<(f64, f64)> {
    if period == 0 || candles.len() < period * 2 + 1 {
        return None;
    }
    let tr = true_range(candles);
    let n = tr.len();
    let recent = tr[n - period..].iter().mean();
    let prior = tr[n - 2 * period..n - period].iter().mean();
    Some((recent, prior))
}

/// Calculate Bollinger Bands
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BandOutput {
    if values.is_empty() || period == 0 {
        return (vec![], vec![], vec![]);
    }

    let mut indicator = match TaBB::new(period, num_std) {
        Ok(i) => i,
        Err(_) => {
            return (
                vec![None; values.len()],
                vec![None; values.len()],
                vec![None; values.len()],
            )
        }
    };

    let mut upper = Vec::with_capacity(values.len());
    let mut middle = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let bb = indicator.next(value);
        if i + 1 >= period {
            upper.push(Some(bb.upper));
            middle.push(Some(bb.average));
            lower.push(Some(bb.lower));
        } else {
            upper.push(None);
            middle.push(None);
            lower.push(None);
        }
    }

    (upper, middle, lower)
}

/// Latest Bollinger band width as a fraction of the middle band
pub fn bollinger_width_pct(candles: &[Candle], period: usize, num_std: f64) -> Option<f64> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (upper, middle, lower) = bollinger_bands(&closes, period, num_std);
    let upper = upper.last().and_then(|&x| x)?;
    let middle = middle.last().and_then(|&x| x).filter(|m| *m > 0.0)?;
    let lower = lower.last().and_then(|&x| x)?;
    Some((upper - lower) / middle)
}

/// Calculate Relative Strength Index
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let rsi_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(rsi_val));
        } else {
            result.push(None);
        }
    }

    result
}

/// Mean volume of a candle slice, `None` when empty
pub fn mean_volume(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    Some(candles.iter().map(|c| c.volume).mean())
}
