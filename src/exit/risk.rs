//! Extended exit fields consumed by the loss cutter

use super::signals::volume_drop;
use crate::config::ExitSignalConfig;
use crate::snapshot::FeatureSnapshot;
use crate::types::{Candle, Side};

/// Weighted blend of adverse indicator readings, 0-1
///
/// Factors whose inputs are missing are left out of both the weighted sum
/// and the total weight. With no factor available the score is 0.
pub fn risk_score(config: &ExitSignalConfig, side: Side, price: f64, snapshot: &FeatureSnapshot) -> f64 {
    let momentum = &snapshot.momentum;
    let volatility = &snapshot.volatility;
    let trend = &snapshot.trend;

    // RSI leaning against the position
    let rsi = momentum
        .rsi
        .map(|rsi| (side.sign() * (50.0 - rsi) / 20.0).clamp(0.0, 1.0));

    // Weak trend strength
    let adx = momentum.adx.map(|adx| ((25.0 - adx) / 15.0).clamp(0.0, 1.0));

    // Histogram against the position, or near zero relative to ATR
    let macd = momentum.macd_hist.and_then(|hist| {
        if side.sign() * hist < 0.0 {
            Some(1.0)
        } else {
            volatility
                .positive_atr()
                .map(|atr| (1.0 - hist.abs() / (0.1 * atr)).clamp(0.0, 1.0))
        }
    });

    let atr = volatility
        .atr_change()
        .map(|change| (-change / 0.3).clamp(0.0, 1.0));

    // Distance from the band centre, in half-widths
    let bollinger = match (volatility.bb_upper, volatility.bb_middle, volatility.bb_lower) {
        (Some(upper), Some(middle), Some(lower)) if upper > lower => {
            Some(((price - middle) / ((upper - lower) / 2.0)).abs().clamp(0.0, 1.0))
        }
        _ => None,
    };

    // Price on the wrong side of VWAP, in units of 2 sigma
    let vwap = match (trend.vwap, trend.vwap_std.filter(|s| *s > 0.0)) {
        (Some(vwap), Some(std)) => Some((side.sign() * (vwap - price) / (2.0 * std)).clamp(0.0, 1.0)),
        _ => None,
    };

    let volume = volume_drop(side, &snapshot.candles)
        .map(|drop| if drop >= config.volume_drop_fraction { 1.0 } else { 0.0 });

    let factors = [
        (rsi, 0.25),
        (adx, 0.20),
        (macd, 0.15),
        (atr, 0.15),
        (bollinger, 0.10),
        (vwap, 0.10),
        (volume, 0.05),
    ];
    let (sum, weight) = factors
        .iter()
        .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
        .fold((0.0, 0.0), |(sum, total), (v, w)| (sum + v, total + w));

    if weight > 0.0 {
        (sum / weight).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Independent structure invalidations against the position (0-4)
pub fn structure_invalidation_count(side: Side, price: f64, snapshot: &FeatureSnapshot) -> usize {
    let trend = &snapshot.trend;
    let against = |a: f64, b: f64| side.sign() * (a - b) < 0.0;

    [
        trend.ema20.map(|ema20| against(price, ema20)),
        trend.ema20.zip(trend.ema50).map(|(fast, slow)| against(fast, slow)),
        trend.sar.map(|sar| against(price, sar)),
        trend.ha_flipped_against(side),
    ]
    .into_iter()
    .filter(|hit| *hit == Some(true))
    .count()
}

/// ADX rolling down from above 30, RSI crossing 50 against the position and
/// the MACD histogram shrinking, all on the same bar
pub fn momentum_relapse(side: Side, snapshot: &FeatureSnapshot) -> bool {
    let m = &snapshot.momentum;
    let (Some(adx), Some(adx_prev), Some(rsi), Some(rsi_prev), Some(hist), Some(hist_prev)) =
        (m.adx, m.adx_prev, m.rsi, m.rsi_prev, m.macd_hist, m.macd_hist_prev)
    else {
        return false;
    };

    let adx_rolling = adx_prev > 30.0 && adx < adx_prev;
    let rsi_crossed = match side {
        Side::Buy => rsi_prev >= 50.0 && rsi < 50.0,
        Side::Sell => rsi_prev <= 50.0 && rsi > 50.0,
    };
    let macd_shrinking = hist.abs() < hist_prev.abs();
    adx_rolling && rsi_crossed && macd_shrinking
}

/// Latest candle rejects the position's direction with a dominant wick
pub fn wick_reversal(side: Side, candles: &[Candle]) -> bool {
    let [.., previous, latest] = candles else {
        return false;
    };
    let rejecting = latest.rejecting_wick(side);
    rejecting > 0.0
        && rejecting > 2.0 * latest.supporting_wick(side)
        && rejecting > previous.rejecting_wick(side)
}
