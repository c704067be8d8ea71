//! Individual exit checks
//!
//! Each check returns `None` when it does not fire, including when its
//! inputs are missing from the snapshot.

use super::{ExitPhase, ExitSignal, SignalCategory};
use crate::config::ExitSignalConfig;
use crate::indicators;
use crate::snapshot::FeatureSnapshot;
use crate::types::{Candle, Side};

/// Run every check in a fixed order
pub(super) fn collect(
    config: &ExitSignalConfig,
    side: Side,
    price: f64,
    snapshot: &FeatureSnapshot,
) -> Vec<ExitSignal> {
    [
        adx_rollover(config, snapshot),
        rsi_divergence(config, side, &snapshot.candles),
        macd_deceleration(config, side, snapshot),
        volume_divergence(config, side, &snapshot.candles),
        atr_compression(config, snapshot),
        bollinger_reentry(side, snapshot),
        vwap_flattening(config, side, snapshot),
        ema20_break(side, price, snapshot),
        sar_flip(side, price, snapshot),
        heikin_ashi_flip(side, snapshot),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn adx_rollover(config: &ExitSignalConfig, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    let adx = snapshot.momentum.adx?;
    let previous = snapshot.momentum.adx_prev.filter(|p| *p > 0.0)?;
    if adx <= config.adx_rollover_threshold || adx >= previous {
        return None;
    }
    let drop = (previous - adx) / previous;
    Some(ExitSignal::new(
        "adx_rollover",
        ExitPhase::EarlyWarning,
        SignalCategory::Momentum,
        (drop * 4.0).max(0.2),
        format!("ADX rolling over {previous:.1} -> {adx:.1}"),
    ))
}

/// Price makes a new extreme in the position's favour while RSI does not
fn rsi_divergence(config: &ExitSignalConfig, side: Side, candles: &[Candle]) -> Option<ExitSignal> {
    let lookback = config.rsi_divergence_lookback;
    if candles.len() < lookback + config.rsi_period {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let rsi = indicators::rsi(&closes, config.rsi_period);

    let start = closes.len() - lookback;
    let half = start + lookback / 2;
    let points: Vec<(f64, f64)> = closes[start..]
        .iter()
        .zip(&rsi[start..])
        .map(|(close, rsi)| rsi.map(|r| (*close, r)))
        .collect::<Option<Vec<_>>>()?;
    let (first, second) = points.split_at(half - start);

    // Extreme close in each half, with the RSI reading at that bar
    let extreme = |window: &[(f64, f64)]| {
        window
            .iter()
            .copied()
            .reduce(|best, p| if side.sign() * (p.0 - best.0) > 0.0 { p } else { best })
    };
    let (price_a, rsi_a) = extreme(first)?;
    let (price_b, rsi_b) = extreme(second)?;

    let price_extended = side.sign() * (price_b - price_a) > 0.0;
    let rsi_lagging = side.sign() * (rsi_b - rsi_a) < 0.0;
    if !(price_extended && rsi_lagging) {
        return None;
    }
    let gap = (rsi_a - rsi_b).abs();
    Some(ExitSignal::new(
        "rsi_divergence",
        ExitPhase::EarlyWarning,
        SignalCategory::Momentum,
        (gap / 10.0).max(0.3),
        format!("Price {price_a:.2} -> {price_b:.2} while RSI {rsi_a:.1} -> {rsi_b:.1}"),
    ))
}

/// Histogram still in favour but shrinking
fn macd_deceleration(config: &ExitSignalConfig, side: Side, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    let hist = snapshot.momentum.macd_hist?;
    let previous = snapshot.momentum.macd_hist_prev?;
    let favourable = side.sign() * previous > 0.0 && side.sign() * hist > 0.0;
    if !favourable || hist.abs() > previous.abs() * (1.0 - config.macd_decel_ratio) {
        return None;
    }
    let shrink = 1.0 - hist.abs() / previous.abs();
    Some(ExitSignal::new(
        "macd_deceleration",
        ExitPhase::EarlyWarning,
        SignalCategory::Momentum,
        shrink,
        format!("MACD histogram shrinking {previous:.4} -> {hist:.4}"),
    ))
}

/// Price still moving with the position over 5 bars on falling volume
fn volume_divergence(config: &ExitSignalConfig, side: Side, candles: &[Candle]) -> Option<ExitSignal> {
    let drop = volume_drop(side, candles)?;
    if drop < config.volume_drop_fraction {
        return None;
    }
    Some(ExitSignal::new(
        "volume_divergence",
        ExitPhase::EarlyWarning,
        SignalCategory::Volume,
        drop,
        format!("Volume down {:.0}% while price extends", drop * 100.0),
    ))
}

/// Fractional volume drop over the last 5 bars vs the 5 before them, when
/// price moved in the position's favour; `Some(0.0)` when it did not
pub(super) fn volume_drop(side: Side, candles: &[Candle]) -> Option<f64> {
    if candles.len() < 10 {
        return None;
    }
    let n = candles.len();
    let recent = &candles[n - 5..];
    let prior = &candles[n - 10..n - 5];
    let moved = side.sign() * (recent[4].close - prior[4].close) > 0.0;
    let recent_vol = indicators::mean_volume(recent)?;
    let prior_vol = indicators::mean_volume(prior).filter(|v| *v > 0.0)?;
    if !moved {
        return Some(0.0);
    }
    Some(((prior_vol - recent_vol) / prior_vol).max(0.0))
}

fn atr_compression(config: &ExitSignalConfig, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    let change = snapshot.volatility.atr_change()?;
    if change > -config.atr_compression_pct {
        return None;
    }
    Some(ExitSignal::new(
        "atr_compression",
        ExitPhase::Exhaustion,
        SignalCategory::Volatility,
        -change * 2.0,
        format!("ATR compressed {:.0}%", -change * 100.0),
    ))
}

/// Previous close outside the band on the position's side, latest back inside
fn bollinger_reentry(side: Side, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    let [.., previous, latest] = snapshot.candles.as_slice() else {
        return None;
    };
    let band = match side {
        Side::Buy => snapshot.volatility.bb_upper?,
        Side::Sell => snapshot.volatility.bb_lower?,
    };
    let outside = |close: f64| side.sign() * (close - band) > 0.0;
    if !(outside(previous.close) && !outside(latest.close)) {
        return None;
    }
    Some(ExitSignal::new(
        "bollinger_reentry",
        ExitPhase::Exhaustion,
        SignalCategory::Volatility,
        0.6,
        format!("Closed back inside the band at {band:.2}"),
    ))
}

fn vwap_flattening(config: &ExitSignalConfig, side: Side, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    let slope = snapshot.trend.vwap_slope?;
    let (strength, message) = if side.sign() * slope < 0.0 && slope.abs() >= config.vwap_flat_slope {
        (0.8, format!("VWAP turned against position (slope {slope:.5})"))
    } else if slope.abs() < config.vwap_flat_slope {
        (0.5, format!("VWAP flattening (slope {slope:.5})"))
    } else {
        return None;
    };
    Some(ExitSignal::new(
        "vwap_flattening",
        ExitPhase::Exhaustion,
        SignalCategory::Volume,
        strength,
        message,
    ))
}

fn ema20_break(side: Side, price: f64, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    let ema20 = snapshot.trend.ema20?;
    let distance = side.sign() * (ema20 - price);
    if distance <= 0.0 {
        return None;
    }
    let strength = snapshot
        .volatility
        .positive_atr()
        .map_or(0.7, |atr| (distance / atr).max(0.3));
    Some(ExitSignal::new(
        "ema20_break",
        ExitPhase::Breakdown,
        SignalCategory::Structure,
        strength,
        format!("Price {price:.2} broke EMA20 {ema20:.2}"),
    ))
}

fn sar_flip(side: Side, price: f64, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    let sar = snapshot.trend.sar?;
    if side.sign() * (sar - price) <= 0.0 {
        return None;
    }
    Some(ExitSignal::new(
        "sar_flip",
        ExitPhase::Breakdown,
        SignalCategory::Structure,
        0.8,
        format!("Parabolic SAR {sar:.2} flipped against position"),
    ))
}

fn heikin_ashi_flip(side: Side, snapshot: &FeatureSnapshot) -> Option<ExitSignal> {
    if !snapshot.trend.ha_flipped_against(side)? {
        return None;
    }
    Some(ExitSignal::new(
        "structure_break",
        ExitPhase::Breakdown,
        SignalCategory::Structure,
        0.7,
        "Heikin-Ashi color flipped against position".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;
    use chrono::{Duration, TimeZone, Utc};

    fn candles_from(closes: &[f64], volumes: &[f64]) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap();
        closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&c, &v))| Candle::new_unchecked(t0 + Duration::minutes(i as i64), c, c + 0.2, c - 0.2, c, v))
            .collect()
    }

    #[test]
    fn test_volume_divergence_requires_favourable_move() {
        let config = ExitSignalConfig::default();
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let volumes = [100.0, 100.0, 100.0, 100.0, 100.0, 50.0, 50.0, 50.0, 50.0, 50.0];
        let candles = candles_from(&closes, &volumes);

        let signal = volume_divergence(&config, Side::Buy, &candles).unwrap();
        assert_eq!(signal.indicator, "volume_divergence");
        assert!((signal.strength - 0.5).abs() < 1e-9);
        assert!(volume_divergence(&config, Side::Sell, &candles).is_none());
    }

    #[test]
    fn test_rsi_divergence_on_weakening_rally() {
        let config = ExitSignalConfig::default();
        // Sharp rally, pullback, then a marginal new high on a slow grind
        let mut closes: Vec<f64> = (0..14).map(|_| 100.0).collect();
        closes.extend((1..=10).map(|i| 100.0 + 2.0 * i as f64));
        closes.extend((1..=5).map(|i| 120.0 - 1.5 * i as f64));
        closes.extend((1..=5).map(|i| 112.5 + 1.6 * i as f64));
        let volumes = vec![100.0; closes.len()];
        let candles = candles_from(&closes, &volumes);

        let signal = rsi_divergence(&config, Side::Buy, &candles).unwrap();
        assert_eq!(signal.phase, ExitPhase::EarlyWarning);
        assert!(rsi_divergence(&config, Side::Sell, &candles).is_none());
    }

    #[test]
    fn test_bollinger_reentry_side_specific() {
        let mut snap = FeatureSnapshot::new(Symbol::new("XAUUSD"), Utc::now(), 100.0);
        snap.candles = candles_from(&[103.0, 101.0], &[1.0, 1.0]);
        snap.volatility.bb_upper = Some(102.0);
        snap.volatility.bb_lower = Some(98.0);
        assert!(bollinger_reentry(Side::Buy, &snap).is_some());
        assert!(bollinger_reentry(Side::Sell, &snap).is_none());
    }

    #[test]
    fn test_vwap_slope_against_short() {
        let config = ExitSignalConfig::default();
        let mut snap = FeatureSnapshot::new(Symbol::new("XAUUSD"), Utc::now(), 100.0);
        snap.trend.vwap_slope = Some(0.002);
        let signal = vwap_flattening(&config, Side::Sell, &snap).unwrap();
        assert_eq!(signal.strength, 0.8);
        assert!(vwap_flattening(&config, Side::Buy, &snap).is_none());
    }

    #[test]
    fn test_missing_inputs_never_fire() {
        let config = ExitSignalConfig::default();
        let snap = FeatureSnapshot::new(Symbol::new("XAUUSD"), Utc::now(), 100.0);
        assert!(collect(&config, Side::Buy, 100.0, &snap).is_empty());
        assert!(collect(&config, Side::Sell, 100.0, &snap).is_empty());
    }
}
