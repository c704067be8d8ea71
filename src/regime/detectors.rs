//! The three regime detectors
//!
//! Each detector adds fixed, all-or-nothing points per check and compares
//! the total against its own threshold. A check whose inputs are missing
//! contributes nothing.

use chrono::{Datelike, NaiveDate};
use statrs::statistics::Statistics;

use super::{DetectionResult, Regime};
use crate::config::RegimeConfig;
use crate::indicators::{bollinger_width_pct, latest_atr, mean_volume, true_range_windows};
use crate::snapshot::FeatureSnapshot;
use crate::types::Candle;

/// Where a range's boundaries came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSource {
    /// Swing extremes of the M15 candles
    Swing,
    /// Previous-day high/low from M1 candles
    PreviousDay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeBounds {
    pub high: f64,
    pub low: f64,
    /// Bars that probed an edge and closed back inside
    pub respects: usize,
    pub source: RangeSource,
}

impl RangeBounds {
    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// Range-boundary detection over a candle window
pub trait RangeProvider: Send + Sync {
    fn detect_range(&self, candles: &[Candle], lookback: usize) -> Option<RangeBounds>;
}

/// Range from the extremes of the lookback window
#[derive(Debug, Clone)]
pub struct SwingRangeProvider {
    /// Distance from an edge, as a fraction of price, that counts as a probe
    pub edge_tolerance: f64,
}

impl Default for SwingRangeProvider {
    fn default() -> Self {
        Self {
            edge_tolerance: 0.001,
        }
    }
}

impl RangeProvider for SwingRangeProvider {
    fn detect_range(&self, candles: &[Candle], lookback: usize) -> Option<RangeBounds> {
        if candles.len() < lookback || lookback < 3 {
            return None;
        }
        let window = &candles[candles.len() - lookback..];
        let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        if high <= low {
            return None;
        }
        Some(RangeBounds {
            high,
            low,
            respects: count_respects(window, high, low, self.edge_tolerance),
            source: RangeSource::Swing,
        })
    }
}

fn count_respects(candles: &[Candle], high: f64, low: f64, tolerance: f64) -> usize {
    candles
        .iter()
        .filter(|c| {
            let probed_high = c.high >= high * (1.0 - tolerance) && c.close < high;
            let probed_low = c.low <= low * (1.0 + tolerance) && c.close > low;
            probed_high || probed_low
        })
        .count()
}

/// Previous session's high/low from M1 candles
pub fn previous_day_range(candles: &[Candle], tolerance: f64) -> Option<RangeBounds> {
    let today: NaiveDate = candles.last()?.datetime.date_naive();
    let previous_day = candles
        .iter()
        .map(|c| c.datetime.date_naive())
        .filter(|d| *d < today)
        .fold(None::<NaiveDate>, |best, d| Some(best.map_or(d, |b| b.max(d))))?;

    let day: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.datetime.date_naive() == previous_day)
        .collect();
    let high = day.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = day.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    if high <= low {
        return None;
    }

    let session: Vec<Candle> = candles
        .iter()
        .filter(|c| c.datetime.date_naive() == today)
        .cloned()
        .collect();
    tracing::trace!(day = %previous_day, weekday = ?previous_day.weekday(), "Using previous-day range");
    Some(RangeBounds {
        high,
        low,
        respects: count_respects(&session, high, low, tolerance),
        source: RangeSource::PreviousDay,
    })
}

fn bollinger_compressed(snapshot: &FeatureSnapshot, config: &RegimeConfig) -> bool {
    snapshot
        .volatility
        .bb_width_pct()
        .or_else(|| bollinger_width_pct(&snapshot.candles, 20, 2.0))
        .is_some_and(|width| width < config.bb_compression_width)
}

/// VWAP mean-reversion: price stretched from a flat VWAP on a volume spike
pub fn detect_vwap_reversion(snapshot: &FeatureSnapshot, config: &RegimeConfig) -> DetectionResult {
    let mut result = DetectionResult::new(Regime::VwapReversion, config.vwap_reversion_threshold);

    if snapshot.candles.len() < config.vwap_min_candles {
        return result.reject("insufficient candles");
    }
    let Some(vwap) = snapshot.trend.vwap.filter(|v| *v > 0.0) else {
        return result.reject("vwap unavailable");
    };
    let Some(sigma) = snapshot.vwap_deviation_sigma() else {
        return result.reject("vwap std unavailable");
    };

    let deviation_pct = (snapshot.price - vwap).abs() / vwap * 100.0;
    let min_pct = if snapshot.symbol.is_crypto_like() {
        config.vwap_min_pct_crypto
    } else {
        config.vwap_min_pct_other
    };
    if sigma >= config.vwap_min_sigma || deviation_pct >= min_pct {
        result.add(40.0, "deviation");
    }

    // Spike: latest bar vs mean of the bars before it
    let [history @ .., latest] = snapshot.candles.as_slice() else {
        return result.reject("insufficient candles");
    };
    let start = history.len().saturating_sub(config.volume_lookback);
    if let Some(avg) = mean_volume(&history[start..]).filter(|v| *v > 0.0) {
        if latest.volume >= avg * config.volume_spike_ratio {
            result.add(20.0, "volume_spike");
        }
    }

    if snapshot
        .trend
        .vwap_slope
        .is_some_and(|slope| slope.abs() < config.vwap_flat_slope)
    {
        result.add(20.0, "vwap_flat");
    }

    if snapshot
        .volatility
        .atr_change()
        .is_some_and(|change| change.abs() <= config.atr_stability_pct)
    {
        result.add(20.0, "atr_stable");
    }

    result.finish()
}

/// Range scalp: price at the edge of a tight, respected, trendless range
pub fn detect_range_scalp(
    snapshot: &FeatureSnapshot,
    config: &RegimeConfig,
    provider: &dyn RangeProvider,
) -> DetectionResult {
    let mut result = DetectionResult::new(Regime::RangeScalp, config.range_scalp_threshold);
    let m15 = &snapshot.candles_m15;

    let range = provider
        .detect_range(m15, config.range_lookback)
        .or_else(|| previous_day_range(&snapshot.candles, 0.001));
    let Some(range) = range else {
        return result.reject("no range");
    };

    let atr = match range.source {
        RangeSource::Swing => latest_atr(m15, config.range_atr_period),
        RangeSource::PreviousDay => None,
    }
    .or_else(|| snapshot.volatility.positive_atr());
    let Some(atr) = atr.filter(|a| *a > 0.0) else {
        return result.reject("atr unavailable");
    };
    if range.width() / atr >= config.range_max_atr_ratio {
        return result.reject("range too wide to scalp");
    }

    let price = snapshot.price;
    let edge_distance_pct = (price - range.high).abs().min((price - range.low).abs()) / price * 100.0;
    if edge_distance_pct > config.range_edge_pct {
        return result.reject("price not near a range edge");
    }
    result.add(30.0, "near_edge");

    if range.respects >= config.range_min_respects {
        result.add(30.0, "edge_respected");
    }
    if bollinger_compressed(snapshot, config) {
        result.add(20.0, "bb_compression");
    }
    if m15_trend_neutral(m15, config.neutral_drift_pct) {
        result.add(20.0, "m15_neutral");
    }

    result.finish()
}

/// Drift between the two halves of the last 20 closes stays under `max_drift_pct`
fn m15_trend_neutral(candles: &[Candle], max_drift_pct: f64) -> bool {
    if candles.len() < 20 {
        return false;
    }
    let closes: Vec<f64> = candles[candles.len() - 20..].iter().map(|c| c.close).collect();
    let first = closes[..10].iter().mean();
    let second = closes[10..].iter().mean();
    first > 0.0 && ((second - first) / first * 100.0).abs() < max_drift_pct
}

/// Balanced zone: compressed, overlapping, two-sided trade around value
pub fn detect_balanced_zone(snapshot: &FeatureSnapshot, config: &RegimeConfig) -> DetectionResult {
    let mut result = DetectionResult::new(Regime::BalancedZone, config.balanced_zone_threshold);

    if bollinger_compressed(snapshot, config) {
        result.add(30.0, "bb_compression");
    }

    if inside_bar(&snapshot.candles) && inside_bar(&snapshot.candles_m5) {
        result.add(30.0, "mtf_inside_bar");
    }

    if let Some((recent, prior)) = true_range_windows(&snapshot.candles, config.atr_window) {
        if prior > 0.0 && recent <= prior * (1.0 - config.atr_drop_pct) {
            result.add(20.0, "atr_dropping");
        }
    }

    if choppy_liquidity(&snapshot.candles, config) {
        result.add(10.0, "choppy_liquidity");
    }

    if let (Some(ema20), Some(vwap)) = (snapshot.trend.ema20, snapshot.trend.vwap.filter(|v| *v > 0.0)) {
        if (ema20 - vwap).abs() / vwap * 100.0 < config.ema_vwap_max_pct {
            result.add(10.0, "ema_at_vwap");
        }
    }

    result.finish()
}

fn inside_bar(candles: &[Candle]) -> bool {
    match candles {
        [.., previous, latest] => latest.is_inside(previous),
        _ => false,
    }
}

/// Mostly wicks, hardly any decisive bodies over the last 5 bars
fn choppy_liquidity(candles: &[Candle], config: &RegimeConfig) -> bool {
    if candles.len() < 5 {
        return false;
    }
    let recent = &candles[candles.len() - 5..];
    let (wicky, decisive) = recent
        .iter()
        .filter(|c| c.range() > 0.0)
        .fold((0, 0), |(wicky, decisive), c| {
            let body_ratio = c.body() / c.range();
            let wick_ratio = 1.0 - body_ratio;
            (
                wicky + usize::from(wick_ratio > config.choppy_wick_ratio),
                decisive + usize::from(body_ratio > config.choppy_body_ratio),
            )
        });
    wicky >= 3 && decisive < 2
}
