//! Feature snapshot consumed by every decision component
//!
//! A snapshot is rebuilt each tick by the market-data side of the bot and
//! handed to the engine read-only. Every indicator is an `Option`: a value
//! the feed could not produce stays `None` so the signals depending on it
//! are skipped instead of being evaluated against a substituted zero.
//!
//! String labels coming from collaborators (Heikin-Ashi colors, structure
//! bias, momentum grades) are normalised here, once, through `FromStr`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::types::{Candle, ParseLabelError, Side, Symbol, Timeframe};

/// Directional bias reported by an external structure/divergence tagger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
}

impl Bias {
    /// Whether this bias works against a position on `side`
    pub fn opposes(self, side: Side) -> bool {
        matches!(
            (self, side),
            (Bias::Bearish, Side::Buy) | (Bias::Bullish, Side::Sell)
        )
    }
}

impl FromStr for Bias {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" | "bull" | "up" | "buy" => Ok(Bias::Bullish),
            "bearish" | "bear" | "down" | "sell" => Ok(Bias::Bearish),
            _ => Err(ParseLabelError::new("bias", s)),
        }
    }
}

/// Heikin-Ashi candle color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleColor {
    Green,
    Red,
}

impl CandleColor {
    /// Color that confirms a position on `side`
    pub fn favouring(side: Side) -> Self {
        match side {
            Side::Buy => CandleColor::Green,
            Side::Sell => CandleColor::Red,
        }
    }
}

impl FromStr for CandleColor {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "green" | "bullish" => Ok(CandleColor::Green),
            "red" | "bearish" => Ok(CandleColor::Red),
            _ => Err(ParseLabelError::new("candle color", s)),
        }
    }
}

/// Externally graded momentum quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MomentumQuality {
    Strong,
    Moderate,
    Weak,
    Poor,
}

impl MomentumQuality {
    pub fn is_deteriorated(self) -> bool {
        matches!(self, MomentumQuality::Weak | MomentumQuality::Poor)
    }
}

impl FromStr for MomentumQuality {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strong" | "excellent" => Ok(MomentumQuality::Strong),
            "moderate" | "good" | "fair" => Ok(MomentumQuality::Moderate),
            "weak" => Ok(MomentumQuality::Weak),
            "poor" => Ok(MomentumQuality::Poor),
            _ => Err(ParseLabelError::new("momentum quality", s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MomentumFeatures {
    pub adx: Option<f64>,
    pub adx_prev: Option<f64>,
    pub rsi: Option<f64>,
    pub rsi_prev: Option<f64>,
    pub macd_hist: Option<f64>,
    pub macd_hist_prev: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolatilityFeatures {
    pub atr: Option<f64>,
    pub atr_prev: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
}

impl VolatilityFeatures {
    /// ATR, treating non-finite or negative readings as unavailable
    pub fn atr(&self) -> Option<f64> {
        self.atr.filter(|a| a.is_finite() && *a >= 0.0)
    }

    /// Positive ATR usable as a divisor or stop distance
    pub fn positive_atr(&self) -> Option<f64> {
        self.atr().filter(|a| *a > 0.0)
    }

    /// Fractional ATR change vs the previous reading (negative = compression)
    pub fn atr_change(&self) -> Option<f64> {
        let current = self.atr()?;
        let previous = self.atr_prev.filter(|p| *p > 0.0)?;
        Some((current - previous) / previous)
    }

    /// Bollinger band width as a fraction of the middle band
    pub fn bb_width_pct(&self) -> Option<f64> {
        let upper = self.bb_upper?;
        let lower = self.bb_lower?;
        let middle = self.bb_middle.filter(|m| *m > 0.0)?;
        Some((upper - lower) / middle)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendFeatures {
    pub ema20: Option<f64>,
    pub ema20_prev: Option<f64>,
    pub ema50: Option<f64>,
    pub ema50_prev: Option<f64>,
    pub ema200: Option<f64>,
    pub sar: Option<f64>,
    pub vwap: Option<f64>,
    pub vwap_std: Option<f64>,
    /// Fractional VWAP change per bar
    pub vwap_slope: Option<f64>,
    pub ha_color: Option<CandleColor>,
    pub ha_color_prev: Option<CandleColor>,
}

impl TrendFeatures {
    /// Heikin-Ashi turned from favouring `side` to opposing it this bar
    pub fn ha_flipped_against(&self, side: Side) -> Option<bool> {
        let previous = self.ha_color_prev?;
        let current = self.ha_color?;
        let favoured = CandleColor::favouring(side);
        Some(previous == favoured && current != favoured)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureHints {
    pub bias: Option<Bias>,
    pub bias_prev: Option<Bias>,
    /// RSI/MACD divergence flagged by an external tagger
    pub divergence: Option<Bias>,
    pub momentum_quality: Option<MomentumQuality>,
    /// Break of structure flagged by an external tagger
    pub structure_break: Option<Bias>,
}

impl StructureHints {
    /// External structure tag turned against `side` this bar
    pub fn flipped_against(&self, side: Side) -> bool {
        match (self.bias_prev, self.bias) {
            (Some(previous), Some(current)) => !previous.opposes(side) && current.opposes(side),
            _ => false,
        }
    }
}

/// Order-flow hints from the depth/trade tape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFlow {
    pub whale_count: u32,
    pub bias: Option<Bias>,
}

/// Everything the engine knows about one instrument at one instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub price: f64,
    #[serde(default)]
    pub spread: Option<f64>,
    #[serde(default)]
    pub momentum: MomentumFeatures,
    #[serde(default)]
    pub volatility: VolatilityFeatures,
    #[serde(default)]
    pub trend: TrendFeatures,
    #[serde(default)]
    pub structure: StructureHints,
    #[serde(default)]
    pub order_flow: Option<OrderFlow>,
    /// Primary (M1) candles, oldest first
    #[serde(default)]
    pub candles: Vec<Candle>,
    #[serde(default)]
    pub candles_m5: Vec<Candle>,
    #[serde(default)]
    pub candles_m15: Vec<Candle>,
}

impl FeatureSnapshot {
    pub fn new(symbol: Symbol, time: DateTime<Utc>, price: f64) -> Self {
        Self {
            symbol,
            time,
            price,
            spread: None,
            momentum: MomentumFeatures::default(),
            volatility: VolatilityFeatures::default(),
            trend: TrendFeatures::default(),
            structure: StructureHints::default(),
            order_flow: None,
            candles: Vec::new(),
            candles_m5: Vec::new(),
            candles_m15: Vec::new(),
        }
    }

    /// Spread from the snapshot, falling back to the latest candle's spread
    pub fn current_spread(&self) -> Option<f64> {
        self.spread
            .or_else(|| self.candles.last().and_then(|c| c.spread))
            .filter(|s| s.is_finite() && *s >= 0.0)
    }

    /// Distance from VWAP in standard deviations
    pub fn vwap_deviation_sigma(&self) -> Option<f64> {
        let vwap = self.trend.vwap?;
        let std = self.trend.vwap_std.filter(|s| *s > 0.0)?;
        Some((self.price - vwap).abs() / std)
    }
}

/// Source of resident candle buffers
///
/// Implementations are expected to serve from memory; the engine never
/// calls them from inside a decision function.
pub trait MarketDataProvider: Send + Sync {
    /// Last `limit` candles, oldest first
    fn get_candles(&self, symbol: &Symbol, timeframe: Timeframe, limit: usize) -> Vec<Candle>;

    fn get_latest_candle(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<Candle> {
        self.get_candles(symbol, timeframe, 1).pop()
    }

    fn calculate_atr(&self, symbol: &Symbol, timeframe: Timeframe, period: usize) -> Option<f64>;
}

/// Fills snapshot candle sets from a [`MarketDataProvider`]
///
/// Candle sets whose newest bar is older than the tolerance are dropped, so
/// a stalled feed shows up as missing data rather than as a frozen market.
pub struct SnapshotAssembler<'a, P: MarketDataProvider + ?Sized> {
    provider: &'a P,
    max_age: Duration,
    limit: usize,
}

impl<'a, P: MarketDataProvider + ?Sized> SnapshotAssembler<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self {
            provider,
            max_age: Duration::minutes(5),
            limit: 100,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn fresh_candles(&self, symbol: &Symbol, timeframe: Timeframe, now: DateTime<Utc>) -> Vec<Candle> {
        let mut candles = self.provider.get_candles(symbol, timeframe, self.limit);
        let before = candles.len();
        candles.retain(|candle| match candle.validate() {
            Ok(()) => true,
            Err(err) => {
                debug!(symbol = %symbol, timeframe = timeframe.as_str(), %err, "Dropping malformed candle");
                false
            }
        });
        if candles.len() < before {
            warn!(
                symbol = %symbol,
                timeframe = timeframe.as_str(),
                dropped = before - candles.len(),
                "Malformed candles removed from snapshot"
            );
        }
        // Providers may answer newest-first; the engine wants oldest-first
        if candles.len() > 1 && candles[0].datetime > candles[candles.len() - 1].datetime {
            candles.reverse();
        }
        match candles.last() {
            Some(last) if now - last.datetime <= self.max_age + timeframe.duration() => candles,
            Some(last) => {
                debug!(
                    symbol = %symbol,
                    timeframe = timeframe.as_str(),
                    last = %last.datetime,
                    "Dropping stale candle set"
                );
                Vec::new()
            }
            None => candles,
        }
    }

    /// Populate candle sets (and ATR if absent) on `snapshot`
    pub fn fill(&self, snapshot: &mut FeatureSnapshot) {
        let now = snapshot.time;
        let symbol = snapshot.symbol.clone();
        snapshot.candles = self.fresh_candles(&symbol, Timeframe::M1, now);
        snapshot.candles_m5 = self.fresh_candles(&symbol, Timeframe::M5, now);
        snapshot.candles_m15 = self.fresh_candles(&symbol, Timeframe::M15, now);
        if snapshot.volatility.atr.is_none() && !snapshot.candles.is_empty() {
            snapshot.volatility.atr = self.provider.calculate_atr(&symbol, Timeframe::M1, 14);
        }
    }
}
