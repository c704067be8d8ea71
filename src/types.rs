//! Core data types shared by every decision component

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Broker-assigned position identifier
pub type Ticket = u64;

/// Reasons a candle is rejected as malformed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CandleError {
    #[error("non-positive or non-finite price in bar at {0}")]
    BadPrice(DateTime<Utc>),

    #[error("inverted range at {at}: high {high} below low {low}")]
    InvertedRange { at: DateTime<Utc>, high: f64, low: f64 },

    #[error("{field} {value} outside [{low}, {high}] at {at}")]
    OutsideRange {
        at: DateTime<Utc>,
        field: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("negative volume {volume} at {at}")]
    NegativeVolume { at: DateTime<Utc>, volume: f64 },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bid/ask spread observed for the bar, when the feed provides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
}

impl Candle {
    /// Build a candle, rejecting malformed bars
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleError> {
        let candle = Self::new_unchecked(datetime, open, high, low, close, volume);
        candle.validate()?;
        Ok(candle)
    }

    /// Create a candle without validation (for trusted sources or when validation is done separately)
    pub fn new_unchecked(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
            spread: None,
        }
    }

    /// Prices positive and finite, open/close inside the high-low range
    pub fn validate(&self) -> Result<(), CandleError> {
        let at = self.datetime;
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(CandleError::BadPrice(at));
        }
        if self.high < self.low {
            return Err(CandleError::InvertedRange {
                at,
                high: self.high,
                low: self.low,
            });
        }
        for (field, value) in [("open", self.open), ("close", self.close)] {
            if value < self.low || value > self.high {
                return Err(CandleError::OutsideRange {
                    at,
                    field,
                    value,
                    low: self.low,
                    high: self.high,
                });
            }
        }
        if self.volume < 0.0 {
            return Err(CandleError::NegativeVolume { at, volume: self.volume });
        }
        Ok(())
    }

    /// Absolute body size
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Full high-low range
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Whether this bar's range sits inside `previous`'s range
    pub fn is_inside(&self, previous: &Candle) -> bool {
        self.high <= previous.high && self.low >= previous.low
    }

    /// Wick that rejects a move in `side`'s favour (upper wick for longs)
    pub fn rejecting_wick(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.upper_wick(),
            Side::Sell => self.lower_wick(),
        }
    }

    /// Wick on the opposite side of [`Candle::rejecting_wick`]
    pub fn supporting_wick(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.lower_wick(),
            Side::Sell => self.upper_wick(),
        }
    }

    /// Whether the candle closed against `side`
    pub fn closes_against(&self, side: Side) -> bool {
        match side {
            Side::Buy => self.is_bearish(),
            Side::Sell => self.is_bullish(),
        }
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned into every classification, cache entry and journal
/// event, so clones stay O(1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

/// Base assets treated as crypto when sizing VWAP deviation minimums
const CRYPTO_BASES: &[&str] = &[
    "BTC", "ETH", "SOL", "XRP", "BNB", "ADA", "DOGE", "LTC", "AVAX", "DOT", "LINK", "MATIC",
];

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Crypto-like instruments trade with wider intraday deviations
    pub fn is_crypto_like(&self) -> bool {
        let upper = self.0.to_ascii_uppercase();
        upper.ends_with("USDT")
            || upper.ends_with("INR")
            || CRYPTO_BASES.iter().any(|base| upper.starts_with(base))
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a collaborator hands over an unrecognised label
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised {kind}: '{value}'")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseLabelError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for longs, -1 for shorts
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    /// Move `price` by `distance` in the protective (stop) direction
    pub fn protective_offset(self, price: f64, distance: f64) -> f64 {
        price - self.sign() * distance
    }

    /// True when `candidate` is a tighter stop than `current` for this side
    pub fn is_tighter_stop(self, candidate: f64, current: f64) -> bool {
        match self {
            Side::Buy => candidate > current,
            Side::Sell => candidate < current,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok(Side::Buy),
            "sell" | "short" => Ok(Side::Sell),
            _ => Err(ParseLabelError::new("side", s)),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle timeframes the engine consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
        }
    }
}

/// Session volatility bucket used to scale time-based exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionVolatility {
    High,
    Medium,
    Low,
}

impl FromStr for SessionVolatility {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(SessionVolatility::High),
            "medium" | "normal" => Ok(SessionVolatility::Medium),
            "low" => Ok(SessionVolatility::Low),
            _ => Err(ParseLabelError::new("session volatility", s)),
        }
    }
}

/// Open position as reported by the execution gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub side: Side,
    pub volume: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    /// Stop at entry; R-multiples are measured against this risk
    #[serde(default)]
    pub initial_stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Initial risk per unit, if a stop was ever set
    pub fn initial_risk(&self) -> Option<f64> {
        let stop = self.initial_stop_loss.or(self.stop_loss)?;
        let risk = (self.entry_price - stop).abs();
        (risk > 0.0).then_some(risk)
    }

    /// Unrealized profit expressed in units of initial risk
    pub fn r_multiple(&self) -> Option<f64> {
        let risk = self.initial_risk()?;
        Some(self.side.sign() * (self.current_price - self.entry_price) / risk)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }
}

/// Top-of-book quote from the execution gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl Tick {
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.ask >= self.bid
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.time
    }
}
