//! Regime-to-strategy routing
//!
//! Maps a classification to one of the regime strategies, falling back to
//! the edge-based strategy whenever detection is disabled, confluence is
//! missing, or the classification does not clear its own threshold.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::{RegimeConfig, RouterConfig};
use crate::indicators::mean_volume;
use crate::regime::{Regime, RegimeClassification};
use crate::snapshot::FeatureSnapshot;
use crate::types::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    VwapReversion,
    RangeScalp,
    BalancedZone,
    /// Catch-all strategy implemented outside the engine
    EdgeBased,
}

impl StrategyName {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyName::VwapReversion => "vwap_reversion",
            StrategyName::RangeScalp => "range_scalp",
            StrategyName::BalancedZone => "balanced_zone",
            StrategyName::EdgeBased => "edge_based",
        }
    }

    /// Strategy for a regime label; unknown labels route to the fallback
    pub fn for_label(label: &str) -> Self {
        label
            .parse::<Regime>()
            .map(Self::for_regime)
            .unwrap_or(StrategyName::EdgeBased)
    }

    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::VwapReversion => StrategyName::VwapReversion,
            Regime::RangeScalp => StrategyName::RangeScalp,
            Regime::BalancedZone => StrategyName::BalancedZone,
            Regime::None => StrategyName::EdgeBased,
        }
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct StrategyRouter {
    enabled: bool,
    config: RouterConfig,
}

impl StrategyRouter {
    pub fn new(regime: &RegimeConfig, mut config: RouterConfig) -> Self {
        config.sanitize();
        Self {
            enabled: regime.enabled,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn select_strategy(
        &self,
        snapshot: &FeatureSnapshot,
        classification: &RegimeClassification,
    ) -> StrategyName {
        if !self.enabled {
            return StrategyName::EdgeBased;
        }

        if self.config.confluence_precheck {
            let score = self.confluence_score(snapshot);
            if score < self.config.confluence_min_score {
                debug!(
                    symbol = %snapshot.symbol,
                    score,
                    min = self.config.confluence_min_score,
                    "Confluence pre-check failed, using edge-based"
                );
                return StrategyName::EdgeBased;
            }
        }

        if classification.regime == Regime::None
            || classification.confidence < classification.threshold
        {
            return StrategyName::EdgeBased;
        }

        let strategy = StrategyName::for_regime(classification.regime);
        debug!(
            symbol = %snapshot.symbol,
            regime = %classification.regime,
            confidence = classification.confidence,
            strategy = %strategy,
            "Strategy selected"
        );
        strategy
    }

    /// Cheap confluence score: structure break, equal-level liquidity,
    /// VWAP stretch and relative volume
    pub fn confluence_score(&self, snapshot: &FeatureSnapshot) -> f64 {
        let cfg = &self.config;
        let candles = &snapshot.candles;
        let mut score = 0.0;

        let prior = prior_window(candles, cfg.lookback);

        let broke_structure = snapshot.structure.structure_break.is_some()
            || match (candles.last(), prior.is_empty()) {
                (Some(last), false) => {
                    let high = prior.iter().map(|c| c.high).fold(f64::MIN, f64::max);
                    let low = prior.iter().map(|c| c.low).fold(f64::MAX, f64::min);
                    last.close > high || last.close < low
                }
                _ => false,
            };
        if broke_structure {
            score += cfg.structure_break_score;
        }

        if has_equal_levels(prior, cfg.equal_level_tolerance_pct) {
            score += cfg.liquidity_score;
        }

        if snapshot.vwap_deviation_sigma().is_some_and(|s| s >= 2.0) {
            score += cfg.vwap_deviation_score;
        }

        if let (Some(last), Some(avg)) = (candles.last(), mean_volume(prior_window(candles, 10))) {
            if avg > 0.0 && last.volume >= avg * cfg.volume_ratio {
                score += cfg.volume_score;
            }
        }

        score
    }
}

/// Up to `n` bars before the latest one
fn prior_window(candles: &[Candle], n: usize) -> &[Candle] {
    let end = candles.len().saturating_sub(1);
    &candles[end.saturating_sub(n)..end]
}

/// Two highs or two lows within `tolerance_pct` of each other
fn has_equal_levels(candles: &[Candle], tolerance_pct: f64) -> bool {
    let clustered = |levels: Vec<OrderedFloat<f64>>| {
        let mut levels = levels;
        levels.sort_unstable();
        levels
            .windows(2)
            .any(|w| w[0].0 > 0.0 && (w[1].0 - w[0].0) / w[0].0 * 100.0 <= tolerance_pct)
    };
    clustered(candles.iter().map(|c| OrderedFloat(c.high)).collect())
        || clustered(candles.iter().map(|c| OrderedFloat(c.low)).collect())
}
