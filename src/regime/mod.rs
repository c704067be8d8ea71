//! Market regime classification
//!
//! Three independent detectors score the snapshot; the detector with the
//! best confidence above its own threshold names the regime. A recent,
//! confident classification is sticky: a different regime must beat it by
//! a configured margin before it is replaced.

mod cache;
pub mod detectors;

pub use cache::RegimeCache;
pub use detectors::{RangeBounds, RangeProvider, RangeSource, SwingRangeProvider};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::RegimeConfig;
use crate::snapshot::FeatureSnapshot;
use crate::types::{ParseLabelError, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    VwapReversion,
    RangeScalp,
    BalancedZone,
    None,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::VwapReversion => "vwap_reversion",
            Regime::RangeScalp => "range_scalp",
            Regime::BalancedZone => "balanced_zone",
            Regime::None => "none",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regime {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "vwap_reversion" | "vwapreversion" | "vwap" => Ok(Regime::VwapReversion),
            "range_scalp" | "rangescalp" | "range" => Ok(Regime::RangeScalp),
            "balanced_zone" | "balancedzone" | "balanced" => Ok(Regime::BalancedZone),
            "none" | "" => Ok(Regime::None),
            _ => Err(ParseLabelError::new("regime", s)),
        }
    }
}

/// Outcome of one detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub regime: Regime,
    pub detected: bool,
    /// 0-100
    pub confidence: f64,
    pub threshold: f64,
    /// Labels of the checks that scored
    pub passed: Vec<String>,
    /// Why the detector bailed out early, if it did
    pub reason: Option<String>,
}

impl DetectionResult {
    pub fn new(regime: Regime, threshold: f64) -> Self {
        Self {
            regime,
            detected: false,
            confidence: 0.0,
            threshold,
            passed: Vec::new(),
            reason: None,
        }
    }

    pub fn add(&mut self, points: f64, label: &str) {
        self.confidence += points;
        self.passed.push(label.to_string());
    }

    pub fn finish(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 100.0);
        self.detected = self.confidence >= self.threshold;
        self
    }

    pub fn reject(mut self, reason: &str) -> Self {
        self.confidence = 0.0;
        self.detected = false;
        self.passed.clear();
        self.reason = Some(reason.to_string());
        self
    }

    /// Points still missing to clear the threshold (negative when cleared)
    pub fn gap(&self) -> f64 {
        self.threshold - self.confidence
    }
}

/// Raw results of the three detectors, in evaluation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResults {
    pub vwap_reversion: DetectionResult,
    pub range_scalp: DetectionResult,
    pub balanced_zone: DetectionResult,
}

impl DetectionResults {
    /// Results with nothing detected, used where no detector ran
    pub fn empty() -> Self {
        Self {
            vwap_reversion: DetectionResult::new(Regime::VwapReversion, 0.0),
            range_scalp: DetectionResult::new(Regime::RangeScalp, 0.0),
            balanced_zone: DetectionResult::new(Regime::BalancedZone, 0.0),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectionResult> {
        [&self.vwap_reversion, &self.range_scalp, &self.balanced_zone].into_iter()
    }

    pub fn get(&self, regime: Regime) -> Option<&DetectionResult> {
        match regime {
            Regime::VwapReversion => Some(&self.vwap_reversion),
            Regime::RangeScalp => Some(&self.range_scalp),
            Regime::BalancedZone => Some(&self.balanced_zone),
            Regime::None => None,
        }
    }

    /// Highest-confidence detected result; ties go to the earlier detector
    pub fn best(&self) -> Option<&DetectionResult> {
        self.iter()
            .filter(|r| r.detected)
            .fold(None, |best: Option<&DetectionResult>, r| match best {
                Some(b) if b.confidence >= r.confidence => Some(b),
                _ => Some(r),
            })
    }

    fn gap_summary(&self) -> String {
        self.iter()
            .map(|r| {
                format!(
                    "{} {:.0}/{:.0} (gap {:.0})",
                    r.regime,
                    r.confidence,
                    r.threshold,
                    r.gap()
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeClassification {
    pub symbol: Symbol,
    pub regime: Regime,
    /// 0-100
    pub confidence: f64,
    /// Threshold of the chosen regime's detector; the router gates on it
    pub threshold: f64,
    pub results: DetectionResults,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl RegimeClassification {
    fn from_result(
        symbol: Symbol,
        result: &DetectionResult,
        results: DetectionResults,
        reason: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            regime: result.regime,
            confidence: result.confidence,
            threshold: result.threshold,
            results,
            reason,
            timestamp,
        }
    }
}

/// Regime detector with per-symbol hysteresis
pub struct RegimeDetector {
    config: RegimeConfig,
    cache: RegimeCache,
    range_provider: Box<dyn RangeProvider>,
}

impl RegimeDetector {
    pub fn new(mut config: RegimeConfig) -> Self {
        config.sanitize();
        let cache = RegimeCache::new(config.cache_size, config.cache_ttl(), config.cache_agreement);
        Self {
            config,
            cache,
            range_provider: Box::new(SwingRangeProvider::default()),
        }
    }

    pub fn with_range_provider(mut self, provider: Box<dyn RangeProvider>) -> Self {
        self.range_provider = provider;
        self
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    pub fn cache(&self) -> &RegimeCache {
        &self.cache
    }

    /// Run the three detectors without touching the cache
    pub fn evaluate(&self, snapshot: &FeatureSnapshot) -> DetectionResults {
        DetectionResults {
            vwap_reversion: detectors::detect_vwap_reversion(snapshot, &self.config),
            range_scalp: detectors::detect_range_scalp(
                snapshot,
                &self.config,
                self.range_provider.as_ref(),
            ),
            balanced_zone: detectors::detect_balanced_zone(snapshot, &self.config),
        }
    }

    /// Classify the snapshot and record the result in the symbol's cache
    pub fn detect_regime(&self, snapshot: &FeatureSnapshot) -> RegimeClassification {
        let results = self.evaluate(snapshot);
        let previous = self.cache.latest(&snapshot.symbol, snapshot.time);
        let classification = self.resolve(&snapshot.symbol, results, previous.as_ref(), snapshot.time);

        if previous.as_ref().map(|p| p.regime) != Some(classification.regime) {
            info!(
                symbol = %snapshot.symbol,
                regime = %classification.regime,
                confidence = classification.confidence,
                previous = ?previous.as_ref().map(|p| p.regime),
                "Regime changed"
            );
        }
        self.cache.push(classification.clone());
        classification
    }

    /// Pick the regime from fresh detector results, honouring a sticky
    /// previous classification
    pub fn resolve(
        &self,
        symbol: &Symbol,
        results: DetectionResults,
        previous: Option<&RegimeClassification>,
        now: DateTime<Utc>,
    ) -> RegimeClassification {
        let sticky = previous.filter(|p| {
            p.regime != Regime::None && p.confidence >= self.config.sticky_confidence
        });

        if let Some(prev) = sticky {
            let best = results.best().cloned();
            match best {
                Some(best) if best.regime == prev.regime => {
                    let reason = format!("{} confirmed at {:.0}", best.regime, best.confidence);
                    return RegimeClassification::from_result(symbol.clone(), &best, results, reason, now);
                }
                Some(best) if best.confidence >= prev.confidence + self.config.switch_margin => {
                    let reason = format!(
                        "{} {:.0} replaced sticky {} {:.0}",
                        best.regime, best.confidence, prev.regime, prev.confidence
                    );
                    return RegimeClassification::from_result(symbol.clone(), &best, results, reason, now);
                }
                _ => {}
            }

            if let Some(kept) = results.get(prev.regime).filter(|r| r.detected).cloned() {
                debug!(
                    symbol = %symbol,
                    regime = %kept.regime,
                    confidence = kept.confidence,
                    "Keeping sticky regime"
                );
                let reason = format!(
                    "kept {} (previous {:.0}, challenger below +{:.0} margin)",
                    kept.regime, prev.confidence, self.config.switch_margin
                );
                return RegimeClassification::from_result(symbol.clone(), &kept, results, reason, now);
            }
        }

        match results.best().cloned() {
            Some(best) => {
                let reason = format!(
                    "{} {:.0} >= {:.0}: {}",
                    best.regime,
                    best.confidence,
                    best.threshold,
                    best.passed.join(", ")
                );
                RegimeClassification::from_result(symbol.clone(), &best, results, reason, now)
            }
            None => {
                let reason = format!("no regime cleared its threshold: {}", results.gap_summary());
                RegimeClassification {
                    symbol: symbol.clone(),
                    regime: Regime::None,
                    confidence: 0.0,
                    threshold: 0.0,
                    results,
                    reason,
                    timestamp: now,
                }
            }
        }
    }

    /// Stable cached classification, or `None` when the cache disagrees
    pub fn cached_regime(&self, symbol: &Symbol, now: DateTime<Utc>) -> Option<RegimeClassification> {
        self.cache.stable(symbol, now)
    }

    pub fn clear(&self, symbol: &Symbol) {
        self.cache.clear(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn result(regime: Regime, confidence: f64, threshold: f64) -> DetectionResult {
        let mut r = DetectionResult::new(regime, threshold);
        r.add(confidence, "score");
        r.finish()
    }

    fn results(vwap: f64, range: f64, balanced: f64) -> DetectionResults {
        DetectionResults {
            vwap_reversion: result(Regime::VwapReversion, vwap, 70.0),
            range_scalp: result(Regime::RangeScalp, range, 55.0),
            balanced_zone: result(Regime::BalancedZone, balanced, 60.0),
        }
    }

    fn previous(regime: Regime, confidence: f64) -> RegimeClassification {
        RegimeClassification {
            symbol: Symbol::new("BTCUSDT"),
            regime,
            confidence,
            threshold: 60.0,
            results: DetectionResults::empty(),
            reason: String::new(),
            timestamp: now(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_regime_labels_normalise() {
        assert_eq!("VWAP_REVERSION".parse::<Regime>().unwrap(), Regime::VwapReversion);
        assert_eq!("range-scalp".parse::<Regime>().unwrap(), Regime::RangeScalp);
        assert!("trend".parse::<Regime>().is_err());
    }

    #[test]
    fn test_confidence_clamped() {
        let mut r = DetectionResult::new(Regime::RangeScalp, 55.0);
        r.add(80.0, "a");
        r.add(80.0, "b");
        let r = r.finish();
        assert_eq!(r.confidence, 100.0);
        assert!(r.detected);
    }

    #[test]
    fn test_best_prefers_highest_then_fixed_order() {
        let r = results(80.0, 80.0, 60.0);
        assert_eq!(r.best().unwrap().regime, Regime::VwapReversion);
        let r = results(40.0, 60.0, 90.0);
        assert_eq!(r.best().unwrap().regime, Regime::BalancedZone);
    }

    #[test]
    fn test_none_lists_every_gap() {
        let detector = RegimeDetector::new(RegimeConfig::default());
        let c = detector.resolve(&Symbol::new("BTCUSDT"), results(40.0, 20.0, 30.0), None, now());
        assert_eq!(c.regime, Regime::None);
        assert_eq!(c.confidence, 0.0);
        assert!(c.reason.contains("vwap_reversion 40/70"));
        assert!(c.reason.contains("range_scalp 20/55"));
        assert!(c.reason.contains("balanced_zone 30/60"));
    }

    #[test]
    fn test_sticky_regime_survives_small_lead() {
        let detector = RegimeDetector::new(RegimeConfig::default());
        let prev = previous(Regime::VwapReversion, 80.0);
        let c = detector.resolve(&prev.symbol, results(70.0, 90.0, 0.0), Some(&prev), now());
        assert_eq!(c.regime, Regime::VwapReversion);
        assert_eq!(c.confidence, 70.0);
    }

    #[test]
    fn test_sticky_regime_replaced_by_large_lead() {
        let detector = RegimeDetector::new(RegimeConfig::default());
        let prev = previous(Regime::VwapReversion, 80.0);
        let c = detector.resolve(&prev.symbol, results(70.0, 96.0, 0.0), Some(&prev), now());
        assert_eq!(c.regime, Regime::RangeScalp);
        assert_eq!(c.threshold, 55.0);
    }

    #[test]
    fn test_sticky_regime_released_when_it_fails_threshold() {
        let detector = RegimeDetector::new(RegimeConfig::default());
        let prev = previous(Regime::VwapReversion, 80.0);
        let c = detector.resolve(&prev.symbol, results(40.0, 60.0, 0.0), Some(&prev), now());
        assert_eq!(c.regime, Regime::RangeScalp);
    }

    #[test]
    fn test_low_confidence_previous_is_not_sticky() {
        let detector = RegimeDetector::new(RegimeConfig::default());
        let prev = previous(Regime::BalancedZone, 65.0);
        let c = detector.resolve(&prev.symbol, results(0.0, 70.0, 65.0), Some(&prev), now());
        assert_eq!(c.regime, Regime::RangeScalp);
    }

    #[test]
    fn test_detect_regime_caches_result() {
        let detector = RegimeDetector::new(RegimeConfig::default());
        let snapshot = FeatureSnapshot::new(Symbol::new("ETHUSDT"), now(), 3000.0);
        let first = detector.detect_regime(&snapshot);
        assert_eq!(first.regime, Regime::None);
        assert_eq!(detector.cache().len(&snapshot.symbol), 1);
        assert_eq!(detector.cached_regime(&snapshot.symbol, now()).unwrap().regime, Regime::None);
    }
}
