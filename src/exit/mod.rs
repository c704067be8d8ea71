//! Exit-signal analysis for open positions
//!
//! `ExitSignalDetector::analyze` is a pure function of the position's side,
//! prices and the current snapshot. Individual checks are tagged with the
//! phase they indicate; the resulting phase is chosen by priority
//! (Breakdown, then Exhaustion, then EarlyWarning), never by majority.

mod risk;
mod signals;

pub use risk::{momentum_relapse, risk_score, structure_invalidation_count, wick_reversal};

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::ExitSignalConfig;
use crate::snapshot::FeatureSnapshot;
use crate::types::{Side, Symbol, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPhase {
    None,
    EarlyWarning,
    Exhaustion,
    Breakdown,
}

impl ExitPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitPhase::None => "none",
            ExitPhase::EarlyWarning => "early_warning",
            ExitPhase::Exhaustion => "exhaustion",
            ExitPhase::Breakdown => "breakdown",
        }
    }

    fn confidence_bonus(self) -> f64 {
        match self {
            ExitPhase::Breakdown => 0.3,
            ExitPhase::Exhaustion => 0.2,
            ExitPhase::EarlyWarning => 0.1,
            ExitPhase::None => 0.0,
        }
    }
}

impl fmt::Display for ExitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::None => "none",
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a signal measures; Exhaustion urgency depends on how many
/// categories agree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Momentum,
    Volatility,
    Volume,
    Structure,
}

/// Recommended handling of the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitAction {
    Hold,
    TrailNormal,
    TrailModerate,
    TrailTight,
    TrailVeryTight,
    ExitFull,
}

impl ExitAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitAction::Hold => "hold",
            ExitAction::TrailNormal => "trail_normal",
            ExitAction::TrailModerate => "trail_moderate",
            ExitAction::TrailTight => "trail_tight",
            ExitAction::TrailVeryTight => "trail_very_tight",
            ExitAction::ExitFull => "exit_full",
        }
    }

    /// Trailing distance in ATR for the trail actions
    pub fn atr_multiple(self) -> Option<f64> {
        match self {
            ExitAction::TrailNormal => Some(2.0),
            ExitAction::TrailModerate => Some(1.5),
            ExitAction::TrailTight => Some(1.0),
            ExitAction::TrailVeryTight => Some(0.5),
            ExitAction::Hold | ExitAction::ExitFull => None,
        }
    }
}

impl fmt::Display for ExitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub indicator: String,
    pub phase: ExitPhase,
    pub category: SignalCategory,
    /// 0-1
    pub strength: f64,
    pub message: String,
}

impl ExitSignal {
    pub(crate) fn new(
        indicator: &str,
        phase: ExitPhase,
        category: SignalCategory,
        strength: f64,
        message: String,
    ) -> Self {
        Self {
            indicator: indicator.to_string(),
            phase,
            category,
            strength: strength.clamp(0.0, 1.0),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitAnalysis {
    pub phase: ExitPhase,
    pub urgency: Urgency,
    /// 0-1
    pub confidence: f64,
    pub signals: Vec<ExitSignal>,
    pub early_warning_count: usize,
    pub exhaustion_count: usize,
    pub breakdown_count: usize,
    pub action: ExitAction,
    pub rationale: String,

    /// 0-1 blend of adverse indicator readings
    pub risk_score: f64,
    /// 0-4
    pub structure_invalidation_count: usize,
    pub momentum_relapse: bool,
    pub wick_reversal: bool,
    /// Set by the loss cutter when the holding-time ceiling is exceeded
    pub time_decay: bool,
}

impl ExitAnalysis {
    pub fn count(&self, phase: ExitPhase) -> usize {
        match phase {
            ExitPhase::Breakdown => self.breakdown_count,
            ExitPhase::Exhaustion => self.exhaustion_count,
            ExitPhase::EarlyWarning => self.early_warning_count,
            ExitPhase::None => 0,
        }
    }

    pub fn signal_names(&self) -> Vec<&str> {
        self.signals.iter().map(|s| s.indicator.as_str()).collect()
    }

    /// Alert text: phase, urgency, action, confidence and every fired signal
    pub fn alert_message(&self, symbol: &Symbol, ticket: Ticket) -> String {
        let mut lines = vec![
            format!("Exit alert {symbol} #{ticket}"),
            format!("Phase: {}", self.phase),
            format!("Urgency: {}", self.urgency),
            format!("Action: {}", self.action),
            format!("Confidence: {:.0}%", self.confidence * 100.0),
        ];
        lines.extend(
            self.signals
                .iter()
                .map(|s| format!("- {} [{}] {:.2}: {}", s.indicator, s.phase, s.strength, s.message)),
        );
        lines.join("\n")
    }
}

pub struct ExitSignalDetector {
    config: ExitSignalConfig,
}

impl ExitSignalDetector {
    pub fn new(mut config: ExitSignalConfig) -> Self {
        config.sanitize();
        Self { config }
    }

    pub fn config(&self) -> &ExitSignalConfig {
        &self.config
    }

    pub fn analyze(
        &self,
        side: Side,
        entry_price: f64,
        current_price: f64,
        snapshot: &FeatureSnapshot,
    ) -> ExitAnalysis {
        let signals = signals::collect(&self.config, side, current_price, snapshot);
        let count = |phase| signals.iter().filter(|s| s.phase == phase).count();
        let breakdown_count = count(ExitPhase::Breakdown);
        let exhaustion_count = count(ExitPhase::Exhaustion);
        let early_warning_count = count(ExitPhase::EarlyWarning);

        let phase = if breakdown_count >= self.config.min_breakdown_signals {
            ExitPhase::Breakdown
        } else if exhaustion_count >= self.config.min_exhaustion_signals {
            ExitPhase::Exhaustion
        } else if early_warning_count >= self.config.min_early_warning_signals {
            ExitPhase::EarlyWarning
        } else {
            ExitPhase::None
        };

        let (urgency, action) = match phase {
            ExitPhase::Breakdown if breakdown_count >= 2 => (Urgency::Critical, ExitAction::ExitFull),
            ExitPhase::Breakdown => (Urgency::High, ExitAction::TrailVeryTight),
            ExitPhase::Exhaustion if category_span(&signals) >= 2 => (Urgency::High, ExitAction::TrailTight),
            ExitPhase::Exhaustion => (Urgency::Medium, ExitAction::TrailModerate),
            ExitPhase::EarlyWarning if early_warning_count >= 3 => (Urgency::Medium, ExitAction::TrailModerate),
            ExitPhase::EarlyWarning => (Urgency::Low, ExitAction::TrailNormal),
            ExitPhase::None => (Urgency::None, ExitAction::Hold),
        };

        let confidence = if signals.is_empty() {
            0.0
        } else {
            let avg = signals.iter().map(|s| s.strength).sum::<f64>() / signals.len() as f64;
            (avg + (0.1 * signals.len() as f64).min(0.3) + phase.confidence_bonus()).clamp(0.0, 1.0)
        };

        let move_pct = if entry_price > 0.0 {
            side.sign() * (current_price - entry_price) / entry_price * 100.0
        } else {
            0.0
        };
        let rationale = if signals.is_empty() {
            format!("No exit signals ({move_pct:+.2}% from entry)")
        } else {
            format!(
                "{} with {} signal(s) ({move_pct:+.2}% from entry): {}",
                phase,
                signals.len(),
                signals.iter().map(|s| s.indicator.as_str()).collect::<Vec<_>>().join(", ")
            )
        };

        let analysis = ExitAnalysis {
            phase,
            urgency,
            confidence,
            early_warning_count,
            exhaustion_count,
            breakdown_count,
            action,
            rationale,
            risk_score: risk_score(&self.config, side, current_price, snapshot),
            structure_invalidation_count: structure_invalidation_count(side, current_price, snapshot),
            momentum_relapse: momentum_relapse(side, snapshot),
            wick_reversal: wick_reversal(side, &snapshot.candles),
            time_decay: false,
            signals,
        };

        debug!(
            symbol = %snapshot.symbol,
            side = %side,
            phase = %analysis.phase,
            urgency = %analysis.urgency,
            signals = analysis.signals.len(),
            risk = analysis.risk_score,
            "Exit analysis"
        );
        analysis
    }
}

/// Distinct non-structure categories among the fired signals
fn category_span(signals: &[ExitSignal]) -> usize {
    [
        SignalCategory::Momentum,
        SignalCategory::Volatility,
        SignalCategory::Volume,
    ]
    .iter()
    .filter(|category| signals.iter().any(|s| s.category == **category))
    .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::CandleColor;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn snapshot(price: f64) -> FeatureSnapshot {
        FeatureSnapshot::new(Symbol::new("XAUUSD"), Utc::now(), price)
    }

    fn detector() -> ExitSignalDetector {
        ExitSignalDetector::new(ExitSignalConfig::default())
    }

    #[test]
    fn test_no_data_means_hold() {
        let analysis = detector().analyze(Side::Buy, 100.0, 101.0, &snapshot(101.0));
        assert_eq!(analysis.phase, ExitPhase::None);
        assert_eq!(analysis.urgency, Urgency::None);
        assert_eq!(analysis.action, ExitAction::Hold);
        assert_eq!(analysis.confidence, 0.0);
        assert_eq!(analysis.risk_score, 0.0);
    }

    #[test]
    fn test_breakdown_beats_exhaustion() {
        let mut snap = snapshot(3865.0);
        snap.trend.sar = Some(3875.0);
        snap.volatility.atr = Some(4.0);
        snap.volatility.atr_prev = Some(6.0);
        snap.trend.vwap_slope = Some(-0.001);

        let analysis = detector().analyze(Side::Buy, 3850.0, 3865.0, &snap);
        assert_eq!(analysis.exhaustion_count, 2);
        assert_eq!(analysis.breakdown_count, 1);
        assert_eq!(analysis.phase, ExitPhase::Breakdown);
        assert_eq!(analysis.urgency, Urgency::High);
        assert_eq!(analysis.action, ExitAction::TrailVeryTight);
    }

    #[test]
    fn test_two_breakdowns_are_critical() {
        let mut snap = snapshot(95.0);
        snap.trend.ema20 = Some(100.0);
        snap.trend.ha_color_prev = Some(CandleColor::Green);
        snap.trend.ha_color = Some(CandleColor::Red);

        let analysis = detector().analyze(Side::Buy, 98.0, 95.0, &snap);
        assert_eq!(analysis.phase, ExitPhase::Breakdown);
        assert_eq!(analysis.urgency, Urgency::Critical);
        assert_eq!(analysis.action, ExitAction::ExitFull);
        assert!(analysis.confidence <= 1.0);
    }

    #[test]
    fn test_exhaustion_category_span() {
        // ATR compression (volatility) + VWAP flat (volume) span two categories
        let mut snap = snapshot(101.0);
        snap.volatility.atr = Some(0.7);
        snap.volatility.atr_prev = Some(1.0);
        snap.trend.vwap_slope = Some(0.0001);
        let analysis = detector().analyze(Side::Buy, 100.0, 101.0, &snap);
        assert_eq!(analysis.phase, ExitPhase::Exhaustion);
        assert_eq!(analysis.urgency, Urgency::High);
        assert_eq!(analysis.action, ExitAction::TrailTight);
    }

    #[test]
    fn test_early_warning_mapping() {
        // ADX rollover + MACD deceleration for a long
        let mut snap = snapshot(101.0);
        snap.momentum.adx = Some(30.0);
        snap.momentum.adx_prev = Some(34.0);
        snap.momentum.macd_hist = Some(0.5);
        snap.momentum.macd_hist_prev = Some(1.0);
        let analysis = detector().analyze(Side::Buy, 100.0, 101.0, &snap);
        assert_eq!(analysis.phase, ExitPhase::EarlyWarning);
        assert_eq!(analysis.urgency, Urgency::Low);
        assert_eq!(analysis.action, ExitAction::TrailNormal);
        assert_relative_eq!(
            analysis.confidence,
            (analysis.signals[0].strength + analysis.signals[1].strength) / 2.0 + 0.2 + 0.1,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_alert_message_lists_signals() {
        let mut snap = snapshot(95.0);
        snap.trend.ema20 = Some(100.0);
        let analysis = detector().analyze(Side::Buy, 98.0, 95.0, &snap);
        let text = analysis.alert_message(&snap.symbol, 42);
        assert!(text.contains("#42"));
        assert!(text.contains("Phase: breakdown"));
        assert!(text.contains("Urgency: high"));
        assert!(text.contains("Action: trail_very_tight"));
        assert!(text.contains("ema20_break"));
    }
}
