//! Loss-cutting ladder
//!
//! Rules are evaluated in a fixed order and the first match wins. Cuts
//! that would cross an abnormally wide spread are held back by the
//! spread/ATR gate, which passes when either input is unknown so that a
//! position is never stranded by missing data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LossCutConfig;
use crate::exit::ExitAnalysis;
use crate::snapshot::{FeatureSnapshot, OrderFlow};
use crate::types::{Position, SessionVolatility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossCutUrgency {
    Immediate,
    TightenFirst,
    Monitor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossCutDecision {
    pub should_cut: bool,
    pub reason: String,
    pub urgency: LossCutUrgency,
    pub new_sl: Option<f64>,
    /// 0-1
    pub confidence: f64,
}

impl LossCutDecision {
    fn cut(reason: &str, confidence: f64) -> Self {
        Self {
            should_cut: true,
            reason: reason.to_string(),
            urgency: LossCutUrgency::Immediate,
            new_sl: None,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    fn tighten(reason: &str, new_sl: Option<f64>, confidence: f64) -> Self {
        Self {
            should_cut: false,
            reason: reason.to_string(),
            urgency: LossCutUrgency::TightenFirst,
            new_sl,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn monitor() -> Self {
        Self {
            should_cut: false,
            reason: "monitor".to_string(),
            urgency: LossCutUrgency::Monitor,
            new_sl: None,
            confidence: 0.0,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.should_cut || self.new_sl.is_some()
    }
}

/// Hit probabilities under an unbiased random walk
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskSimulation {
    pub p_hit_sl: f64,
    pub p_hit_tp: f64,
    pub expected_r: f64,
}

/// Gambler's-ruin estimate of hitting take-profit before stop-loss
///
/// Any non-positive distance or ATR yields all zeros.
pub fn simulate(entry: f64, stop_loss: f64, take_profit: f64, atr: f64) -> RiskSimulation {
    let dist_sl = (entry - stop_loss).abs();
    let dist_tp = (take_profit - entry).abs();
    if dist_sl <= 0.0 || dist_tp <= 0.0 || atr <= 0.0 || !atr.is_finite() {
        return RiskSimulation::default();
    }
    let sl = dist_sl / atr;
    let tp = dist_tp / atr;
    let p_hit_tp = sl / (sl + tp);
    let p_hit_sl = 1.0 - p_hit_tp;
    RiskSimulation {
        p_hit_sl,
        p_hit_tp,
        expected_r: p_hit_tp - p_hit_sl,
    }
}

/// Spread/ATR gate: false only when both are known and the ratio exceeds `cap`
pub fn spread_atr_gate(spread: Option<f64>, atr: Option<f64>, cap: f64) -> bool {
    match (spread, atr) {
        (Some(spread), Some(atr)) if atr > 0.0 => spread / atr <= cap,
        // A genuine zero ATR cannot absorb any spread
        (Some(spread), Some(_)) => spread <= 0.0,
        _ => true,
    }
}

pub struct LossCutter {
    config: LossCutConfig,
}

impl LossCutter {
    pub fn new(mut config: LossCutConfig) -> Self {
        config.sanitize();
        Self { config }
    }

    pub fn config(&self) -> &LossCutConfig {
        &self.config
    }

    /// Walk the ladder for `position`
    ///
    /// Every rule that closes outright requires R ≤ 0, so a winner that the
    /// profit protector left alone is at most tightened here.
    ///
    /// `analysis` is the exit analysis for this tick; its `time_decay` flag
    /// is set here when the holding-time ceiling is exceeded.
    pub fn should_cut_loss(
        &self,
        position: &Position,
        snapshot: &FeatureSnapshot,
        analysis: &mut ExitAnalysis,
        session: SessionVolatility,
        order_flow: Option<&OrderFlow>,
        now: DateTime<Utc>,
    ) -> LossCutDecision {
        let cfg = &self.config;
        let Some(r) = position.r_multiple() else {
            debug!(ticket = position.ticket, "No initial risk, loss ladder skipped");
            return LossCutDecision::monitor();
        };
        let atr = snapshot.volatility.atr();
        let gate = spread_atr_gate(snapshot.current_spread(), atr, cfg.max_spread_atr);
        analysis.time_decay = position.age(now) > cfg.time_ceiling(session);

        // Opposing whale flow nudges confidence, never the ladder itself
        let flow_boost = order_flow
            .filter(|f| f.whale_count > 0 && f.bias.is_some_and(|b| b.opposes(position.side)))
            .map_or(0.0, |_| 0.05);

        let decision = if r <= cfg.early_exit_r && analysis.risk_score >= cfg.min_risk_score && gate {
            LossCutDecision::cut("early_r", analysis.risk_score + flow_boost)
        } else if cfg.mtf_invalidation_enabled
            && r <= 0.0
            && analysis.structure_invalidation_count >= cfg.min_invalidations
            && gate
        {
            let confidence = 0.5 + 0.125 * analysis.structure_invalidation_count as f64;
            LossCutDecision::cut("invalidation", confidence + flow_boost)
        } else if analysis.momentum_relapse {
            let new_sl = atr.and_then(|atr| self.tightened_stop(position, cfg.relapse_tighten_atr * atr));
            LossCutDecision::tighten("momentum_relapse", new_sl, 0.6)
        } else if analysis.wick_reversal && r <= cfg.wick_exit_r && gate {
            LossCutDecision::cut("wick_exit", 0.7 + flow_boost)
        } else if cfg.time_backstop_enabled
            && analysis.time_decay
            && r <= 0.0
            && analysis.risk_score >= cfg.time_backstop_min_risk
            && gate
        {
            LossCutDecision::cut("time_backstop", analysis.risk_score + flow_boost)
        } else if let Some(sim) = self.negative_simulation(position, atr, r) {
            LossCutDecision::cut("risk_sim_neg", sim.p_hit_sl + flow_boost)
        } else if r <= cfg.ladder_r {
            let new_sl = atr.and_then(|atr| self.tightened_stop(position, cfg.ladder_tighten_atr * atr));
            LossCutDecision::tighten("r_ladder", new_sl, 0.5)
        } else {
            LossCutDecision::monitor()
        };

        if decision.urgency != LossCutUrgency::Monitor {
            info!(
                ticket = position.ticket,
                symbol = %position.symbol,
                r_multiple = r,
                reason = %decision.reason,
                should_cut = decision.should_cut,
                new_sl = ?decision.new_sl,
                risk = analysis.risk_score,
                "Loss-cut decision"
            );
        }
        decision
    }

    /// Simulation from the current price says the stop is the likelier exit
    ///
    /// Distances are measured from where price is now rather than from
    /// entry, so the estimate moves as the trade drifts toward either level.
    fn negative_simulation(&self, position: &Position, atr: Option<f64>, r: f64) -> Option<RiskSimulation> {
        let stop = position.stop_loss?;
        let target = position.take_profit?;
        let atr = atr.filter(|a| *a > 0.0)?;
        if r >= 0.0 {
            return None;
        }
        let sim = simulate(position.current_price, stop, target, atr);
        (sim.expected_r < 0.0 && sim.p_hit_sl > self.config.risk_sim_ratio * sim.p_hit_tp).then_some(sim)
    }

    /// Stop at entry offset by `distance` on the protective side, only if it
    /// tightens the current stop
    fn tightened_stop(&self, position: &Position, distance: f64) -> Option<f64> {
        let candidate = position.side.protective_offset(position.entry_price, distance);
        match position.stop_loss {
            Some(current) if !position.side.is_tighter_stop(candidate, current) => None,
            _ => Some(candidate),
        }
    }
}
