//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files. Every section
//! and field has a documented default, so a partial file (or none at all)
//! yields a working engine. Values that fail validation are replaced by
//! their defaults with a warning instead of aborting the evaluation loop.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::types::SessionVolatility;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub regime: RegimeConfig,
    pub router: RouterConfig,
    pub exit_signals: ExitSignalConfig,
    pub loss_cut: LossCutConfig,
    pub profit: ProfitConfig,
    pub executor: ExecutorConfig,
}

impl EngineConfig {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        Ok(config.with_env_overrides().sanitized())
    }

    /// Apply environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("REGIME_DETECTION_ENABLED") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.regime.enabled = true,
                "0" | "false" | "no" | "off" => self.regime.enabled = false,
                other => warn!(value = other, "Ignoring unrecognised REGIME_DETECTION_ENABLED"),
            }
        }
        self
    }

    /// Replace invalid values with defaults, logging each replacement
    pub fn sanitized(mut self) -> Self {
        self.regime.sanitize();
        self.router.sanitize();
        self.exit_signals.sanitize();
        self.loss_cut.sanitize();
        self.profit.sanitize();
        self.executor.sanitize();
        self.engine.sanitize();
        self
    }
}

/// Reset `value` to `default` when `valid` rejects it
fn ensure<T: Copy + std::fmt::Debug>(
    section: &str,
    field: &str,
    value: &mut T,
    default: T,
    valid: impl Fn(T) -> bool,
) {
    if !valid(*value) {
        warn!(
            section,
            field,
            value = ?*value,
            default = ?default,
            "Invalid config value, falling back to default"
        );
        *value = default;
    }
}

fn is_score(v: f64) -> bool {
    (0.0..=100.0).contains(&v)
}

fn is_unit(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

fn is_positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn is_non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Identity written into `managed_by`; other managers' tickets are skipped
    pub manager_id: String,
    /// Minimum spacing between exit alerts for one ticket
    pub alert_cooldown_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        EngineSection {
            manager_id: "regime_exit_engine".to_string(),
            alert_cooldown_secs: 300,
        }
    }
}

impl EngineSection {
    pub(crate) fn sanitize(&mut self) {
        if self.manager_id.trim().is_empty() {
            warn!("Empty engine.manager_id, falling back to default");
            self.manager_id = Self::default().manager_id;
        }
    }

    pub fn alert_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.alert_cooldown_secs as i64)
    }
}

/// Regime detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// When false the router always falls back to the edge-based strategy
    pub enabled: bool,

    // Per-regime acceptance thresholds (0-100)
    pub vwap_reversion_threshold: f64,
    pub range_scalp_threshold: f64,
    pub balanced_zone_threshold: f64,

    // Hysteresis
    /// Cached confidence at which the previous regime becomes sticky
    pub sticky_confidence: f64,
    /// Points a different regime must add over a sticky one to replace it
    pub switch_margin: f64,

    // Cache
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    /// Share of valid cache entries that must agree for a stable read
    pub cache_agreement: f64,

    // VWAP reversion
    pub vwap_min_candles: usize,
    pub vwap_min_sigma: f64,
    /// Minimum deviation in percent for crypto-like symbols
    pub vwap_min_pct_crypto: f64,
    /// Minimum deviation in percent for everything else
    pub vwap_min_pct_other: f64,
    pub volume_spike_ratio: f64,
    pub volume_lookback: usize,
    /// Fractional VWAP slope per bar below which VWAP counts as flat
    pub vwap_flat_slope: f64,
    /// Maximum fractional ATR change for ATR to count as stable
    pub atr_stability_pct: f64,

    // Range scalp
    pub range_lookback: usize,
    pub range_atr_period: usize,
    /// Range width / ATR at or above which the range is rejected
    pub range_max_atr_ratio: f64,
    /// Distance to a range edge, in percent, that counts as "near"
    pub range_edge_pct: f64,
    pub range_min_respects: usize,
    /// Maximum drift between the halves of the last 20 M15 closes, percent
    pub neutral_drift_pct: f64,

    // Balanced zone / shared
    /// Bollinger width / middle band below which bands count as compressed
    pub bb_compression_width: f64,
    pub atr_drop_pct: f64,
    pub atr_window: usize,
    pub choppy_wick_ratio: f64,
    pub choppy_body_ratio: f64,
    /// Maximum EMA20-to-VWAP distance in percent
    pub ema_vwap_max_pct: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            enabled: true,

            vwap_reversion_threshold: 70.0,
            range_scalp_threshold: 55.0,
            balanced_zone_threshold: 60.0,

            sticky_confidence: 70.0,
            switch_margin: 15.0,

            cache_size: 3,
            cache_ttl_secs: 300,
            cache_agreement: 0.6,

            vwap_min_candles: 10,
            vwap_min_sigma: 2.0,
            vwap_min_pct_crypto: 0.5,
            vwap_min_pct_other: 0.2,
            volume_spike_ratio: 1.5,
            volume_lookback: 20,
            vwap_flat_slope: 0.0005,
            atr_stability_pct: 0.10,

            range_lookback: 20,
            range_atr_period: 14,
            range_max_atr_ratio: 1.2,
            range_edge_pct: 0.5,
            range_min_respects: 2,
            neutral_drift_pct: 0.2,

            bb_compression_width: 0.01,
            atr_drop_pct: 0.05,
            atr_window: 14,
            choppy_wick_ratio: 0.5,
            choppy_body_ratio: 0.7,
            ema_vwap_max_pct: 0.1,
        }
    }
}

impl RegimeConfig {
    pub(crate) fn sanitize(&mut self) {
        let d = Self::default();
        let s = "regime";
        ensure(s, "vwap_reversion_threshold", &mut self.vwap_reversion_threshold, d.vwap_reversion_threshold, is_score);
        ensure(s, "range_scalp_threshold", &mut self.range_scalp_threshold, d.range_scalp_threshold, is_score);
        ensure(s, "balanced_zone_threshold", &mut self.balanced_zone_threshold, d.balanced_zone_threshold, is_score);
        ensure(s, "sticky_confidence", &mut self.sticky_confidence, d.sticky_confidence, is_score);
        ensure(s, "switch_margin", &mut self.switch_margin, d.switch_margin, is_score);
        ensure(s, "cache_size", &mut self.cache_size, d.cache_size, |v| v > 0);
        ensure(s, "cache_ttl_secs", &mut self.cache_ttl_secs, d.cache_ttl_secs, |v| v > 0);
        ensure(s, "cache_agreement", &mut self.cache_agreement, d.cache_agreement, |v| v > 0.0 && v <= 1.0);
        ensure(s, "vwap_min_candles", &mut self.vwap_min_candles, d.vwap_min_candles, |v| v > 1);
        ensure(s, "vwap_min_sigma", &mut self.vwap_min_sigma, d.vwap_min_sigma, is_positive);
        ensure(s, "vwap_min_pct_crypto", &mut self.vwap_min_pct_crypto, d.vwap_min_pct_crypto, is_positive);
        ensure(s, "vwap_min_pct_other", &mut self.vwap_min_pct_other, d.vwap_min_pct_other, is_positive);
        ensure(s, "volume_spike_ratio", &mut self.volume_spike_ratio, d.volume_spike_ratio, is_positive);
        ensure(s, "volume_lookback", &mut self.volume_lookback, d.volume_lookback, |v| v > 0);
        ensure(s, "vwap_flat_slope", &mut self.vwap_flat_slope, d.vwap_flat_slope, is_positive);
        ensure(s, "atr_stability_pct", &mut self.atr_stability_pct, d.atr_stability_pct, is_positive);
        ensure(s, "range_lookback", &mut self.range_lookback, d.range_lookback, |v| v > 2);
        ensure(s, "range_atr_period", &mut self.range_atr_period, d.range_atr_period, |v| v > 0);
        ensure(s, "range_max_atr_ratio", &mut self.range_max_atr_ratio, d.range_max_atr_ratio, is_positive);
        ensure(s, "range_edge_pct", &mut self.range_edge_pct, d.range_edge_pct, is_positive);
        ensure(s, "neutral_drift_pct", &mut self.neutral_drift_pct, d.neutral_drift_pct, is_positive);
        ensure(s, "bb_compression_width", &mut self.bb_compression_width, d.bb_compression_width, is_positive);
        ensure(s, "atr_drop_pct", &mut self.atr_drop_pct, d.atr_drop_pct, is_unit);
        ensure(s, "atr_window", &mut self.atr_window, d.atr_window, |v| v > 0);
        ensure(s, "choppy_wick_ratio", &mut self.choppy_wick_ratio, d.choppy_wick_ratio, is_unit);
        ensure(s, "choppy_body_ratio", &mut self.choppy_body_ratio, d.choppy_body_ratio, is_unit);
        ensure(s, "ema_vwap_max_pct", &mut self.ema_vwap_max_pct, d.ema_vwap_max_pct, is_positive);
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }
}

/// Strategy router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Run the cheap confluence pre-check before consulting the regime
    pub confluence_precheck: bool,
    pub confluence_min_score: f64,
    pub structure_break_score: f64,
    pub liquidity_score: f64,
    pub vwap_deviation_score: f64,
    pub volume_score: f64,
    pub volume_ratio: f64,
    /// Tolerance, in percent, for two highs/lows to count as equal
    pub equal_level_tolerance_pct: f64,
    pub lookback: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            confluence_precheck: false,
            confluence_min_score: 25.0,
            structure_break_score: 30.0,
            liquidity_score: 20.0,
            vwap_deviation_score: 25.0,
            volume_score: 25.0,
            volume_ratio: 1.3,
            equal_level_tolerance_pct: 0.05,
            lookback: 10,
        }
    }
}

impl RouterConfig {
    pub(crate) fn sanitize(&mut self) {
        let d = Self::default();
        let s = "router";
        ensure(s, "confluence_min_score", &mut self.confluence_min_score, d.confluence_min_score, is_score);
        ensure(s, "structure_break_score", &mut self.structure_break_score, d.structure_break_score, is_score);
        ensure(s, "liquidity_score", &mut self.liquidity_score, d.liquidity_score, is_score);
        ensure(s, "vwap_deviation_score", &mut self.vwap_deviation_score, d.vwap_deviation_score, is_score);
        ensure(s, "volume_score", &mut self.volume_score, d.volume_score, is_score);
        ensure(s, "volume_ratio", &mut self.volume_ratio, d.volume_ratio, is_positive);
        ensure(s, "equal_level_tolerance_pct", &mut self.equal_level_tolerance_pct, d.equal_level_tolerance_pct, is_positive);
        ensure(s, "lookback", &mut self.lookback, d.lookback, |v| v > 2);
    }
}

/// Exit-signal detector thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSignalConfig {
    pub adx_rollover_threshold: f64,
    pub rsi_period: usize,
    pub rsi_divergence_lookback: usize,
    /// Fractional shrink of the MACD histogram that counts as deceleration
    pub macd_decel_ratio: f64,
    /// Fractional volume drop over the last 5 bars for volume divergence
    pub volume_drop_fraction: f64,
    pub atr_compression_pct: f64,
    pub vwap_flat_slope: f64,

    pub min_breakdown_signals: usize,
    pub min_exhaustion_signals: usize,
    pub min_early_warning_signals: usize,
}

impl Default for ExitSignalConfig {
    fn default() -> Self {
        ExitSignalConfig {
            adx_rollover_threshold: 25.0,
            rsi_period: 14,
            rsi_divergence_lookback: 20,
            macd_decel_ratio: 0.2,
            volume_drop_fraction: 0.3,
            atr_compression_pct: 0.2,
            vwap_flat_slope: 0.0003,

            min_breakdown_signals: 1,
            min_exhaustion_signals: 2,
            min_early_warning_signals: 2,
        }
    }
}

impl ExitSignalConfig {
    pub(crate) fn sanitize(&mut self) {
        let d = Self::default();
        let s = "exit_signals";
        ensure(s, "adx_rollover_threshold", &mut self.adx_rollover_threshold, d.adx_rollover_threshold, is_score);
        ensure(s, "rsi_period", &mut self.rsi_period, d.rsi_period, |v| v > 1);
        ensure(s, "rsi_divergence_lookback", &mut self.rsi_divergence_lookback, d.rsi_divergence_lookback, |v| v >= 6);
        ensure(s, "macd_decel_ratio", &mut self.macd_decel_ratio, d.macd_decel_ratio, is_unit);
        ensure(s, "volume_drop_fraction", &mut self.volume_drop_fraction, d.volume_drop_fraction, is_unit);
        ensure(s, "atr_compression_pct", &mut self.atr_compression_pct, d.atr_compression_pct, is_unit);
        ensure(s, "vwap_flat_slope", &mut self.vwap_flat_slope, d.vwap_flat_slope, is_positive);
        ensure(s, "min_breakdown_signals", &mut self.min_breakdown_signals, d.min_breakdown_signals, |v| v > 0);
        ensure(s, "min_exhaustion_signals", &mut self.min_exhaustion_signals, d.min_exhaustion_signals, |v| v > 0);
        ensure(s, "min_early_warning_signals", &mut self.min_early_warning_signals, d.min_early_warning_signals, |v| v > 0);
    }
}

/// Loss-cut ladder thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossCutConfig {
    /// R-multiple at or below which the early exit may trigger
    pub early_exit_r: f64,
    pub min_risk_score: f64,
    /// Maximum spread / ATR ratio for an immediate cut
    pub max_spread_atr: f64,
    pub mtf_invalidation_enabled: bool,
    pub min_invalidations: usize,
    pub relapse_tighten_atr: f64,
    pub wick_exit_r: f64,
    pub time_backstop_enabled: bool,
    pub time_backstop_high_mins: i64,
    pub time_backstop_medium_mins: i64,
    pub time_backstop_low_mins: i64,
    pub time_backstop_min_risk: f64,
    /// P(hit SL) must exceed P(hit TP) by this factor for a simulated cut
    pub risk_sim_ratio: f64,
    pub ladder_r: f64,
    pub ladder_tighten_atr: f64,
}

impl Default for LossCutConfig {
    fn default() -> Self {
        LossCutConfig {
            early_exit_r: -0.35,
            min_risk_score: 0.6,
            max_spread_atr: 0.25,
            mtf_invalidation_enabled: true,
            min_invalidations: 2,
            relapse_tighten_atr: 0.3,
            wick_exit_r: -0.5,
            time_backstop_enabled: true,
            time_backstop_high_mins: 60,
            time_backstop_medium_mins: 120,
            time_backstop_low_mins: 180,
            time_backstop_min_risk: 0.5,
            risk_sim_ratio: 1.5,
            ladder_r: -0.5,
            ladder_tighten_atr: 0.2,
        }
    }
}

impl LossCutConfig {
    pub(crate) fn sanitize(&mut self) {
        let d = Self::default();
        let s = "loss_cut";
        ensure(s, "early_exit_r", &mut self.early_exit_r, d.early_exit_r, |v| v.is_finite() && v <= 0.0);
        ensure(s, "min_risk_score", &mut self.min_risk_score, d.min_risk_score, is_unit);
        ensure(s, "max_spread_atr", &mut self.max_spread_atr, d.max_spread_atr, is_positive);
        ensure(s, "min_invalidations", &mut self.min_invalidations, d.min_invalidations, |v| (1..=4).contains(&v));
        ensure(s, "relapse_tighten_atr", &mut self.relapse_tighten_atr, d.relapse_tighten_atr, is_non_negative);
        ensure(s, "wick_exit_r", &mut self.wick_exit_r, d.wick_exit_r, |v| v.is_finite() && v <= 0.0);
        ensure(s, "time_backstop_high_mins", &mut self.time_backstop_high_mins, d.time_backstop_high_mins, |v| v > 0);
        ensure(s, "time_backstop_medium_mins", &mut self.time_backstop_medium_mins, d.time_backstop_medium_mins, |v| v > 0);
        ensure(s, "time_backstop_low_mins", &mut self.time_backstop_low_mins, d.time_backstop_low_mins, |v| v > 0);
        ensure(s, "time_backstop_min_risk", &mut self.time_backstop_min_risk, d.time_backstop_min_risk, is_unit);
        ensure(s, "risk_sim_ratio", &mut self.risk_sim_ratio, d.risk_sim_ratio, is_positive);
        ensure(s, "ladder_r", &mut self.ladder_r, d.ladder_r, |v| v.is_finite() && v <= 0.0);
        ensure(s, "ladder_tighten_atr", &mut self.ladder_tighten_atr, d.ladder_tighten_atr, is_non_negative);
    }

    /// Maximum holding time before the time backstop may fire
    pub fn time_ceiling(&self, session: SessionVolatility) -> chrono::Duration {
        let minutes = match session {
            SessionVolatility::High => self.time_backstop_high_mins,
            SessionVolatility::Medium => self.time_backstop_medium_mins,
            SessionVolatility::Low => self.time_backstop_low_mins,
        };
        chrono::Duration::minutes(minutes)
    }
}

/// Profit protection weights and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfitConfig {
    pub cooldown_secs: u64,
    pub exit_score: u32,
    pub tighten_min_score: u32,
    /// Minimum stop improvement, in ATR, for a tighten to be issued
    pub min_improvement_atr: f64,
    pub stop_atr_offset: f64,
    /// Share of the distance to take-profit covered before a rejection counts
    pub tp_progress: f64,
    pub engulfing_ratio: f64,
    pub rejection_wick_ratio: f64,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub atr_drop_pct: f64,
    pub weak_adx: f64,
}

impl Default for ProfitConfig {
    fn default() -> Self {
        ProfitConfig {
            cooldown_secs: 300,
            exit_score: 5,
            tighten_min_score: 2,
            min_improvement_atr: 0.3,
            stop_atr_offset: 0.5,
            tp_progress: 0.8,
            engulfing_ratio: 1.5,
            rejection_wick_ratio: 2.0,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            atr_drop_pct: 0.15,
            weak_adx: 20.0,
        }
    }
}

impl ProfitConfig {
    pub(crate) fn sanitize(&mut self) {
        let d = Self::default();
        let s = "profit";
        ensure(s, "exit_score", &mut self.exit_score, d.exit_score, |v| v > 1);
        ensure(s, "tighten_min_score", &mut self.tighten_min_score, d.tighten_min_score, |v| v > 1);
        if self.tighten_min_score >= self.exit_score {
            warn!(
                tighten = self.tighten_min_score,
                exit = self.exit_score,
                "profit.tighten_min_score must be below exit_score, falling back to defaults"
            );
            self.tighten_min_score = d.tighten_min_score;
            self.exit_score = d.exit_score;
        }
        ensure(s, "min_improvement_atr", &mut self.min_improvement_atr, d.min_improvement_atr, is_non_negative);
        ensure(s, "stop_atr_offset", &mut self.stop_atr_offset, d.stop_atr_offset, is_non_negative);
        ensure(s, "tp_progress", &mut self.tp_progress, d.tp_progress, is_unit);
        ensure(s, "engulfing_ratio", &mut self.engulfing_ratio, d.engulfing_ratio, is_positive);
        ensure(s, "rejection_wick_ratio", &mut self.rejection_wick_ratio, d.rejection_wick_ratio, is_positive);
        ensure(s, "rsi_overbought", &mut self.rsi_overbought, d.rsi_overbought, is_score);
        ensure(s, "rsi_oversold", &mut self.rsi_oversold, d.rsi_oversold, is_score);
        ensure(s, "atr_drop_pct", &mut self.atr_drop_pct, d.atr_drop_pct, is_unit);
        ensure(s, "weak_adx", &mut self.weak_adx, d.weak_adx, is_score);
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// Order-fill policy for closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    /// Immediate-or-cancel
    Ioc,
    /// Fill-or-kill
    Fok,
    Return,
}

/// Retry/backoff policy for position actions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    /// Price deviation (points) allowed on the first attempt
    pub base_deviation: u32,
    pub max_deviation: u32,
    /// Delay after each failed attempt; the last value repeats
    pub backoff_ms: Vec<u64>,
    /// Ticks older than this mean the market is likely closed
    pub max_tick_age_secs: u64,
    pub fill_mode: FillMode,
    pub comment: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_retries: 3,
            base_deviation: 20,
            max_deviation: 50,
            backoff_ms: vec![500, 1000, 2000],
            max_tick_age_secs: 600,
            fill_mode: FillMode::Ioc,
            comment: "regime_exit".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub(crate) fn sanitize(&mut self) {
        let d = Self::default();
        let s = "executor";
        ensure(s, "max_retries", &mut self.max_retries, d.max_retries, |v| v > 0);
        ensure(s, "base_deviation", &mut self.base_deviation, d.base_deviation, |v| v > 0);
        if self.max_deviation < self.base_deviation {
            warn!(
                base = self.base_deviation,
                max = self.max_deviation,
                "executor.max_deviation below base_deviation, using base"
            );
            self.max_deviation = self.base_deviation;
        }
        if self.backoff_ms.is_empty() {
            warn!("Empty executor.backoff_ms, falling back to default schedule");
            self.backoff_ms = d.backoff_ms;
        }
        ensure(s, "max_tick_age_secs", &mut self.max_tick_age_secs, d.max_tick_age_secs, |v| v > 0);
    }

    /// Backoff for a failed attempt, clamped to the last configured delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.backoff_ms.len().saturating_sub(1));
        Duration::from_millis(self.backoff_ms.get(idx).copied().unwrap_or(0))
    }

    /// Deviation tolerance for an attempt: base × (1 + 0.5 × attempt), capped
    pub fn deviation(&self, attempt: u32) -> u32 {
        let scaled = self.base_deviation as f64 * (1.0 + 0.5 * attempt as f64);
        (scaled.round() as u32).min(self.max_deviation)
    }

    pub fn max_tick_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_tick_age_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = EngineConfig::default();
        assert_eq!(config.regime.vwap_reversion_threshold, 70.0);
        assert_eq!(config.regime.range_scalp_threshold, 55.0);
        assert_eq!(config.regime.balanced_zone_threshold, 60.0);
        assert_eq!(config.profit.cooldown_secs, 300);
        assert_eq!(config.executor.max_tick_age_secs, 600);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "regime": { "switch_margin": 20.0 } }"#).unwrap();
        assert_eq!(config.regime.switch_margin, 20.0);
        assert_eq!(config.regime.sticky_confidence, 70.0);
        assert_eq!(config.loss_cut.ladder_r, -0.5);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let mut config = EngineConfig::default();
        config.regime.vwap_reversion_threshold = 140.0;
        config.loss_cut.min_risk_score = -1.0;
        config.executor.backoff_ms.clear();
        config.profit.tighten_min_score = 9;

        let config = config.sanitized();
        assert_eq!(config.regime.vwap_reversion_threshold, 70.0);
        assert_eq!(config.loss_cut.min_risk_score, 0.6);
        assert_eq!(config.executor.backoff_ms, vec![500, 1000, 2000]);
        assert_eq!(config.profit.tighten_min_score, 2);
        assert_eq!(config.profit.exit_score, 5);
    }

    #[test]
    fn test_deviation_escalates_and_caps() {
        let config = ExecutorConfig::default();
        assert_eq!(config.deviation(0), 20);
        assert_eq!(config.deviation(1), 30);
        assert_eq!(config.deviation(2), 40);
        assert_eq!(config.deviation(5), 50);
    }

    #[test]
    fn test_backoff_clamps_to_last_value() {
        let config = ExecutorConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
        assert_eq!(config.backoff(7), Duration::from_millis(2000));
    }

    #[test]
    fn test_time_ceiling_scales_with_volatility() {
        let config = LossCutConfig::default();
        assert_eq!(config.time_ceiling(SessionVolatility::High), chrono::Duration::minutes(60));
        assert_eq!(config.time_ceiling(SessionVolatility::Low), chrono::Duration::minutes(180));
    }
}
