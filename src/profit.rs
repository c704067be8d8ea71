//! Profit protection for winning positions
//!
//! Eight weighted warnings are summed into a score. A high score exits, a
//! moderate one tightens the stop behind recent structure, a single weak
//! warning is reported for information only. Exit and tighten decisions
//! start a per-ticket cooldown.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ProfitConfig;
use crate::exit::structure_invalidation_count;
use crate::snapshot::{FeatureSnapshot, OrderFlow};
use crate::state::TicketClock;
use crate::types::{Candle, Position, Side, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfitAction {
    Exit,
    Tighten,
    Monitor,
}

impl ProfitAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfitAction::Exit => "exit",
            ProfitAction::Tighten => "tighten",
            ProfitAction::Monitor => "monitor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub name: String,
    /// 1-3
    pub weight: u32,
    pub description: String,
}

impl Warning {
    fn new(name: &str, weight: u32, description: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            weight,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitProtectionDecision {
    pub action: ProfitAction,
    pub reason: String,
    pub warnings: Vec<Warning>,
    pub total_score: u32,
    pub new_sl: Option<f64>,
    /// 0-1
    pub confidence: f64,
}

impl ProfitProtectionDecision {
    /// Exit and tighten are acted on; monitor is informational
    pub fn is_actionable(&self) -> bool {
        matches!(self.action, ProfitAction::Exit | ProfitAction::Tighten)
    }

    pub fn warning_names(&self) -> Vec<&str> {
        self.warnings.iter().map(|w| w.name.as_str()).collect()
    }
}

pub struct ProfitProtector {
    config: ProfitConfig,
    last_tighten: TicketClock,
}

impl ProfitProtector {
    pub fn new(mut config: ProfitConfig) -> Self {
        config.sanitize();
        Self {
            config,
            last_tighten: TicketClock::new(),
        }
    }

    pub fn config(&self) -> &ProfitConfig {
        &self.config
    }

    pub fn last_tighten(&self, ticket: Ticket) -> Option<DateTime<Utc>> {
        self.last_tighten.last(ticket)
    }

    /// Drop cooldown state for a closed position
    pub fn forget(&self, ticket: Ticket) {
        self.last_tighten.forget(ticket);
    }

    pub fn analyze_profit_protection(
        &self,
        position: &Position,
        snapshot: &FeatureSnapshot,
        order_flow: Option<&OrderFlow>,
        r_multiple: f64,
        now: DateTime<Utc>,
    ) -> Option<ProfitProtectionDecision> {
        if r_multiple <= 0.0 {
            return None;
        }
        let cooldown = self.config.cooldown();
        if self.last_tighten.is_within(position.ticket, now, cooldown) {
            debug!(ticket = position.ticket, "Profit protection in cooldown");
            return None;
        }

        let warnings = self.warnings(position, snapshot, order_flow, now);
        let total_score: u32 = warnings.iter().map(|w| w.weight).sum();
        let names = warnings.iter().map(|w| w.name.as_str()).collect::<Vec<_>>().join(", ");

        let (action, new_sl, confidence) = if total_score >= self.config.exit_score {
            (ProfitAction::Exit, None, 0.85)
        } else if total_score >= self.config.tighten_min_score {
            let Some(new_sl) = self.tightened_stop(position, snapshot) else {
                debug!(
                    ticket = position.ticket,
                    score = total_score,
                    "Tighten suppressed, no stop improves enough"
                );
                return None;
            };
            (ProfitAction::Tighten, Some(new_sl), 0.70)
        } else if total_score == 1 {
            (ProfitAction::Monitor, None, 0.50)
        } else {
            return None;
        };

        if action != ProfitAction::Monitor
            && !self.last_tighten.try_stamp(position.ticket, now, cooldown)
        {
            // Another evaluation of this ticket acted first
            return None;
        }

        let reason = format!(
            "{} at {:.2}R, score {}: {}",
            action.as_str(),
            r_multiple,
            total_score,
            names
        );
        if action != ProfitAction::Monitor {
            info!(
                ticket = position.ticket,
                symbol = %position.symbol,
                action = action.as_str(),
                score = total_score,
                new_sl = ?new_sl,
                "Profit protection decision"
            );
        }
        Some(ProfitProtectionDecision {
            action,
            reason,
            warnings,
            total_score,
            new_sl,
            confidence,
        })
    }

    fn warnings(
        &self,
        position: &Position,
        snapshot: &FeatureSnapshot,
        order_flow: Option<&OrderFlow>,
        now: DateTime<Utc>,
    ) -> Vec<Warning> {
        let cfg = &self.config;
        let side = position.side;
        let price = position.current_price;
        let candles = &snapshot.candles;
        let mut warnings = Vec::new();

        let structure_shift = snapshot.structure.flipped_against(side)
            || structure_invalidation_count(side, price, snapshot) >= 2
            || swing_break(side, candles);
        if structure_shift {
            warnings.push(Warning::new("structure_shift", 3, "Change of character against position"));
        }

        if let [.., previous, latest] = candles.as_slice() {
            if latest.closes_against(side) && latest.body() > cfg.engulfing_ratio * previous.body() {
                warnings.push(Warning::new(
                    "opposite_engulfing",
                    3,
                    format!("Opposite candle body {:.2} vs {:.2}", latest.body(), previous.body()),
                ));
            }
        }

        if let (Some(tp), Some(latest)) = (position.take_profit, candles.last()) {
            let to_target = side.sign() * (tp - position.entry_price);
            let progress = side.sign() * (price - position.entry_price);
            let wick = latest.rejecting_wick(side);
            if to_target > 0.0
                && progress / to_target >= cfg.tp_progress
                && wick > cfg.rejection_wick_ratio * latest.body()
            {
                warnings.push(Warning::new(
                    "liquidity_rejection",
                    2,
                    format!("{:.0}% to target with rejection wick", progress / to_target * 100.0),
                ));
            }
        }

        let rsi_stretched = snapshot.momentum.rsi.is_some_and(|rsi| match side {
            Side::Buy => rsi > cfg.rsi_overbought,
            Side::Sell => rsi < cfg.rsi_oversold,
        });
        if snapshot.structure.divergence.is_some_and(|d| d.opposes(side)) || rsi_stretched {
            warnings.push(Warning::new("momentum_divergence", 2, "Divergence or stretched RSI"));
        }

        let close = candles.last().map_or(price, |c| c.close);
        let broke = |level: Option<f64>| level.is_some_and(|l| side.sign() * (close - l) < 0.0);
        if broke(snapshot.trend.ema20) || broke(snapshot.trend.ema50) {
            warnings.push(Warning::new("sr_break", 2, format!("Close {close:.2} broke dynamic support")));
        }

        let quality_weak = snapshot
            .structure
            .momentum_quality
            .is_some_and(|q| q.is_deteriorated());
        let atr_falling = snapshot
            .volatility
            .atr_change()
            .is_some_and(|c| c < -cfg.atr_drop_pct);
        let adx_weak = snapshot.momentum.adx.is_some_and(|adx| adx < cfg.weak_adx);
        if quality_weak || atr_falling || adx_weak {
            warnings.push(Warning::new("momentum_loss", 1, "Momentum fading"));
        }

        if session_shift(now) {
            warnings.push(Warning::new("session_shift", 1, "Friday close or London close window"));
        }

        if let Some(flow) = order_flow.filter(|f| f.whale_count > 0) {
            if flow.bias.is_some_and(|b| b.opposes(side)) {
                warnings.push(Warning::new(
                    "whale_orders",
                    1,
                    format!("{} opposing whale order(s)", flow.whale_count),
                ));
            }
        }

        warnings
    }

    /// Structure stop behind the nearest recent swing, or breakeven plus a
    /// buffer; `None` when it does not improve the current stop by enough
    fn tightened_stop(&self, position: &Position, snapshot: &FeatureSnapshot) -> Option<f64> {
        let atr = snapshot.volatility.positive_atr()?;
        let side = position.side;
        let price = position.current_price;
        let offset = self.config.stop_atr_offset * atr;

        let protective = |stop: f64| side.sign() * (price - stop) > 0.0;
        let improves = |stop: f64| position.stop_loss.map_or(true, |current| side.is_tighter_stop(stop, current));

        let candles = &snapshot.candles;
        let window = &candles[candles.len().saturating_sub(10)..];
        let recent_start = window.len().saturating_sub(5);
        let swing = swing_points(side, window)
            .into_iter()
            .filter(|(i, _)| *i >= recent_start)
            .map(|(_, level)| side.protective_offset(level, offset))
            .filter(|stop| protective(*stop) && improves(*stop))
            // Nearest to price is the tightest
            .reduce(|a, b| if side.is_tighter_stop(b, a) { b } else { a });

        let candidate = swing.unwrap_or_else(|| side.protective_offset(position.entry_price, -offset));
        if !protective(candidate) {
            return None;
        }
        match position.stop_loss {
            None => Some(candidate),
            Some(current) => {
                let improvement = side.sign() * (candidate - current);
                (improvement >= self.config.min_improvement_atr * atr).then_some(candidate)
            }
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.config.cooldown()
    }
}

/// Swing lows (longs) or swing highs (shorts) as `(index, level)`
fn swing_points(side: Side, candles: &[Candle]) -> Vec<(usize, f64)> {
    let level = |c: &Candle| match side {
        Side::Buy => c.low,
        Side::Sell => c.high,
    };
    candles
        .windows(3)
        .enumerate()
        .filter_map(|(i, w)| {
            let (a, b, c) = (level(&w[0]), level(&w[1]), level(&w[2]));
            let is_pivot = side.sign() * (a - b) > 0.0 && side.sign() * (c - b) >= 0.0;
            is_pivot.then_some((i + 1, b))
        })
        .collect()
}

/// The most recent swing in the last 10 bars broke the extreme of the four
/// bars before it, against the position
fn swing_break(side: Side, candles: &[Candle]) -> bool {
    let start = candles.len().saturating_sub(10);
    let Some((index, level)) = swing_points(side, &candles[start..]).pop() else {
        return false;
    };
    let index = start + index;
    if index < 4 {
        return false;
    }
    let prior = &candles[index - 4..index];
    let extreme = match side {
        Side::Buy => prior.iter().map(|c| c.low).fold(f64::MAX, f64::min),
        Side::Sell => prior.iter().map(|c| c.high).fold(f64::MIN, f64::max),
    };
    side.sign() * (level - extreme) < 0.0
}

/// Friday from 14:00 UTC, or the 15:00-16:00 UTC London close on any day
fn session_shift(now: DateTime<Utc>) -> bool {
    let hour = now.hour();
    (now.weekday() == Weekday::Fri && hour >= 14) || hour == 15
}
