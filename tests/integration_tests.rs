//! Integration tests for the regime-exit-engine
//!
//! These tests drive the public API the way the bot does: snapshot in,
//! decisions and gateway calls out.

use approx::assert_relative_eq;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use regime_exit_engine::config::{EngineConfig, ExecutorConfig};
use regime_exit_engine::engine::{DecisionEngine, PlannedAction};
use regime_exit_engine::executor::{
    CloseRequest, ExecutionGateway, ExecutionOutcome, GatewayResponse, PositionActionExecutor,
};
use regime_exit_engine::exit::{ExitAction, ExitPhase, ExitSignalDetector, Urgency};
use regime_exit_engine::loss_cut::{simulate, spread_atr_gate, LossCutUrgency, LossCutter};
use regime_exit_engine::paper::PaperGateway;
use regime_exit_engine::profit::{ProfitAction, ProfitProtector};
use regime_exit_engine::regime::{
    DetectionResult, DetectionResults, Regime, RegimeClassification, RegimeDetector,
};
use regime_exit_engine::snapshot::{Bias, FeatureSnapshot};
use regime_exit_engine::{Candle, Position, SessionVolatility, Side, Symbol, Tick, Ticket};

// =============================================================================
// Test Utilities
// =============================================================================

/// A Wednesday morning, clear of the session-shift windows
fn wednesday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap()
}

fn snapshot(symbol: &str, price: f64) -> FeatureSnapshot {
    FeatureSnapshot::new(Symbol::new(symbol), wednesday(), price)
}

fn long_position(ticket: Ticket, entry: f64, current: f64, initial_stop: f64) -> Position {
    Position {
        ticket,
        symbol: Symbol::new("XAUUSD"),
        side: Side::Buy,
        volume: 0.1,
        entry_price: entry,
        current_price: current,
        stop_loss: Some(initial_stop),
        initial_stop_loss: Some(initial_stop),
        take_profit: None,
        opened_at: wednesday() - Duration::minutes(10),
    }
}

/// Sideways M1 bars with a mild oscillation
fn oscillating_candles(count: usize, base: f64) -> Vec<Candle> {
    let start = wednesday() - Duration::minutes(count as i64);
    (0..count)
        .map(|i| {
            let mid = base + (i as f64 * 0.7).sin() * 2.0;
            Candle::new_unchecked(
                start + Duration::minutes(i as i64),
                mid - 0.2,
                mid + 0.8,
                mid - 0.9,
                mid + 0.3,
                100.0 + (i % 5) as f64 * 20.0,
            )
        })
        .collect()
}

fn classification(regime: Regime, confidence: f64) -> RegimeClassification {
    RegimeClassification {
        symbol: Symbol::new("XAUUSD"),
        regime,
        confidence,
        threshold: 55.0,
        results: DetectionResults::empty(),
        reason: "prior".to_string(),
        timestamp: wednesday(),
    }
}

fn results_with(regime: Regime, confidence: f64, previous: Regime, previous_confidence: f64) -> DetectionResults {
    let result = |r: Regime| {
        let mut out = DetectionResult::new(r, 55.0);
        if r == regime {
            out.add(confidence, "candidate");
        } else if r == previous {
            out.add(previous_confidence, "incumbent");
        }
        out.finish()
    };
    DetectionResults {
        vwap_reversion: result(Regime::VwapReversion),
        range_scalp: result(Regime::RangeScalp),
        balanced_zone: result(Regime::BalancedZone),
    }
}

/// Gateway whose closes take a while, so concurrent callers overlap
#[derive(Default)]
struct SlowGateway {
    closes: AtomicUsize,
}

#[async_trait]
impl ExecutionGateway for SlowGateway {
    async fn get_tick(&self, _symbol: &Symbol) -> Option<Tick> {
        Some(Tick {
            bid: 100.0,
            ask: 100.2,
            time: Utc::now(),
        })
    }

    async fn close_position(&self, _request: &CloseRequest) -> GatewayResponse {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.closes.fetch_add(1, Ordering::SeqCst);
        GatewayResponse::ok("filled")
    }

    async fn modify_stop_loss(&self, _ticket: Ticket, _new_sl: f64) -> GatewayResponse {
        GatewayResponse::ok("modified")
    }
}

// =============================================================================
// Regime detection
// =============================================================================

#[test]
fn test_regime_confidences_stay_in_range() {
    let detector = RegimeDetector::new(EngineConfig::default().regime);
    for base in [50.0, 2000.0, 40_000.0] {
        let mut snap = snapshot("XAUUSD", base);
        snap.candles = oscillating_candles(60, base);
        snap.candles_m5 = oscillating_candles(30, base);
        snap.candles_m15 = oscillating_candles(20, base);
        snap.volatility.atr = Some(1.0);
        snap.volatility.atr_prev = Some(1.05);
        snap.volatility.bb_upper = Some(base * 1.002);
        snap.volatility.bb_middle = Some(base);
        snap.volatility.bb_lower = Some(base * 0.998);
        snap.trend.vwap = Some(base - 5.0);
        snap.trend.vwap_std = Some(1.0);
        snap.trend.vwap_slope = Some(0.0);

        let results = detector.evaluate(&snap);
        for result in results.iter() {
            assert!((0.0..=100.0).contains(&result.confidence), "{result:?}");
        }
    }
}

#[test]
fn test_detection_is_idempotent_with_empty_cache() {
    let detector = RegimeDetector::new(EngineConfig::default().regime);
    let mut snap = snapshot("EURUSD", 1.1);
    snap.candles = oscillating_candles(40, 1.1);
    snap.volatility.atr = Some(0.001);

    let first = detector.detect_regime(&snap);
    detector.clear(&snap.symbol);
    let second = detector.detect_regime(&snap);
    assert_eq!(first.regime, second.regime);
    assert_relative_eq!(first.confidence, second.confidence);
    assert_eq!(first.reason, second.reason);
}

#[test]
fn test_hysteresis_keeps_incumbent_against_small_lead() {
    let detector = RegimeDetector::new(EngineConfig::default().regime);
    let symbol = Symbol::new("XAUUSD");
    let prior = classification(Regime::RangeScalp, 80.0);

    let results = results_with(Regime::BalancedZone, 90.0, Regime::RangeScalp, 75.0);
    let kept = detector.resolve(&symbol, results, Some(&prior), wednesday());
    assert_eq!(kept.regime, Regime::RangeScalp);

    let results = results_with(Regime::BalancedZone, 96.0, Regime::RangeScalp, 75.0);
    let replaced = detector.resolve(&symbol, results, Some(&prior), wednesday());
    assert_eq!(replaced.regime, Regime::BalancedZone);
    assert_relative_eq!(replaced.confidence, 96.0);
}

// =============================================================================
// Exit analysis
// =============================================================================

#[test]
fn test_breakdown_scenario_for_long() {
    let detector = ExitSignalDetector::new(EngineConfig::default().exit_signals);
    let mut snap = snapshot("XAUUSD", 3865.0);
    snap.trend.ema20 = Some(3870.0);
    snap.trend.sar = Some(3875.0);
    snap.momentum.adx = Some(40.0);
    snap.momentum.adx_prev = Some(45.0);

    let analysis = detector.analyze(Side::Buy, 3850.0, 3865.0, &snap);
    assert_eq!(analysis.phase, ExitPhase::Breakdown);
    assert!(matches!(analysis.urgency, Urgency::High | Urgency::Critical));
    assert!(matches!(
        analysis.action,
        ExitAction::TrailVeryTight | ExitAction::ExitFull
    ));
    assert!((0.0..=1.0).contains(&analysis.confidence));
    assert!(analysis.signal_names().contains(&"sar_flip"));
}

#[test]
fn test_breakdown_outranks_exhaustion() {
    let detector = ExitSignalDetector::new(EngineConfig::default().exit_signals);
    let mut snap = snapshot("XAUUSD", 100.0);
    // Two exhaustion signals
    snap.volatility.atr = Some(0.6);
    snap.volatility.atr_prev = Some(1.0);
    snap.trend.vwap_slope = Some(0.0);
    // One breakdown signal
    snap.trend.ema20 = Some(100.4);

    let analysis = detector.analyze(Side::Buy, 99.0, 100.0, &snap);
    assert_eq!(analysis.exhaustion_count, 2);
    assert_eq!(analysis.breakdown_count, 1);
    assert_eq!(analysis.phase, ExitPhase::Breakdown);
}

// =============================================================================
// Loss cutting
// =============================================================================

#[test]
fn test_early_r_wins_over_r_ladder() {
    let config = EngineConfig::default();
    let detector = ExitSignalDetector::new(config.exit_signals.clone());
    let cutter = LossCutter::new(config.loss_cut.clone());

    // r = -0.6 satisfies both the early exit and the ladder
    let position = long_position(11, 100.0, 98.8, 98.0);
    let mut snap = snapshot("XAUUSD", 98.8);
    snap.momentum.rsi = Some(30.0);
    snap.momentum.adx = Some(10.0);
    snap.volatility.atr = Some(1.0);

    let mut analysis = detector.analyze(position.side, position.entry_price, position.current_price, &snap);
    let decision = cutter.should_cut_loss(
        &position,
        &snap,
        &mut analysis,
        SessionVolatility::Medium,
        None,
        wednesday(),
    );
    assert!(decision.should_cut);
    assert_eq!(decision.urgency, LossCutUrgency::Immediate);
    assert_eq!(decision.reason, "early_r");
    assert!((0.0..=1.0).contains(&decision.confidence));
}

#[test]
fn test_risk_simulation_is_symmetric() {
    let sim = simulate(100.0, 99.0, 101.0, 0.2);
    assert_relative_eq!(sim.p_hit_sl, 0.5, epsilon = 1e-9);
    assert_relative_eq!(sim.p_hit_tp, 0.5, epsilon = 1e-9);
    assert_relative_eq!(sim.expected_r, 0.0, epsilon = 1e-9);

    for degenerate in [
        simulate(100.0, 100.0, 101.0, 0.2),
        simulate(100.0, 99.0, 100.0, 0.2),
        simulate(100.0, 99.0, 101.0, 0.0),
        simulate(100.0, 99.0, 101.0, -1.0),
    ] {
        assert_eq!(degenerate.p_hit_sl, 0.0);
        assert_eq!(degenerate.p_hit_tp, 0.0);
        assert_eq!(degenerate.expected_r, 0.0);
    }
}

#[test]
fn test_spread_gate_fails_open() {
    assert!(!spread_atr_gate(Some(0.5), Some(1.0), 0.25));
    assert!(spread_atr_gate(Some(0.2), Some(1.0), 0.25));
    assert!(spread_atr_gate(None, Some(1.0), 0.25));
    assert!(spread_atr_gate(Some(0.5), None, 0.25));
}

// =============================================================================
// Profit protection
// =============================================================================

#[test]
fn test_profit_protector_silent_when_not_winning() {
    let protector = ProfitProtector::new(EngineConfig::default().profit);
    let position = long_position(21, 100.0, 99.0, 98.0);
    let mut snap = snapshot("XAUUSD", 99.0);
    snap.momentum.rsi = Some(95.0);
    snap.trend.ema20 = Some(110.0);
    snap.structure.divergence = Some(Bias::Bearish);
    for r in [0.0, -0.2, -3.0] {
        assert!(protector
            .analyze_profit_protection(&position, &snap, None, r, wednesday())
            .is_none());
    }
}

/// Divergence (2) and an EMA50 break (2) at 1.4R
fn tighten_setup(stop: f64) -> (Position, FeatureSnapshot) {
    let mut position = long_position(31, 100.0, 102.8, 98.0);
    position.stop_loss = Some(stop);
    let mut snap = snapshot("XAUUSD", 102.8);
    snap.structure.divergence = Some(Bias::Bearish);
    snap.trend.ema50 = Some(103.0);
    snap.volatility.atr = Some(1.0);
    (position, snap)
}

#[test]
fn test_tighten_moves_stop_toward_price() {
    let protector = ProfitProtector::new(EngineConfig::default().profit);
    let (position, snap) = tighten_setup(99.0);
    assert_relative_eq!(position.r_multiple().unwrap(), 1.4, epsilon = 1e-9);

    let decision = protector
        .analyze_profit_protection(&position, &snap, None, 1.4, wednesday())
        .expect("tighten decision");
    assert_eq!(decision.action, ProfitAction::Tighten);
    assert_eq!(decision.total_score, 4);
    let new_sl = decision.new_sl.expect("new stop");
    assert!(new_sl > 99.0);
    assert!(new_sl < position.current_price);
    assert_relative_eq!(new_sl, 100.5, epsilon = 1e-9);
}

#[test]
fn test_tighten_suppressed_for_small_improvement() {
    let protector = ProfitProtector::new(EngineConfig::default().profit);
    // Breakeven + 0.5 ATR is only 0.2 above this stop
    let (position, snap) = tighten_setup(100.3);
    assert!(protector
        .analyze_profit_protection(&position, &snap, None, 1.4, wednesday())
        .is_none());
}

// =============================================================================
// Execution
// =============================================================================

#[tokio::test]
async fn test_concurrent_closes_execute_once() {
    let gateway = Arc::new(SlowGateway::default());
    let executor = PositionActionExecutor::new(ExecutorConfig::default(), Arc::clone(&gateway));
    let position = long_position(41, 100.0, 99.0, 98.0);

    let (a, b) = tokio::join!(
        executor.close(&position, "early_r"),
        executor.close(&position, "early_r")
    );
    let closed = [&a, &b]
        .iter()
        .filter(|o| matches!(o, ExecutionOutcome::Closed { .. }))
        .count();
    let skipped = [&a, &b]
        .iter()
        .filter(|o| matches!(o, ExecutionOutcome::AlreadyClosing))
        .count();
    assert_eq!(closed, 1);
    assert_eq!(skipped, 1);
    assert_eq!(gateway.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_engine_tightens_winner_through_paper_gateway() {
    let gateway = Arc::new(PaperGateway::new());
    let engine = DecisionEngine::new(EngineConfig::default(), Arc::clone(&gateway));
    let (position, snap) = tighten_setup(99.0);

    let (evaluation, outcome) = engine
        .manage_position(&position, &snap, SessionVolatility::Medium)
        .await;
    assert!(matches!(
        evaluation.planned_action(),
        PlannedAction::ModifyStop { .. }
    ));
    // Profit protection acted, so the loss ladder never ran
    assert!(evaluation.analysis.is_none());
    assert!(matches!(outcome, Some(ExecutionOutcome::Modified { .. })));
    assert_relative_eq!(gateway.stop_loss(31).unwrap(), 100.5, epsilon = 1e-9);
    assert!(engine.last_tighten_time(31).is_some());

    // Cooldown: the next tick is left to the loss ladder
    let again = engine.evaluate_position(&position, &snap, SessionVolatility::Medium);
    assert!(again.profit.is_none());
    assert!(again.analysis.is_some());
}
