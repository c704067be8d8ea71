//! Per-tick orchestration
//!
//! The engine is the long-lived owner of every piece of shared state:
//! regime cache, alert clock, tighten cooldowns and the closing set. It is
//! `Sync`, so evaluations for different symbols may run on separate tasks
//! against one `Arc<DecisionEngine<_>>`.
//!
//! Per open position the profit protector runs first. Only when it declines
//! (no decision, or monitor-only) do exit analysis and the loss ladder run.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::executor::{ExecutionGateway, ExecutionOutcome, PositionActionExecutor};
use crate::exit::{ExitAnalysis, ExitPhase, ExitSignalDetector};
use crate::journal::{DecisionEvent, DecisionEventType, JournalSink, TradeRegistry};
use crate::loss_cut::{LossCutDecision, LossCutter};
use crate::profit::{ProfitAction, ProfitProtectionDecision, ProfitProtector};
use crate::regime::{RegimeClassification, RegimeDetector};
use crate::router::{StrategyName, StrategyRouter};
use crate::snapshot::FeatureSnapshot;
use crate::state::TicketClock;
use crate::types::{Position, SessionVolatility, Ticket};

/// What the engine wants done with a position this tick
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Hold,
    Close { reason: String },
    ModifyStop { new_sl: f64, reason: String },
}

/// Why a position was not evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ManagedElsewhere,
    Closing,
}

/// Everything decided for one position on one tick
#[derive(Debug, Clone)]
pub struct PositionEvaluation {
    pub ticket: Ticket,
    pub r_multiple: Option<f64>,
    pub skipped: Option<SkipReason>,
    pub profit: Option<ProfitProtectionDecision>,
    pub analysis: Option<ExitAnalysis>,
    pub loss_cut: Option<LossCutDecision>,
    /// Alert text, present only when the alert throttle allowed it
    pub alert: Option<String>,
}

impl PositionEvaluation {
    fn skipped(ticket: Ticket, reason: SkipReason) -> Self {
        Self {
            ticket,
            r_multiple: None,
            skipped: Some(reason),
            profit: None,
            analysis: None,
            loss_cut: None,
            alert: None,
        }
    }

    pub fn planned_action(&self) -> PlannedAction {
        if let Some(profit) = self.profit.as_ref().filter(|p| p.is_actionable()) {
            return match (profit.action, profit.new_sl) {
                (ProfitAction::Exit, _) => PlannedAction::Close {
                    reason: "profit_exit".to_string(),
                },
                (ProfitAction::Tighten, Some(new_sl)) => PlannedAction::ModifyStop {
                    new_sl,
                    reason: "profit_tighten".to_string(),
                },
                _ => PlannedAction::Hold,
            };
        }
        match &self.loss_cut {
            Some(cut) if cut.should_cut => PlannedAction::Close {
                reason: cut.reason.clone(),
            },
            Some(LossCutDecision {
                new_sl: Some(new_sl),
                reason,
                ..
            }) => PlannedAction::ModifyStop {
                new_sl: *new_sl,
                reason: reason.clone(),
            },
            _ => PlannedAction::Hold,
        }
    }
}

pub struct DecisionEngine<G: ExecutionGateway + ?Sized> {
    config: EngineConfig,
    regime: RegimeDetector,
    router: StrategyRouter,
    exit_detector: ExitSignalDetector,
    loss_cutter: LossCutter,
    profit: ProfitProtector,
    executor: PositionActionExecutor<G>,
    last_alert: TicketClock,
    journal: Option<Arc<dyn JournalSink>>,
    registry: Option<Arc<dyn TradeRegistry>>,
}

impl<G: ExecutionGateway + ?Sized> DecisionEngine<G> {
    /// Invalid configuration values fall back to their defaults here, so
    /// configs built in code get the same treatment as `from_file`.
    pub fn new(config: EngineConfig, gateway: Arc<G>) -> Self {
        let config = config.sanitized();
        Self {
            regime: RegimeDetector::new(config.regime.clone()),
            router: StrategyRouter::new(&config.regime, config.router.clone()),
            exit_detector: ExitSignalDetector::new(config.exit_signals.clone()),
            loss_cutter: LossCutter::new(config.loss_cut.clone()),
            profit: ProfitProtector::new(config.profit.clone()),
            executor: PositionActionExecutor::new(config.executor.clone(), gateway),
            last_alert: TicketClock::new(),
            journal: None,
            registry: None,
            config,
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn JournalSink>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn TradeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn regime_detector(&self) -> &RegimeDetector {
        &self.regime
    }

    pub fn executor(&self) -> &PositionActionExecutor<G> {
        &self.executor
    }

    pub fn last_alert_time(&self, ticket: Ticket) -> Option<DateTime<Utc>> {
        self.last_alert.last(ticket)
    }

    pub fn last_tighten_time(&self, ticket: Ticket) -> Option<DateTime<Utc>> {
        self.profit.last_tighten(ticket)
    }

    /// Classify an idle symbol and pick the strategy for it
    pub fn evaluate_symbol(&self, snapshot: &FeatureSnapshot) -> (RegimeClassification, StrategyName) {
        let classification = self.regime.detect_regime(snapshot);
        let strategy = self.router.select_strategy(snapshot, &classification);
        self.emit(
            DecisionEvent::new(
                DecisionEventType::RegimeClassification,
                snapshot.symbol.clone(),
                snapshot.time,
            )
            .label("regime", classification.regime)
            .label("strategy", strategy)
            .confidence(classification.confidence / 100.0),
        );
        (classification, strategy)
    }

    /// Decide what to do with `position`; no orders are sent
    pub fn evaluate_position(
        &self,
        position: &Position,
        snapshot: &FeatureSnapshot,
        session: SessionVolatility,
    ) -> PositionEvaluation {
        let now = snapshot.time;
        let ticket = position.ticket;

        if self.is_managed_elsewhere(ticket) {
            debug!(ticket, "Ticket managed by another manager, skipping");
            return PositionEvaluation::skipped(ticket, SkipReason::ManagedElsewhere);
        }
        if self.executor.closing().contains(ticket) {
            return PositionEvaluation::skipped(ticket, SkipReason::Closing);
        }

        let r_multiple = position.r_multiple();
        let order_flow = snapshot.order_flow.as_ref();

        let profit = r_multiple.and_then(|r| {
            self.profit
                .analyze_profit_protection(position, snapshot, order_flow, r, now)
        });
        if profit.as_ref().is_some_and(|p| p.is_actionable()) {
            return PositionEvaluation {
                ticket,
                r_multiple,
                skipped: None,
                profit,
                analysis: None,
                loss_cut: None,
                alert: None,
            };
        }

        let mut analysis =
            self.exit_detector
                .analyze(position.side, position.entry_price, position.current_price, snapshot);
        let loss_cut = self
            .loss_cutter
            .should_cut_loss(position, snapshot, &mut analysis, session, order_flow, now);

        let alert = (analysis.phase != ExitPhase::None
            && self
                .last_alert
                .try_stamp(ticket, now, self.config.engine.alert_cooldown()))
        .then(|| analysis.alert_message(&position.symbol, ticket));
        if let Some(text) = &alert {
            info!(ticket, symbol = %position.symbol, phase = %analysis.phase, "{}", text);
        }

        PositionEvaluation {
            ticket,
            r_multiple,
            skipped: None,
            profit,
            analysis: Some(analysis),
            loss_cut: Some(loss_cut),
            alert,
        }
    }

    /// Evaluate `position`, act on the decision and journal it
    pub async fn manage_position(
        &self,
        position: &Position,
        snapshot: &FeatureSnapshot,
        session: SessionVolatility,
    ) -> (PositionEvaluation, Option<ExecutionOutcome>) {
        let evaluation = self.evaluate_position(position, snapshot, session);
        if evaluation.skipped.is_some() {
            return (evaluation, None);
        }

        let outcome = match evaluation.planned_action() {
            PlannedAction::Hold => None,
            PlannedAction::Close { reason } => Some(self.executor.close(position, &reason).await),
            PlannedAction::ModifyStop { new_sl, .. } => {
                Some(self.executor.modify_stop_loss(position, new_sl).await)
            }
        };

        match &outcome {
            Some(ExecutionOutcome::Closed { .. }) => self.on_position_closed(position.ticket),
            Some(ExecutionOutcome::Failed { error, .. }) => {
                warn!(ticket = position.ticket, error = %error, "Action failed, will re-evaluate next tick")
            }
            _ => {}
        }

        let executed = outcome.as_ref().is_some_and(ExecutionOutcome::executed);
        self.journal_evaluation(position, snapshot, &evaluation, executed);
        (evaluation, outcome)
    }

    /// Drop per-ticket state once a position is gone
    pub fn on_position_closed(&self, ticket: Ticket) {
        self.last_alert.forget(ticket);
        self.profit.forget(ticket);
        debug!(ticket, "Per-ticket state cleared");
    }

    fn is_managed_elsewhere(&self, ticket: Ticket) -> bool {
        self.registry
            .as_ref()
            .and_then(|registry| registry.get_trade_state(ticket))
            .is_some_and(|state| state.is_managed_elsewhere(&self.config.engine.manager_id))
    }

    fn journal_evaluation(
        &self,
        position: &Position,
        snapshot: &FeatureSnapshot,
        evaluation: &PositionEvaluation,
        executed: bool,
    ) {
        if self.journal.is_none() {
            return;
        }
        let event = |event_type| {
            DecisionEvent::new(event_type, position.symbol.clone(), snapshot.time).ticket(position.ticket)
        };

        if let Some(profit) = &evaluation.profit {
            self.emit(
                event(DecisionEventType::ProfitProtection)
                    .label("action", profit.action.as_str())
                    .warnings(profit.warning_names().into_iter().map(String::from).collect())
                    .confidence(profit.confidence)
                    .executed(executed && profit.is_actionable()),
            );
        }
        if let Some(analysis) = evaluation.analysis.as_ref().filter(|a| a.phase != ExitPhase::None) {
            self.emit(
                event(DecisionEventType::ExitAnalysis)
                    .label("phase", analysis.phase)
                    .label("urgency", analysis.urgency)
                    .label("action", analysis.action)
                    .warnings(analysis.signal_names().into_iter().map(String::from).collect())
                    .confidence(analysis.confidence),
            );
        }
        if let Some(cut) = evaluation.loss_cut.as_ref().filter(|c| c.is_actionable()) {
            self.emit(
                event(DecisionEventType::LossCut)
                    .label("reason", &cut.reason)
                    .label("should_cut", cut.should_cut)
                    .confidence(cut.confidence)
                    .executed(executed),
            );
        }
    }

    fn emit(&self, event: DecisionEvent) {
        if let Some(journal) = &self.journal {
            journal.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CloseRequest, GatewayResponse};
    use crate::journal::{MemoryJournal, TradeState};
    use crate::types::{Side, Symbol, Tick};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingGateway {
        closes: AtomicUsize,
        modifies: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionGateway for CountingGateway {
        async fn get_tick(&self, _symbol: &crate::types::Symbol) -> Option<Tick> {
            Some(Tick {
                bid: 99.0,
                ask: 99.1,
                time: Utc::now(),
            })
        }

        async fn close_position(&self, _request: &CloseRequest) -> GatewayResponse {
            self.closes.fetch_add(1, Ordering::SeqCst);
            GatewayResponse::ok("closed")
        }

        async fn modify_stop_loss(&self, _ticket: Ticket, _new_sl: f64) -> GatewayResponse {
            self.modifies.fetch_add(1, Ordering::SeqCst);
            GatewayResponse::ok("modified")
        }
    }

    struct ForeignRegistry;

    impl TradeRegistry for ForeignRegistry {
        fn get_trade_state(&self, _ticket: Ticket) -> Option<TradeState> {
            Some(TradeState {
                managed_by: Some("someone_else".to_string()),
            })
        }
    }

    fn losing_position() -> Position {
        Position {
            ticket: 5,
            symbol: Symbol::new("XAUUSD"),
            side: Side::Buy,
            volume: 0.1,
            entry_price: 100.0,
            current_price: 99.0,
            stop_loss: Some(98.0),
            initial_stop_loss: Some(98.0),
            take_profit: None,
            opened_at: Utc::now(),
        }
    }

    /// Bearish readings: RSI 35 and ADX 10 give a risk score of 0.75+
    fn bearish_snapshot() -> FeatureSnapshot {
        let mut snap = FeatureSnapshot::new(Symbol::new("XAUUSD"), Utc::now(), 99.0);
        snap.momentum.rsi = Some(35.0);
        snap.momentum.adx = Some(10.0);
        snap
    }

    #[tokio::test]
    async fn test_early_r_cut_closes_once_and_journals() {
        let gateway = Arc::new(CountingGateway::default());
        let journal = Arc::new(MemoryJournal::new());
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::clone(&gateway))
            .with_journal(journal.clone());

        let (evaluation, outcome) = engine
            .manage_position(&losing_position(), &bearish_snapshot(), SessionVolatility::Medium)
            .await;

        assert_eq!(
            evaluation.planned_action(),
            PlannedAction::Close {
                reason: "early_r".to_string()
            }
        );
        assert!(matches!(outcome, Some(ExecutionOutcome::Closed { .. })));
        assert_eq!(gateway.closes.load(Ordering::SeqCst), 1);

        let events = journal.events();
        let cut = events
            .iter()
            .find(|e| e.event_type == DecisionEventType::LossCut)
            .expect("loss cut journalled");
        assert_eq!(cut.get("reason"), Some("early_r"));
        assert!(cut.executed);
    }

    #[tokio::test]
    async fn test_foreign_tickets_are_skipped() {
        let gateway = Arc::new(CountingGateway::default());
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::clone(&gateway))
            .with_registry(Arc::new(ForeignRegistry));

        let (evaluation, outcome) = engine
            .manage_position(&losing_position(), &bearish_snapshot(), SessionVolatility::Medium)
            .await;
        assert_eq!(evaluation.skipped, Some(SkipReason::ManagedElsewhere));
        assert!(outcome.is_none());
        assert_eq!(gateway.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mid_close_ticket_is_skipped() {
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::new(CountingGateway::default()));
        let _claim = engine.executor().closing().try_claim(5);
        let evaluation = engine.evaluate_position(&losing_position(), &bearish_snapshot(), SessionVolatility::Medium);
        assert_eq!(evaluation.skipped, Some(SkipReason::Closing));
        assert_eq!(evaluation.planned_action(), PlannedAction::Hold);
    }

    #[test]
    fn test_alerts_are_throttled_per_ticket() {
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::new(CountingGateway::default()));
        let mut snap = bearish_snapshot();
        // EMA20 and SAR above price: two breakdown signals
        snap.trend.ema20 = Some(100.5);
        snap.trend.sar = Some(101.0);
        let position = losing_position();

        let first = engine.evaluate_position(&position, &snap, SessionVolatility::Medium);
        assert!(first.alert.is_some());
        assert!(engine.last_alert_time(5).is_some());

        snap.time = snap.time + chrono::Duration::seconds(60);
        let second = engine.evaluate_position(&position, &snap, SessionVolatility::Medium);
        assert!(second.alert.is_none());

        snap.time = snap.time + chrono::Duration::seconds(300);
        let third = engine.evaluate_position(&position, &snap, SessionVolatility::Medium);
        assert!(third.alert.is_some());

        engine.on_position_closed(5);
        assert!(engine.last_alert_time(5).is_none());
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"regime":{"vwap_min_candles":0},"executor":{"backoff_ms":[]}}"#).unwrap();
        let engine = DecisionEngine::new(config, Arc::new(CountingGateway::default()));
        assert_eq!(engine.config().regime.vwap_min_candles, 10);
        assert!(!engine.config().executor.backoff_ms.is_empty());

        let mut snap = FeatureSnapshot::new(Symbol::new("XAUUSD"), Utc::now(), 2010.0);
        snap.trend.vwap = Some(2000.0);
        snap.trend.vwap_std = Some(4.0);
        let (classification, _) = engine.evaluate_symbol(&snap);
        assert!(!classification.results.vwap_reversion.detected);
        assert_eq!(
            classification.results.vwap_reversion.reason.as_deref(),
            Some("insufficient candles")
        );
    }

    #[test]
    fn test_profit_protection_silent_for_losers() {
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::new(CountingGateway::default()));
        let evaluation = engine.evaluate_position(&losing_position(), &bearish_snapshot(), SessionVolatility::Medium);
        assert!(evaluation.profit.is_none());
        assert!(evaluation.analysis.is_some());
    }
}
