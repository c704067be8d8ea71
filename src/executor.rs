//! Position action executor
//!
//! Turns close and stop-modification decisions into gateway calls. Each
//! action runs as an explicit retry state machine:
//!
//! ```text
//! Attempting -> Succeeded
//!            -> Backoff -> Retrying -> Succeeded
//!                                   -> Backoff ...
//!                                   -> Failed
//! ```
//!
//! The only suspension point is the backoff sleep, so dropping the future
//! cancels cleanly; the closing claim is released by its guard either way.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{ExecutorConfig, FillMode};
use crate::error::{EngineError, EngineResult};
use crate::state::ClosingTickets;
use crate::types::{Position, Symbol, Ticket, Tick};

/// Close order as sent to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub volume: f64,
    /// Allowed slippage in points
    pub deviation: u32,
    pub fill_mode: FillMode,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub success: bool,
    pub message: String,
}

impl GatewayResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Broker-side execution, implemented outside the engine
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn get_tick(&self, symbol: &Symbol) -> Option<Tick>;

    async fn close_position(&self, request: &CloseRequest) -> GatewayResponse;

    async fn modify_stop_loss(&self, ticket: Ticket, new_sl: f64) -> GatewayResponse;
}

/// Retry state for one action
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Retrying { attempt: u32 },
    Succeeded { attempts: u32, message: String },
    Failed { attempts: u32, last_message: String },
}

impl RetryState {
    pub fn start() -> Self {
        RetryState::Attempting { attempt: 0 }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded { .. } | RetryState::Failed { .. })
    }

    /// Transition after the gateway answered attempt `attempt` (0-based)
    pub fn after_response(attempt: u32, response: GatewayResponse, config: &ExecutorConfig) -> Self {
        let attempts = attempt + 1;
        if response.success {
            RetryState::Succeeded {
                attempts,
                message: response.message,
            }
        } else if attempts < config.max_retries {
            RetryState::Backoff {
                attempt,
                delay: config.backoff(attempt),
            }
        } else {
            RetryState::Failed {
                attempts,
                last_message: response.message,
            }
        }
    }
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Closed { attempts: u32, message: String },
    Modified { attempts: u32, message: String },
    /// Another task is already closing this ticket
    AlreadyClosing,
    /// Market unavailable; re-evaluated next tick
    Deferred(EngineError),
    /// Every attempt was rejected
    Failed { attempts: u32, error: EngineError },
}

impl ExecutionOutcome {
    pub fn executed(&self) -> bool {
        matches!(self, ExecutionOutcome::Closed { .. } | ExecutionOutcome::Modified { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Closed { .. } => "closed",
            ExecutionOutcome::Modified { .. } => "modified",
            ExecutionOutcome::AlreadyClosing => "already_closing",
            ExecutionOutcome::Deferred(_) => "deferred",
            ExecutionOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action<'a> {
    Close { reason: &'a str },
    ModifyStop { new_sl: f64 },
}

pub struct PositionActionExecutor<G: ExecutionGateway + ?Sized> {
    config: ExecutorConfig,
    gateway: Arc<G>,
    closing: ClosingTickets,
}

impl<G: ExecutionGateway + ?Sized> PositionActionExecutor<G> {
    pub fn new(mut config: ExecutorConfig, gateway: Arc<G>) -> Self {
        config.sanitize();
        Self {
            config,
            gateway,
            closing: ClosingTickets::new(),
        }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn closing(&self) -> &ClosingTickets {
        &self.closing
    }

    /// Close `position`, unless it is already being closed or its market is
    /// unavailable
    pub async fn close(&self, position: &Position, reason: &str) -> ExecutionOutcome {
        let Some(_claim) = self.closing.try_claim(position.ticket) else {
            debug!(ticket = position.ticket, "Close already in flight, skipping");
            return ExecutionOutcome::AlreadyClosing;
        };

        if let Err(e) = self.check_market(&position.symbol).await {
            info!(ticket = position.ticket, error = %e, "Close deferred");
            return ExecutionOutcome::Deferred(e);
        }

        match self.run(position, Action::Close { reason }).await {
            RetryState::Succeeded { attempts, message } => {
                info!(
                    ticket = position.ticket,
                    symbol = %position.symbol,
                    attempts,
                    reason,
                    "Position closed"
                );
                ExecutionOutcome::Closed { attempts, message }
            }
            state => self.failed(position.ticket, state),
        }
    }

    /// Move the stop of `position` to `new_sl`
    pub async fn modify_stop_loss(&self, position: &Position, new_sl: f64) -> ExecutionOutcome {
        if self.closing.contains(position.ticket) {
            return ExecutionOutcome::AlreadyClosing;
        }
        match self.run(position, Action::ModifyStop { new_sl }).await {
            RetryState::Succeeded { attempts, message } => {
                info!(ticket = position.ticket, new_sl, attempts, "Stop loss modified");
                ExecutionOutcome::Modified { attempts, message }
            }
            state => self.failed(position.ticket, state),
        }
    }

    fn failed(&self, ticket: Ticket, state: RetryState) -> ExecutionOutcome {
        let (attempts, message) = match state {
            RetryState::Failed {
                attempts,
                last_message,
            } => (attempts, last_message),
            other => (0, format!("retry loop ended in {other:?}")),
        };
        warn!(ticket, attempts, message = %message, "Position action failed");
        ExecutionOutcome::Failed {
            attempts,
            error: EngineError::Gateway { ticket, message },
        }
    }

    /// A valid, fresh tick is required before closing
    async fn check_market(&self, symbol: &Symbol) -> EngineResult<Tick> {
        let tick = self
            .gateway
            .get_tick(symbol)
            .await
            .filter(Tick::is_valid)
            .ok_or_else(|| EngineError::NoTick(symbol.clone()))?;
        let age = tick.age(Utc::now());
        if age > self.config.max_tick_age() {
            return Err(EngineError::StaleMarket {
                symbol: symbol.clone(),
                age_secs: age.num_seconds(),
            });
        }
        Ok(tick)
    }

    async fn run(&self, position: &Position, action: Action<'_>) -> RetryState {
        let mut state = RetryState::start();
        loop {
            state = match state {
                RetryState::Attempting { attempt } | RetryState::Retrying { attempt } => {
                    let response = self.attempt(position, action, attempt).await;
                    if !response.success {
                        warn!(
                            ticket = position.ticket,
                            attempt = attempt + 1,
                            max = self.config.max_retries,
                            message = %response.message,
                            "Gateway rejected action"
                        );
                    }
                    RetryState::after_response(attempt, response, &self.config)
                }
                RetryState::Backoff { attempt, delay } => {
                    debug!(ticket = position.ticket, delay_ms = delay.as_millis() as u64, "Backing off");
                    sleep(delay).await;
                    RetryState::Retrying { attempt: attempt + 1 }
                }
                done => return done,
            };
        }
    }

    async fn attempt(&self, position: &Position, action: Action<'_>, attempt: u32) -> GatewayResponse {
        match action {
            Action::Close { reason } => {
                let request = CloseRequest {
                    ticket: position.ticket,
                    symbol: position.symbol.clone(),
                    volume: position.volume,
                    deviation: self.config.deviation(attempt),
                    fill_mode: self.config.fill_mode,
                    comment: format!("{}:{}", self.config.comment, reason),
                };
                self.gateway.close_position(&request).await
            }
            Action::ModifyStop { new_sl } => self.gateway.modify_stop_loss(position.ticket, new_sl).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use std::sync::Mutex;

    struct ScriptedGateway {
        tick: Option<Tick>,
        responses: Mutex<Vec<bool>>,
        requests: Mutex<Vec<CloseRequest>>,
    }

    impl ScriptedGateway {
        fn new(tick: Option<Tick>, responses: Vec<bool>) -> Self {
            Self {
                tick,
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExecutionGateway for ScriptedGateway {
        async fn get_tick(&self, _symbol: &Symbol) -> Option<Tick> {
            self.tick
        }

        async fn close_position(&self, request: &CloseRequest) -> GatewayResponse {
            self.requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if !responses.is_empty() && responses.remove(0) {
                GatewayResponse::ok("done")
            } else {
                GatewayResponse::rejected("requote")
            }
        }

        async fn modify_stop_loss(&self, _ticket: Ticket, _new_sl: f64) -> GatewayResponse {
            GatewayResponse::ok("modified")
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            backoff_ms: vec![1, 2],
            ..Default::default()
        }
    }

    fn fresh_tick() -> Tick {
        Tick {
            bid: 99.9,
            ask: 100.1,
            time: Utc::now(),
        }
    }

    fn position() -> Position {
        Position {
            ticket: 77,
            symbol: Symbol::new("XAUUSD"),
            side: Side::Buy,
            volume: 0.5,
            entry_price: 100.0,
            current_price: 99.0,
            stop_loss: Some(98.0),
            initial_stop_loss: Some(98.0),
            take_profit: None,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_transitions() {
        let config = ExecutorConfig::default();
        let next = RetryState::after_response(0, GatewayResponse::rejected("busy"), &config);
        assert_eq!(
            next,
            RetryState::Backoff {
                attempt: 0,
                delay: Duration::from_millis(500)
            }
        );
        let last = RetryState::after_response(2, GatewayResponse::rejected("busy"), &config);
        assert_eq!(
            last,
            RetryState::Failed {
                attempts: 3,
                last_message: "busy".to_string()
            }
        );
        assert!(last.is_terminal());
        let ok = RetryState::after_response(1, GatewayResponse::ok("filled"), &config);
        assert!(matches!(ok, RetryState::Succeeded { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_retries_with_escalating_deviation() {
        let gateway = Arc::new(ScriptedGateway::new(Some(fresh_tick()), vec![false, false, true]));
        let executor = PositionActionExecutor::new(fast_config(), Arc::clone(&gateway));

        let outcome = executor.close(&position(), "early_r").await;
        assert!(matches!(outcome, ExecutionOutcome::Closed { attempts: 3, .. }));

        let requests = gateway.requests.lock().unwrap();
        let deviations: Vec<u32> = requests.iter().map(|r| r.deviation).collect();
        assert_eq!(deviations, vec![20, 30, 40]);
        assert_eq!(requests[0].fill_mode, FillMode::Ioc);
        assert_eq!(requests[0].comment, "regime_exit:early_r");
        assert!(!executor.closing().contains(77));
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_message() {
        let gateway = Arc::new(ScriptedGateway::new(Some(fresh_tick()), vec![]));
        let executor = PositionActionExecutor::new(fast_config(), Arc::clone(&gateway));

        match executor.close(&position(), "wick_exit").await {
            ExecutionOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 3);
                assert!(error.to_string().contains("requote"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(gateway.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_tick_defers_without_calling_close() {
        let stale = Tick {
            time: Utc::now() - chrono::Duration::minutes(11),
            ..fresh_tick()
        };
        let gateway = Arc::new(ScriptedGateway::new(Some(stale), vec![true]));
        let executor = PositionActionExecutor::new(fast_config(), Arc::clone(&gateway));

        let outcome = executor.close(&position(), "early_r").await;
        assert!(matches!(outcome, ExecutionOutcome::Deferred(EngineError::StaleMarket { .. })));
        assert!(gateway.requests.lock().unwrap().is_empty());
        assert!(!executor.closing().contains(77));
    }

    #[tokio::test]
    async fn test_zero_quote_defers() {
        let dead = Tick {
            bid: 0.0,
            ask: 0.0,
            time: Utc::now(),
        };
        let gateway = Arc::new(ScriptedGateway::new(Some(dead), vec![true]));
        let executor = PositionActionExecutor::new(fast_config(), gateway);
        let outcome = executor.close(&position(), "early_r").await;
        assert!(matches!(outcome, ExecutionOutcome::Deferred(EngineError::NoTick(_))));
    }

    #[tokio::test]
    async fn test_modify_skipped_while_closing() {
        let gateway = Arc::new(ScriptedGateway::new(Some(fresh_tick()), vec![]));
        let executor = PositionActionExecutor::new(fast_config(), gateway);
        let claim = executor.closing().try_claim(77);
        assert!(claim.is_some());
        let outcome = executor.modify_stop_loss(&position(), 99.5).await;
        assert!(matches!(outcome, ExecutionOutcome::AlreadyClosing));
        drop(claim);
        let outcome = executor.modify_stop_loss(&position(), 99.5).await;
        assert!(outcome.executed());
    }
}
