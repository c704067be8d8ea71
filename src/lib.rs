//! Regime/Exit Decision Engine
//!
//! Decision core for an automated trading bot: classifies the market
//! regime of an instrument, routes it to a strategy, and re-evaluates open
//! positions for exhaustion or reversal, deciding whether to tighten,
//! protect or close them.
//!
//! Decision functions are synchronous and I/O-free. Only the position
//! action executor awaits, on the execution gateway and its backoff sleeps.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod exit;
pub mod indicators;
pub mod journal;
pub mod loss_cut;
pub mod paper;
pub mod profit;
pub mod regime;
pub mod router;
pub mod snapshot;
pub mod state;
pub mod types;

pub use config::EngineConfig;
pub use engine::{DecisionEngine, PlannedAction, PositionEvaluation};
pub use error::{EngineError, EngineResult};
pub use executor::{ExecutionGateway, ExecutionOutcome, PositionActionExecutor};
pub use exit::{ExitAnalysis, ExitPhase, ExitSignalDetector, Urgency};
pub use loss_cut::{LossCutDecision, LossCutUrgency, LossCutter};
pub use profit::{ProfitAction, ProfitProtectionDecision, ProfitProtector};
pub use regime::{Regime, RegimeClassification, RegimeDetector};
pub use router::{StrategyName, StrategyRouter};
pub use snapshot::FeatureSnapshot;
pub use types::*;
