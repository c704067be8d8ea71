//! Decision journal and trade ownership
//!
//! Both collaborators are optional. A journal sink receives one event per
//! decision and must not block; the trade registry tells the engine which
//! tickets belong to another manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

use crate::state::lock;
use crate::types::{Symbol, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEventType {
    ExitAnalysis,
    LossCut,
    ProfitProtection,
    RegimeClassification,
}

impl DecisionEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionEventType::ExitAnalysis => "exit_analysis",
            DecisionEventType::LossCut => "loss_cut",
            DecisionEventType::ProfitProtection => "profit_protection",
            DecisionEventType::RegimeClassification => "regime_classification",
        }
    }
}

/// One journalled decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub event_type: DecisionEventType,
    pub symbol: Symbol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<Ticket>,
    pub time: DateTime<Utc>,
    /// Phase, urgency, action or regime labels, depending on the event
    pub labels: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub confidence: f64,
    pub executed: bool,
}

impl DecisionEvent {
    pub fn new(event_type: DecisionEventType, symbol: Symbol, time: DateTime<Utc>) -> Self {
        Self {
            event_type,
            symbol,
            ticket: None,
            time,
            labels: Vec::new(),
            warnings: Vec::new(),
            confidence: 0.0,
            executed: false,
        }
    }

    pub fn ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn label(mut self, key: &str, value: impl ToString) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn executed(mut self, executed: bool) -> Self {
        self.executed = executed;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Fire-and-forget decision sink
pub trait JournalSink: Send + Sync {
    fn record(&self, event: DecisionEvent);
}

/// Writes decision events as structured log records
#[derive(Debug, Default)]
pub struct TracingJournal;

impl JournalSink for TracingJournal {
    fn record(&self, event: DecisionEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(
                target: "journal",
                event_type = event.event_type.as_str(),
                symbol = %event.symbol,
                ticket = ?event.ticket,
                executed = event.executed,
                "{}",
                json
            ),
            Err(e) => info!(target: "journal", error = %e, "Unserializable decision event"),
        }
    }
}

/// Keeps events in memory; used by the replay binary and tests
#[derive(Debug, Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<DecisionEvent>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DecisionEvent> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JournalSink for MemoryJournal {
    fn record(&self, event: DecisionEvent) {
        lock(&self.events).push(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeState {
    /// Manager responsible for this ticket, if any
    pub managed_by: Option<String>,
}

impl TradeState {
    /// Unclaimed tickets and tickets already ours are fair game
    pub fn is_managed_elsewhere(&self, manager_id: &str) -> bool {
        self.managed_by
            .as_deref()
            .is_some_and(|owner| !owner.is_empty() && owner != manager_id)
    }
}

pub trait TradeRegistry: Send + Sync {
    fn get_trade_state(&self, ticket: Ticket) -> Option<TradeState>;
}
