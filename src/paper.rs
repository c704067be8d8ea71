//! Paper execution gateway
//!
//! Fills every close and stop change immediately and only logs it. Quotes
//! are fed in by the caller; each quote is stamped with the wall clock on
//! arrival so replayed history is never treated as a stale market.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::info;

use crate::executor::{CloseRequest, ExecutionGateway, GatewayResponse};
use crate::state::lock;
use crate::types::{Symbol, Tick, Ticket};

#[derive(Debug, Default)]
pub struct PaperGateway {
    quotes: Mutex<HashMap<Symbol, Tick>>,
    closed: Mutex<HashSet<Ticket>>,
    stops: Mutex<HashMap<Ticket, f64>>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a quote for `symbol`
    pub fn set_quote(&self, symbol: &Symbol, bid: f64, ask: f64) {
        let tick = Tick {
            bid,
            ask,
            time: Utc::now(),
        };
        lock(&self.quotes).insert(symbol.clone(), tick);
    }

    pub fn is_closed(&self, ticket: Ticket) -> bool {
        lock(&self.closed).contains(&ticket)
    }

    pub fn closed_count(&self) -> usize {
        lock(&self.closed).len()
    }

    /// Last stop set through this gateway
    pub fn stop_loss(&self, ticket: Ticket) -> Option<f64> {
        lock(&self.stops).get(&ticket).copied()
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn get_tick(&self, symbol: &Symbol) -> Option<Tick> {
        lock(&self.quotes).get(symbol).copied()
    }

    async fn close_position(&self, request: &CloseRequest) -> GatewayResponse {
        if !lock(&self.closed).insert(request.ticket) {
            return GatewayResponse::rejected(format!("ticket {} already closed", request.ticket));
        }
        info!(
            ticket = request.ticket,
            symbol = %request.symbol,
            volume = request.volume,
            deviation = request.deviation,
            comment = %request.comment,
            "[PAPER] Position closed"
        );
        GatewayResponse::ok("paper fill")
    }

    async fn modify_stop_loss(&self, ticket: Ticket, new_sl: f64) -> GatewayResponse {
        if self.is_closed(ticket) {
            return GatewayResponse::rejected(format!("ticket {ticket} is closed"));
        }
        lock(&self.stops).insert(ticket, new_sl);
        info!(ticket, new_sl, "[PAPER] Stop loss modified");
        GatewayResponse::ok("paper modify")
    }
}
