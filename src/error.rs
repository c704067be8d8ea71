//! Engine error types
//!
//! Missing indicator data is not an error: signals return `Option` and
//! simply do not fire. These variants cover the action path, where a
//! failure has to be reported back to the caller.

use thiserror::Error;

use crate::types::{Symbol, Ticket};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no valid tick for {0}")]
    NoTick(Symbol),

    #[error("tick for {symbol} is {age_secs}s old, market likely closed")]
    StaleMarket { symbol: Symbol, age_secs: i64 },

    #[error("gateway rejected action on ticket {ticket}: {message}")]
    Gateway { ticket: Ticket, message: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
