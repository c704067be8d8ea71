//! Shared per-ticket state owned by the long-lived engine
//!
//! Evaluations for different symbols may run concurrently, so every map
//! here sits behind a mutex and exposes check-and-update operations that
//! complete inside a single critical section.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::Ticket;

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Last-event timestamps per ticket (alerts, tighten decisions)
#[derive(Debug, Default)]
pub struct TicketClock {
    stamps: Mutex<HashMap<Ticket, DateTime<Utc>>>,
}

impl TicketClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self, ticket: Ticket) -> Option<DateTime<Utc>> {
        lock(&self.stamps).get(&ticket).copied()
    }

    /// Whether `ticket` had an event less than `window` before `now`
    pub fn is_within(&self, ticket: Ticket, now: DateTime<Utc>, window: Duration) -> bool {
        lock(&self.stamps)
            .get(&ticket)
            .is_some_and(|last| now - *last < window)
    }

    pub fn stamp(&self, ticket: Ticket, now: DateTime<Utc>) {
        lock(&self.stamps).insert(ticket, now);
    }

    /// Stamp `ticket` unless it already has an event inside `window`.
    /// Returns true when the stamp was taken.
    pub fn try_stamp(&self, ticket: Ticket, now: DateTime<Utc>, window: Duration) -> bool {
        let mut stamps = lock(&self.stamps);
        match stamps.get(&ticket) {
            Some(last) if now - *last < window => false,
            _ => {
                stamps.insert(ticket, now);
                true
            }
        }
    }

    pub fn forget(&self, ticket: Ticket) {
        lock(&self.stamps).remove(&ticket);
    }

    pub fn len(&self) -> usize {
        lock(&self.stamps).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tickets with a close order in flight
#[derive(Debug, Clone, Default)]
pub struct ClosingTickets {
    inner: Arc<Mutex<HashSet<Ticket>>>,
}

impl ClosingTickets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `ticket` for closing. `None` if another task already holds it.
    /// The claim is released when the returned guard drops.
    pub fn try_claim(&self, ticket: Ticket) -> Option<ClosingGuard> {
        if lock(&self.inner).insert(ticket) {
            Some(ClosingGuard {
                ticket,
                inner: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, ticket: Ticket) -> bool {
        lock(&self.inner).contains(&ticket)
    }

    pub fn release(&self, ticket: Ticket) {
        lock(&self.inner).remove(&ticket);
    }
}

/// Releases a closing claim on drop, including when the close future is cancelled
#[derive(Debug)]
pub struct ClosingGuard {
    ticket: Ticket,
    inner: Arc<Mutex<HashSet<Ticket>>>,
}

impl ClosingGuard {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

impl Drop for ClosingGuard {
    fn drop(&mut self) {
        lock(&self.inner).remove(&self.ticket);
    }
}
