//! Bounded per-symbol history of regime classifications

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{Regime, RegimeClassification};
use crate::state::lock;
use crate::types::Symbol;

/// Rolling cache of the most recent classifications for each symbol
///
/// Entries older than the TTL are ignored by every read. A stable read
/// only succeeds when a qualified majority of the valid entries agree.
#[derive(Debug)]
pub struct RegimeCache {
    entries: Mutex<HashMap<Symbol, VecDeque<RegimeClassification>>>,
    capacity: usize,
    ttl: Duration,
    agreement: f64,
}

impl RegimeCache {
    pub fn new(capacity: usize, ttl: Duration, agreement: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
            agreement,
        }
    }

    pub fn push(&self, classification: RegimeClassification) {
        let mut entries = lock(&self.entries);
        let history = entries.entry(classification.symbol.clone()).or_default();
        history.push_back(classification);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    fn valid<'a>(
        &self,
        history: &'a VecDeque<RegimeClassification>,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a RegimeClassification> + 'a {
        let ttl = self.ttl;
        history.iter().filter(move |c| now - c.timestamp <= ttl)
    }

    /// Most recent non-expired classification
    pub fn latest(&self, symbol: &Symbol, now: DateTime<Utc>) -> Option<RegimeClassification> {
        let entries = lock(&self.entries);
        let history = entries.get(symbol)?;
        self.valid(history, now).last().cloned()
    }

    /// Latest classification of the agreed regime, or `None` (a miss) when
    /// the valid entries do not reach the agreement ratio
    pub fn stable(&self, symbol: &Symbol, now: DateTime<Utc>) -> Option<RegimeClassification> {
        let entries = lock(&self.entries);
        let history = entries.get(symbol)?;
        let valid: Vec<&RegimeClassification> = self.valid(history, now).collect();
        if valid.is_empty() {
            return None;
        }

        let counts = valid.iter().map(|c| c.regime).counts();
        // Ties go to the regime seen most recently
        let (regime, count) = valid
            .iter()
            .rev()
            .map(|c| (c.regime, counts[&c.regime]))
            .fold(None::<(Regime, usize)>, |best, (regime, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((regime, count)),
            })?;

        if count as f64 / valid.len() as f64 >= self.agreement {
            valid.iter().rev().find(|c| c.regime == regime).map(|c| (*c).clone())
        } else {
            None
        }
    }

    pub fn clear(&self, symbol: &Symbol) {
        lock(&self.entries).remove(symbol);
    }

    pub fn len(&self, symbol: &Symbol) -> usize {
        lock(&self.entries).get(symbol).map_or(0, VecDeque::len)
    }
}
