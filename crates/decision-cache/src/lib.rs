//! Working set of enforced decisions.
//!
//! Turns authority delta batches into the minimal list of enforcement
//! events:
//! - a decision id already enforced is never added twice
//! - removing an id that was never added is a no-op
//! - an id removed less than `retention` ago is not re-added

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::debug;

use bouncer_core::{Action, Decision, DecisionId, DeltaBatch, EnforcementEvent};

#[derive(Debug)]
pub struct DecisionCache {
    working_set: HashMap<DecisionId, Decision>,
    /// Removal time of recently lifted decisions
    recently_removed: HashMap<DecisionId, Instant>,
    retention: Duration,
}

impl DecisionCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            working_set: HashMap::new(),
            recently_removed: HashMap::new(),
            retention,
        }
    }

    /// Applies one batch and returns the events to enforce: removals first,
    /// then adds, each in authority order. An id listed on both sides of the
    /// same batch ends up not enforced.
    pub fn apply(&mut self, batch: DeltaBatch, now: Instant) -> Vec<EnforcementEvent> {
        self.expire(now);
        let mut events = Vec::with_capacity(batch.to_add.len() + batch.to_remove.len());
        let removed_now: HashSet<DecisionId> =
            batch.to_remove.iter().map(|decision| decision.id).collect();

        for decision in batch.to_remove {
            let Some(enforced) = self.working_set.remove(&decision.id) else {
                continue;
            };
            // the authority's copy carries the up-to-date duration
            events.push(EnforcementEvent::new(Action::Del, &decision));
            debug!("lifted decision {} for '{}'", enforced.id, enforced.value);
            self.recently_removed.insert(decision.id, now);
        }

        for decision in batch.to_add {
            if removed_now.contains(&decision.id) {
                debug!("decision {} for '{}' is deleted in the same batch", decision.id, decision.value);
                continue;
            }
            if self.working_set.contains_key(&decision.id) {
                debug!("decision {} for '{}' already enforced", decision.id, decision.value);
                continue;
            }
            if self.recently_removed.contains_key(&decision.id) {
                debug!("decision {} for '{}' was removed recently, not re-adding", decision.id, decision.value);
                continue;
            }
            events.push(EnforcementEvent::new(Action::Add, &decision));
            self.working_set.insert(decision.id, decision);
        }

        events
    }

    pub fn contains(&self, id: DecisionId) -> bool {
        self.working_set.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.working_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working_set.is_empty()
    }

    pub fn decisions(&self) -> impl Iterator<Item = &Decision> {
        self.working_set.values()
    }

    fn expire(&mut self, now: Instant) {
        let retention = self.retention;
        let before = self.recently_removed.len();
        self.recently_removed
            .retain(|_, removed_at| now.saturating_duration_since(*removed_at) < retention);
        let cleared = before - self.recently_removed.len();
        if cleared != 0 {
            debug!("resetting cache, clearing {cleared} decisions");
        }
    }
}
