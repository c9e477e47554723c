//! Vector clocks
//!
//! A vector clock gives a partial causal order over operations without any
//! central sequencer. Only the owning actor ever increments its own entry;
//! entries never decrease; an actor missing from the map reads as zero.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ActorId;

/// Causal relation between two clocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClockOrdering {
    /// Left happens-before right
    Before,
    /// Right happens-before left
    After,
    /// Neither happens-before the other
    Concurrent,
    /// Identical counters for every actor
    Equal,
}

/// Version vector for causal ordering (not total ordering)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<ActorId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        VectorClock {
            clocks: BTreeMap::new(),
        }
    }

    /// Get the counter for an actor
    #[inline]
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.clocks.get(actor).copied().unwrap_or(0)
    }

    /// Increment the counter for an actor in place, returning the new value
    pub fn increment(&mut self, actor: &ActorId) -> u64 {
        let counter = self.clocks.entry(actor.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Copy of this clock with the actor's counter advanced by one
    pub fn incremented(&self, actor: &ActorId) -> VectorClock {
        let mut next = self.clone();
        next.increment(actor);
        next
    }

    /// Raise an actor's counter to at least `value`
    pub fn observe(&mut self, actor: &ActorId, value: u64) {
        if value == 0 {
            return;
        }
        let counter = self.clocks.entry(actor.clone()).or_insert(0);
        *counter = (*counter).max(value);
    }

    /// Set the counter for an actor
    pub fn set(&mut self, actor: ActorId, value: u64) {
        self.clocks.insert(actor, value);
    }

    /// Merge two clocks (element-wise max)
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// Merge another clock into this one
    pub fn merge_from(&mut self, other: &VectorClock) {
        for (actor, &counter) in &other.clocks {
            self.clocks
                .entry(actor.clone())
                .and_modify(|c| *c = (*c).max(counter))
                .or_insert(counter);
        }
    }

    /// Compare two clocks
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for actor in self.clocks.keys().chain(other.clocks.keys()) {
            match self.get(actor).cmp(&other.get(actor)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Check if self happens-before other
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Check if two clocks are concurrent (neither happens-before)
    pub fn concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Whether `self` has seen every event `other` has (after or equal)
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .clocks
            .iter()
            .all(|(actor, &counter)| self.get(actor) >= counter)
    }

    /// Sum of all counters.
    ///
    /// Strictly increases along happens-before, so sorting by it yields a
    /// linear extension of the causal order.
    pub fn total(&self) -> u64 {
        self.clocks.values().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.clocks.iter().map(|(a, &c)| (a, c))
    }
}

impl FromIterator<(ActorId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Self {
        VectorClock {
            clocks: iter.into_iter().collect(),
        }
    }
}
