//! Client clock - per-origin monotonic transaction counters
//!
//! The kernel accepts a transaction only when its index is exactly one past
//! the origin's counter, which gives ordering and deduplication per origin.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ClientId;

/// Map origin → last applied index
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientClock {
    clocks: BTreeMap<ClientId, u64>,
}

impl ClientClock {
    pub fn new() -> Self {
        ClientClock::default()
    }

    /// Last applied index for an origin (0 if never seen)
    #[inline]
    pub fn get(&self, origin: ClientId) -> u64 {
        self.clocks.get(&origin).copied().unwrap_or(0)
    }

    /// Advance an origin by one, returning the new value
    pub fn tick(&mut self, origin: ClientId) -> u64 {
        let c = self.clocks.entry(origin).or_insert(0);
        *c += 1;
        *c
    }

    pub fn set(&mut self, origin: ClientId, value: u64) {
        self.clocks.insert(origin, value);
    }

    /// Index the kernel will accept next from this origin
    #[inline]
    pub fn next_index(&self, origin: ClientId) -> u64 {
        self.get(origin) + 1
    }

    /// Is `index` the next expected one for `origin`?
    #[inline]
    pub fn expects(&self, origin: ClientId, index: u64) -> bool {
        index == self.next_index(origin)
    }

    /// Element-wise max
    pub fn merge(&self, other: &ClientClock) -> ClientClock {
        let mut merged = self.clocks.clone();
        for (origin, &clock) in &other.clocks {
            merged
                .entry(*origin)
                .and_modify(|c| *c = (*c).max(clock))
                .or_insert(clock);
        }
        ClientClock { clocks: merged }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.clocks.iter().map(|(&o, &c)| (o, c))
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}
