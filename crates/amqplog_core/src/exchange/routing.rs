//! Exchange routing tables.

use super::topic::topic_matches;
use crate::types::ExchangeType;
use std::collections::{BTreeMap, BTreeSet};

/// Returns whether a binding key selects a routing key under `kind`.
#[must_use]
pub fn binding_matches(kind: ExchangeType, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeType::Direct => binding_key == routing_key,
        ExchangeType::Fanout => true,
        ExchangeType::Topic => topic_matches(binding_key, routing_key),
    }
}

struct Bound<T> {
    target: T,
    keys: BTreeSet<String>,
}

/// Bindings of one exchange, grouped by queue name.
///
/// Grouping by queue is what makes routing emit each queue at most once per
/// publish, however many of its keys match.
pub(crate) struct RoutingTable<T> {
    bound: BTreeMap<String, Bound<T>>,
}

impl<T: Clone> RoutingTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            bound: BTreeMap::new(),
        }
    }

    /// Adds a binding. Returns `false` if it already existed.
    pub(crate) fn bind(&mut self, queue: &str, target: &T, key: &str) -> bool {
        self.bound
            .entry(queue.to_string())
            .or_insert_with(|| Bound {
                target: target.clone(),
                keys: BTreeSet::new(),
            })
            .keys
            .insert(key.to_string())
    }

    /// Removes a binding. Returns `false` if it did not exist.
    pub(crate) fn unbind(&mut self, queue: &str, key: &str) -> bool {
        let Some(bound) = self.bound.get_mut(queue) else {
            return false;
        };
        let removed = bound.keys.remove(key);
        if bound.keys.is_empty() {
            self.bound.remove(queue);
        }
        removed
    }

    /// Removes every binding of a queue and returns how many there were.
    pub(crate) fn remove_queue(&mut self, queue: &str) -> usize {
        self.bound.remove(queue).map_or(0, |bound| bound.keys.len())
    }

    /// Queues selected by `routing_key`, each at most once, in name order.
    pub(crate) fn route(&self, kind: ExchangeType, routing_key: &str) -> Vec<(&str, T)> {
        self.bound
            .iter()
            .filter(|(_, bound)| {
                bound
                    .keys
                    .iter()
                    .any(|key| binding_matches(kind, key, routing_key))
            })
            .map(|(name, bound)| (name.as_str(), bound.target.clone()))
            .collect()
    }

    /// Every `(queue, key)` pair.
    pub(crate) fn bindings(&self) -> Vec<(String, String)> {
        self.bound
            .iter()
            .flat_map(|(queue, bound)| bound.keys.iter().map(move |key| (queue.clone(), key.clone())))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.bound.clear();
    }
}
