// Vector clocks used for causal ordering and at-most-once dedup of events
// replicated across endpoints.
//
// A comparable type with its own merge/dominance operations, rather than a
// bare `HashMap<id, seq>` threaded through call sites by hand.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::EndpointId;

/// A per-endpoint logical clock vector. `BTreeMap` rather than `HashMap`
/// keeps iteration order deterministic, which matters for anything that
/// serializes a `VectorTime` for the wire or a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VectorTime(BTreeMap<EndpointId, u64>);

impl VectorTime {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_entry(endpoint_id: EndpointId, value: u64) -> Self {
        let mut map = BTreeMap::new();
        map.insert(endpoint_id, value);
        Self(map)
    }

    pub fn get(&self, endpoint_id: &EndpointId) -> u64 {
        self.0.get(endpoint_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, endpoint_id: EndpointId, value: u64) {
        self.0.insert(endpoint_id, value);
    }

    /// Increments the local entry and returns the new value. Used by a log
    /// when it assigns a causal timestamp to a freshly appended local event.
    pub fn increment(&mut self, endpoint_id: &EndpointId) -> u64 {
        let entry = self.0.entry(endpoint_id.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Componentwise max of `self` and `other`, merged into `self`.
    pub fn merge(&mut self, other: &VectorTime) {
        for (endpoint_id, value) in &other.0 {
            let entry = self.0.entry(endpoint_id.clone()).or_insert(0);
            if *value > *entry {
                *entry = *value;
            }
        }
    }

    pub fn merged(&self, other: &VectorTime) -> VectorTime {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// Pointwise `self <= other`: every entry of `self` is no greater than
    /// the corresponding entry of `other` (entries absent from `other`
    /// count as 0).
    pub fn is_less_or_equal(&self, other: &VectorTime) -> bool {
        self.0.iter().all(|(id, value)| *value <= other.get(id))
    }

    /// True when `self` carries strictly new information relative to
    /// `other`, i.e. `self` is NOT `<= other`. This is the dedup check of
    /// invariant I1: an event whose vector time is `<=` the log's current
    /// vector time carries nothing new and must be rejected as a duplicate
    /// (or a causal predecessor already folded in).
    pub fn dominates_or_concurrent(&self, other: &VectorTime) -> bool {
        !self.is_less_or_equal(other)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EndpointId, &u64)> {
        self.0.iter()
    }
}

/// `VectorTime` only supports `<=`/`>=` comparisons, never a total order, so
/// this deliberately implements `PartialOrd` and not `Ord`.
impl PartialOrd for VectorTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let le = self.is_less_or_equal(other);
        let ge = other.is_less_or_equal(self);
        match (le, ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EndpointId {
        EndpointId::new(s).unwrap()
    }

    #[test]
    fn merge_is_componentwise_max() {
        let mut a = VectorTime::from_entry(id("a"), 3);
        a.set(id("b"), 1);
        let mut b = VectorTime::from_entry(id("a"), 1);
        b.set(id("b"), 5);
        a.merge(&b);
        assert_eq!(a.get(&id("a")), 3);
        assert_eq!(a.get(&id("b")), 5);
    }

    #[test]
    fn dedup_rejects_known_events() {
        let known = VectorTime::from_entry(id("a"), 5);
        let dup = VectorTime::from_entry(id("a"), 3);
        assert!(!dup.dominates_or_concurrent(&known));
        let fresh = VectorTime::from_entry(id("a"), 6);
        assert!(fresh.dominates_or_concurrent(&known));
    }

    #[test]
    fn concurrent_vectors_are_unordered() {
        let mut a = VectorTime::from_entry(id("a"), 1);
        a.set(id("b"), 0);
        let mut b = VectorTime::from_entry(id("a"), 0);
        b.set(id("b"), 1);
        assert_eq!(a.partial_cmp(&b), None);
    }
}
