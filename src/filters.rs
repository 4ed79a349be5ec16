// Endpoint filter composition algebra.
//
// The application-defined predicates themselves are out of scope; only the
// algebra that combines a target-log filter and a source-log filter into
// the filter actually shipped with a `ReplicationRead` is specified here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::model::LogId;

#[derive(Error, Debug, Clone)]
pub enum FilterError {
    #[error("no filter registered for target log {0}")]
    NoFilterForTarget(LogId),
}

/// An event, as seen by a `Filter`. The core treats `DurableEvent` as opaque,
/// so filters only get the vector time and emitter in the general case, plus
/// an application payload they downcast via `Any` when the predicate is
/// payload-aware. Kept intentionally minimal: this crate never inspects
/// payloads itself. `DurableEvent` is a supertrait of this one, so any
/// `&dyn DurableEvent` coerces straight to `&dyn FilterableEvent`.
pub trait FilterableEvent {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// `filter_for(target_log_id, source_log_name) -> Filter` plus the algebra
/// used to build filters out of two single-sided predicates.
pub trait Filter: Send + Sync + fmt::Debug {
    fn matches(&self, event: &dyn FilterableEvent) -> bool;

    /// True for the identity filter. Lets `ReplicationConnection::is_filtered`
    /// distinguish "no filter configured" from "a filter that happens to be
    /// an `and` of two no-ops" without relying on `Any` downcasting at every
    /// call site.
    fn is_no_filter(&self) -> bool {
        false
    }
}

/// Identity filter: matches everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFilter;

impl Filter for NoFilter {
    fn matches(&self, _event: &dyn FilterableEvent) -> bool {
        true
    }

    fn is_no_filter(&self) -> bool {
        true
    }
}

/// Conjunction of two filters.
#[derive(Debug, Clone)]
pub struct And {
    pub left: Arc<dyn Filter>,
    pub right: Arc<dyn Filter>,
}

impl Filter for And {
    fn matches(&self, event: &dyn FilterableEvent) -> bool {
        self.left.matches(event) && self.right.matches(event)
    }
}

pub fn and(a: Arc<dyn Filter>, b: Arc<dyn Filter>) -> Arc<dyn Filter> {
    Arc::new(And { left: a, right: b })
}

/// `leftIdentity` combinator: target overrides source, ignoring the source
/// side entirely.
#[derive(Debug, Clone)]
pub struct LeftIdentity {
    pub left: Arc<dyn Filter>,
}

impl Filter for LeftIdentity {
    fn matches(&self, event: &dyn FilterableEvent) -> bool {
        self.left.matches(event)
    }
}

fn no_filter() -> Arc<dyn Filter> {
    Arc::new(NoFilter)
}

/// Closure-backed filter: the composition algebra only cares about
/// application-defined predicates, not how a predicate itself is authored,
/// so a named `Filter` impl isn't the only way to build one.
pub struct FilterFn<F>(F)
where
    F: Fn(&dyn FilterableEvent) -> bool + Send + Sync;

impl<F> fmt::Debug for FilterFn<F>
where
    F: Fn(&dyn FilterableEvent) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterFn").finish_non_exhaustive()
    }
}

impl<F> Filter for FilterFn<F>
where
    F: Fn(&dyn FilterableEvent) -> bool + Send + Sync,
{
    fn matches(&self, event: &dyn FilterableEvent) -> bool {
        (self.0)(event)
    }
}

/// Builds an ad hoc `Filter` out of a closure, for callers that don't want to
/// name a type just to compose one predicate into the algebra above.
pub fn from_fn<F>(predicate: F) -> Arc<dyn Filter>
where
    F: Fn(&dyn FilterableEvent) -> bool + Send + Sync + 'static,
{
    Arc::new(FilterFn(predicate))
}

/// `target_and_source(tf, sf)`: `and`-combine when both present, else the
/// present one, else `NoFilter`.
pub fn target_and_source(tf: Option<Arc<dyn Filter>>, sf: Option<Arc<dyn Filter>>) -> Arc<dyn Filter> {
    match (tf, sf) {
        (Some(t), Some(s)) => and(t, s),
        (Some(t), None) => t,
        (None, Some(s)) => s,
        (None, None) => no_filter(),
    }
}

/// `target_overwrites_source(tf, sf)`: `tf` if present, else `sf`, else
/// `NoFilter`.
pub fn target_overwrites_source(tf: Option<Arc<dyn Filter>>, sf: Option<Arc<dyn Filter>>) -> Arc<dyn Filter> {
    tf.or(sf).unwrap_or_else(no_filter)
}

/// `source_filters(sf)`: single-sided lookup, `NoFilter` default.
pub fn source_filters(sf: Option<Arc<dyn Filter>>) -> Arc<dyn Filter> {
    sf.unwrap_or_else(no_filter)
}

/// `target_filters(tf)`: single-sided lookup, `NoFilter` default.
pub fn target_filters(tf: Option<Arc<dyn Filter>>) -> Arc<dyn Filter> {
    tf.unwrap_or_else(no_filter)
}

/// Resolves the filter actually applied to a given `(target_log_id,
/// source_log_name)` pair. `EndpointFilters` owns the per-(target, source)
/// table (populated from `ReplicationConnection::per_log_filters` plus any
/// local target-side filters the endpoint itself configures) and a
/// combination strategy.
pub trait EndpointFilters: Send + Sync {
    fn filter_for(&self, target_log_id: LogId, source_log_name: &str) -> Arc<dyn Filter>;
}

/// Combination strategy, selected once per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinationStrategy {
    TargetAndSource,
    TargetOverwritesSource,
    SourceOnly,
    TargetOnly,
    NoFilters,
}

/// Standard `EndpointFilters` built from two lookup tables plus a
/// combination strategy, covering all five standard constructors above.
pub struct TableEndpointFilters {
    strategy: CombinationStrategy,
    target_filters: HashMap<LogId, Arc<dyn Filter>>,
    source_filters: HashMap<String, Arc<dyn Filter>>,
}

impl TableEndpointFilters {
    pub fn new(strategy: CombinationStrategy) -> Self {
        Self {
            strategy,
            target_filters: HashMap::new(),
            source_filters: HashMap::new(),
        }
    }

    pub fn with_target_filter(mut self, target_log_id: LogId, filter: Arc<dyn Filter>) -> Self {
        self.target_filters.insert(target_log_id, filter);
        self
    }

    pub fn with_source_filter(mut self, source_log_name: impl Into<String>, filter: Arc<dyn Filter>) -> Self {
        self.source_filters.insert(source_log_name.into(), filter);
        self
    }
}

impl EndpointFilters for TableEndpointFilters {
    fn filter_for(&self, target_log_id: LogId, source_log_name: &str) -> Arc<dyn Filter> {
        let tf = self.target_filters.get(&target_log_id).cloned();
        let sf = self.source_filters.get(source_log_name).cloned();
        match self.strategy {
            CombinationStrategy::TargetAndSource => target_and_source(tf, sf),
            CombinationStrategy::TargetOverwritesSource => target_overwrites_source(tf, sf),
            CombinationStrategy::SourceOnly => source_filters(sf),
            CombinationStrategy::TargetOnly => target_filters(tf),
            CombinationStrategy::NoFilters => no_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Tagged(bool);
    impl Filter for Tagged {
        fn matches(&self, _event: &dyn FilterableEvent) -> bool {
            self.0
        }
    }

    struct Probe;
    impl FilterableEvent for Probe {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn f(pass: bool) -> Arc<dyn Filter> {
        Arc::new(Tagged(pass))
    }

    #[test]
    fn target_and_source_combines_with_and() {
        let combined = target_and_source(Some(f(true)), Some(f(false)));
        assert!(!combined.matches(&Probe));
        let combined = target_and_source(Some(f(true)), Some(f(true)));
        assert!(combined.matches(&Probe));
    }

    #[test]
    fn target_overwrites_source_prefers_target() {
        let combined = target_overwrites_source(Some(f(true)), Some(f(false)));
        assert!(combined.matches(&Probe));
    }

    #[test]
    fn source_filters_falls_back_to_no_filter() {
        let combined = source_filters(None);
        assert!(combined.is_no_filter());
        assert!(combined.matches(&Probe));
    }

    #[test]
    fn from_fn_builds_a_filter_from_a_closure() {
        let evens = from_fn(|_event| true);
        assert!(evens.matches(&Probe));
        let rejects = from_fn(|_event| false);
        assert!(!rejects.matches(&Probe));
    }

    #[test]
    fn table_filters_resolve_by_strategy() {
        let log_id = LogId::of(
            &crate::model::EndpointId::new("a").unwrap(),
            &crate::model::LogName::new("L").unwrap(),
        );
        let table = TableEndpointFilters::new(CombinationStrategy::TargetAndSource)
            .with_target_filter(log_id, f(true))
            .with_source_filter("L", f(false));
        assert!(!table.filter_for(log_id, "L").matches(&Probe));
    }
}
