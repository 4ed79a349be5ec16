// Contract for the external event-log collaborator. The log engine itself,
// durable storage, sequence number assignment, physical deletion, lives
// outside this crate; only the shape of the operations the replication core
// drives against it is specified here.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LogError;
use crate::filters::{Filter, FilterableEvent};
use crate::model::LogId;
use crate::vector_time::VectorTime;

/// An opaque, causally-timestamped event as the core sees it: carries at
/// least a vector timestamp and an emitter/origin identity, nothing more.
/// Concrete log implementations attach whatever payload representation
/// they like behind this trait object. A supertrait of `FilterableEvent` so
/// `&dyn DurableEvent` coerces directly to `&dyn FilterableEvent` wherever a
/// `Filter` needs to inspect one, with no separate downcast step.
pub trait DurableEvent: FilterableEvent + Send + Sync + fmt::Debug {
    fn vector_timestamp(&self) -> &VectorTime;
    fn emitter_id(&self) -> &str;
}

pub type LogHandle = Arc<dyn EventLog>;

/// Operations a `Replicator`, `Acceptor`, or `RecoveryCoordinator` drives
/// against a local log. Every method corresponds to one of the local log
/// commands the replication core needs.
#[async_trait]
pub trait EventLog: Send + Sync + fmt::Debug {
    fn log_name(&self) -> &str;

    /// Current aggregate vector time of the log.
    async fn vector_time(&self) -> VectorTime;

    /// Current local sequence number; always `>= vector_time[self]`.
    async fn sequence_nr(&self) -> u64;

    /// `GetReplicationProgress(source_log_id)`: last remote sequence number
    /// from `source_log_id` whose events have been durably written here.
    async fn get_replication_progress(&self, source_log_id: LogId) -> Result<u64, LogError>;

    /// `ReplicationWrite(events, progress, source_log_id, source_vt,
    /// continue_flag)`. The log performs the causal dedup check itself
    /// (reject any event whose vector time is `<=` the log's vector
    /// time at apply time) and merges survivors' vector times in. Returns
    /// the stored progress and the log's vector time after the write.
    #[allow(clippy::too_many_arguments)]
    async fn replication_write(
        &self,
        events: Vec<Arc<dyn DurableEvent>>,
        progress: u64,
        source_log_id: LogId,
        source_vt: VectorTime,
        continue_flag: bool,
    ) -> Result<ReplicationWriteOutcome, LogError>;

    /// `ReplicationRead` applied server-side by the acceptor: returns up to
    /// `max_events` events with sequence number `>= from_seq`, scanning at
    /// most `scan_limit` source-side slots, restricted to events the
    /// `filter` accepts.
    async fn replication_read(
        &self,
        from_seq: u64,
        max_events: usize,
        scan_limit: usize,
        filter: Arc<dyn Filter>,
        target_vt: &VectorTime,
    ) -> Result<ReplicationReadOutcome, LogError>;

    /// Logical delete up to `to_sequence_nr` scoped to `remote_log_ids`;
    /// returns the effective deletion watermark.
    async fn delete(&self, to_sequence_nr: u64, remote_log_ids: Vec<LogId>) -> Result<u64, LogError>;

    /// `adjust_event_log_clocks` step of recovery: raises the
    /// log's sequence number to at least `vector_time[self]` if it has
    /// fallen behind. A no-op when the log is already consistent (Open
    /// Question (a): documented as a no-op, never a rollback).
    async fn adjust_clock(&self) -> Result<(), LogError>;

    /// Recovery step 2: resets this log's stored progress for `source_log_id`
    /// back to zero, so a subsequent `recover_links` pass re-pulls
    /// everything the remote has rather than trusting a watermark that may
    /// have raced ahead of what was actually durably applied before loss.
    async fn reset_replication_progress(&self, source_log_id: LogId) -> Result<(), LogError>;

    /// Recovery step 3/4 tail: invalidates any local snapshot whose covered
    /// vector time is not `<=` the log's current vector time (it may
    /// reference events that were lost and have since been re-pulled under
    /// different positions). Returns the number invalidated.
    async fn invalidate_stale_snapshots(&self) -> Result<usize, LogError>;
}

#[derive(Debug, Clone)]
pub struct ReplicationWriteOutcome {
    pub stored_progress: u64,
    pub target_vt: VectorTime,
    /// Whether the source should be re-read immediately: `continue =
    /// new_progress >= from_seq` propagated from the read that produced
    /// these events.
    pub continue_reading: bool,
}

#[derive(Debug, Clone)]
pub struct ReplicationReadOutcome {
    pub events: Vec<Arc<dyn DurableEvent>>,
    pub from_seq: u64,
    /// `min(last_scanned_seq, source_head)`.
    pub new_progress: u64,
    pub source_vt: VectorTime,
}
