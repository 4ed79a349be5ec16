// In-process test doubles satisfying the `EventLog` and `Transport`
// collaborator contracts, both external concerns (a log engine, a
// wire transport) this crate never implements itself. Exercised only by
// this crate's own tests; a real deployment swaps in a durable log store
// and a networked transport.
//
// Hand-written struct + `#[async_trait]` impl per collaborator trait, no
// mocking framework, generalised from stateless mocks into small stateful
// in-memory stores since the replication state machine has real invariants
// (progress, vector time, dedup) to exercise.

#![cfg(test)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::error::{LogError, TransportError};
use crate::filters::{Filter, FilterableEvent};
use crate::log::{DurableEvent, EventLog, ReplicationReadOutcome, ReplicationWriteOutcome};
use crate::model::{EndpointId, LogId, PeerAddress};
use crate::transport::Transport;
use crate::vector_time::VectorTime;
use crate::wire::{
    GetReplicationEndpointInfoSuccess, ReplicationReadEnvelope, ReplicationReadError,
    ReplicationReadSuccess, SynchronizeReplicationProgress, SynchronizeReplicationProgressSuccess,
};

#[derive(Debug)]
pub struct TestEvent {
    pub vector_timestamp: VectorTime,
    pub emitter_id: String,
}

impl DurableEvent for TestEvent {
    fn vector_timestamp(&self) -> &VectorTime {
        &self.vector_timestamp
    }

    fn emitter_id(&self) -> &str {
        &self.emitter_id
    }
}

impl FilterableEvent for TestEvent {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    sequence_nr: u64,
    vector_time: VectorTime,
    events: BTreeMap<u64, Arc<dyn DurableEvent>>,
    progress: HashMap<LogId, u64>,
    snapshots: Vec<VectorTime>,
    deletion_watermark: u64,
}

/// A minimal durable log: own append-ordered event store (the numbering a
/// remote replicator reads by) plus a per-source progress table (the
/// numbering this log tracks when it is itself a replication target).
#[derive(Debug)]
pub struct InMemoryLog {
    name: String,
    self_endpoint_id: EndpointId,
    inner: Mutex<Inner>,
}

impl InMemoryLog {
    pub fn new(name: impl Into<String>, self_endpoint_id: EndpointId) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            self_endpoint_id,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Seeds `count` locally-authored events, each incrementing
    /// `vector_time[self_endpoint_id]` by one, as a stand-in for events an
    /// application would have appended directly to this log.
    pub fn seed_local_events(&self, count: u64) {
        let mut inner = self.inner.lock();
        for _ in 0..count {
            let seq = inner.vector_time.increment(&self.self_endpoint_id);
            inner.sequence_nr = inner.sequence_nr.max(seq);
            let event: Arc<dyn DurableEvent> = Arc::new(TestEvent {
                vector_timestamp: inner.vector_time.clone(),
                emitter_id: self.self_endpoint_id.as_str().to_string(),
            });
            inner.events.insert(seq, event);
        }
    }

    pub fn head(&self) -> u64 {
        self.inner.lock().sequence_nr
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Simulates a storage restore that lost every event with sequence
    /// number greater than `keep_up_to`, and any snapshot covering one of
    /// them, without touching `progress`, used to simulate recovery from
    /// partial loss.
    pub fn truncate_to(&self, keep_up_to: u64) {
        let mut inner = self.inner.lock();
        inner.events.retain(|seq, _| *seq <= keep_up_to);
        inner.sequence_nr = keep_up_to;
        let mut vt = VectorTime::new();
        for event in inner.events.values() {
            vt.merge(event.vector_timestamp());
        }
        inner.vector_time = vt;
    }

    pub fn record_snapshot(&self, covers: VectorTime) {
        self.inner.lock().snapshots.push(covers);
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }
}

#[async_trait]
impl EventLog for InMemoryLog {
    fn log_name(&self) -> &str {
        &self.name
    }

    async fn vector_time(&self) -> VectorTime {
        self.inner.lock().vector_time.clone()
    }

    async fn sequence_nr(&self) -> u64 {
        self.inner.lock().sequence_nr
    }

    async fn get_replication_progress(&self, source_log_id: LogId) -> Result<u64, LogError> {
        Ok(self.inner.lock().progress.get(&source_log_id).copied().unwrap_or(0))
    }

    async fn replication_write(
        &self,
        events: Vec<Arc<dyn DurableEvent>>,
        progress: u64,
        source_log_id: LogId,
        source_vt: VectorTime,
        continue_flag: bool,
    ) -> Result<ReplicationWriteOutcome, LogError> {
        let mut inner = self.inner.lock();
        for event in events {
            // I1 dedup: reject anything that carries nothing new relative to
            // this log's vector time at apply time.
            if event.vector_timestamp().dominates_or_concurrent(&inner.vector_time) {
                inner.sequence_nr += 1;
                let seq = inner.sequence_nr;
                inner.vector_time.merge(event.vector_timestamp());
                inner.events.insert(seq, event);
            }
        }
        inner.vector_time.merge(&source_vt);
        let entry = inner.progress.entry(source_log_id).or_insert(0);
        *entry = (*entry).max(progress);

        Ok(ReplicationWriteOutcome {
            stored_progress: *entry,
            target_vt: inner.vector_time.clone(),
            continue_reading: continue_flag,
        })
    }

    async fn replication_read(
        &self,
        from_seq: u64,
        max_events: usize,
        scan_limit: usize,
        filter: Arc<dyn Filter>,
        target_vt: &VectorTime,
    ) -> Result<ReplicationReadOutcome, LogError> {
        let inner = self.inner.lock();
        let head = inner.sequence_nr;
        let candidate_last = from_seq + scan_limit as u64 - 1;
        let last_scanned = candidate_last.min(head);

        let mut events = Vec::new();
        if last_scanned >= from_seq {
            for (_, event) in inner.events.range(from_seq..=last_scanned) {
                if events.len() >= max_events {
                    break;
                }
                if !event.vector_timestamp().is_less_or_equal(target_vt) && filter.matches(event.as_ref()) {
                    events.push(event.clone());
                }
            }
        }

        Ok(ReplicationReadOutcome {
            events,
            from_seq,
            new_progress: last_scanned,
            source_vt: inner.vector_time.clone(),
        })
    }

    async fn delete(&self, to_sequence_nr: u64, _remote_log_ids: Vec<LogId>) -> Result<u64, LogError> {
        let mut inner = self.inner.lock();
        let effective = to_sequence_nr.min(inner.sequence_nr);
        inner.deletion_watermark = inner.deletion_watermark.max(effective);
        Ok(inner.deletion_watermark)
    }

    async fn adjust_clock(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        let self_vt = inner.vector_time.get(&self.self_endpoint_id);
        if inner.sequence_nr < self_vt {
            inner.sequence_nr = self_vt;
        }
        Ok(())
    }

    async fn reset_replication_progress(&self, source_log_id: LogId) -> Result<(), LogError> {
        self.inner.lock().progress.remove(&source_log_id);
        Ok(())
    }

    async fn invalidate_stale_snapshots(&self) -> Result<usize, LogError> {
        let mut inner = self.inner.lock();
        let current = inner.vector_time.clone();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|covers| covers.is_less_or_equal(&current));
        Ok(before - inner.snapshots.len())
    }
}

/// Routes requests directly to an in-process `Acceptor` keyed by
/// `PeerAddress::system_name`, standing in for the networked transport a
/// real deployment would run over the wire.
#[derive(Default)]
pub struct InMemoryTransport {
    peers: Mutex<HashMap<String, Arc<Acceptor>>>,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, system_name: impl Into<String>, acceptor: Arc<Acceptor>) {
        self.peers.lock().insert(system_name.into(), acceptor);
    }

    fn peer(&self, address: &PeerAddress) -> Result<Arc<Acceptor>, TransportError> {
        self.peers
            .lock()
            .get(&address.system_name)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(address.system_name.clone()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn get_replication_endpoint_info(
        &self,
        peer: &PeerAddress,
    ) -> Result<GetReplicationEndpointInfoSuccess, TransportError> {
        let acceptor = self.peer(peer)?;
        Ok(acceptor.handle_get_info().await)
    }

    async fn replication_read(
        &self,
        peer: &PeerAddress,
        envelope: ReplicationReadEnvelope,
    ) -> Result<ReplicationReadSuccess, ReplicationReadError> {
        let acceptor = self.peer(peer).map_err(ReplicationReadError::Transport)?;
        acceptor.handle_read(envelope).await
    }

    async fn synchronize_replication_progress(
        &self,
        peer: &PeerAddress,
        request: SynchronizeReplicationProgress,
    ) -> Result<SynchronizeReplicationProgressSuccess, TransportError> {
        let acceptor = self.peer(peer)?;
        acceptor
            .handle_synchronize(request)
            .await
            .map_err(|cause| TransportError::Unreachable(cause.to_string()))
    }
}
