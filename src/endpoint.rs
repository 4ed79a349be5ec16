// Endpoint: the facade. Owns the local logs, the acceptor, and every
// connector; exposes `activate`, `recover`, `delete` as the only entry
// points callers need. Everything else is wiring performed once at
// construction.
//
// Builder + `Arc`-shared-state facade, built up once and handed out as a
// single owned value.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::acceptor::{Acceptor, Mode};
use crate::config::{ApplicationVersion, EndpointConfig, ReplicationSettings};
use crate::connector::{self, ConnectorHandle};
use crate::error::{ReplicoreError, Result};
use crate::events::{EventPublisher, InMemoryEventPublisher};
use crate::filters::{CombinationStrategy, EndpointFilters, TableEndpointFilters};
use crate::log::LogHandle;
use crate::model::{
    check_log_id_collisions, EndpointId, LogId, LogName, ReplicationConnection,
    ReplicationEndpointInfo, ReplicationLink,
};
use crate::recovery::RecoveryCoordinator;
use crate::transport::Transport;

const CREATED: u8 = 0;
const ACTIVATED: u8 = 1;
const RECOVERING: u8 = 2;
const TERMINATED: u8 = 3;

/// `{created -> (activated | recovering -> activated) -> terminated}`
/// lifecycle. Exactly one transition out of `created` is permitted; that
/// guarantee lives in the `compare_exchange` in `activate`/`recover`, not in
/// this enum, since both share one underlying atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Activated,
    Recovering,
    Terminated,
}

/// Observability summary returned by a successful `recover()`. Ambient
/// stack, not a functional addition: a caller that only cares whether
/// recovery succeeded can ignore it entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    pub links_recovered: usize,
    pub snapshots_invalidated: usize,
}

pub struct Endpoint {
    endpoint_id: EndpointId,
    app_name: String,
    app_version: ApplicationVersion,
    logs: HashMap<LogName, LogHandle>,
    connections: Vec<ReplicationConnection>,
    settings: Arc<ReplicationSettings>,
    transport: Arc<dyn Transport>,
    acceptor: Arc<Acceptor>,
    publisher: Arc<dyn EventPublisher>,
    /// Set only when the builder used the default publisher (no
    /// `with_event_publisher` override), so `subscribe_availability` can hand
    /// out receivers without requiring every caller to plumb a publisher
    /// handle through the builder just to observe events.
    default_publisher: Option<Arc<InMemoryEventPublisher>>,
    state: AtomicU8,
    connector_handles: Mutex<Vec<ConnectorHandle>>,
}

impl Endpoint {
    pub fn builder(config: EndpointConfig) -> EndpointBuilder {
        EndpointBuilder::new(config)
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    pub fn state(&self) -> EndpointState {
        match self.state.load(Ordering::SeqCst) {
            ACTIVATED => EndpointState::Activated,
            RECOVERING => EndpointState::Recovering,
            TERMINATED => EndpointState::Terminated,
            _ => EndpointState::Created,
        }
    }

    /// `log_id(log_name) = f(id, log_name)`.
    pub fn log_id(&self, log_name: &LogName) -> LogId {
        LogId::of(&self.endpoint_id, log_name)
    }

    /// `common_log_names(info) = self.log_names ∩ info.log_names`.
    pub fn common_log_names(&self, info: &ReplicationEndpointInfo) -> HashSet<LogName> {
        let local: HashSet<LogName> = self.logs.keys().cloned().collect();
        local.intersection(&info.log_names()).cloned().collect()
    }

    /// The log names this endpoint manages locally.
    pub fn log_names(&self) -> HashSet<LogName> {
        self.logs.keys().cloned().collect()
    }

    /// The connections this endpoint was configured with.
    pub fn connections(&self) -> &[ReplicationConnection] {
        &self.connections
    }

    /// Atomic test-and-set on the flag shared with `recover`: on
    /// success, moves the `Acceptor` to Normal mode and starts one
    /// `Connector` per configured connection with no preset links, so each
    /// discovers its peer's logs independently via `GetReplicationEndpointInfo`.
    #[instrument(skip(self), fields(endpoint = %self.endpoint_id))]
    pub fn activate(&self) -> Result<()> {
        self.state
            .compare_exchange(CREATED, ACTIVATED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                ReplicoreError::illegal_state("endpoint is already activated or recovering")
            })?;

        self.acceptor.set_mode(Mode::Normal);
        self.spawn_connectors(None);
        info!("endpoint activated");
        Ok(())
    }

    /// Runs the Recovery Coordinator first; only on success does the
    /// Acceptor move to Normal mode and connectors start (with the link set
    /// the coordinator already discovered, so there is no redundant
    /// `GetReplicationEndpointInfo` round trip right after recovery).
    /// Fails immediately with `IllegalState` if there are no connections,
    /// since recovery has nothing to synchronize progress against.
    #[instrument(skip(self), fields(endpoint = %self.endpoint_id))]
    pub async fn recover(&self) -> Result<RecoverySummary> {
        if self.connections.is_empty() {
            return Err(ReplicoreError::illegal_state(
                "recover() requires at least one connection",
            ));
        }
        self.state
            .compare_exchange(CREATED, RECOVERING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                ReplicoreError::illegal_state("endpoint is already activated or recovering")
            })?;

        let coordinator = RecoveryCoordinator {
            local_endpoint_id: self.endpoint_id.clone(),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            local_logs: self.logs.clone(),
            connections: self.connections.clone(),
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            acceptor: self.acceptor.clone(),
        };

        // A failure here leaves `state` at RECOVERING rather than rolling
        // back to CREATED: a failed recovery must never look like a fresh,
        // re-activatable endpoint. `partial_update` is derived from which
        // step failed: steps 1-2 (read local info, synchronize progress)
        // precede any possible write, so a failure there is always safe to
        // retry; steps 3-5 may already have written events.
        let outcome = coordinator.run().await.map_err(|cause| {
            let partial_update = cause.partial_update();
            ReplicoreError::recovery(cause, partial_update)
        })?;

        self.state.store(ACTIVATED, Ordering::SeqCst);
        let summary = RecoverySummary {
            links_recovered: outcome.links_recovered,
            snapshots_invalidated: outcome.snapshots_invalidated,
        };
        self.spawn_connectors(Some(outcome.links_by_connection));
        info!(
            links_recovered = summary.links_recovered,
            snapshots_invalidated = summary.snapshots_invalidated,
            "endpoint recovered"
        );
        Ok(summary)
    }

    /// `delete(log_name, to_sequence_nr, remote_endpoint_ids)`: computes
    /// the remote `log_id`s via `f(remote_endpoint_id, log_name)`
    /// and forwards a logical-delete request to the named local log, which
    /// returns the effective watermark
    /// `max(previous_watermark, min(to_sequence_nr, current_sequence_nr))`.
    #[instrument(skip(self), fields(endpoint = %self.endpoint_id, %log_name))]
    pub async fn delete(
        &self,
        log_name: &LogName,
        to_sequence_nr: u64,
        remote_endpoint_ids: &[EndpointId],
    ) -> Result<u64> {
        let log = self
            .logs
            .get(log_name)
            .ok_or_else(|| ReplicoreError::Delete(format!("no local log named {log_name}")))?;
        let remote_log_ids = remote_endpoint_ids
            .iter()
            .map(|remote_id| LogId::of(remote_id, log_name))
            .collect();
        log.delete(to_sequence_nr, remote_log_ids)
            .await
            .map_err(|cause| ReplicoreError::Delete(cause.to_string()))
    }

    /// Aborts every connector (and transitively the replicators and failure
    /// detectors it spawned) and marks the endpoint terminated. Idempotent.
    pub fn terminate(&self) {
        self.state.store(TERMINATED, Ordering::SeqCst);
        let mut handles = self.connector_handles.lock();
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    /// Taps the default in-process event bus for `Available`/`Unavailable`
    /// notifications. Returns `None` when the endpoint was built with a
    /// custom `EventPublisher`; subscribe through that publisher directly
    /// instead.
    pub fn subscribe_availability(
        &self,
    ) -> Option<tokio::sync::broadcast::Receiver<crate::wire::AvailabilityEvent>> {
        self.default_publisher.as_ref().map(|p| p.subscribe())
    }

    /// `subscribe_availability`, wrapped as a `Stream` for callers that would
    /// rather compose than poll `recv()` in a loop.
    pub fn subscribe_availability_stream(
        &self,
    ) -> Option<impl tokio_stream::Stream<Item = Result<crate::wire::AvailabilityEvent, tokio_stream::wrappers::errors::BroadcastStreamRecvError>>>
    {
        self.default_publisher.as_ref().map(|p| p.subscribe_stream())
    }

    fn spawn_connectors(&self, preset_links_by_connection: Option<Vec<Vec<ReplicationLink>>>) {
        let mut handles = self.connector_handles.lock();
        for (idx, connection) in self.connections.iter().enumerate() {
            let preset = preset_links_by_connection
                .as_ref()
                .map(|all| all[idx].clone());
            let handle = connector::spawn(
                self.endpoint_id.clone(),
                connection.clone(),
                self.logs.clone(),
                self.transport.clone(),
                self.settings.clone(),
                self.acceptor.clone(),
                self.acceptor.clone(),
                self.publisher.clone(),
                self.app_name.clone(),
                self.app_version.clone(),
                preset,
            );
            handles.push(handle);
        }
    }
}

pub struct EndpointBuilder {
    endpoint_id: EndpointId,
    app_name: String,
    app_version: ApplicationVersion,
    settings: Arc<ReplicationSettings>,
    logs: HashMap<LogName, LogHandle>,
    connections: Vec<ReplicationConnection>,
    /// Raw `endpoint.connections` entries carried over from the config,
    /// kept only to check at `build()` time: a bare `"host:port"` has no
    /// peer system name, so it can never become a dialable
    /// `ReplicationConnection` on its own. Surfacing that as a build-time
    /// error beats quietly handing back an endpoint with no connections
    /// that only fails later, confusingly, inside `recover()`.
    unresolved_connections: Vec<String>,
    transport: Option<Arc<dyn Transport>>,
    endpoint_filters: Option<Arc<dyn EndpointFilters>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl EndpointBuilder {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            endpoint_id: config.endpoint_id,
            app_name: config.application_name,
            app_version: config.application_version,
            settings: Arc::new(config.settings),
            logs: HashMap::new(),
            connections: Vec::new(),
            unresolved_connections: config.connections,
            transport: None,
            endpoint_filters: None,
            publisher: None,
        }
    }

    pub fn with_log(mut self, log_name: LogName, handle: LogHandle) -> Self {
        self.logs.insert(log_name, handle);
        self
    }

    /// `endpoint.connections` entries in the config are plain `"host:port"`
    /// strings (§6) with no peer system name, so they cannot be turned into
    /// a `ReplicationConnection` by parsing alone; every real connection
    /// must be attached here with the system name its peer actually reports
    /// (`PeerAddress::system_name`, used to route every request to it).
    pub fn with_connection(mut self, connection: ReplicationConnection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_endpoint_filters(mut self, filters: Arc<dyn EndpointFilters>) -> Self {
        self.endpoint_filters = Some(filters);
        self
    }

    pub fn with_event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Detects Open Question (b) over the locally managed log set (the only
    /// `(endpoint, log)` pairs known at construction time; a connection's
    /// remote logs are learned later, from whichever `endpoint_id` its
    /// acceptor actually reports) and wires an `Acceptor` for this endpoint.
    pub fn build(self) -> Result<Endpoint> {
        if !self.unresolved_connections.is_empty() {
            return Err(ReplicoreError::illegal_state(format!(
                "endpoint.connections named {} peer(s) ({}), but a bare \"host:port\" carries no \
                 peer system name and cannot be dialed on its own; call with_connection() for \
                 each one with the system name its acceptor reports",
                self.unresolved_connections.len(),
                self.unresolved_connections.join(", "),
            )));
        }
        let transport = self
            .transport
            .ok_or_else(|| ReplicoreError::illegal_state("transport is required"))?;
        let endpoint_filters = self.endpoint_filters.unwrap_or_else(|| {
            Arc::new(TableEndpointFilters::new(CombinationStrategy::TargetAndSource))
                as Arc<dyn EndpointFilters>
        });
        let default_publisher = if self.publisher.is_none() {
            Some(Arc::new(InMemoryEventPublisher::default()))
        } else {
            None
        };
        let publisher: Arc<dyn EventPublisher> = self
            .publisher
            .unwrap_or_else(|| default_publisher.clone().unwrap());

        let pairs: Vec<(EndpointId, LogName)> = self
            .logs
            .keys()
            .map(|name| (self.endpoint_id.clone(), name.clone()))
            .collect();
        check_log_id_collisions(&pairs)?;

        let acceptor = Arc::new(Acceptor::new(
            self.endpoint_id.clone(),
            self.app_name.clone(),
            self.app_version.clone(),
            self.logs.clone(),
            endpoint_filters,
        ));

        Ok(Endpoint {
            endpoint_id: self.endpoint_id,
            app_name: self.app_name,
            app_version: self.app_version,
            logs: self.logs,
            connections: self.connections,
            settings: self.settings,
            transport,
            acceptor,
            publisher,
            default_publisher,
            state: AtomicU8::new(CREATED),
            connector_handles: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::log::EventLog;
    use crate::model::{EndpointId, LogName, ReplicationConnection};
    use crate::testing::{InMemoryLog, InMemoryTransport};

    use super::*;

    fn settings(retry_delay_ms: u64) -> ReplicationSettings {
        ReplicationSettings {
            write_batch_size: 64,
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            remote_read_timeout: Duration::from_secs(5),
            remote_scan_limit: 1_000,
            retry_delay: Duration::from_millis(retry_delay_ms),
            failure_detection_limit: Duration::from_secs(60),
        }
    }

    fn config(id: &str, connections: Vec<String>) -> EndpointConfig {
        EndpointConfig {
            endpoint_id: EndpointId::new(id).unwrap(),
            connections,
            application_name: "app".to_string(),
            application_version: ApplicationVersion::new(1, 0, 0),
            settings: settings(20),
        }
    }

    /// Happy pull: B connects to A, activates, and
    /// eventually has every event A had at connect time, with `progress`
    /// caught up to A's head.
    #[tokio::test]
    async fn happy_pull_replicates_all_events() {
        let transport = InMemoryTransport::new();

        let a_id = EndpointId::new("A").unwrap();
        let log_x = LogName::new("X").unwrap();
        let a_log = InMemoryLog::new("X", a_id.clone());
        a_log.seed_local_events(5);

        let a_endpoint = Endpoint::builder(config("A", vec![]))
            .with_log(log_x.clone(), a_log.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();
        a_endpoint.activate().unwrap();
        transport.register("A", endpoint_acceptor_for_test(&a_endpoint));

        let b_id = EndpointId::new("B").unwrap();
        let b_log = InMemoryLog::new("X", b_id.clone());
        let b_endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_x.clone(), b_log.clone())
            .with_transport(transport.clone())
            .with_connection(ReplicationConnection::new("localhost", 1, "A"))
            .build()
            .unwrap();
        b_endpoint.activate().unwrap();

        wait_until(Duration::from_secs(2), || b_log.event_count() == 5).await;
        assert_eq!(b_log.event_count(), 5);
    }

    /// Duplicate suppression: writing the same event twice
    /// applies it once; `progress` still advances.
    #[tokio::test]
    async fn duplicate_events_are_suppressed_by_vector_time() {
        let a_id = EndpointId::new("A").unwrap();
        let b_log = InMemoryLog::new("X", EndpointId::new("B").unwrap());
        let source_log_id = crate::model::LogId::of(&a_id, &LogName::new("X").unwrap());

        let mut vt = crate::vector_time::VectorTime::new();
        vt.set(a_id.clone(), 1);
        let event: Arc<dyn crate::log::DurableEvent> = Arc::new(crate::testing::TestEvent {
            vector_timestamp: vt.clone(),
            emitter_id: a_id.as_str().to_string(),
        });

        let first = b_log
            .replication_write(vec![event.clone()], 1, source_log_id, vt.clone(), false)
            .await
            .unwrap();
        assert_eq!(b_log.event_count(), 1);
        assert_eq!(first.stored_progress, 1);

        let second = b_log
            .replication_write(vec![event], 1, source_log_id, vt, false)
            .await
            .unwrap();
        assert_eq!(b_log.event_count(), 1, "duplicate must not be applied twice");
        assert_eq!(second.stored_progress, 1, "progress still reflects the latest report");
    }

    /// Recover from partial loss: B lost its tail, `recover()`
    /// re-pulls it from A and restores it.
    #[tokio::test]
    async fn recover_repulls_lost_events() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();

        let a_id = EndpointId::new("A").unwrap();
        let a_log = InMemoryLog::new("X", a_id.clone());
        a_log.seed_local_events(5);
        let a_endpoint = Endpoint::builder(config("A", vec![]))
            .with_log(log_x.clone(), a_log.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();
        a_endpoint.activate().unwrap();
        transport.register("A", endpoint_acceptor_for_test(&a_endpoint));

        let b_id = EndpointId::new("B").unwrap();
        let b_log = InMemoryLog::new("X", b_id.clone());
        b_log.seed_local_events(0);
        // Simulate B having already pulled e1..e5, then losing e4..e5.
        let source_log_id = crate::model::LogId::of(&a_id, &log_x);
        for seq in 1..=5u64 {
            let mut vt = crate::vector_time::VectorTime::new();
            vt.set(a_id.clone(), seq);
            let event: Arc<dyn crate::log::DurableEvent> = Arc::new(crate::testing::TestEvent {
                vector_timestamp: vt.clone(),
                emitter_id: a_id.as_str().to_string(),
            });
            b_log
                .replication_write(vec![event], seq, source_log_id, vt, false)
                .await
                .unwrap();
        }
        assert_eq!(b_log.event_count(), 5);
        b_log.truncate_to(3);
        assert_eq!(b_log.event_count(), 3);

        let b_endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_x.clone(), b_log.clone())
            .with_transport(transport.clone())
            .with_connection(ReplicationConnection::new("localhost", 1, "A"))
            .build()
            .unwrap();

        b_endpoint.recover().await.unwrap();

        assert_eq!(b_log.event_count(), 5, "recovery must re-pull the lost tail");
        let vt = b_log.vector_time().await;
        assert!(b_log.sequence_nr().await >= vt.get(&b_id), "I5 must hold after recovery");
    }

    /// Genuine multi-master case: A's log holds events A itself never
    /// authored (all three came in from a third endpoint, C, that A
    /// previously replicated from). `target_vt[A]` stays at zero throughout,
    /// so a termination check keyed off it would never see recovery as
    /// done; `recover()` must still converge by walking A's own log
    /// sequence space instead.
    #[tokio::test]
    async fn recover_converges_when_source_log_has_no_self_authored_events() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();

        let a_id = EndpointId::new("A").unwrap();
        let c_id = EndpointId::new("C").unwrap();
        let a_log = InMemoryLog::new("X", a_id.clone());
        let c_source_log_id = crate::model::LogId::of(&c_id, &log_x);
        for seq in 1..=3u64 {
            let mut vt = crate::vector_time::VectorTime::new();
            vt.set(c_id.clone(), seq);
            let event: Arc<dyn crate::log::DurableEvent> = Arc::new(crate::testing::TestEvent {
                vector_timestamp: vt.clone(),
                emitter_id: c_id.as_str().to_string(),
            });
            a_log
                .replication_write(vec![event], seq, c_source_log_id, vt, false)
                .await
                .unwrap();
        }
        assert_eq!(a_log.event_count(), 3);
        assert_eq!(a_log.vector_time().await.get(&a_id), 0, "A never authored anything itself");

        let a_endpoint = Endpoint::builder(config("A", vec![]))
            .with_log(log_x.clone(), a_log.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();
        a_endpoint.activate().unwrap();
        transport.register("A", endpoint_acceptor_for_test(&a_endpoint));

        let b_log = InMemoryLog::new("X", EndpointId::new("B").unwrap());
        let b_endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_x, b_log.clone())
            .with_transport(transport)
            .with_connection(ReplicationConnection::new("localhost", 1, "A"))
            .build()
            .unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), b_endpoint.recover())
            .await
            .expect("recover() must not hang comparing the wrong namespace")
            .unwrap();

        assert_eq!(summary.links_recovered, 1);
        assert_eq!(b_log.event_count(), 3);
    }

    #[tokio::test]
    async fn recover_fails_without_connections() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();
        let b_log = InMemoryLog::new("X", EndpointId::new("B").unwrap());
        let endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_x, b_log)
            .with_transport(transport)
            .build()
            .unwrap();

        let err = endpoint.recover().await.unwrap_err();
        assert!(matches!(err, ReplicoreError::IllegalState(_)));
    }

    /// A connection named purely through `EndpointConfig.connections` (a
    /// bare "host:port" with no peer system name) can't be dialed, so
    /// `build()` must reject it loudly instead of silently producing an
    /// endpoint with zero connections that only fails later in `recover()`.
    #[tokio::test]
    async fn build_rejects_unresolved_config_connections() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();
        let b_log = InMemoryLog::new("X", EndpointId::new("B").unwrap());
        let b_config = EndpointConfig {
            connections: vec!["localhost:1".to_string()],
            ..config("B", vec![])
        };

        let err = Endpoint::builder(b_config)
            .with_log(log_x, b_log)
            .with_transport(transport)
            .build()
            .unwrap_err();

        assert!(matches!(err, ReplicoreError::IllegalState(_)));
    }

    /// The same config entry, once supplied to the builder as a proper
    /// `ReplicationConnection` via `with_connection`, builds and recovers
    /// normally; `build()` only objects to connections it cannot resolve
    /// itself.
    #[tokio::test]
    async fn with_connection_resolves_what_config_alone_cannot() {
        let transport = InMemoryTransport::new();

        let a_id = EndpointId::new("A").unwrap();
        let log_x = LogName::new("X").unwrap();
        let a_log = InMemoryLog::new("X", a_id.clone());
        a_log.seed_local_events(3);
        let a_endpoint = Endpoint::builder(config("A", vec![]))
            .with_log(log_x.clone(), a_log)
            .with_transport(transport.clone())
            .build()
            .unwrap();
        a_endpoint.activate().unwrap();
        transport.register("A", endpoint_acceptor_for_test(&a_endpoint));

        let b_log = InMemoryLog::new("X", EndpointId::new("B").unwrap());
        let b_endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_x, b_log.clone())
            .with_transport(transport)
            .with_connection(ReplicationConnection::new("localhost", 1, "A"))
            .build()
            .unwrap();

        assert_eq!(b_endpoint.connections().len(), 1);
        b_endpoint.recover().await.unwrap();
        assert_eq!(b_log.event_count(), 3);
    }

    /// A remote unreachable during recovery step 2 (synchronize progress)
    /// fails before any replication write could have happened, so the
    /// caller must see `partial_update = false`, safe to retry blindly.
    #[tokio::test]
    async fn recovery_failure_before_any_write_reports_partial_update_false() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();
        let b_log = InMemoryLog::new("X", EndpointId::new("B").unwrap());
        // "A" is never registered with the transport, so step 2's
        // synchronize round trip fails with Unreachable.
        let endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_x, b_log)
            .with_transport(transport)
            .with_connection(ReplicationConnection::new("localhost", 1, "A"))
            .build()
            .unwrap();

        let err = endpoint.recover().await.unwrap_err();
        match err {
            ReplicoreError::Recovery { partial_update, .. } => {
                assert!(!partial_update, "no write could have happened before step 2 failed");
            }
            other => panic!("expected Recovery error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn double_activate_is_illegal_state() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();
        let b_log = InMemoryLog::new("X", EndpointId::new("B").unwrap());
        let endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_x, b_log)
            .with_transport(transport)
            .build()
            .unwrap();

        endpoint.activate().unwrap();
        let err = endpoint.activate().unwrap_err();
        assert!(matches!(err, ReplicoreError::IllegalState(_)));
    }

    /// Version gate: A's acceptor rejects B's read because
    /// B's application version is older than A's, and B eventually emits
    /// `Unavailable` carrying the incompatibility cause.
    #[tokio::test]
    async fn version_incompatibility_surfaces_as_unavailable() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();

        let a_id = EndpointId::new("A").unwrap();
        let a_log = InMemoryLog::new("X", a_id.clone());
        a_log.seed_local_events(1);
        let mut a_config = config("A", vec![]);
        a_config.application_version = ApplicationVersion::new(2, 0, 0);
        let a_endpoint = Endpoint::builder(a_config)
            .with_log(log_x.clone(), a_log.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();
        a_endpoint.activate().unwrap();
        transport.register("A", endpoint_acceptor_for_test(&a_endpoint));

        let b_id = EndpointId::new("B").unwrap();
        let b_log = InMemoryLog::new("X", b_id.clone());
        let mut b_config = config("B", vec![]);
        b_config.application_version = ApplicationVersion::new(1, 0, 0);
        b_config.settings.remote_read_timeout = Duration::from_millis(50);
        b_config.settings.retry_delay = Duration::from_millis(20);
        b_config.settings.failure_detection_limit = Duration::from_millis(100);
        let b_endpoint = Endpoint::builder(b_config)
            .with_log(log_x.clone(), b_log.clone())
            .with_transport(transport.clone())
            .with_connection(ReplicationConnection::new("localhost", 1, "A"))
            .build()
            .unwrap();
        let mut availability = b_endpoint.subscribe_availability().unwrap();
        b_endpoint.activate().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), availability.recv())
            .await
            .expect("timed out waiting for an availability event")
            .unwrap();
        match event {
            crate::wire::AvailabilityEvent::Unavailable { causes, .. } => {
                assert!(
                    causes.iter().any(|c| c.contains("incompatible")),
                    "expected an incompatibility cause, got {causes:?}"
                );
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(b_log.event_count(), 0, "no event should have been written across the gate");
    }

    /// Continue flag: a read that scans a large range but
    /// only admits a handful of events through the filter still reports
    /// `new_progress >= from_seq`, and the replicator re-enters `Reading`
    /// immediately rather than waiting a full `retry_delay`.
    #[tokio::test]
    async fn continue_flag_skips_the_retry_delay_wait() {
        let transport = InMemoryTransport::new();
        let log_x = LogName::new("X").unwrap();

        let a_id = EndpointId::new("A").unwrap();
        let a_log = InMemoryLog::new("X", a_id.clone());
        a_log.seed_local_events(200);
        let mut a_config = config("A", vec![]);
        a_config.settings.remote_scan_limit = 200;
        let a_endpoint = Endpoint::builder(a_config)
            .with_log(log_x.clone(), a_log.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();
        a_endpoint.activate().unwrap();
        transport.register("A", endpoint_acceptor_for_test(&a_endpoint));

        let b_id = EndpointId::new("B").unwrap();
        let b_log = InMemoryLog::new("X", b_id.clone());
        let mut b_config = config("B", vec![]);
        b_config.settings.remote_scan_limit = 200;
        b_config.settings.retry_delay = Duration::from_secs(3);
        let sparse_filter = crate::filters::from_fn(move |event| {
            event
                .as_any()
                .downcast_ref::<crate::testing::TestEvent>()
                .map(|e| e.vector_timestamp.get(&a_id) % 20 == 0)
                .unwrap_or(false)
        });
        let b_endpoint = Endpoint::builder(b_config)
            .with_log(log_x.clone(), b_log.clone())
            .with_transport(transport.clone())
            .with_connection(
                ReplicationConnection::new("localhost", 1, "A").with_filter(log_x, sparse_filter),
            )
            .build()
            .unwrap();
        b_endpoint.activate().unwrap();

        // Only 10 of 200 events pass the filter; with a 3s retry_delay, seeing
        // them all well inside 500ms proves the replicator never idled.
        wait_until(Duration::from_millis(500), || b_log.event_count() == 10).await;
        assert_eq!(b_log.event_count(), 10);
    }

    /// Test-only accessor: real callers never need an `Endpoint`'s
    /// `Acceptor`, since a transport dispatches wire requests into it. The
    /// in-memory transport double has to route "network" calls somewhere, so
    /// tests wire it up directly.
    fn endpoint_acceptor_for_test(endpoint: &Endpoint) -> Arc<Acceptor> {
        endpoint.acceptor.clone()
    }

    async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !predicate() {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition did not become true within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wraps an `InMemoryLog` to record, in a shared order log, every
    /// non-empty `replication_write` call by log name, used only to observe
    /// unfiltered-before-filtered recovery ordering, which the
    /// coordinator itself doesn't expose any other way to assert on.
    #[derive(Debug)]
    struct RecordingLog {
        inner: Arc<InMemoryLog>,
        name: String,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl crate::log::EventLog for RecordingLog {
        fn log_name(&self) -> &str {
            &self.name
        }

        async fn vector_time(&self) -> crate::vector_time::VectorTime {
            self.inner.vector_time().await
        }

        async fn sequence_nr(&self) -> u64 {
            self.inner.sequence_nr().await
        }

        async fn get_replication_progress(
            &self,
            source_log_id: LogId,
        ) -> Result<u64, crate::error::LogError> {
            self.inner.get_replication_progress(source_log_id).await
        }

        async fn replication_write(
            &self,
            events: Vec<Arc<dyn crate::log::DurableEvent>>,
            progress: u64,
            source_log_id: LogId,
            source_vt: crate::vector_time::VectorTime,
            continue_flag: bool,
        ) -> Result<crate::log::ReplicationWriteOutcome, crate::error::LogError> {
            if !events.is_empty() {
                self.order.lock().push(self.name.clone());
            }
            self.inner
                .replication_write(events, progress, source_log_id, source_vt, continue_flag)
                .await
        }

        async fn replication_read(
            &self,
            from_seq: u64,
            max_events: usize,
            scan_limit: usize,
            filter: Arc<dyn crate::filters::Filter>,
            target_vt: &crate::vector_time::VectorTime,
        ) -> Result<crate::log::ReplicationReadOutcome, crate::error::LogError> {
            self.inner
                .replication_read(from_seq, max_events, scan_limit, filter, target_vt)
                .await
        }

        async fn delete(
            &self,
            to_sequence_nr: u64,
            remote_log_ids: Vec<LogId>,
        ) -> Result<u64, crate::error::LogError> {
            self.inner.delete(to_sequence_nr, remote_log_ids).await
        }

        async fn adjust_clock(&self) -> Result<(), crate::error::LogError> {
            self.inner.adjust_clock().await
        }

        async fn reset_replication_progress(
            &self,
            source_log_id: LogId,
        ) -> Result<(), crate::error::LogError> {
            self.inner.reset_replication_progress(source_log_id).await
        }

        async fn invalidate_stale_snapshots(&self) -> Result<usize, crate::error::LogError> {
            self.inner.invalidate_stale_snapshots().await
        }
    }

    /// Unfiltered-first ordering: B recovers an unfiltered
    /// link (log `L0`, carrying causal predecessors) and a filtered link
    /// (log `L1`) from the same remote. Every `L0` write must land before
    /// the first `L1` write.
    #[tokio::test]
    async fn unfiltered_links_recover_before_filtered_links() {
        let transport = InMemoryTransport::new();
        let log_l0 = LogName::new("L0").unwrap();
        let log_l1 = LogName::new("L1").unwrap();

        let a_id = EndpointId::new("A").unwrap();
        let a_l0 = InMemoryLog::new("L0", a_id.clone());
        let a_l1 = InMemoryLog::new("L1", a_id.clone());
        a_l0.seed_local_events(3);
        a_l1.seed_local_events(3);
        let a_endpoint = Endpoint::builder(config("A", vec![]))
            .with_log(log_l0.clone(), a_l0.clone())
            .with_log(log_l1.clone(), a_l1.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap();
        a_endpoint.activate().unwrap();
        transport.register("A", endpoint_acceptor_for_test(&a_endpoint));

        let b_id = EndpointId::new("B").unwrap();
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let b_l0_inner = InMemoryLog::new("L0", b_id.clone());
        let b_l1_inner = InMemoryLog::new("L1", b_id.clone());
        let b_l0: LogHandle = Arc::new(RecordingLog {
            inner: b_l0_inner.clone(),
            name: "L0".to_string(),
            order: order.clone(),
        });
        let b_l1: LogHandle = Arc::new(RecordingLog {
            inner: b_l1_inner.clone(),
            name: "L1".to_string(),
            order: order.clone(),
        });

        let b_endpoint = Endpoint::builder(config("B", vec![]))
            .with_log(log_l0.clone(), b_l0)
            .with_log(log_l1.clone(), b_l1)
            .with_transport(transport.clone())
            .with_connection(
                ReplicationConnection::new("localhost", 1, "A")
                    .with_filter(log_l1.clone(), crate::filters::from_fn(|_| true)),
            )
            .build()
            .unwrap();

        b_endpoint.recover().await.unwrap();

        assert_eq!(b_l0_inner.event_count(), 3);
        assert_eq!(b_l1_inner.event_count(), 3);
        let recorded = order.lock().clone();
        let last_l0 = recorded.iter().rposition(|n| n == "L0");
        let first_l1 = recorded.iter().position(|n| n == "L1");
        if let (Some(last_l0), Some(first_l1)) = (last_l0, first_l1) {
            assert!(
                last_l0 < first_l1,
                "every L0 write must precede the first L1 write, got {recorded:?}"
            );
        }
    }
}
