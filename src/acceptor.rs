// Acceptor: the local server side. Answers peer info and read
// requests, applies the application-compatibility gate and filter
// resolution, and fans completed writes out to sibling replicators.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use tracing::instrument;

use crate::config::ApplicationVersion;
use crate::connector::ReplicatorRegistry;
use crate::filters::{self, EndpointFilters};
use crate::log::LogHandle;
use crate::model::{EndpointId, LogId, LogName, ReplicationEndpointInfo};
use crate::replicator::{ReplicatorHandle, WriteNotifier};
use crate::wire::{
    GetReplicationEndpointInfoSuccess, ReplicationReadEnvelope, ReplicationReadError,
    ReplicationReadSuccess, SynchronizeReplicationProgress, SynchronizeReplicationProgressSuccess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Recovery,
    Normal,
}

const RECOVERY: u8 = 0;
const NORMAL: u8 = 1;

/// Local server for one endpoint. Shared (`Arc`) across the endpoint's
/// connectors and replicators: connectors register newly-spawned
/// replicators here, replicators notify write success through the
/// `WriteNotifier` impl, and an external transport dispatches incoming
/// requests into `handle_get_info` / `handle_read`.
pub struct Acceptor {
    local_endpoint_id: EndpointId,
    app_name: String,
    app_version: ApplicationVersion,
    local_logs: HashMap<LogName, LogHandle>,
    endpoint_filters: Arc<dyn EndpointFilters>,
    mode: AtomicU8,
    replicators_by_log: DashMap<LogId, Vec<ReplicatorHandle>>,
}

impl Acceptor {
    pub fn new(
        local_endpoint_id: EndpointId,
        app_name: String,
        app_version: ApplicationVersion,
        local_logs: HashMap<LogName, LogHandle>,
        endpoint_filters: Arc<dyn EndpointFilters>,
    ) -> Self {
        Self {
            local_endpoint_id,
            app_name,
            app_version,
            local_logs,
            endpoint_filters,
            mode: AtomicU8::new(RECOVERY),
            replicators_by_log: DashMap::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        match self.mode.load(Ordering::SeqCst) {
            NORMAL => Mode::Normal,
            _ => Mode::Recovery,
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        let value = match mode {
            Mode::Recovery => RECOVERY,
            Mode::Normal => NORMAL,
        };
        self.mode.store(value, Ordering::SeqCst);
    }

    /// `GetReplicationEndpointInfo`: answered in both Recovery and Normal
    /// mode.
    pub async fn handle_get_info(&self) -> GetReplicationEndpointInfoSuccess {
        let mut log_sequence_nrs = HashMap::new();
        for (log_name, log) in &self.local_logs {
            log_sequence_nrs.insert(log_name.clone(), log.sequence_nr().await);
        }
        GetReplicationEndpointInfoSuccess {
            info: ReplicationEndpointInfo {
                endpoint_id: self.local_endpoint_id.clone(),
                log_sequence_nrs,
            },
        }
    }

    /// `ReplicationReadEnvelope`: only served in Normal mode. Applies the
    /// application-compatibility gate, resolves the authoritative filter via
    /// `endpoint_filters.filter_for`, combines it with whatever filter the
    /// requester attached to its own `ReplicationRead` (the requester's
    /// filter is a pre-filtering hint, never a relaxation of the
    /// acceptor's own policy, `and`-combined so the stricter of the two
    /// always wins), and forwards to the named local log.
    #[instrument(skip(self, envelope), fields(source_log = %envelope.source_log_name))]
    pub async fn handle_read(
        &self,
        envelope: ReplicationReadEnvelope,
    ) -> Result<ReplicationReadSuccess, ReplicationReadError> {
        if self.mode() != Mode::Normal {
            return Err(ReplicationReadError::NotServing);
        }

        if envelope.app_name == self.app_name && envelope.app_version < self.app_version {
            return Err(ReplicationReadError::Incompatible(format!(
                "peer application version {:?} is older than required {:?}",
                envelope.app_version, self.app_version
            )));
        }

        let log = self
            .local_logs
            .get(&envelope.source_log_name)
            .ok_or_else(|| {
                ReplicationReadError::Log(crate::error::LogError::Unavailable(format!(
                    "no local log named {}",
                    envelope.source_log_name
                )))
            })?;

        let authoritative = self
            .endpoint_filters
            .filter_for(envelope.read.target_log_id, envelope.source_log_name.as_str());
        let combined = filters::and(authoritative, envelope.read.filter.clone());

        let outcome = log
            .replication_read(
                envelope.read.from_seq,
                envelope.read.max_events,
                envelope.read.scan_limit,
                combined,
                &envelope.read.target_vt,
            )
            .await?;

        Ok(ReplicationReadSuccess {
            events: outcome.events,
            from_seq: outcome.from_seq,
            new_progress: outcome.new_progress,
            target_log_id: envelope.read.target_log_id,
            source_vt: outcome.source_vt,
        })
    }

    /// Answered in both Recovery and Normal mode,
    /// since recovery itself must be able to reach peers that are mid
    /// recovery too. Resets this endpoint's stored progress for the
    /// requester on every log it shares with the requester, then replies
    /// with its own current heads.
    #[instrument(skip(self, request), fields(requester = %request.local_info.endpoint_id))]
    pub async fn handle_synchronize(
        &self,
        request: SynchronizeReplicationProgress,
    ) -> Result<SynchronizeReplicationProgressSuccess, crate::error::LogError> {
        let requester_id = &request.local_info.endpoint_id;
        for log_name in request.local_info.log_sequence_nrs.keys() {
            if let Some(log) = self.local_logs.get(log_name) {
                let source_log_id = LogId::of(requester_id, log_name);
                log.reset_replication_progress(source_log_id).await?;
            }
        }
        let remote_info = self.handle_get_info().await.info;
        Ok(SynchronizeReplicationProgressSuccess { remote_info })
    }
}

impl ReplicatorRegistry for Acceptor {
    fn register(&self, _source_endpoint_id: EndpointId, log_id: LogId, handle: ReplicatorHandle) {
        self.replicators_by_log.entry(log_id).or_default().push(handle);
    }
}

impl WriteNotifier for Acceptor {
    fn notify_write_success(&self, target_log_id: LogId) {
        if let Some(handles) = self.replicators_by_log.get(&target_log_id) {
            for handle in handles.iter() {
                handle.replication_due();
            }
        }
    }
}
