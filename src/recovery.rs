// Recovery Coordinator: the multi-step disaster-recovery protocol that
// re-seeds a replica which has lost events, without causing permanent state
// divergence.
//
// A handful of `async` steps run strictly in order, each fallible, with the
// caller's error type telling observers whether a retry is safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::acceptor::{Acceptor, Mode};
use crate::config::{ApplicationVersion, ReplicationSettings};
use crate::error::TransportError;
use crate::filters::{Filter, NoFilter};
use crate::log::LogHandle;
use crate::model::{
    EndpointId, LogId, LogName, RecoveryLink, ReplicationConnection, ReplicationEndpointInfo,
    ReplicationLink, ReplicationSource, ReplicationTarget,
};
use crate::transport::Transport;
use crate::wire::{ReplicationRead, ReplicationReadEnvelope, SynchronizeReplicationProgress};

/// Which of the five recovery steps failed, carrying enough information for
/// `Endpoint::recover` to pick the right `partial_update` flag: steps 1-2
/// run before any replication write is possible, so a failure there can
/// never leave the replica in a partially-updated state; steps 3-5 may
/// already have written events by the time they fail.
#[derive(Debug)]
pub enum RecoveryStepError {
    /// Never constructed by this crate's own `Acceptor`, whose
    /// `handle_get_info` only reads already-durable local state and cannot
    /// fail; kept so a collaborator whose `EventLog`/`Acceptor` impl can
    /// fail this step still has a variant that reports `partial_update =
    /// false`, per the step 1 contract.
    #[allow(dead_code)]
    ReadLocalInfo(String),
    SynchronizeProgress(String),
    RecoverLinks(String),
    AdjustClocks(String),
}

impl RecoveryStepError {
    /// `false` for steps 1-2 (nothing written yet, safe to retry blindly);
    /// `true` for steps 3-5 (some replication write may already have
    /// occurred, so a blind retry risks writing causally-out-of-order
    /// events).
    pub fn partial_update(&self) -> bool {
        !matches!(self, Self::ReadLocalInfo(_) | Self::SynchronizeProgress(_))
    }
}

impl std::fmt::Display for RecoveryStepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadLocalInfo(cause) => write!(f, "reading local endpoint info: {cause}"),
            Self::SynchronizeProgress(cause) => {
                write!(f, "synchronizing replication progress with a remote: {cause}")
            }
            Self::RecoverLinks(cause) => write!(f, "recovering links: {cause}"),
            Self::AdjustClocks(cause) => write!(f, "adjusting local log clocks: {cause}"),
        }
    }
}

impl std::error::Error for RecoveryStepError {}

/// Narrow context the coordinator needs; assembled once by `Endpoint::recover`
/// from its own fields rather than borrowing the whole `Endpoint`, to break
/// the Endpoint/collaborator reference cycle.
pub struct RecoveryCoordinator {
    pub local_endpoint_id: EndpointId,
    pub app_name: String,
    pub app_version: ApplicationVersion,
    pub local_logs: HashMap<LogName, LogHandle>,
    pub connections: Vec<ReplicationConnection>,
    pub transport: Arc<dyn Transport>,
    pub settings: Arc<ReplicationSettings>,
    pub acceptor: Arc<Acceptor>,
}

/// Links recovered, grouped by the originating connection's position in
/// `RecoveryCoordinator::connections`, so `Endpoint::recover` can start each
/// connection's post-recovery `Connector` with a preset link set instead of
/// rediscovering it via a fresh `GetReplicationEndpointInfo` round trip.
pub struct RecoveryOutcome {
    pub links_by_connection: Vec<Vec<ReplicationLink>>,
    pub links_recovered: usize,
    pub snapshots_invalidated: usize,
}

impl RecoveryCoordinator {
    #[instrument(skip(self), fields(endpoint = %self.local_endpoint_id))]
    pub async fn run(&self) -> Result<RecoveryOutcome, RecoveryStepError> {
        // Step 1: read local endpoint info.
        let local_info = self.acceptor.handle_get_info().await.info;
        info!(
            local_logs = local_info.log_sequence_nrs.len(),
            "recovery: read local endpoint info"
        );

        // Step 2: synchronize replication progress with every remote. Every
        // connection is independent, so the round trips run concurrently
        // rather than one after another.
        let synchronized = futures::future::join_all(
            self.connections
                .iter()
                .map(|connection| self.synchronize_with_remote(connection, &local_info)),
        )
        .await;
        let recovery_links_by_connection = synchronized
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|cause: TransportError| RecoveryStepError::SynchronizeProgress(cause.to_string()))?;

        // Step 3/4: unfiltered links recover first, across all connections,
        // before any filtered link is touched. An unfiltered link is
        // guaranteed to carry every causal predecessor a filtered link
        // might later deliver.
        let mut unfiltered = Vec::new();
        let mut filtered = Vec::new();
        for (connection, links) in self.connections.iter().zip(&recovery_links_by_connection) {
            for recovery_link in links {
                if connection.is_filtered(&recovery_link.link.source.log_name) {
                    filtered.push(recovery_link.clone());
                } else {
                    unfiltered.push(recovery_link.clone());
                }
            }
        }
        info!(
            unfiltered = unfiltered.len(),
            filtered = filtered.len(),
            "recovery: recovering links"
        );

        let snapshots_invalidated = self.recover_links(&unfiltered).await?
            + self.recover_links(&filtered).await?;
        let links_recovered = unfiltered.len() + filtered.len();

        // Step 5: adjust local log clocks so sequence numbers stay ahead of
        // vector time even when recovery applied fewer events than were
        // originally lost. A no-op when the log is already consistent.
        for (log_name, log) in &self.local_logs {
            log.adjust_clock()
                .await
                .map_err(|cause| RecoveryStepError::AdjustClocks(format!("{log_name}: {cause}")))?;
        }

        self.acceptor.set_mode(Mode::Normal);

        let links_by_connection = recovery_links_by_connection
            .into_iter()
            .map(|links| links.into_iter().map(|rl| rl.link).collect())
            .collect();
        Ok(RecoveryOutcome {
            links_by_connection,
            links_recovered,
            snapshots_invalidated,
        })
    }

    async fn synchronize_with_remote(
        &self,
        connection: &ReplicationConnection,
        local_info: &ReplicationEndpointInfo,
    ) -> Result<Vec<RecoveryLink>, TransportError> {
        let peer_address = connection.peer_address();
        let request = SynchronizeReplicationProgress {
            local_info: local_info.clone(),
        };
        let success = self
            .transport
            .synchronize_replication_progress(&peer_address, request)
            .await?;

        let local_names: HashSet<LogName> = self.local_logs.keys().cloned().collect();
        let remote_names = success.remote_info.log_names();

        let mut links = Vec::new();
        for log_name in local_names.intersection(&remote_names) {
            let source = ReplicationSource::from_info(
                &success.remote_info,
                log_name.clone(),
                peer_address.clone(),
            );
            let local_log_handle = self
                .local_logs
                .get(log_name)
                .expect("log_name came from local_logs")
                .clone();
            let target = ReplicationTarget {
                owning_endpoint: self.local_endpoint_id.clone(),
                log_name: log_name.clone(),
                log_id: LogId::of(&self.local_endpoint_id, log_name),
                local_log_handle,
            };
            let remote_sequence_nr = success
                .remote_info
                .log_sequence_nrs
                .get(log_name)
                .copied()
                .unwrap_or(0);
            let local_sequence_nr = local_info
                .log_sequence_nrs
                .get(log_name)
                .copied()
                .unwrap_or(0);
            links.push(RecoveryLink {
                link: ReplicationLink { source, target },
                remote_sequence_nr,
                local_sequence_nr,
            });
        }
        Ok(links)
    }

    /// Drives a replicator-like read/write loop per link until the target
    /// log has observed every sequence number up to the link's
    /// `remote_sequence_nr`, then invalidates snapshots the pull may have
    /// invalidated. No `Replicator` task exists yet for these links, so
    /// this loop is the only writer touching them while recovery runs.
    async fn recover_links(&self, links: &[RecoveryLink]) -> Result<usize, RecoveryStepError> {
        let mut invalidated_total = 0;
        for recovery_link in links {
            invalidated_total += self.recover_one_link(recovery_link).await?;
        }
        Ok(invalidated_total)
    }

    async fn recover_one_link(&self, recovery_link: &RecoveryLink) -> Result<usize, RecoveryStepError> {
        let link = &recovery_link.link;
        let log = &link.target.local_log_handle;
        let no_filter: Arc<dyn Filter> = Arc::new(NoFilter);

        // Walks the source log's own sequence-number space, the same space
        // `remote_sequence_nr` was captured in at step 2. `target_vt[source]`
        // is the wrong yardstick for this: it counts events *authored* by
        // the source endpoint, not events *appended to the source's log*,
        // and the two diverge as soon as that log also carries events the
        // source itself replicated in from a third endpoint. Starting from
        // 1 rather than the log's own stored replication progress is
        // deliberate too: that watermark can survive the very storage loss
        // recovery exists to repair, and a stale-high watermark would skip
        // straight past the events recovery is supposed to re-pull.
        let mut from_seq = 1u64;

        loop {
            let target_vt = log.vector_time().await;

            let read = ReplicationRead {
                from_seq,
                max_events: self.settings.write_batch_size,
                scan_limit: self.settings.remote_scan_limit,
                filter: no_filter.clone(),
                target_log_id: link.target.log_id,
                target_vt,
            };
            let envelope = ReplicationReadEnvelope {
                read,
                source_log_name: link.source.log_name.clone(),
                app_name: self.app_name.clone(),
                app_version: self.app_version.clone(),
            };

            let call = self
                .transport
                .replication_read(&link.source.peer_acceptor_address, envelope);
            let success = match tokio::time::timeout(self.settings.remote_read_timeout, call).await {
                Ok(Ok(success)) => success,
                Ok(Err(cause)) => {
                    warn!(%cause, log = %link.source.log_name, "recovery read failed, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                    continue;
                }
                Err(_elapsed) => {
                    warn!(log = %link.source.log_name, "recovery read timed out, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                    continue;
                }
            };

            let continue_flag = success.new_progress >= success.from_seq;
            let new_progress = success.new_progress;
            let source_vt = success.source_vt.clone();
            let write = log.replication_write(
                success.events,
                new_progress,
                link.source.log_id,
                success.source_vt,
                continue_flag,
            );
            match tokio::time::timeout(self.settings.write_timeout, write).await {
                Ok(Ok(_)) => {}
                Ok(Err(cause)) => {
                    warn!(%cause, log = %link.source.log_name, "recovery write failed, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                    continue;
                }
                Err(_elapsed) => {
                    warn!(log = %link.source.log_name, "recovery write timed out, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                    continue;
                }
            }

            from_seq = new_progress + 1;

            // Done once this link has scanned through the source's head at
            // recovery time and the target has actually absorbed everything
            // the source reported as of that scan. The first condition alone
            // is not enough in a genuine multi-master setting: scanning the
            // right range doesn't prove every causal predecessor landed.
            if new_progress >= recovery_link.remote_sequence_nr {
                let target_vt = log.vector_time().await;
                if source_vt.is_less_or_equal(&target_vt) {
                    break;
                }
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        let invalidated = log
            .invalidate_stale_snapshots()
            .await
            .map_err(|e| RecoveryStepError::RecoverLinks(e.to_string()))?;
        if invalidated > 0 {
            info!(invalidated, log = %link.target.log_name, "recovery: invalidated stale snapshots");
        }
        Ok(invalidated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_early_steps_are_safe_to_retry_blindly() {
        assert!(!RecoveryStepError::ReadLocalInfo("x".into()).partial_update());
        assert!(!RecoveryStepError::SynchronizeProgress("x".into()).partial_update());
        assert!(RecoveryStepError::RecoverLinks("x".into()).partial_update());
        assert!(RecoveryStepError::AdjustClocks("x".into()).partial_update());
    }
}
