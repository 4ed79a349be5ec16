// Connector: drives peer-info discovery for one remote
// connection and spawns one `Replicator` per common log once the peer's
// logs are known.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::{ApplicationVersion, ReplicationSettings};
use crate::events::EventPublisher;
use crate::failure_detector::{self};
use crate::log::LogHandle;
use crate::model::{
    EndpointId, LogId, LogName, PeerAddress, ReplicationConnection, ReplicationLink,
    ReplicationSource, ReplicationTarget,
};
use crate::replicator::{Replicator, ReplicatorHandle, WriteNotifier};
use crate::transport::Transport;

/// Narrow capability a `Connector` needs from the owning `Endpoint`/`Acceptor`
/// to register the replicators it spawns, so siblings sharing a target log
/// can be woken by a push notification. Breaks the
/// Endpoint/Connector/Replicator reference cycle.
pub trait ReplicatorRegistry: Send + Sync {
    fn register(&self, source_endpoint_id: EndpointId, log_id: LogId, handle: ReplicatorHandle);
}

pub struct ConnectorHandle {
    join: JoinHandle<()>,
}

impl ConnectorHandle {
    pub fn abort(&self) {
        self.join.abort();
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    local_endpoint_id: EndpointId,
    connection: ReplicationConnection,
    local_logs: HashMap<LogName, LogHandle>,
    transport: Arc<dyn Transport>,
    settings: Arc<ReplicationSettings>,
    registry: Arc<dyn ReplicatorRegistry>,
    write_notifier: Arc<dyn WriteNotifier>,
    publisher: Arc<dyn EventPublisher>,
    app_name: String,
    app_version: ApplicationVersion,
    preset_links: Option<Vec<ReplicationLink>>,
) -> ConnectorHandle {
    let join = tokio::spawn(run(
        local_endpoint_id,
        connection,
        local_logs,
        transport,
        settings,
        registry,
        write_notifier,
        publisher,
        app_name,
        app_version,
        preset_links,
    ));
    ConnectorHandle { join }
}

#[instrument(skip_all, fields(peer = %connection.peer_system_name))]
#[allow(clippy::too_many_arguments)]
async fn run(
    local_endpoint_id: EndpointId,
    connection: ReplicationConnection,
    local_logs: HashMap<LogName, LogHandle>,
    transport: Arc<dyn Transport>,
    settings: Arc<ReplicationSettings>,
    registry: Arc<dyn ReplicatorRegistry>,
    write_notifier: Arc<dyn WriteNotifier>,
    publisher: Arc<dyn EventPublisher>,
    app_name: String,
    app_version: ApplicationVersion,
    preset_links: Option<Vec<ReplicationLink>>,
) {
    let peer_address = connection.peer_address();

    let links = match preset_links {
        Some(links) => links,
        None => {
            discover_links(
                &local_endpoint_id,
                &connection,
                &local_logs,
                &transport,
                &settings,
                &peer_address,
            )
            .await
        }
    };

    info!(link_count = links.len(), "connector established, spawning replicators");

    for link in links {
        let log_name = link.source.log_name.clone();
        let source_endpoint_id = link.source.endpoint_id.clone();
        let requested_filter = connection
            .per_log_filters
            .get(&log_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(crate::filters::NoFilter));

        let (detector, _detector_join) = failure_detector::spawn(
            source_endpoint_id.clone(),
            log_name,
            settings.failure_detection_limit,
            publisher.clone(),
        );

        let target_log_id = link.target.log_id;
        let (handle, _replicator_join) = Replicator::spawn(
            link,
            transport.clone(),
            settings.clone(),
            requested_filter,
            detector,
            write_notifier.clone(),
            app_name.clone(),
            app_version.clone(),
        );
        registry.register(source_endpoint_id, target_log_id, handle);
    }
}

/// Schedules `GetReplicationEndpointInfo` at `retry_delay` starting at t=0
/// until the first success, then computes the common-log links. Once a
/// request succeeds, the loop returns without re-arming; any additional
/// success the peer might otherwise have produced is simply never asked
/// for, which is fine since discovery only needs one.
async fn discover_links(
    local_endpoint_id: &EndpointId,
    connection: &ReplicationConnection,
    local_logs: &HashMap<LogName, LogHandle>,
    transport: &Arc<dyn Transport>,
    settings: &Arc<ReplicationSettings>,
    peer_address: &PeerAddress,
) -> Vec<ReplicationLink> {
    loop {
        match transport.get_replication_endpoint_info(peer_address).await {
            Ok(success) => {
                let info = success.info;
                let local_names: HashSet<LogName> = local_logs.keys().cloned().collect();
                let peer_names = info.log_names();
                let common = local_names.intersection(&peer_names).cloned();

                let mut links = Vec::new();
                for log_name in common {
                    let source =
                        ReplicationSource::from_info(&info, log_name.clone(), peer_address.clone());
                    let local_log_handle = local_logs
                        .get(&log_name)
                        .expect("log name came from local_logs")
                        .clone();
                    let target = ReplicationTarget {
                        owning_endpoint: local_endpoint_id.clone(),
                        log_name: log_name.clone(),
                        log_id: LogId::of(local_endpoint_id, &log_name),
                        local_log_handle,
                    };
                    links.push(ReplicationLink { source, target });
                }
                return links;
            }
            Err(cause) => {
                warn!(%cause, "failed to fetch replication endpoint info, retrying");
                tokio::time::sleep(settings.retry_delay).await;
            }
        }
    }
}
