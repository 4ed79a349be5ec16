// Wire protocol message schemas. The transport that carries these is out of
// scope; only their shape and semantics are specified here. `serde`-derived
// since any real transport will serialize them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ApplicationVersion;
use crate::error::{LogError, TransportError};
use crate::filters::Filter;
use crate::log::DurableEvent;
use crate::model::{EndpointId, LogId, LogName, ReplicationEndpointInfo};
use crate::vector_time::VectorTime;

#[derive(Debug, Clone)]
pub struct GetReplicationEndpointInfo;

#[derive(Debug, Clone)]
pub struct GetReplicationEndpointInfoSuccess {
    pub info: ReplicationEndpointInfo,
}

/// Recovery step 2 (§4.6): "to every remote, send a request carrying the
/// local info; the remote resets its stored target->source progress for
/// this endpoint, and replies with its current source-side heads."
#[derive(Debug, Clone)]
pub struct SynchronizeReplicationProgress {
    pub local_info: ReplicationEndpointInfo,
}

#[derive(Debug, Clone)]
pub struct SynchronizeReplicationProgressSuccess {
    pub remote_info: ReplicationEndpointInfo,
}

/// `ReplicationReadEnvelope{read, source_log_name, app_name, app_version}`:
/// what actually travels over the wire to a peer acceptor, carrying the
/// application-compatibility fields the acceptor gates on before even
/// looking at `read`.
#[derive(Debug, Clone)]
pub struct ReplicationReadEnvelope {
    pub read: ReplicationRead,
    pub source_log_name: LogName,
    pub app_name: String,
    pub app_version: ApplicationVersion,
}

/// `ReplicationRead{from_seq, max_events, scan_limit, filter, target_log_id,
/// replier, target_vt}`. `replier` is the abstract reply address; in this
/// crate that's simply "send the reply back over the same `Transport` call",
/// so it is not modeled as a field; the transport's request/response
/// exchange plays that role (§9 "ask+pipeTo" design note).
#[derive(Debug, Clone)]
pub struct ReplicationRead {
    pub from_seq: u64,
    pub max_events: usize,
    pub scan_limit: usize,
    pub filter: Arc<dyn Filter>,
    pub target_log_id: LogId,
    pub target_vt: VectorTime,
}

#[derive(Debug, Clone)]
pub struct ReplicationReadSuccess {
    pub events: Vec<Arc<dyn DurableEvent>>,
    pub from_seq: u64,
    pub new_progress: u64,
    pub target_log_id: LogId,
    pub source_vt: VectorTime,
}

#[derive(Debug, Clone)]
pub struct ReplicationReadFailure {
    pub cause: ReplicationReadError,
    pub target_log_id: LogId,
}

/// Unifies a reported remote failure and a synthesized timeout (§4.3
/// "Timeouts": "A timed-out remote read synthesizes a
/// `ReplicationReadFailure(ReplicationReadTimeout, target_log_id)`").
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationReadError {
    #[error("remote read timed out")]
    ReplicationReadTimeout,
    #[error("application incompatible: {0}")]
    Incompatible(String),
    #[error("acceptor is not serving reads (recovery in progress)")]
    NotServing,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Log(#[from] LogError),
}

#[derive(Debug, Clone)]
pub struct GetReplicationProgress {
    pub source_log_id: LogId,
}

#[derive(Debug, Clone)]
pub struct GetReplicationProgressSuccess {
    pub progress: u64,
    pub target_vt: VectorTime,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to fetch replication progress: {0}")]
pub struct GetReplicationProgressFailure(pub LogError);

#[derive(Debug, Clone)]
pub struct ReplicationWrite {
    pub events: Vec<Arc<dyn DurableEvent>>,
    pub progress: u64,
    pub source_log_id: LogId,
    pub source_vt: VectorTime,
    pub continue_flag: bool,
}

#[derive(Debug, Clone)]
pub struct ReplicationWriteSuccess {
    pub target_log_id: LogId,
    pub stored_progress: u64,
    pub source_log_id: LogId,
    pub target_vt: VectorTime,
    pub continue_flag: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("replication write failed: {0}")]
pub struct ReplicationWriteFailure(pub LogError);

#[derive(Debug, Clone)]
pub struct Delete {
    pub to_seq: u64,
    pub remote_log_ids: Vec<LogId>,
}

#[derive(Debug, Clone)]
pub struct DeleteSuccess {
    pub watermark: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("delete failed: {0}")]
pub struct DeleteFailure(pub LogError);

/// Published process-wide events (§6 "Published events"). `observed_at` is
/// the detector's local wall-clock time, not a causal timestamp; it has no
/// bearing on dedup or ordering, only on observability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AvailabilityEvent {
    Available {
        endpoint_id: EndpointId,
        log_name: LogName,
        observed_at: String,
    },
    Unavailable {
        endpoint_id: EndpointId,
        log_name: LogName,
        causes: Vec<String>,
        observed_at: String,
    },
}

/// Peer info as materialized for a `GetReplicationEndpointInfoSuccess`
/// reply, keyed by the log names a peer's logs carry. Kept separate from
/// `ReplicationEndpointInfo` only to document intent at call sites.
pub type LogHeads = HashMap<LogName, u64>;
