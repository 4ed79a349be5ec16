// Core data model: endpoint/log identity, replication connections, and the
// source/target/link triple a `Replicator` is built around.
//
// Newtype + validation style grounded on `ReplicaId` / `ReplicaAddress` in
// `replication/types.rs`.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filters::Filter;
use crate::log::LogHandle;

#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("invalid endpoint id '{0}': must be non-empty and contain no whitespace")]
    InvalidEndpointId(String),

    #[error("invalid log name '{0}': must be non-empty and contain no whitespace")]
    InvalidLogName(String),

    #[error(
        "log id collision: '{a_endpoint}/{a_log}' and '{b_endpoint}/{b_log}' both hash to {log_id}"
    )]
    LogIdCollision {
        log_id: LogId,
        a_endpoint: EndpointId,
        a_log: LogName,
        b_endpoint: EndpointId,
        b_log: LogName,
    },
}

/// Globally unique endpoint identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(ModelError::InvalidEndpointId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a log managed by an endpoint, unique within that endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogName(String);

impl LogName {
    pub fn new(name: impl Into<String>) -> Result<Self, ModelError> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ModelError::InvalidLogName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic, collision-free (in practice) function of `(endpoint_id,
/// log_name)`, required to be stable and collision-free across pairs; we
/// hash the pair with `DefaultHasher` seeded
/// by the pair itself (not process-randomized) so the same pair always
/// yields the same id across processes and restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId(u64);

impl LogId {
    pub fn of(endpoint_id: &EndpointId, log_name: &LogName) -> Self {
        let mut hasher = DefaultHasher::new();
        endpoint_id.hash(&mut hasher);
        log_name.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Detects Open Question (b): two distinct `(endpoint, log)` pairs that hash
/// to the same `LogId`. Called at `Endpoint` construction over the full set
/// of locally managed logs plus every log named by a connection's
/// `per_log_filters`; a collision is a construction-time hard failure, not a
/// silently-overwritten routing entry.
pub fn check_log_id_collisions(
    pairs: &[(EndpointId, LogName)],
) -> Result<(), ModelError> {
    let mut seen: HashMap<LogId, (EndpointId, LogName)> = HashMap::new();
    for (endpoint_id, log_name) in pairs {
        let log_id = LogId::of(endpoint_id, log_name);
        if let Some((seen_endpoint, seen_log)) = seen.get(&log_id) {
            if seen_endpoint != endpoint_id || seen_log != log_name {
                return Err(ModelError::LogIdCollision {
                    log_id,
                    a_endpoint: seen_endpoint.clone(),
                    a_log: seen_log.clone(),
                    b_endpoint: endpoint_id.clone(),
                    b_log: log_name.clone(),
                });
            }
        } else {
            seen.insert(log_id, (endpoint_id.clone(), log_name.clone()));
        }
    }
    Ok(())
}

/// Addressing record for one remote connection: `{host, port,
/// peer_system_name, per_log_filters}`.
#[derive(Debug, Clone)]
pub struct ReplicationConnection {
    pub host: String,
    pub port: u16,
    pub peer_system_name: String,
    pub per_log_filters: HashMap<LogName, Arc<dyn Filter>>,
}

impl ReplicationConnection {
    pub fn new(host: impl Into<String>, port: u16, peer_system_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            peer_system_name: peer_system_name.into(),
            per_log_filters: HashMap::new(),
        }
    }

    pub fn with_filter(mut self, log_name: LogName, filter: Arc<dyn Filter>) -> Self {
        self.per_log_filters.insert(log_name, filter);
        self
    }

    /// A link for `log_name` is filtered iff this connection supplies a
    /// non-trivial filter for it, used to prioritise unfiltered links during
    /// recovery.
    pub fn is_filtered(&self, log_name: &LogName) -> bool {
        self.per_log_filters
            .get(log_name)
            .map(|f| !f.is_no_filter())
            .unwrap_or(false)
    }

    pub fn peer_address(&self) -> PeerAddress {
        PeerAddress {
            protocol: "repl".to_string(),
            system_name: self.peer_system_name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// `"<protocol>://<system_name>@<host>:<port>/user/acceptor"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub protocol: String,
    pub system_name: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}/user/acceptor",
            self.protocol, self.system_name, self.host, self.port
        )
    }
}

#[derive(Error, Debug)]
pub enum PeerAddressError {
    #[error("malformed peer address '{0}'")]
    Malformed(String),
}

impl std::str::FromStr for PeerAddress {
    type Err = PeerAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = s
            .split_once("://")
            .ok_or_else(|| PeerAddressError::Malformed(s.to_string()))?;
        let (system_name, rest) = rest
            .split_once('@')
            .ok_or_else(|| PeerAddressError::Malformed(s.to_string()))?;
        let (host_port, _path) = rest
            .split_once('/')
            .ok_or_else(|| PeerAddressError::Malformed(s.to_string()))?;
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| PeerAddressError::Malformed(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| PeerAddressError::Malformed(s.to_string()))?;
        Ok(PeerAddress {
            protocol: protocol.to_string(),
            system_name: system_name.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// What a peer publishes to describe the heads of its logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEndpointInfo {
    pub endpoint_id: EndpointId,
    pub log_sequence_nrs: HashMap<LogName, u64>,
}

impl ReplicationEndpointInfo {
    pub fn log_names(&self) -> HashSet<LogName> {
        self.log_sequence_nrs.keys().cloned().collect()
    }
}

/// `{endpoint_id, log_name, log_id, peer_acceptor_address}`.
#[derive(Debug, Clone)]
pub struct ReplicationSource {
    pub endpoint_id: EndpointId,
    pub log_name: LogName,
    pub log_id: LogId,
    pub peer_acceptor_address: PeerAddress,
}

impl ReplicationSource {
    pub fn from_info(info: &ReplicationEndpointInfo, log_name: LogName, peer_acceptor_address: PeerAddress) -> Self {
        let log_id = LogId::of(&info.endpoint_id, &log_name);
        Self {
            endpoint_id: info.endpoint_id.clone(),
            log_name,
            log_id,
            peer_acceptor_address,
        }
    }
}

/// `{owning_endpoint, log_name, log_id, local_log_handle}`. `local_log_handle`
/// is a `dyn EventLog` handle since the log engine is an external
/// collaborator the endpoint resolves at construction time.
#[derive(Clone, Debug)]
pub struct ReplicationTarget {
    pub owning_endpoint: EndpointId,
    pub log_name: LogName,
    pub log_id: LogId,
    pub local_log_handle: LogHandle,
}

/// Unidirectional `{source, target}` pair owned by one `Replicator`.
#[derive(Clone, Debug)]
pub struct ReplicationLink {
    pub source: ReplicationSource,
    pub target: ReplicationTarget,
}

/// A link carrying the peer's head-at-recovery-time and the local
/// head-at-recovery-time, captured by `synchronize_replication_progresses_with_remote`.
#[derive(Clone, Debug)]
pub struct RecoveryLink {
    pub link: ReplicationLink,
    pub remote_sequence_nr: u64,
    pub local_sequence_nr: u64,
}
