// Crate-wide error types for the replication endpoint core.

use thiserror::Error;

use crate::filters::FilterError;
use crate::model::ModelError;

/// Top-level error returned by `Endpoint` operations and anything that rolls
/// up into them.
#[derive(Error, Debug)]
pub enum ReplicoreError {
    /// A lifecycle operation was attempted from a state that forbids it:
    /// double `activate`, `recover` with no connections, and so on. Never
    /// retryable by itself.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Disaster recovery failed partway through. `partial_update` tells the
    /// caller whether any replication write already happened, and therefore
    /// whether a blind retry risks writing causally-out-of-order events.
    #[error("recovery failed: {cause}")]
    Recovery {
        cause: String,
        partial_update: bool,
    },

    /// A `delete` request failed against the named local log.
    #[error("delete failed: {0}")]
    Delete(String),

    #[error("event log error: {0}")]
    Log(#[from] LogError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ReplicoreError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn recovery(cause: impl std::fmt::Display, partial_update: bool) -> Self {
        Self::Recovery {
            cause: cause.to_string(),
            partial_update,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicoreError>;

/// Errors surfaced by the external event-log collaborator contract
/// (`EventLog`). The log engine itself is out of scope; this enum only
/// names the failure shapes the core must react to.
#[derive(Error, Debug, Clone)]
pub enum LogError {
    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("sequence number {requested} not found (head is {head})")]
    SequenceNotFound { requested: u64, head: u64 },

    #[error("write rejected: {0}")]
    WriteRejected(String),

    #[error("delete rejected: {0}")]
    DeleteRejected(String),
}

/// Errors surfaced by the external transport collaborator contract.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("application version incompatible: {0}")]
    IncompatibleApplication(String),

    #[error("malformed peer address: {0}")]
    BadAddress(String),
}

/// Errors surfaced while parsing the flat key/value endpoint configuration.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("missing required key {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(
        "failure-detection-limit ({limit_ms}ms) must be >= remote-read-timeout + retry-delay ({min_ms}ms)"
    )]
    FailureDetectionLimitTooLow { limit_ms: u64, min_ms: u64 },
}
