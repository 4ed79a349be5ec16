// Transport contract. The wire transport itself is external; callers resolve
// an abstract `PeerAddress` to a concrete peer and fold request/response plus
// an explicit timeout into a single unified-failure call. This module
// defines only the request/response shape the core needs; an in-process
// test double lives in `testing.rs`.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::model::PeerAddress;
use crate::wire::{
    GetReplicationEndpointInfoSuccess, ReplicationReadEnvelope, ReplicationReadError,
    ReplicationReadSuccess, SynchronizeReplicationProgress, SynchronizeReplicationProgressSuccess,
};

/// One peer acceptor, reachable by address. A `Transport` resolves
/// `PeerAddress` to a concrete acceptor and folds request/response plus
/// timeout into a single call, so callers never see a bare future they'd
/// need to race against a timer themselves.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_replication_endpoint_info(
        &self,
        peer: &PeerAddress,
    ) -> Result<GetReplicationEndpointInfoSuccess, TransportError>;

    /// Issues a `ReplicationReadEnvelope` against `peer` and returns the
    /// unified success/failure the `Replicator`'s `Reading` state consumes.
    /// A transport-level timeout must be folded into
    /// `ReplicationReadError::Transport(TransportError::Timeout)` internally
    /// rather than propagated as a distinct error type.
    async fn replication_read(
        &self,
        peer: &PeerAddress,
        envelope: ReplicationReadEnvelope,
    ) -> Result<ReplicationReadSuccess, ReplicationReadError>;

    /// Recovery step 2's remote round trip.
    async fn synchronize_replication_progress(
        &self,
        peer: &PeerAddress,
        request: SynchronizeReplicationProgress,
    ) -> Result<SynchronizeReplicationProgressSuccess, TransportError>;
}
