// Replicator: the per-link `Fetching -> Reading -> Writing -> Idle` state
// machine. One `tokio::spawn`ed task per `ReplicationLink`, mirroring a
// task-per-entity + `mpsc`-mailbox pattern (see
// `replication/monitor.rs::start_monitoring_tasks`), generalised from a
// fixed interval loop into a state machine with three distinct suspension
// points, each under its own timeout.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::config::{ApplicationVersion, ReplicationSettings};
use crate::failure_detector::FailureDetectorHandle;
use crate::filters::Filter;
use crate::log::{ReplicationReadOutcome, ReplicationWriteOutcome};
use crate::model::{LogId, ReplicationLink};
use crate::transport::Transport;
use crate::vector_time::VectorTime;
use crate::wire::{ReplicationRead, ReplicationReadEnvelope, ReplicationReadError};

/// Narrow capability a `Replicator` needs from the local `Acceptor`: fan a
/// just-completed write out as a `ReplicationDue` push to sibling
/// replicators sharing the same target log. Modeled as a trait rather than a
/// dependency on the concrete `Acceptor` type, to break the
/// Endpoint/Connector/Replicator reference cycle.
pub trait WriteNotifier: Send + Sync {
    fn notify_write_success(&self, target_log_id: LogId);
}

/// Handle used to push `ReplicationDue` into a running `Replicator`, from
/// the owning `Acceptor` (source push) or a sibling replicator.
#[derive(Clone)]
pub struct ReplicatorHandle {
    due: mpsc::UnboundedSender<()>,
}

impl ReplicatorHandle {
    pub fn replication_due(&self) {
        let _ = self.due.send(());
    }
}

enum State {
    Fetching,
    Reading { progress: u64, target_vt: VectorTime },
    Writing {
        outcome: ReplicationReadOutcome,
        continue_flag: bool,
    },
    Idle,
}

pub struct Replicator {
    link: ReplicationLink,
    transport: Arc<dyn Transport>,
    settings: Arc<ReplicationSettings>,
    requested_filter: Arc<dyn Filter>,
    detector: FailureDetectorHandle,
    write_notifier: Arc<dyn WriteNotifier>,
    app_name: String,
    app_version: ApplicationVersion,
    due_rx: mpsc::UnboundedReceiver<()>,
}

impl Replicator {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        link: ReplicationLink,
        transport: Arc<dyn Transport>,
        settings: Arc<ReplicationSettings>,
        requested_filter: Arc<dyn Filter>,
        detector: FailureDetectorHandle,
        write_notifier: Arc<dyn WriteNotifier>,
        app_name: String,
        app_version: ApplicationVersion,
    ) -> (ReplicatorHandle, JoinHandle<()>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let replicator = Replicator {
            link,
            transport,
            settings,
            requested_filter,
            detector,
            write_notifier,
            app_name,
            app_version,
            due_rx,
        };
        let join = tokio::spawn(replicator.run());
        (ReplicatorHandle { due: due_tx }, join)
    }

    #[instrument(skip(self), fields(
        source = %self.link.source.endpoint_id,
        log = %self.link.source.log_name,
    ))]
    async fn run(mut self) {
        let mut state = State::Fetching;
        loop {
            state = match state {
                State::Fetching => self.do_fetch().await,
                State::Reading { progress, target_vt } => self.do_read(progress, target_vt).await,
                State::Writing { outcome, continue_flag } => self.do_write(outcome, continue_flag).await,
                State::Idle => self.do_idle().await,
            };
        }
    }

    async fn do_fetch(&mut self) -> State {
        // Discard any ReplicationDue pushes queued while not Idle.
        self.drain_due();
        let log = &self.link.target.local_log_handle;
        let fetch = async {
            let progress = log
                .get_replication_progress(self.link.source.log_id)
                .await?;
            let target_vt = log.vector_time().await;
            Ok::<_, crate::error::LogError>((progress, target_vt))
        };
        match tokio::time::timeout(self.settings.read_timeout, fetch).await {
            Ok(Ok((progress, target_vt))) => State::Reading { progress, target_vt },
            Ok(Err(cause)) => {
                warn!(%cause, "failed to fetch replication progress");
                tokio::time::sleep(self.settings.retry_delay).await;
                State::Fetching
            }
            Err(_elapsed) => {
                warn!("timed out fetching replication progress");
                tokio::time::sleep(self.settings.retry_delay).await;
                State::Fetching
            }
        }
    }

    async fn do_read(&mut self, progress: u64, target_vt: VectorTime) -> State {
        let from_seq = progress + 1;
        let read = ReplicationRead {
            from_seq,
            max_events: self.settings.write_batch_size,
            scan_limit: self.settings.remote_scan_limit,
            filter: self.requested_filter.clone(),
            target_log_id: self.link.target.log_id,
            target_vt,
        };
        let envelope = ReplicationReadEnvelope {
            read,
            source_log_name: self.link.source.log_name.clone(),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
        };

        let call = self
            .transport
            .replication_read(&self.link.source.peer_acceptor_address, envelope);

        let outcome = match tokio::time::timeout(self.settings.remote_read_timeout, call).await {
            Ok(Ok(success)) => Ok(success),
            Ok(Err(cause)) => Err(cause),
            Err(_elapsed) => Err(ReplicationReadError::ReplicationReadTimeout),
        };

        match outcome {
            Ok(success) => {
                self.detector.availability_detected();
                let continue_flag = success.new_progress >= success.from_seq;
                State::Writing {
                    outcome: ReplicationReadOutcome {
                        events: success.events,
                        from_seq: success.from_seq,
                        new_progress: success.new_progress,
                        source_vt: success.source_vt,
                    },
                    continue_flag,
                }
            }
            Err(cause) => {
                self.detector.failure_detected(&cause);
                State::Idle
            }
        }
    }

    async fn do_write(&mut self, outcome: ReplicationReadOutcome, continue_flag: bool) -> State {
        let log = &self.link.target.local_log_handle;
        let write = log.replication_write(
            outcome.events,
            outcome.new_progress,
            self.link.source.log_id,
            outcome.source_vt,
            continue_flag,
        );

        match tokio::time::timeout(self.settings.write_timeout, write).await {
            Ok(Ok(ReplicationWriteOutcome {
                stored_progress: _,
                target_vt,
                continue_reading,
            })) => {
                self.write_notifier.notify_write_success(self.link.target.log_id);
                if continue_reading {
                    State::Reading {
                        progress: outcome.new_progress,
                        target_vt,
                    }
                } else {
                    State::Idle
                }
            }
            Ok(Err(cause)) => {
                warn!(%cause, "replication write failed");
                State::Idle
            }
            Err(_elapsed) => {
                warn!("replication write timed out");
                State::Idle
            }
        }
    }

    async fn do_idle(&mut self) -> State {
        self.drain_due();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.retry_delay) => {}
            _ = self.due_rx.recv() => {}
        }
        State::Fetching
    }

    /// Discards any `ReplicationDue` pushes queued while the replicator was
    /// not `Idle`; such a push must be ignored, not deferred.
    fn drain_due(&mut self) {
        while self.due_rx.try_recv().is_ok() {}
    }
}
