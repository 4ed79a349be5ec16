// Failure detector. One `tokio::spawn`ed task per
// `(source_endpoint_id, log_name)` owning an `mpsc` mailbox, event-driven
// (reschedule-on-signal) rather than a fixed `tokio::time::interval`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::events::EventPublisher;
use crate::model::{EndpointId, LogName};
use crate::wire::AvailabilityEvent;

/// Inputs the detector reacts to.
#[derive(Debug)]
enum DetectorMsg {
    AvailabilityDetected,
    FailureDetected(String),
    /// Internal: a previously scheduled timer fired, carrying the counter
    /// value it was armed with. Stale timers (armed counter != current
    /// counter) are dropped silently.
    TimerFired(u64),
}

/// Handle a `Replicator` holds to feed the detector for its link.
#[derive(Clone)]
pub struct FailureDetectorHandle {
    sender: mpsc::UnboundedSender<DetectorMsg>,
}

impl FailureDetectorHandle {
    pub fn availability_detected(&self) {
        let _ = self.sender.send(DetectorMsg::AvailabilityDetected);
    }

    pub fn failure_detected(&self, cause: impl std::fmt::Display) {
        let _ = self.sender.send(DetectorMsg::FailureDetected(cause.to_string()));
    }
}

struct DetectorState {
    counter: u64,
    causes: Vec<String>,
    last_available_at: Option<Instant>,
}

/// Spawns the detector task for `(source_endpoint_id, log_name)` and
/// returns a handle plus its `JoinHandle` for lifecycle management.
pub fn spawn(
    source_endpoint_id: EndpointId,
    log_name: LogName,
    failure_detection_limit: Duration,
    publisher: Arc<dyn EventPublisher>,
) -> (FailureDetectorHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<DetectorMsg>();
    let loop_sender = sender.clone();

    let join = tokio::spawn(async move {
        let mut state = DetectorState {
            counter: 0,
            causes: Vec::new(),
            last_available_at: None,
        };
        arm_timer(loop_sender.clone(), state.counter, failure_detection_limit);

        while let Some(msg) = receiver.recv().await {
            handle_message(
                msg,
                &mut state,
                &source_endpoint_id,
                &log_name,
                failure_detection_limit,
                &loop_sender,
                publisher.as_ref(),
            )
            .await;
        }
    });

    (FailureDetectorHandle { sender }, join)
}

fn arm_timer(sender: mpsc::UnboundedSender<DetectorMsg>, counter: u64, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = sender.send(DetectorMsg::TimerFired(counter));
    });
}

#[instrument(skip(state, publisher, sender), fields(source = %source_endpoint_id, log = %log_name))]
#[allow(clippy::too_many_arguments)]
async fn handle_message(
    msg: DetectorMsg,
    state: &mut DetectorState,
    source_endpoint_id: &EndpointId,
    log_name: &LogName,
    failure_detection_limit: Duration,
    sender: &mpsc::UnboundedSender<DetectorMsg>,
    publisher: &dyn EventPublisher,
) {
    match msg {
        DetectorMsg::AvailabilityDetected => {
            let now = Instant::now();
            let should_publish = match state.last_available_at {
                None => true,
                Some(last) => now.duration_since(last) >= failure_detection_limit,
            };
            if should_publish {
                publisher
                    .publish(AvailabilityEvent::Available {
                        endpoint_id: source_endpoint_id.clone(),
                        log_name: log_name.clone(),
                        observed_at: chrono::Utc::now().to_rfc3339(),
                    })
                    .await;
                state.last_available_at = Some(now);
            }
            state.counter += 1;
            state.causes.clear();
            arm_timer(sender.clone(), state.counter, failure_detection_limit);
        }
        DetectorMsg::FailureDetected(cause) => {
            state.causes.push(cause);
        }
        DetectorMsg::TimerFired(armed_counter) => {
            if armed_counter != state.counter {
                // Stale timer: a reset happened since this one was armed.
                return;
            }
            publisher
                .publish(AvailabilityEvent::Unavailable {
                    endpoint_id: source_endpoint_id.clone(),
                    log_name: log_name.clone(),
                    causes: std::mem::take(&mut state.causes),
                    observed_at: chrono::Utc::now().to_rfc3339(),
                })
                .await;
            state.counter += 1;
            arm_timer(sender.clone(), state.counter, failure_detection_limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventPublisher;

    fn id(s: &str) -> EndpointId {
        EndpointId::new(s).unwrap()
    }

    #[tokio::test]
    async fn publishes_unavailable_after_limit_elapses_with_no_availability() {
        let publisher = Arc::new(InMemoryEventPublisher::new(16));
        let mut subscriber = publisher.subscribe();
        let (handle, _join) = spawn(
            id("peer"),
            LogName::new("L").unwrap(),
            Duration::from_millis(50),
            publisher.clone(),
        );
        handle.failure_detected("boom");

        let event = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        match event {
            AvailabilityEvent::Unavailable { causes, .. } => {
                assert_eq!(causes, vec!["boom".to_string()]);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn availability_is_rate_limited_to_one_per_window() {
        let publisher = Arc::new(InMemoryEventPublisher::new(16));
        let mut subscriber = publisher.subscribe();
        let (handle, _join) = spawn(
            id("peer"),
            LogName::new("L").unwrap(),
            Duration::from_millis(200),
            publisher.clone(),
        );
        handle.availability_detected();
        let first = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, AvailabilityEvent::Available { .. }));

        // A second AvailabilityDetected immediately after should not emit
        // another Available within the same window.
        handle.availability_detected();
        let second = tokio::time::timeout(Duration::from_millis(100), subscriber.recv()).await;
        assert!(second.is_err(), "unexpected second Available within the rate-limit window");
    }
}
