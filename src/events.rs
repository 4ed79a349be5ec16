// Process-wide event bus abstraction: an injected event publisher in place
// of a global event stream singleton.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::wire::AvailabilityEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: AvailabilityEvent);
}

/// Ambient default publisher: a broadcast channel subscribers can tap for
/// `Available`/`Unavailable` notifications. This is the crate's own
/// observability surface, not a stand-in for an application-level event
/// stream a caller might already run.
pub struct InMemoryEventPublisher {
    sender: broadcast::Sender<AvailabilityEvent>,
}

impl InMemoryEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AvailabilityEvent> {
        self.sender.subscribe()
    }

    /// `subscribe()` wrapped as a `Stream`, for callers that compose with
    /// `futures`/`tokio_stream` combinators instead of polling `recv()`
    /// directly. A lagging subscriber sees `Err(BroadcastStreamRecvError::Lagged)`
    /// in place of the events it missed, same as the underlying channel.
    pub fn subscribe_stream(
        &self,
    ) -> impl tokio_stream::Stream<Item = Result<AvailabilityEvent, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.subscribe())
    }
}

impl Default for InMemoryEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: AvailabilityEvent) {
        // No subscribers is not an error: the bus is fire-and-forget.
        let _ = self.sender.send(event);
    }
}
