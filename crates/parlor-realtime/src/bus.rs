use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use parlor_types::events::RoomEvent;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The channel is gone for good; re-subscribe to recover.
    #[error("realtime channel closed")]
    Closed,

    /// The subscriber fell behind and `skipped` events were dropped.
    /// Consumers re-synchronize from the store instead of trusting the
    /// gap.
    #[error("subscriber lagged, skipped {0} events")]
    Lagged(u64),
}

/// Fans row-change notifications out to room-scoped subscribers — the
/// in-process stand-in for the hosted realtime service. Delivery is
/// at-least-once from the consumer's point of view and carries no
/// ordering guarantee relative to the store write that caused it;
/// consumers dedupe by message id and treat events as resync hints.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    broadcast_tx: broadcast::Sender<RoomEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(BusInner { broadcast_tx }),
        }
    }

    /// Raw firehose of every event. The presence tracker consumes this;
    /// room views go through `subscribe` instead.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Room-scoped subscription: message events for `room_id`, plus the
    /// global events every subscriber sees.
    pub fn subscribe(&self, room_id: &str) -> RoomSubscription {
        let mut raw = self.subscribe_raw();
        let (tx, rx) = mpsc::unbounded_channel();
        let room = room_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                match raw.recv().await {
                    Ok(event) => {
                        if let Some(scope) = event.room_id() {
                            if scope != room {
                                continue;
                            }
                        }
                        if tx.send(Ok(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("room {} subscriber lagged by {} events", room, n);
                        if tx.send(Err(SubscriptionError::Lagged(n))).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        RoomSubscription {
            room_id: room_id.to_string(),
            rx,
            task: Some(task),
        }
    }

    /// Publish to every matching subscriber. A send error only means
    /// nobody is listening right now.
    pub fn publish(&self, event: RoomEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Live broadcast receivers (room subscriptions + raw taps).
    pub fn receiver_count(&self) -> usize {
        self.inner.broadcast_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one room's event feed. Tears itself down on drop, so a
/// subscription scoped to a view cannot leak its forwarding task.
pub struct RoomSubscription {
    room_id: String,
    rx: mpsc::UnboundedReceiver<Result<RoomEvent, SubscriptionError>>,
    task: Option<JoinHandle<()>>,
}

impl RoomSubscription {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Next event for this room; `Closed` once torn down.
    pub async fn recv(&mut self) -> Result<RoomEvent, SubscriptionError> {
        if self.task.is_none() {
            return Err(SubscriptionError::Closed);
        }
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(SubscriptionError::Closed),
        }
    }

    /// Releases the subscription. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
