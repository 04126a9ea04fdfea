use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use super::connection::ConnectionState;
use super::models::Purchase;
use super::response::ResponseCode;

/// Caller-facing notifications emitted by the engine worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BillingEvent {
    /// A purchase is pending (in progress) or has been delivered.
    PurchaseUpdated {
        code: ResponseCode,
        purchase: Purchase,
    },
    PurchaseConsumed {
        code: ResponseCode,
        purchase_token: String,
    },
    PurchaseError {
        code: ResponseCode,
    },
    ConnectionChanged {
        state: ConnectionState,
    },
}

/// Broadcast fan-out owned by the worker. Emission is best-effort.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<BillingEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> BillingSubscription {
        BillingSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn emit(&self, event: BillingEvent) {
        let _ = self.sender.send(event);
    }
}

/// key: billing-event-subscription -> explicit subscribe/unsubscribe
///
/// Obtained from `BillingEngine::subscribe`. Dropping it, or calling
/// [`BillingSubscription::unsubscribe`], detaches the subscriber.
#[derive(Debug)]
pub struct BillingSubscription {
    receiver: broadcast::Receiver<BillingEvent>,
}

impl BillingSubscription {
    /// Next event, skipping over any the subscriber lagged behind on.
    /// Returns `None` once the engine has shut down.
    pub async fn recv(&mut self) -> Option<BillingEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "billing event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`BillingSubscription::recv`].
    pub fn try_recv(&mut self) -> Option<BillingEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "billing event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = BillingEvent> {
        BroadcastStream::new(self.receiver).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "billing event stream lagged");
                None
            }
        })
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(BillingEvent::PurchaseError {
            code: ResponseCode::UserCanceled,
        });

        assert_eq!(a.recv().await, b.recv().await);
    }

    #[tokio::test]
    async fn unsubscribed_receivers_get_nothing() {
        let bus = EventBus::new(8);
        let a = bus.subscribe();
        a.unsubscribe();
        let mut b = bus.subscribe();

        bus.emit(BillingEvent::ConnectionChanged {
            state: ConnectionState::Connected,
        });
        assert!(b.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = EventBus::new(8);
        let subscription = bus.subscribe();
        bus.emit(BillingEvent::PurchaseError {
            code: ResponseCode::Error,
        });
        drop(bus);

        let events: Vec<BillingEvent> = subscription.into_stream().collect().await;
        assert_eq!(events.len(), 1);
    }
}
