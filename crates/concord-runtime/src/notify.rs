//! Change notification
//!
//! Every subscriber owns an unbounded channel. A subscriber whose receiver
//! has been dropped is pruned on the next publish; the pipeline never waits
//! on, or fails because of, a listener.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use concord_core::{ConcordError, EntityId, Operation};
use concord_state::StateSnapshot;

use crate::engine::ResolutionHandle;

/// Subscriber identifier
pub type SubscriberId = u64;

/// Events published by the engine
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// An operation took effect; `state` is the full state afterwards
    OperationApplied {
        operation: Operation,
        state: Arc<BTreeMap<EntityId, Value>>,
    },
    /// A conflict is waiting for manual resolution
    Conflict {
        operation: Operation,
        conflicts: Vec<Operation>,
        resolution: ResolutionHandle,
    },
    SnapshotLoaded {
        snapshot: Arc<StateSnapshot>,
    },
    /// An operation failed to apply or was dropped
    OperationFailed {
        operation: Operation,
        error: ConcordError,
    },
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: UnboundedReceiver<EngineEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event; `None` once unsubscribed or the engine is gone
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already waiting
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything currently buffered
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Fan-out of engine events to subscribers
#[derive(Default)]
pub struct ChangeNotifier {
    next_id: SubscriberId,
    subscribers: Vec<(SubscriberId, UnboundedSender<EngineEvent>)>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        ChangeNotifier::default()
    }

    pub fn subscribe(&mut self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, sender));
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver an event to every live subscriber. Returns the delivery count.
    pub fn publish(&mut self, event: &EngineEvent) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|(id, sender)| match sender.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                let error = ConcordError::Listener(format!("subscriber {id} hung up"));
                warn!(subscriber = id, %error, "dropping subscriber");
                false
            }
        });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ActorId, EntityType, OperationDraft, Timestamp, VectorClock};
    use serde_json::json;

    fn failed_event() -> EngineEvent {
        let actor = ActorId::from("a");
        let operation = OperationDraft::update(EntityType::Token, "t1", json!({}))
            .stamp(actor.clone(), VectorClock::new().incremented(&actor), Timestamp(1));
        EngineEvent::OperationFailed {
            error: ConcordError::NothingToUndo,
            operation,
        }
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let mut notifier = ChangeNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        assert_ne!(first.id(), second.id());

        assert_eq!(notifier.publish(&failed_event()), 2);
        assert!(first.try_recv().is_some());
        assert!(second.try_recv().is_some());
        assert!(first.try_recv().is_none());
    }

    #[test]
    fn test_closed_subscriber_is_pruned() {
        let mut notifier = ChangeNotifier::new();
        let dropped = notifier.subscribe();
        let mut kept = notifier.subscribe();
        drop(dropped);

        assert_eq!(notifier.publish(&failed_event()), 1);
        assert_eq!(notifier.len(), 1);
        assert_eq!(kept.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut notifier = ChangeNotifier::new();
        let sub = notifier.subscribe();
        assert!(notifier.unsubscribe(sub.id()));
        assert!(!notifier.unsubscribe(sub.id()));
        assert!(!notifier.has_subscribers());
    }
}
