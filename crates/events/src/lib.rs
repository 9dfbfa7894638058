//! Lifecycle and health event bus for local networks.
//!
//! Every subscriber gets its own unbounded queue, so a slow observer never
//! causes events to be dropped. Events published before a subscription was
//! taken are not replayed; re-subscribing starts a fresh sequence.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use localnet_topology::{HealthStatus, InstanceId, InstanceState, NodeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A node process was spawned.
    Started {
        /// OS process id.
        pid: u32,
    },

    /// Spawning a node failed for good.
    SpawnFailed {
        /// Rendered error.
        error: String,
    },

    /// A node process was stopped on request.
    Stopped {
        /// Whether SIGKILL was needed.
        forced: bool,
    },

    /// A node process was stopped and spawned again.
    Restarted {
        /// New OS process id.
        pid: u32,
        /// Restarts so far.
        restarts: u32,
    },

    /// A node process exited without being asked to.
    Exited {
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
    },

    /// A process left over from an earlier session was taken over.
    Adopted {
        /// OS process id.
        pid: u32,
    },

    /// A recorded process was dead or no longer ran the node's command.
    Stale {
        /// Recorded OS process id.
        pid: u32,
    },

    /// A node's health status changed.
    HealthChanged {
        /// Previous status.
        from: HealthStatus,
        /// New status.
        to: HealthStatus,
    },

    /// The instance moved to a new lifecycle state.
    InstanceStateChanged {
        /// Previous state.
        from: InstanceState,
        /// New state.
        to: InstanceState,
    },
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Bus-wide sequence number, strictly increasing in publish order.
    pub seq: u64,

    /// When the event was published.
    pub at: DateTime<Utc>,

    /// Instance the event belongs to.
    pub instance: InstanceId,

    /// Node the event belongs to, if any.
    pub node: Option<NodeId>,

    /// Payload.
    pub kind: EventKind,
}

impl Event {
    /// Creates an instance-level event. Sequence number and timestamp are
    /// assigned on publish.
    #[must_use]
    pub fn new(instance: InstanceId, kind: EventKind) -> Self {
        Self {
            seq: 0,
            at: Utc::now(),
            instance,
            node: None,
            kind,
        }
    }

    /// Creates a node-level event.
    #[must_use]
    pub fn for_node(instance: InstanceId, node: NodeId, kind: EventKind) -> Self {
        Self {
            node: Some(node),
            ..Self::new(instance, kind)
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    closed: bool,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

/// Fan-out bus delivering every published event to every live subscriber.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates an open bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event and returns its sequence number.
    ///
    /// Publishing on a closed bus is a no-op returning `None`.
    pub fn publish(&self, mut event: Event) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }

        // Assigned under the lock so every subscriber sees sequence order.
        event.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        event.at = Utc::now();
        trace!(seq = event.seq, instance = %event.instance, "publishing {:?}", event.kind);

        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());

        Some(event.seq)
    }

    /// Subscribes to every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.subscribers.push(tx);
        }

        Subscription {
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    /// Subscribes to the events of one instance.
    pub fn subscribe_instance(&self, instance: InstanceId) -> impl Stream<Item = Event> + use<> {
        self.subscribe()
            .filter(move |event| event.instance == instance)
    }

    /// Closes the bus; every subscription ends once drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    /// Whether [`Self::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Stream of events for one subscriber.
#[derive(Debug)]
pub struct Subscription {
    stream: UnboundedReceiverStream<Event>,
}

impl Subscription {
    /// Receives the next event, or `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.stream.next().await
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceId {
        InstanceId::new("dev").unwrap()
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::new(
            instance(),
            EventKind::InstanceStateChanged {
                from: InstanceState::Unprovisioned,
                to: InstanceState::Starting,
            },
        ));

        assert_eq!(a.recv().await.unwrap().seq, 1);
        assert_eq!(b.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_per_node_order_preserved() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let node = NodeId::new("validator-0");

        for pid in 1..=100 {
            bus.publish(Event::for_node(
                instance(),
                node.clone(),
                EventKind::Started { pid },
            ));
        }
        bus.close();

        let mut pids = Vec::new();
        while let Some(event) = sub.recv().await {
            if let EventKind::Started { pid } = event.kind {
                pids.push(pid);
            }
        }

        assert_eq!(pids, (1..=100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.close();

        assert!(sub.recv().await.is_none());
        assert!(bus.publish(Event::new(instance(), EventKind::Stopped { forced: false })).is_none());
        assert!(bus.subscribe().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(Event::new(instance(), EventKind::Stopped { forced: false }));

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_instance_filter() {
        let bus = EventBus::new();
        let mut sub = Box::pin(bus.subscribe_instance(instance()));

        bus.publish(Event::new(
            InstanceId::new("other").unwrap(),
            EventKind::Stopped { forced: false },
        ));
        bus.publish(Event::new(instance(), EventKind::Stopped { forced: true }));

        let event = sub.next().await.unwrap();
        assert_eq!(event.instance, instance());
        assert_eq!(event.kind, EventKind::Stopped { forced: true });
    }
}
