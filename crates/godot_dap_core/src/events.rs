use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::codec::Event;

/// Synthetic event published once when the connection goes away.
pub const CONNECTION_LOST_EVENT: &str = "godot_dap/connectionLost";

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Which of a subscription's two queues an event lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Control,
    Output,
}

impl EventClass {
    pub fn of(event: &str) -> Self {
        match event {
            "output" | "module" | "loadedSource" => Self::Output,
            name if name.starts_with("progress") => Self::Output,
            _ => Self::Control,
        }
    }
}

#[derive(Debug)]
enum ControlSender {
    Bounded(mpsc::Sender<Event>),
    Lossless(mpsc::UnboundedSender<Event>),
}

impl ControlSender {
    fn try_send(&self, event: Event) -> Result<(), TrySendError<Event>> {
        match self {
            Self::Bounded(tx) => tx.try_send(event),
            Self::Lossless(tx) => tx.send(event).map_err(|e| TrySendError::Closed(e.0)),
        }
    }
}

#[derive(Debug)]
enum ControlReceiver {
    Bounded(mpsc::Receiver<Event>),
    Lossless(mpsc::UnboundedReceiver<Event>),
}

impl ControlReceiver {
    async fn recv(&mut self) -> Option<Event> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Lossless(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<Event> {
        match self {
            Self::Bounded(rx) => rx.try_recv().ok(),
            Self::Lossless(rx) => rx.try_recv().ok(),
        }
    }
}

#[derive(Debug)]
struct SubscriberQueues {
    control: ControlSender,
    output: mpsc::Sender<Event>,
}

#[derive(Debug)]
struct BusInner {
    next_id: AtomicU64,
    capacity: usize,
    subscribers: Mutex<HashMap<u64, SubscriberQueues>>,
}

/// Best-effort fan-out of peer events. `publish` never waits on a
/// subscriber; a full queue drops the event for that subscriber only.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (control_tx, control_rx) = mpsc::channel(self.inner.capacity);
        self.register(
            ControlSender::Bounded(control_tx),
            ControlReceiver::Bounded(control_rx),
        )
    }

    /// Like `subscribe`, but control events are never dropped. Only the
    /// output queue is bounded. Meant for a consumer that drains promptly
    /// and cannot afford to miss a lifecycle event.
    pub fn subscribe_lossless(&self) -> EventSubscription {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.register(
            ControlSender::Lossless(control_tx),
            ControlReceiver::Lossless(control_rx),
        )
    }

    fn register(&self, control_tx: ControlSender, control_rx: ControlReceiver) -> EventSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (output_tx, output_rx) = mpsc::channel(self.inner.capacity);

        lock(&self.inner.subscribers).insert(
            id,
            SubscriberQueues {
                control: control_tx,
                output: output_tx,
            },
        );
        tracing::debug!("Event subscriber {id} registered");

        EventSubscription {
            id,
            control: control_rx,
            output: output_rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Returns how many subscribers accepted the event.
    pub fn publish(&self, event: Event) -> usize {
        let class = EventClass::of(&event.event);
        let mut subscribers = lock(&self.inner.subscribers);
        if subscribers.is_empty() {
            tracing::trace!("No subscribers for event '{}'", event.event);
            return 0;
        }

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, queues) in subscribers.iter() {
            let sent = match class {
                EventClass::Control => queues.control.try_send(event.clone()),
                EventClass::Output => queues.output.try_send(event.clone()),
            };
            match sent {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Event queue full for subscriber {id}, dropping '{}'",
                        event.event
                    );
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            subscribers.remove(&id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    control: ControlReceiver,
    output: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, control events first. `None` once the bus is gone and
    /// both queues are drained.
    pub async fn recv(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            Some(event) = self.control.recv() => Some(event),
            Some(event) = self.output.recv() => Some(event),
            else => None,
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.control
            .try_recv()
            .or_else(|| self.output.try_recv().ok())
    }

    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            lock(&bus.subscribers).remove(&self.id);
            tracing::debug!("Event subscriber {} removed", self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str) -> Event {
        Event::new(name, json!({}))
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(event("stopped")), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_that_subscriber() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        assert_eq!(bus.publish(event("stopped")), 2);
        assert_eq!(fast.recv().await.expect("event").event, "stopped");
        assert_eq!(bus.publish(event("continued")), 2);
        assert_eq!(fast.recv().await.expect("event").event, "continued");

        // slow now holds two events; the third is dropped for it alone
        assert_eq!(bus.publish(event("terminated")), 1);
        assert_eq!(fast.recv().await.expect("event").event, "terminated");

        assert_eq!(slow.recv().await.expect("event").event, "stopped");
        assert_eq!(slow.recv().await.expect("event").event, "continued");
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lossless_subscriber_keeps_every_control_event() {
        let bus = EventBus::new(4);
        let mut bounded = bus.subscribe();
        let mut lossless = bus.subscribe_lossless();

        for _ in 0..120 {
            bus.publish(event("thread"));
        }
        bus.publish(event("stopped"));
        for _ in 0..10 {
            bus.publish(event("output"));
        }

        let mut control = 0;
        let mut output = 0;
        let mut last_control = None;
        while let Some(ev) = lossless.try_recv() {
            if ev.event == "output" {
                output += 1;
            } else {
                control += 1;
                last_control = Some(ev.event);
            }
        }
        assert_eq!(control, 121);
        assert_eq!(last_control.as_deref(), Some("stopped"));
        // output stays bounded
        assert_eq!(output, 4);

        let mut kept = 0;
        while bounded.try_recv().is_some() {
            kept += 1;
        }
        assert_eq!(kept, 8);
    }

    #[tokio::test]
    async fn test_control_events_jump_ahead_of_output() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        bus.publish(event("output"));
        bus.publish(event("output"));
        bus.publish(event("stopped"));

        assert_eq!(sub.recv().await.expect("event").event, "stopped");
        assert_eq!(sub.recv().await.expect("event").event, "output");
        assert_eq!(sub.recv().await.expect("event").event, "output");
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        let other = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        other.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_ends_when_bus_is_gone() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        bus.publish(event("exited"));
        drop(bus);

        assert_eq!(sub.recv().await.expect("queued event").event, "exited");
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_event_classes() {
        assert_eq!(EventClass::of("output"), EventClass::Output);
        assert_eq!(EventClass::of("progressUpdate"), EventClass::Output);
        assert_eq!(EventClass::of("stopped"), EventClass::Control);
        assert_eq!(EventClass::of(CONNECTION_LOST_EVENT), EventClass::Control);
    }
}
