//! Multicast registry delivering [`Event`]s to subscribers.

use crate::event::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Receives events from a [`ListenerHub`].
///
/// Called on the manager's task; implementations must not block.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Handle returned by [`ListenerHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Entry = (SubscriptionId, Arc<dyn Listener>);

/// Ordered set of listeners.
///
/// Delivery iterates a snapshot taken when [`notify`](Self::notify) starts:
/// a listener subscribed during delivery misses the in-flight event, one
/// removed during delivery still receives it.
#[derive(Default)]
pub struct ListenerHub {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl ListenerHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        // Listeners run outside the lock, so a poisoned list is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, listener));
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn notify(&self, event: &Event) {
        let snapshot: Vec<Arc<dyn Listener>> =
            self.entries().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

/// Forwards events into an unbounded channel for async consumers.
///
/// Events are dropped silently once the receiver is gone.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Listener for ChannelListener {
    fn on_event(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DiscoveryState;
    use std::sync::OnceLock;

    fn state_event(new: DiscoveryState) -> Event {
        Event::DiscoveryStateChanged {
            old: DiscoveryState::NotReady,
            new,
        }
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let hub = ListenerHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            hub.subscribe(Arc::new(move |_: &Event| log.lock().unwrap().push(name)));
        }
        hub.notify(&state_event(DiscoveryState::Inactive));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = ListenerHub::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = hub.subscribe(Arc::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        hub.notify(&state_event(DiscoveryState::Inactive));
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.notify(&state_event(DiscoveryState::Scanning));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hub.is_empty());
    }

    #[test]
    fn test_listener_added_during_delivery_misses_event() {
        let hub = Arc::new(ListenerHub::new());
        let late_calls = Arc::new(AtomicU64::new(0));
        let added = Arc::new(OnceLock::new());

        let hub_ref = Arc::clone(&hub);
        let late = Arc::clone(&late_calls);
        let added_ref = Arc::clone(&added);
        hub.subscribe(Arc::new(move |_: &Event| {
            let late = Arc::clone(&late);
            added_ref.get_or_init(|| {
                hub_ref.subscribe(Arc::new(move |_: &Event| {
                    late.fetch_add(1, Ordering::SeqCst);
                }))
            });
        }));

        hub.notify(&state_event(DiscoveryState::Inactive));
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        assert_eq!(hub.len(), 2);

        hub.notify(&state_event(DiscoveryState::Scanning));
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removed_during_delivery_still_receives_event() {
        let hub = Arc::new(ListenerHub::new());
        let second_calls = Arc::new(AtomicU64::new(0));
        let second_id = Arc::new(OnceLock::new());

        let hub_ref = Arc::clone(&hub);
        let id_ref = Arc::clone(&second_id);
        hub.subscribe(Arc::new(move |_: &Event| {
            if let Some(id) = id_ref.get() {
                hub_ref.unsubscribe(*id);
            }
        }));
        let calls = Arc::clone(&second_calls);
        let id = hub.subscribe(Arc::new(move |_: &Event| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        second_id.set(id).unwrap();

        hub.notify(&state_event(DiscoveryState::Inactive));
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        hub.notify(&state_event(DiscoveryState::Scanning));
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let hub = ListenerHub::new();
        let (listener, mut rx) = ChannelListener::new();
        hub.subscribe(listener);

        hub.notify(&state_event(DiscoveryState::Inactive));
        assert_eq!(rx.recv().await, Some(state_event(DiscoveryState::Inactive)));

        drop(rx);
        hub.notify(&state_event(DiscoveryState::Scanning));
    }
}
