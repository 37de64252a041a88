//! In-process replication bus.
//!
//! A single incoming channel fans out to subscribers with bounded buffers.
//! Publishing never waits on a slow subscriber: a subscriber whose buffer
//! is full at delivery time is dropped and its channel disconnected. The
//! bus streams live events only; historical catch-up is the secondary
//! agent's business.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// One replicated command, as framed on the wire: NDJSON with the raw
/// command object embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub collection: String,
    pub command: Box<RawValue>,
}

/// Buffered events per subscriber and for the incoming channel.
pub const BUS_BUFFER: usize = 1024;

struct Subscribers {
    channels: Mutex<HashMap<u64, Sender<Event>>>,
    next_id: AtomicU64,
}

pub struct Bus {
    incoming: Mutex<Option<Sender<Event>>>,
    subscribers: Arc<Subscribers>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps a subscription registered; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    subscribers: Arc<Subscribers>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.channels.lock().remove(&self.id);
    }
}

impl Bus {
    pub fn new() -> Self {
        let (incoming, events) = bounded::<Event>(BUS_BUFFER);
        let subscribers = Arc::new(Subscribers {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        let dispatch_to = Arc::clone(&subscribers);
        let dispatcher = std::thread::spawn(move || {
            Self::dispatch_loop(events, dispatch_to);
        });

        Self {
            incoming: Mutex::new(Some(incoming)),
            subscribers,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    fn dispatch_loop(events: Receiver<Event>, subscribers: Arc<Subscribers>) {
        for event in events.iter() {
            let mut drop_ids = Vec::new();
            {
                let channels = subscribers.channels.lock();
                for (id, channel) in channels.iter() {
                    match channel.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                            drop_ids.push(*id);
                        }
                    }
                }
            }
            if !drop_ids.is_empty() {
                let mut channels = subscribers.channels.lock();
                for id in drop_ids {
                    if channels.remove(&id).is_some() {
                        tracing::warn!(subscriber = id, "dropping slow replication subscriber");
                    }
                }
            }
        }

        // Incoming closed: disconnect everyone.
        subscribers.channels.lock().clear();
    }

    /// Publish a committed command for one collection. Empty commands are
    /// a no-op. Blocks only while the bus buffer itself is full.
    pub fn publish(&self, collection: &str, command: &[u8]) {
        if command.is_empty() {
            return;
        }
        let command = match RawValue::from_string(String::from_utf8_lossy(command).into_owned()) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(collection, error = %err, "dropping unencodable event");
                return;
            }
        };
        let event = Event {
            collection: collection.to_string(),
            command,
        };

        let incoming = self.incoming.lock();
        if let Some(sender) = incoming.as_ref() {
            let _ = sender.send(event);
        }
    }

    /// Register a subscriber with a bounded buffer. The receiver
    /// disconnects when the subscriber is dropped for falling behind or
    /// when the bus closes.
    pub fn subscribe(&self) -> (Receiver<Event>, Subscription) {
        let (sender, receiver) = bounded(BUS_BUFFER);
        let id = self.subscribers.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscribers.channels.lock().insert(id, sender);
        (
            receiver,
            Subscription {
                id,
                subscribers: Arc::clone(&self.subscribers),
            },
        )
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.channels.lock().len()
    }

    /// Close the incoming channel; the dispatcher drains what was already
    /// accepted, then disconnects every subscriber.
    pub fn close(&self) {
        self.incoming.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn publish_json(bus: &Bus, collection: &str, n: usize) {
        bus.publish(collection, format!("{{\"n\":{n}}}").as_bytes());
    }

    #[test]
    fn test_events_reach_subscriber_in_order() {
        let bus = Bus::new();
        let (events, _subscription) = bus.subscribe();

        for n in 0..10 {
            publish_json(&bus, "users", n);
        }

        for n in 0..10 {
            let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(event.collection, "users");
            assert_eq!(event.command.get(), format!("{{\"n\":{n}}}"));
        }
    }

    #[test]
    fn test_empty_command_is_noop() {
        let bus = Bus::new();
        let (events, _subscription) = bus.subscribe();
        bus.publish("users", b"");
        publish_json(&bus, "users", 1);

        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.command.get(), "{\"n\":1}");
    }

    #[test]
    fn test_slow_subscriber_is_dropped_not_waited_on() {
        let bus = Bus::new();
        let (fast, _fast_subscription) = bus.subscribe();
        let (slow, _slow_subscription) = bus.subscribe();

        // The fast subscriber reads everything; the slow one reads nothing.
        let reader = std::thread::spawn(move || {
            let mut received = 0usize;
            while fast.recv_timeout(Duration::from_secs(5)).is_ok() {
                received += 1;
            }
            received
        });

        for n in 0..2048 {
            publish_json(&bus, "users", n);
        }
        bus.close();

        let received = reader.join().unwrap();
        assert_eq!(received, 2048);

        // The slow subscriber was dropped once its buffer filled, and its
        // channel disconnected after draining the buffered prefix.
        assert_eq!(bus.subscriber_count(), 0);
        let mut drained = 0usize;
        while slow.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= BUS_BUFFER);
        assert!(slow.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let bus = Bus::new();
        let (_events, subscription) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(bus.subscriber_count(), 0);
        bus.close();
    }

    #[test]
    fn test_publish_after_close_is_noop() {
        let bus = Bus::new();
        bus.close();
        publish_json(&bus, "users", 1);
    }
}
