//! Per-subscriber event fan-out
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a
//! subscriber whose queue is full is disconnected and its stream ends with
//! [`StreamEnd::Overflowed`] once the events queued before the overflow have
//! been read. A live subscriber therefore never sees a gap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use super::event::LinkEvent;

/// Why an [`EventStream`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamEnd {
    /// The link manager shut down
    #[error("event stream closed")]
    Closed,
    /// The subscriber fell behind and was disconnected
    #[error("subscriber fell behind and was disconnected")]
    Overflowed,
}

struct Subscriber {
    tx: mpsc::Sender<LinkEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Subscribers {
    list: Vec<Subscriber>,
    closed: bool,
}

/// Ordered fan-out of [`LinkEvent`]s
///
/// Clones share the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    capacity: usize,
}

impl EventBus {
    /// Bus whose subscribers may fall `capacity` events behind
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            capacity: capacity.max(1),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive every event published from now on
    ///
    /// After [`close`](Self::close) the returned stream is already ended.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut subscribers = self.subscribers();
        if !subscribers.closed {
            subscribers.list.push(Subscriber {
                tx,
                overflowed: overflowed.clone(),
            });
        }

        EventStream { rx, overflowed }
    }

    /// Deliver `event` to every subscriber without waiting
    pub fn publish(&self, event: LinkEvent) {
        let mut subscribers = self.subscribers();
        subscribers.list.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.overflowed.store(true, Ordering::SeqCst);
                warn!("Event subscriber fell {} events behind, disconnecting it", self.capacity);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// End every stream; later subscribers get an ended stream
    pub fn close(&self) {
        let mut subscribers = self.subscribers();
        subscribers.closed = true;
        subscribers.list.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().list.len()
    }
}

/// Receiving end of one subscription
pub struct EventStream {
    rx: mpsc::Receiver<LinkEvent>,
    overflowed: Arc<AtomicBool>,
}

impl EventStream {
    /// Next event, in publish order
    pub async fn recv(&mut self) -> Result<LinkEvent, StreamEnd> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => Err(self.end()),
        }
    }

    /// Next event if one is queued
    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        self.rx.try_recv().ok()
    }

    fn end(&self) -> StreamEnd {
        if self.overflowed.load(Ordering::SeqCst) {
            StreamEnd::Overflowed
        } else {
            StreamEnd::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::state::LinkState;

    fn message(n: usize) -> LinkEvent {
        LinkEvent::MessageReceived(format!("msg{}", n))
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(LinkEvent::StateChanged(LinkState::Scanning));
        bus.publish(message(1));

        for stream in [&mut first, &mut second] {
            assert_eq!(
                stream.recv().await.unwrap(),
                LinkEvent::StateChanged(LinkState::Scanning)
            );
            assert_eq!(stream.recv().await.unwrap(), message(1));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_disconnected_without_gaps() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for n in 0..10 {
            bus.publish(message(n));
            if let Some(event) = fast.try_recv() {
                assert_eq!(event, message(n));
            }
        }
        assert_eq!(bus.subscriber_count(), 1);

        // Everything queued before the overflow, in order, then the end marker
        for n in 0..4 {
            assert_eq!(slow.recv().await.unwrap(), message(n));
        }
        assert_eq!(slow.recv().await, Err(StreamEnd::Overflowed));
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();
        bus.publish(message(0));
        bus.close();

        assert_eq!(stream.recv().await.unwrap(), message(0));
        assert_eq!(stream.recv().await, Err(StreamEnd::Closed));

        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, Err(StreamEnd::Closed));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_stream_is_pruned() {
        let bus = EventBus::new(4);
        drop(bus.subscribe());
        bus.publish(message(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(1);
        bus.publish(message(0));
    }
}
