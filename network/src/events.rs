// Link and address event delivery

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

/// Events reported by the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceEvent {
    /// PHY link came up
    LinkUp,
    /// PHY link went down; the interface is no longer ready
    LinkDown,
    /// An address was assigned (DHCP lease or static fast path)
    GotIpAddress,
}

impl fmt::Display for InterfaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceEvent::LinkUp => write!(f, "link up"),
            InterfaceEvent::LinkDown => write!(f, "link down"),
            InterfaceEvent::GotIpAddress => write!(f, "got IP address"),
        }
    }
}

/// Receiver of interface events
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: InterfaceEvent);
}

impl<F> Subscriber for F
where
    F: Fn(InterfaceEvent) + Send + Sync,
{
    fn on_event(&self, event: InterfaceEvent) {
        self(event)
    }
}

/// Ordered subscriber registry
///
/// Subscribers are called in registration order. There is no removal.
#[derive(Default)]
pub struct CallbackDispatcher {
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every subscriber
    ///
    /// The registry lock is not held while subscribers run, so a subscriber
    /// may register further subscribers; those see the next event.
    pub fn dispatch(&self, event: InterfaceEvent) {
        let snapshot: Vec<Arc<dyn Subscriber>> = self.subscribers.lock().clone();
        log::trace!("dispatching {} to {} subscribers", event, snapshot.len());
        for subscriber in snapshot {
            subscriber.on_event(event);
        }
    }
}
