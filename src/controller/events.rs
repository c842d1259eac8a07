//! Controller event bus.
//!
//! Subscribers get their own unbounded channel; delivery is lossless
//! per subscriber and never blocks the publisher. Dead subscribers are
//! dropped on the next publish.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::target::{AddressRange, MemoryType, TargetDescriptor, TargetState};

#[derive(Debug, Clone)]
pub enum Event {
    TargetStateChanged(TargetState),
    TargetReset,
    RegistersWritten,
    MemoryWritten {
        memory_type: MemoryType,
        range: AddressRange,
    },
    ProgrammingModeEnabled,
    ProgrammingModeDisabled,
    TargetControllerResumed {
        descriptor: Arc<TargetDescriptor>,
    },
    TargetControllerSuspended,
    TargetControllerErrorOccurred {
        message: String,
    },
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<Arc<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Arc<Event>> {
        let (sender, receiver) = channel();
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    pub fn publish(&self, event: Event) {
        log::debug!("Publishing event: {event:?}");
        let event = Arc::new(event);
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.send(Arc::clone(&event)).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fan_out_to_every_subscriber() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish(Event::TargetReset);

        assert!(matches!(*first.try_recv().unwrap(), Event::TargetReset));
        assert!(matches!(*second.try_recv().unwrap(), Event::TargetReset));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        let kept = bus.subscribe();

        bus.publish(Event::TargetReset);
        bus.publish(Event::RegistersWritten);

        assert_eq!(kept.try_iter().count(), 2);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
