//! Typed publish/subscribe for simulation observers.
//!
//! The UI layers of the teaching tool watch the simulation through event
//! subscriptions. Handlers are plain closures; a panicking handler is
//! caught and logged so one misbehaving observer cannot take down the
//! simulation or starve the other subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// A list of subscribers for one event type.
///
/// Dispatch is synchronous and in subscription order. This is observation
/// only: handlers receive a shared reference to the payload and cannot call
/// back into the component that is emitting.
pub struct EventBus<E> {
    listeners: Vec<Box<dyn FnMut(&E)>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Register a handler. Handlers are never removed individually; the
    /// bus lives as long as its owning registry.
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&E) + 'static,
    {
        self.listeners.push(Box::new(handler));
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `event` to every subscriber. A panic in one handler is
    /// logged and the remaining handlers still run.
    pub fn emit(&mut self, event: &E) {
        for listener in &mut self.listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                log::error!("event subscriber panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let mut bus: EventBus<u32> = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..3u32 {
            let seen = Rc::clone(&seen);
            bus.subscribe(move |ev: &u32| seen.borrow_mut().push((tag, *ev)));
        }

        bus.emit(&7);
        bus.emit(&8);

        assert_eq!(
            *seen.borrow(),
            vec![(0, 7), (1, 7), (2, 7), (0, 8), (1, 8), (2, 8)]
        );
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let mut bus: EventBus<()> = EventBus::new();
        let seen = Rc::new(RefCell::new(0u32));

        bus.subscribe(|_| panic!("bad observer"));
        {
            let seen = Rc::clone(&seen);
            bus.subscribe(move |_| *seen.borrow_mut() += 1);
        }

        bus.emit(&());
        bus.emit(&());

        assert_eq!(*seen.borrow(), 2);
    }

    #[test]
    fn test_empty_bus_emit_is_noop() {
        let mut bus: EventBus<String> = EventBus::new();
        bus.emit(&"nobody listening".to_string());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
