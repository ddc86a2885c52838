//! Minimal typed publish/subscribe.
//!
//! Subscribers are invoked synchronously in registration order; long
//! work belongs in a spawned task. Disposal clears the subscriber list.

use std::sync::Mutex;

type Subscriber<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A list of subscribers for one event type.
pub struct Emitter<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Emitter<T> {
    /// Create an emitter with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber. Subscribers cannot be removed
    /// individually; [`clear`](Self::clear) drops them all.
    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Box::new(f));
    }

    /// Invoke every subscriber, in registration order.
    ///
    /// Emits for one event source are serialized by its owner (a
    /// connection has a single reader task).
    pub fn emit(&self, value: &T) {
        // Snapshot outside the lock so subscribers may re-subscribe.
        let subscribers = std::mem::take(&mut *self.subscribers.lock().unwrap());
        for subscriber in &subscribers {
            subscriber(value);
        }
        let mut guard = self.subscribers.lock().unwrap();
        let added = std::mem::take(&mut *guard);
        *guard = subscribers;
        guard.extend(added);
    }

    /// Drop all subscribers.
    pub fn clear(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Whether no subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().unwrap().is_empty()
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscribers_fire_in_registration_order() {
        let emitter = Emitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            emitter.subscribe(move |_: &u32| order.lock().unwrap().push(tag));
        }

        emitter.emit(&1);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn emit_passes_the_value() {
        let emitter = Emitter::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        emitter.subscribe(move |v: &usize| seen2.store(*v, Ordering::SeqCst));
        emitter.emit(&42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn clear_drops_subscribers() {
        let emitter = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        emitter.subscribe(move |_: &()| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&());
        emitter.clear();
        emitter.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(emitter.is_empty());
    }

    #[test]
    fn subscribing_during_emit_does_not_deadlock() {
        let emitter = Arc::new(Emitter::new());
        let emitter2 = emitter.clone();
        emitter.subscribe(move |_: &()| {
            emitter2.subscribe(|_: &()| {});
        });
        emitter.emit(&());
        assert_eq!(emitter.len(), 2);
    }
}
