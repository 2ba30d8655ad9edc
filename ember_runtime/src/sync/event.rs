//! One-shot event used by the stop-the-world countdown.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A resettable one-shot event.
///
/// The stop-the-world requester resets the event at the start of each
/// request and blocks on it; the last thread to park notifies it.
pub struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Mark the event set and wake all waiters.
    pub fn notify(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    /// Clear the event for reuse.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until the event is set.
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Block until the event is set or the timeout elapses.
    ///
    /// Returns true if the event was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if *set {
            return true;
        }
        self.cond.wait_for(&mut set, timeout);
        *set
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_event_starts_unset() {
        let event = Event::new();
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_event_notify_and_reset() {
        let event = Event::new();
        event.notify();
        assert!(event.is_set());
        assert!(event.wait_timeout(Duration::from_millis(1)));

        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_event_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        event.notify();
        waiter.join().unwrap();
    }
}
