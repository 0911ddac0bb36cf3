use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

pub(crate) type Waiter = Box<dyn FnOnce() + Send>;

enum EventState {
    Pending { waiters: Vec<Waiter> },
    Complete,
}

struct EventInner {
    id: u64,
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Marks a point in a stream.
///
/// Other streams can wait on the event without blocking a host thread, the
/// host can block on it with `synchronize`.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new(id: u64) -> Self {
        Event {
            inner: Arc::new(EventInner {
                id,
                state: Mutex::new(EventState::Pending {
                    waiters: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.inner.state.lock(), EventState::Complete)
    }

    /// Block the current thread until the event completes.
    pub fn synchronize(&self) {
        let mut state = self.inner.state.lock();
        while !matches!(*state, EventState::Complete) {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Mark the event complete, running all registered waiters.
    pub(crate) fn complete(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, EventState::Complete) {
                EventState::Pending { waiters } => waiters,
                EventState::Complete => Vec::new(),
            }
        };
        self.inner.cond.notify_all();

        for waiter in waiters {
            waiter();
        }
    }

    /// Register a function to run once the event completes.
    ///
    /// Returns the waiter back if the event is already complete.
    pub(crate) fn add_waiter(&self, waiter: Waiter) -> Option<Waiter> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            EventState::Pending { waiters } => {
                waiters.push(waiter);
                None
            }
            EventState::Complete => Some(waiter),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn waiters_run_on_complete() {
        let event = Event::new(1);
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let ret = event.add_waiter(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(ret.is_none());
        assert_eq!(0, count.load(Ordering::SeqCst));

        event.complete();
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert!(event.is_complete());

        // Already complete, waiter is handed back.
        let ret = event.add_waiter(Box::new(|| {}));
        assert!(ret.is_some());
    }

    #[test]
    fn synchronize_from_other_thread() {
        let event = Event::new(2);
        let e = event.clone();
        let handle = std::thread::spawn(move || e.synchronize());

        event.complete();
        handle.join().unwrap();
    }
}
