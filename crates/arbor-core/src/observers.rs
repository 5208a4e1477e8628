//! Observer registration and fan-out.
//!
//! [`Observers`] hands out stable `i64` handles and dispatches against a
//! snapshot of the subscriber list, so observers can add or remove observers
//! from inside a callback without deadlocking. A panicking subscriber is
//! logged and skipped; it never poisons the dispatch loop or its peers.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::diff::CacheObserver;
use crate::entry::{Entry, EntryError};

pub struct Observers<O: ?Sized> {
    state: Mutex<ObserverList<O>>,
}

struct ObserverList<O: ?Sized> {
    next_handle: i64,
    entries: Vec<(i64, Arc<O>)>,
}

impl<O: ?Sized> Default for Observers<O> {
    fn default() -> Self {
        Observers {
            state: Mutex::new(ObserverList {
                next_handle: 0,
                entries: Vec::new(),
            }),
        }
    }
}

impl<O: ?Sized> Observers<O> {
    pub fn new() -> Observers<O> {
        Observers::default()
    }

    pub fn add(&self, observer: Arc<O>) -> i64 {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.entries.push((handle, observer));
        handle
    }

    /// Removes the observer registered under `handle`. Unknown handles are
    /// ignored.
    pub fn remove(&self, handle: i64) -> bool {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|(h, _)| *h != handle);
        state.entries.len() != before
    }

    /// The current subscribers, in registration order. Dispatch against this
    /// snapshot rather than under the lock.
    pub fn snapshot(&self) -> Vec<Arc<O>> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect()
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}

/// Runs one observer callback, capturing panics so a bad subscriber cannot
/// take down the dispatching thread.
pub fn run_isolated(callback: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            target = "arbor.core",
            callback,
            panic = %panic_message(&*panic),
            "observer panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Simplified subscriber for callers that do not care which kind of change
/// occurred: every create/update/delete collapses to `on_next` with the
/// current entry.
pub trait EntryObserver<T>: Send + Sync {
    fn on_next(&self, entry: &Entry<T>);
    fn on_error(&self, _error: &EntryError) {}
}

struct EntryObserverAdapter<T>(Arc<dyn EntryObserver<T>>);

impl<T> CacheObserver<T> for EntryObserverAdapter<T> {
    fn on_create(&self, entry: &Entry<T>) {
        self.0.on_next(entry);
    }

    fn on_update(&self, _previous: &Entry<T>, current: &Entry<T>) {
        self.0.on_next(current);
    }

    fn on_delete(&self, entry: &Entry<T>) {
        self.0.on_next(entry);
    }

    fn on_error(&self, error: &EntryError) {
        self.0.on_error(error);
    }
}

/// Fan-out for [`CacheObserver`]s with per-subscriber panic isolation. Itself
/// a `CacheObserver`, so a [`Diff`](crate::Diff) can be replayed straight
/// into it.
pub struct CacheObservers<T> {
    observers: Observers<dyn CacheObserver<T>>,
}

impl<T> Default for CacheObservers<T> {
    fn default() -> Self {
        CacheObservers {
            observers: Observers::new(),
        }
    }
}

impl<T: 'static> CacheObservers<T> {
    pub fn new() -> CacheObservers<T> {
        CacheObservers::default()
    }

    pub fn add(&self, observer: Arc<dyn CacheObserver<T>>) -> i64 {
        self.observers.add(observer)
    }

    pub fn add_entry_observer(&self, observer: Arc<dyn EntryObserver<T>>) -> i64 {
        self.observers.add(Arc::new(EntryObserverAdapter(observer)))
    }

    pub fn remove(&self, handle: i64) -> bool {
        self.observers.remove(handle)
    }

    pub fn clear(&self) {
        self.observers.clear();
    }
}

impl<T> CacheObserver<T> for CacheObservers<T> {
    fn on_create(&self, entry: &Entry<T>) {
        for observer in self.observers.snapshot() {
            run_isolated("on_create", || observer.on_create(entry));
        }
    }

    fn on_update(&self, previous: &Entry<T>, current: &Entry<T>) {
        for observer in self.observers.snapshot() {
            run_isolated("on_update", || observer.on_update(previous, current));
        }
    }

    fn on_delete(&self, entry: &Entry<T>) {
        for observer in self.observers.snapshot() {
            run_isolated("on_delete", || observer.on_delete(entry));
        }
    }

    fn on_error(&self, error: &EntryError) {
        for observer in self.observers.snapshot() {
            run_isolated("on_error", || observer.on_error(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::path::TypedPath;

    struct Counting(AtomicUsize);

    impl CacheObserver<u32> for Counting {
        fn on_create(&self, _entry: &Entry<u32>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn on_update(&self, _previous: &Entry<u32>, _current: &Entry<u32>) {}

        fn on_delete(&self, _entry: &Entry<u32>) {}
    }

    struct Panicking;

    impl CacheObserver<u32> for Panicking {
        fn on_create(&self, _entry: &Entry<u32>) {
            panic!("subscriber bug");
        }

        fn on_update(&self, _previous: &Entry<u32>, _current: &Entry<u32>) {}

        fn on_delete(&self, _entry: &Entry<u32>) {}
    }

    fn sample() -> Entry<u32> {
        Entry::resolved(TypedPath::nonexistent("/r/a"), 1)
    }

    #[test]
    fn removed_handles_stop_receiving() {
        let observers = CacheObservers::new();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let handle = observers.add(counting.clone());

        observers.on_create(&sample());
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        assert!(observers.remove(handle));
        assert!(!observers.remove(handle));
        observers.on_create(&sample());
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_observer_does_not_starve_the_rest() {
        let observers = CacheObservers::new();
        observers.add(Arc::new(Panicking));
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        observers.add(counting.clone());

        observers.on_create(&sample());
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entry_observer_sees_all_change_kinds() {
        struct Next(AtomicUsize);
        impl EntryObserver<u32> for Next {
            fn on_next(&self, _entry: &Entry<u32>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let observers = CacheObservers::new();
        let next = Arc::new(Next(AtomicUsize::new(0)));
        observers.add_entry_observer(next.clone());

        observers.on_create(&sample());
        observers.on_update(&sample(), &sample());
        observers.on_delete(&sample());
        assert_eq!(next.0.load(Ordering::SeqCst), 3);
    }
}
