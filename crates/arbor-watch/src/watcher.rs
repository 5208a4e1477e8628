//! The watcher backend seam.
//!
//! [`PathWatcher`] is what the repository builds on: something that can be
//! told which paths matter and that pushes [`Event`]s to observers from its
//! own thread. Production code uses [`NotifyPathWatcher`] or
//! [`PollingPathWatcher`]; tests use [`ManualPathWatcher`] and inject events
//! directly, so nothing in the test suite depends on OS watcher timing.
//!
//! [`NotifyPathWatcher`]: crate::NotifyPathWatcher
//! [`PollingPathWatcher`]: crate::PollingPathWatcher

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_core::observers::{run_isolated, Observers};
use parking_lot::Mutex;

use crate::error::WatchError;
use crate::event::Event;

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
    fn on_error(&self, _error: &WatchError) {}
}

struct FnEventObserver<F>(F);

impl<F> EventObserver for FnEventObserver<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        (self.0)(event);
    }
}

/// Wraps a closure as an [`EventObserver`] that ignores errors.
pub fn event_observer<F>(f: F) -> Arc<dyn EventObserver>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(FnEventObserver(f))
}

pub trait PathWatcher: Send + Sync {
    /// Starts watching `path` to `max_depth` levels below it.
    ///
    /// Idempotent: re-registering an already-watched path succeeds and
    /// returns `false` unless the depth was widened. Registering a path that
    /// does not exist yet is allowed; backends watch the nearest existing
    /// ancestor until it appears.
    fn register(&self, path: &Path, max_depth: i32) -> Result<bool, WatchError>;

    /// Stops watching `path`. Unknown paths are ignored.
    fn unregister(&self, path: &Path);

    fn add_observer(&self, observer: Arc<dyn EventObserver>) -> i64;

    fn remove_observer(&self, handle: i64) -> bool;

    /// Releases watches and background threads. Idempotent; `register` after
    /// close fails with [`WatchError::Closed`].
    fn close(&self);
}

#[derive(Default)]
struct ManualState {
    registered: BTreeMap<PathBuf, i32>,
    register_calls: Vec<(PathBuf, i32)>,
    unregister_calls: Vec<PathBuf>,
}

/// Deterministic in-memory watcher for tests.
///
/// Records registration traffic and delivers exactly the events the test
/// injects via [`emit`](ManualPathWatcher::emit), synchronously on the
/// calling thread.
#[derive(Default)]
pub struct ManualPathWatcher {
    observers: Observers<dyn EventObserver>,
    state: Mutex<ManualState>,
    closed: AtomicBool,
}

impl ManualPathWatcher {
    pub fn new() -> Arc<ManualPathWatcher> {
        Arc::new(ManualPathWatcher::default())
    }

    /// Delivers `event` to every observer on the calling thread.
    pub fn emit(&self, event: Event) {
        for observer in self.observers.snapshot() {
            run_isolated("on_event", || observer.on_event(&event));
        }
    }

    pub fn emit_error(&self, error: WatchError) {
        for observer in self.observers.snapshot() {
            run_isolated("on_error", || observer.on_error(&error));
        }
    }

    pub fn registered(&self) -> BTreeMap<PathBuf, i32> {
        self.state.lock().registered.clone()
    }

    pub fn register_calls(&self) -> Vec<(PathBuf, i32)> {
        self.state.lock().register_calls.clone()
    }

    pub fn unregister_calls(&self) -> Vec<PathBuf> {
        self.state.lock().unregister_calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PathWatcher for ManualPathWatcher {
    fn register(&self, path: &Path, max_depth: i32) -> Result<bool, WatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }
        let mut state = self.state.lock();
        state.register_calls.push((path.to_path_buf(), max_depth));
        match state.registered.get_mut(path) {
            Some(existing) if *existing >= max_depth => Ok(false),
            Some(existing) => {
                *existing = max_depth;
                Ok(true)
            }
            None => {
                state.registered.insert(path.to_path_buf(), max_depth);
                Ok(true)
            }
        }
    }

    fn unregister(&self, path: &Path) {
        let mut state = self.state.lock();
        state.unregister_calls.push(path.to_path_buf());
        state.registered.remove(path);
    }

    fn add_observer(&self, observer: Arc<dyn EventObserver>) -> i64 {
        self.observers.add(observer)
    }

    fn remove_observer(&self, handle: i64) -> bool {
        self.observers.remove(handle)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.observers.clear();
        self.state.lock().registered.clear();
    }
}
