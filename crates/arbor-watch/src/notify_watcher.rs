//! OS-backed watcher built on `notify`.
//!
//! The notify callback runs on the OS watcher's own thread and must never
//! block, so it only tries to push the raw event onto a bounded channel; a
//! dedicated drain thread translates raw events into [`Event`]s and fans them
//! out. When the channel fills up, the raw event is dropped and an overflow
//! flag is set; the drain thread then emits an `Overflow` event per
//! registered root, which consumers treat as "rescan this root".
//!
//! Roots that do not exist yet are watched via their nearest existing
//! ancestor and the watch is re-pinned onto the root once it appears (and
//! back onto an ancestor if the root is deleted), so registration order does
//! not race directory creation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arbor_core::observers::{run_isolated, Observers};
use arbor_core::TypedPath;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use notify::event::{EventKind as NotifyKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::error::WatchError;
use crate::event::{Event, EventKind};
use crate::watcher::{EventObserver, PathWatcher};

/// Raw events buffered between the notify callback and the drain thread.
const RAW_CHANNEL_CAPACITY: usize = 4096;

/// How long the drain thread sleeps between flag checks when no events
/// arrive. Only affects how promptly a pending overflow is reported.
const DRAIN_IDLE_TICK: Duration = Duration::from_millis(500);

type RawEvent = notify::Result<notify::Event>;

#[derive(Debug)]
struct Requested {
    max_depth: i32,
    /// Where the OS watch actually sits: the root itself, or its nearest
    /// existing ancestor while the root is absent.
    watched: PathBuf,
}

#[derive(Default)]
struct WatchState {
    requested: HashMap<PathBuf, Requested>,
    /// Refcounted OS-level watches; several requested roots can share one
    /// ancestor watch.
    actual: HashMap<PathBuf, usize>,
}

struct NotifyInner {
    observers: Observers<dyn EventObserver>,
    watches: Mutex<WatchState>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    overflowed: AtomicBool,
    closed: AtomicBool,
}

impl NotifyInner {
    fn emit(&self, event: &Event) {
        for observer in self.observers.snapshot() {
            run_isolated("on_event", || observer.on_event(event));
        }
    }

    fn emit_error(&self, error: &WatchError) {
        for observer in self.observers.snapshot() {
            run_isolated("on_error", || observer.on_error(error));
        }
    }

    /// One `Overflow` per requested root; the consumer rescans each.
    fn emit_overflow(&self) {
        let roots: Vec<PathBuf> = self.watches.lock().requested.keys().cloned().collect();
        for root in roots {
            self.emit(&Event::new(TypedPath::stat(&root), EventKind::Overflow));
        }
    }

    fn watch_actual(&self, state: &mut WatchState, path: &Path) -> Result<(), WatchError> {
        if let Some(count) = state.actual.get_mut(path) {
            *count += 1;
            return Ok(());
        }
        let mut watcher = self.watcher.lock();
        if let Some(watcher) = watcher.as_mut() {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }
        state.actual.insert(path.to_path_buf(), 1);
        Ok(())
    }

    fn unwatch_actual(&self, state: &mut WatchState, path: &Path) {
        let Some(count) = state.actual.get_mut(path) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        state.actual.remove(path);
        let mut watcher = self.watcher.lock();
        if let Some(watcher) = watcher.as_mut() {
            if let Err(err) = watcher.unwatch(path) {
                tracing::debug!(
                    target = "arbor.watch",
                    path = %path.display(),
                    error = %err,
                    "unwatch failed"
                );
            }
        }
    }

    /// Moves the OS watch for any requested root whose existence changed:
    /// onto the root itself once it appears, back onto the nearest existing
    /// ancestor when it goes away.
    fn repin_watches(&self, changed: &Path) {
        let mut state = self.watches.lock();
        let roots: Vec<PathBuf> = state
            .requested
            .keys()
            .filter(|root| changed.starts_with(root) || root.starts_with(changed))
            .cloned()
            .collect();
        for root in roots {
            let desired = nearest_existing(&root);
            let current = state.requested[&root].watched.clone();
            if desired == current {
                continue;
            }
            if let Err(err) = self.watch_actual(&mut state, &desired) {
                tracing::debug!(
                    target = "arbor.watch",
                    root = %root.display(),
                    target_path = %desired.display(),
                    error = %err,
                    "failed to re-pin watch"
                );
                continue;
            }
            self.unwatch_actual(&mut state, &current);
            if let Some(requested) = state.requested.get_mut(&root) {
                requested.watched = desired;
            }
        }
    }

    /// Whether an event for `path` is interesting to any requested root.
    fn relevant(&self, path: &Path) -> bool {
        let state = self.watches.lock();
        state
            .requested
            .keys()
            .any(|root| path.starts_with(root) || root.starts_with(path))
    }
}

pub struct NotifyPathWatcher {
    inner: Arc<NotifyInner>,
    stop_tx: Sender<()>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl NotifyPathWatcher {
    pub fn new() -> Result<NotifyPathWatcher, WatchError> {
        let inner = Arc::new(NotifyInner {
            observers: Observers::new(),
            watches: Mutex::new(WatchState::default()),
            watcher: Mutex::new(None),
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let (raw_tx, raw_rx) = bounded::<RawEvent>(RAW_CHANNEL_CAPACITY);
        let callback_inner = Arc::clone(&inner);
        let watcher = notify::recommended_watcher(move |raw: RawEvent| {
            try_send_or_overflow(&raw_tx, raw, &callback_inner.overflowed);
        })?;
        *inner.watcher.lock() = Some(watcher);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let drain_inner = Arc::clone(&inner);
        let drain = std::thread::Builder::new()
            .name("arbor-notify-drain".to_owned())
            .spawn(move || run_drain_loop(drain_inner, raw_rx, stop_rx))
            .map_err(WatchError::Io)?;

        Ok(NotifyPathWatcher {
            inner,
            stop_tx,
            drain: Mutex::new(Some(drain)),
        })
    }
}

impl PathWatcher for NotifyPathWatcher {
    fn register(&self, path: &Path, max_depth: i32) -> Result<bool, WatchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }
        let mut state = self.inner.watches.lock();
        if let Some(requested) = state.requested.get_mut(path) {
            if requested.max_depth >= max_depth {
                return Ok(false);
            }
            requested.max_depth = max_depth;
            return Ok(true);
        }
        let watched = nearest_existing(path);
        self.inner.watch_actual(&mut state, &watched)?;
        state.requested.insert(
            path.to_path_buf(),
            Requested { max_depth, watched },
        );
        tracing::debug!(
            target = "arbor.watch",
            path = %path.display(),
            max_depth,
            "registered notify watch"
        );
        Ok(true)
    }

    fn unregister(&self, path: &Path) {
        let mut state = self.inner.watches.lock();
        if let Some(requested) = state.requested.remove(path) {
            self.inner.unwatch_actual(&mut state, &requested.watched);
        }
    }

    fn add_observer(&self, observer: Arc<dyn EventObserver>) -> i64 {
        self.inner.observers.add(observer)
    }

    fn remove_observer(&self, handle: i64) -> bool {
        self.inner.observers.remove(handle)
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.drain.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target = "arbor.watch", "notify drain thread panicked");
            }
        }
        // Lock order is watches before watcher everywhere.
        {
            let mut state = self.inner.watches.lock();
            state.requested.clear();
            state.actual.clear();
        }
        // Dropping the OS watcher releases every watch at once.
        self.inner.watcher.lock().take();
        self.inner.observers.clear();
    }
}

impl Drop for NotifyPathWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_drain_loop(inner: Arc<NotifyInner>, raw_rx: Receiver<RawEvent>, stop_rx: Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            recv(raw_rx) -> raw => match raw {
                Ok(raw) => handle_raw(&inner, raw),
                Err(_) => break,
            },
            default(DRAIN_IDLE_TICK) => {}
        }
        if inner.overflowed.swap(false, Ordering::SeqCst) {
            inner.emit_overflow();
        }
    }
}

fn handle_raw(inner: &NotifyInner, raw: RawEvent) {
    let raw = match raw {
        Ok(raw) => raw,
        Err(err) => {
            // A failing backend may have dropped events; degrade to overflow
            // so consumers resynchronize.
            inner.emit_error(&WatchError::Notify(err));
            inner.emit_overflow();
            return;
        }
    };
    if raw.need_rescan() {
        inner.emit_overflow();
        return;
    }
    for event in translate(&raw) {
        if !inner.relevant(event.path()) {
            continue;
        }
        if matches!(event.kind(), EventKind::Create | EventKind::Delete) {
            inner.repin_watches(event.path());
        }
        inner.emit(&event);
    }
}

/// Maps one raw notify event to typed events. Rename halves become
/// delete/create pairs; access-only events are dropped.
fn translate(raw: &notify::Event) -> Vec<Event> {
    let stat = |path: &PathBuf| TypedPath::stat(path);
    match &raw.kind {
        NotifyKind::Create(_) => raw
            .paths
            .iter()
            .map(|p| Event::new(stat(p), EventKind::Create))
            .collect(),
        NotifyKind::Remove(_) => raw
            .paths
            .iter()
            .map(|p| Event::new(stat(p), EventKind::Delete))
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => raw
            .paths
            .iter()
            .map(|p| Event::new(stat(p), EventKind::Delete))
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => raw
            .paths
            .iter()
            .map(|p| Event::new(stat(p), EventKind::Create))
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = raw.paths.first() {
                out.push(Event::new(stat(from), EventKind::Delete));
            }
            if let Some(to) = raw.paths.get(1) {
                out.push(Event::new(stat(to), EventKind::Create));
            }
            out
        }
        NotifyKind::Modify(ModifyKind::Name(_)) => raw
            .paths
            .iter()
            .map(|p| {
                let typed = stat(p);
                let kind = if typed.exists() {
                    EventKind::Create
                } else {
                    EventKind::Delete
                };
                Event::new(typed, kind)
            })
            .collect(),
        NotifyKind::Modify(_) | NotifyKind::Any | NotifyKind::Other => raw
            .paths
            .iter()
            .map(|p| Event::new(stat(p), EventKind::Modify))
            .collect(),
        NotifyKind::Access(_) => Vec::new(),
    }
}

fn try_send_or_overflow(tx: &Sender<RawEvent>, raw: RawEvent, overflowed: &AtomicBool) {
    match tx.try_send(raw) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            overflowed.store(true, Ordering::SeqCst);
        }
        // Drain thread gone; the watcher is shutting down.
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// `path` if it exists, otherwise its closest existing ancestor.
fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return path.to_path_buf(),
        }
    }
}
