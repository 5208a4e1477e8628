//! Symlink target watching.
//!
//! When the cache follows symlinks, a change to the link *target* must
//! surface as a change at the link *path*. [`SymlinkWatcher`] owns a backend
//! [`PathWatcher`] pointed at canonical target paths, keeps a target → links
//! map, and replays target events against every linking path. Targets are
//! refcounted by their dependent links: the last link removed tears the
//! target watch down.
//!
//! Self-referential links are rejected up front, and remapped paths that
//! would re-enter a loop are suppressed, so link cycles cannot generate
//! event storms.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arbor_core::observers::{run_isolated, Observers};
use arbor_core::TypedPath;
use parking_lot::Mutex;

use crate::error::WatchError;
use crate::event::Event;
use crate::watcher::{EventObserver, PathWatcher};

struct RegisteredTarget {
    max_depth: i32,
    /// Symlink paths that resolve into this target.
    links: BTreeSet<PathBuf>,
}

struct SymlinkInner {
    watcher: Arc<dyn PathWatcher>,
    targets: Mutex<HashMap<PathBuf, RegisteredTarget>>,
    observers: Observers<dyn EventObserver>,
    closed: AtomicBool,
}

impl SymlinkInner {
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

    /// Translates one target-side event into link-side events.
    fn remap(&self, event: &Event) {
        let path = event.path();
        let (target_path, links) = {
            let targets = self.targets.lock();
            let Some(target_path) = find_target(&targets, path) else {
                return;
            };
            let links = targets[&target_path].links.clone();
            (target_path, links)
        };

        let rel = path.strip_prefix(&target_path).unwrap_or(Path::new(""));
        for link in &links {
            let mapped = if rel.as_os_str().is_empty() {
                link.clone()
            } else {
                link.join(rel)
            };
            if has_loop(&mapped) {
                tracing::debug!(
                    target = "arbor.watch",
                    path = %mapped.display(),
                    "suppressing looping symlink event"
                );
                continue;
            }
            self.emit(&event.with_typed_path(TypedPath::stat(&mapped)));
        }

        // The watched target itself vanished; nothing left to observe there.
        if path == target_path && !event.typed_path().exists() {
            self.targets.lock().remove(&target_path);
            self.watcher.unregister(&target_path);
        }
    }
}

/// The innermost registered target that `path` falls under.
fn find_target(
    targets: &HashMap<PathBuf, RegisteredTarget>,
    path: &Path,
) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if targets.contains_key(candidate) {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}

/// Whether resolving some ancestor of `path` leads back above `path`, i.e.
/// the path only exists by virtue of a link cycle.
fn has_loop(path: &Path) -> bool {
    let mut current = path.parent();
    while let Some(dir) = current {
        if TypedPath::stat(dir).is_symlink() {
            if let Ok(real) = dir.canonicalize() {
                if path.starts_with(&real) && path != real {
                    return true;
                }
            }
        }
        current = dir.parent();
    }
    false
}

struct TargetForwarder(Weak<SymlinkInner>);

impl EventObserver for TargetForwarder {
    fn on_event(&self, event: &Event) {
        if let Some(inner) = self.0.upgrade() {
            inner.remap(event);
        }
    }

    fn on_error(&self, error: &WatchError) {
        if let Some(inner) = self.0.upgrade() {
            inner.emit_error(error);
        }
    }
}

pub struct SymlinkWatcher {
    inner: Arc<SymlinkInner>,
}

impl SymlinkWatcher {
    /// Builds a symlink watcher over `watcher`, which it now owns: targets
    /// are registered on it and it is closed together with this watcher.
    pub fn new(watcher: Arc<dyn PathWatcher>) -> SymlinkWatcher {
        let inner = Arc::new(SymlinkInner {
            watcher: Arc::clone(&watcher),
            targets: Mutex::new(HashMap::new()),
            observers: Observers::new(),
            closed: AtomicBool::new(false),
        });
        watcher.add_observer(Arc::new(TargetForwarder(Arc::downgrade(&inner))));
        SymlinkWatcher { inner }
    }

    /// Starts watching the target of the symlink at `path`.
    ///
    /// Rejects links that resolve to one of their own ancestors: watching
    /// such a target would make every event under it remap into itself.
    pub fn add_symlink(&self, path: &Path, max_depth: i32) -> Result<(), WatchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }
        let real = std::fs::canonicalize(path)?;
        if path.starts_with(&real) && path != real {
            return Err(WatchError::SymlinkLoop(path.to_path_buf()));
        }
        let mut targets = self.inner.targets.lock();
        match targets.get_mut(&real) {
            Some(target) => {
                target.links.insert(path.to_path_buf());
                if max_depth > target.max_depth {
                    target.max_depth = max_depth;
                    self.inner.watcher.register(&real, max_depth)?;
                }
            }
            None => {
                self.inner.watcher.register(&real, max_depth)?;
                let mut links = BTreeSet::new();
                links.insert(path.to_path_buf());
                targets.insert(real, RegisteredTarget { max_depth, links });
            }
        }
        Ok(())
    }

    /// Forgets the symlink at `path`. The target watch is torn down when its
    /// last dependent link goes away.
    pub fn remove_symlink(&self, path: &Path) {
        let mut targets = self.inner.targets.lock();
        let Some(real) = targets
            .iter()
            .find(|(_, target)| target.links.contains(path))
            .map(|(real, _)| real.clone())
        else {
            return;
        };
        let target = targets.get_mut(&real).expect("target just found");
        target.links.remove(path);
        if target.links.is_empty() {
            targets.remove(&real);
            self.inner.watcher.unregister(&real);
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) -> i64 {
        self.inner.observers.add(observer)
    }

    pub fn remove_observer(&self, handle: i64) -> bool {
        self.inner.observers.remove(handle)
    }

    /// Paths currently watched as link targets, for diagnostics.
    pub fn watched_targets(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.inner.targets.lock().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.targets.lock().clear();
        self.inner.observers.clear();
        self.inner.watcher.close();
    }
}

impl Drop for SymlinkWatcher {
    fn drop(&mut self) {
        self.close();
    }
}
