//! The file tree repository: a live cache of registered subtrees.
//!
//! [`FileTreeRepository`] wires the pieces together: a [`PathWatcher`]
//! backend produces raw events, every event is funneled through the single
//! callback executor, and the handler reconciles the owning
//! [`CachedDirectory`] under one state lock before invoking subscriber
//! callbacks in path order. Because the executor is single-threaded, no two
//! callbacks ever run concurrently and events for one path are processed in
//! arrival order.
//!
//! The state lock is acquired with a bounded wait. If another thread wedges
//! it past the timeout the event is skipped with a warning instead of
//! deadlocking the callback thread; a later event or overflow rescan
//! resynchronizes the cache.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arbor_core::{
    CacheObserver, CacheObservers, CachedDirectory, Converter, Diff, DirectoryLister,
    DirectoryRegistry, Entry, EntryError, EntryObserver, OpenError, TypedPath,
};
use parking_lot::{Mutex, MutexGuard};

use crate::error::WatchError;
use crate::event::{Event, EventKind};
use crate::executor::CallbackExecutor;
use crate::symlink::SymlinkWatcher;
use crate::watcher::{EventObserver, PathWatcher};

const STATE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts before giving up on a root that stats as existing but fails to
/// open with permission errors; some platforms report transient denials for
/// freshly renamed directories.
const OPEN_RETRIES: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(1);

struct TreeState<T> {
    directories: BTreeMap<PathBuf, CachedDirectory<T>>,
    /// Registered roots that did not exist at registration time. A create
    /// event for one of these materializes it into `directories`.
    pending: BTreeSet<PathBuf>,
}

enum Callback<T> {
    Create(Entry<T>),
    Update(Entry<T>, Entry<T>),
    Delete(Entry<T>),
}

impl<T> Callback<T> {
    fn path(&self) -> &Path {
        match self {
            Callback::Create(entry) | Callback::Delete(entry) => entry.path(),
            Callback::Update(_, current) => current.path(),
        }
    }
}

/// Symlink watch adjustments discovered while the state lock was held; they
/// are applied after it is released so the symlink watcher's own locking
/// never nests inside the repository lock.
#[derive(Default)]
struct LinkChanges {
    add: Vec<(PathBuf, i32)>,
    remove: Vec<PathBuf>,
}

struct RepoInner<T> {
    registry: Arc<DirectoryRegistry>,
    converter: Converter<T>,
    lister: Arc<dyn DirectoryLister>,
    watcher: Arc<dyn PathWatcher>,
    symlinks: Option<SymlinkWatcher>,
    observers: CacheObservers<T>,
    executor: CallbackExecutor,
    state: Mutex<TreeState<T>>,
    closed: AtomicBool,
}

/// Forwards watcher events onto the executor. Holds the repository weakly so
/// queued events cannot keep a closed repository alive.
struct EventForwarder<T>(Weak<RepoInner<T>>);

impl<T> EventObserver for EventForwarder<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let weak = Weak::clone(&self.0);
        let event = event.clone();
        inner.executor.submit(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(&event);
            }
        });
    }

    fn on_error(&self, error: &WatchError) {
        if let Some(inner) = self.0.upgrade() {
            let entry_error = EntryError::from(io::Error::other(error.to_string()));
            inner.observers.on_error(&entry_error);
        }
    }
}

pub struct FileTreeRepository<T> {
    inner: Arc<RepoInner<T>>,
}

impl<T> Clone for FileTreeRepository<T> {
    fn clone(&self) -> Self {
        FileTreeRepository {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FileTreeRepository<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Repository that treats symlinks as opaque leaves: a link's own entry
    /// is cached, but changes behind it are not observed.
    pub fn no_follow(
        converter: Converter<T>,
        lister: Arc<dyn DirectoryLister>,
        watcher: Arc<dyn PathWatcher>,
    ) -> FileTreeRepository<T> {
        FileTreeRepository::build(converter, lister, watcher, None)
    }

    /// Repository that follows symlinks: scans descend through link targets
    /// and a [`SymlinkWatcher`] over `link_watcher` replays target changes
    /// against the linking paths.
    pub fn follow_symlinks(
        converter: Converter<T>,
        lister: Arc<dyn DirectoryLister>,
        watcher: Arc<dyn PathWatcher>,
        link_watcher: Arc<dyn PathWatcher>,
    ) -> FileTreeRepository<T> {
        let symlinks = SymlinkWatcher::new(link_watcher);
        FileTreeRepository::build(converter, lister, watcher, Some(symlinks))
    }

    fn build(
        converter: Converter<T>,
        lister: Arc<dyn DirectoryLister>,
        watcher: Arc<dyn PathWatcher>,
        symlinks: Option<SymlinkWatcher>,
    ) -> FileTreeRepository<T> {
        let inner = Arc::new(RepoInner {
            registry: Arc::new(DirectoryRegistry::new()),
            converter,
            lister,
            watcher: Arc::clone(&watcher),
            symlinks,
            observers: CacheObservers::new(),
            executor: CallbackExecutor::new(),
            state: Mutex::new(TreeState {
                directories: BTreeMap::new(),
                pending: BTreeSet::new(),
            }),
            closed: AtomicBool::new(false),
        });
        watcher.add_observer(Arc::new(EventForwarder(Arc::downgrade(&inner))));
        if let Some(symlinks) = &inner.symlinks {
            symlinks.add_observer(Arc::new(EventForwarder(Arc::downgrade(&inner))));
        }
        FileTreeRepository { inner }
    }

    /// Starts mirroring `path` to `max_depth` levels below it.
    ///
    /// Returns `true` when this request newly covers the path (first
    /// registration, or a depth widening). Registration itself emits no
    /// callbacks; read the initial contents with [`list`](Self::list). A path
    /// that does not exist yet is accepted and materializes into the cache
    /// when it appears; a root that exists but cannot be read fails with the
    /// underlying error after a bounded retry.
    pub fn register(&self, path: impl AsRef<Path>, max_depth: i32) -> Result<bool, WatchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }
        let path = absolute(path.as_ref())?;

        let prior_depth = self
            .inner
            .registry
            .registered()
            .into_iter()
            .find(|(p, _)| *p == path)
            .map(|(_, d)| d);
        if !self.inner.registry.add_directory(&path, max_depth) {
            return Ok(false);
        }
        if let Err(err) = self.inner.watcher.register(&path, max_depth) {
            self.rollback_registration(&path, prior_depth);
            return Err(err);
        }
        tracing::debug!(
            target = "arbor.watch",
            path = %path.display(),
            max_depth,
            "registered root"
        );

        let mut link_changes = LinkChanges::default();
        let result = match self.inner.lock_state() {
            Some(mut state) => {
                self.inner
                    .install_root(&mut state, &path, max_depth, &mut link_changes)
            }
            // The watch is installed; the cache will catch up via events.
            None => Ok(()),
        };
        if result.is_err() {
            self.rollback_registration(&path, prior_depth);
            if prior_depth.is_none() {
                self.inner.watcher.unregister(&path);
            }
        }
        self.inner.apply_link_changes(link_changes);
        result.map(|()| true)
    }

    /// Restores the registry to its pre-`register` state so a later attempt
    /// starts clean.
    fn rollback_registration(&self, path: &Path, prior_depth: Option<i32>) {
        self.inner.registry.remove_directory(path);
        if let Some(depth) = prior_depth {
            self.inner.registry.add_directory(path, depth);
        }
    }

    /// Stops mirroring `path`. Cached entries still covered by another
    /// registered root survive; the rest are dropped without callbacks.
    pub fn unregister(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        let path = absolute(path.as_ref())?;
        self.inner.registry.remove_directory(&path);
        self.inner.watcher.unregister(&path);

        let mut link_changes = LinkChanges::default();
        if let Some(mut state) = self.inner.lock_state() {
            state.pending.remove(&path);
            if !self.inner.registry.accept_prefix(&path) {
                if let Some(dir) = state.directories.remove(&path) {
                    let mut dropped = dir.list(&path, arbor_core::DEPTH_INFINITE, &|_| true);
                    dropped.push(dir.root_entry().clone());
                    for entry in dropped {
                        if entry.typed_path().is_symlink() {
                            link_changes.remove.push(entry.path().to_path_buf());
                        }
                    }
                } else if let Some(owner) = find_owner_key(&state.directories, &path) {
                    let dir = state.directories.get_mut(&owner).expect("owner key exists");
                    for entry in dir.remove(&path) {
                        if entry.typed_path().is_symlink() {
                            link_changes.remove.push(entry.path().to_path_buf());
                        }
                    }
                }
            }
        }
        self.inner.apply_link_changes(link_changes);
        Ok(())
    }

    /// Cached entries under `path`, `max_depth` levels deep, filtered. A
    /// `max_depth` of `-1` returns only `path`'s own entry. Pure cache read;
    /// never touches disk.
    pub fn list(
        &self,
        path: impl AsRef<Path>,
        max_depth: i32,
        filter: impl Fn(&Entry<T>) -> bool,
    ) -> Vec<Entry<T>> {
        let Ok(path) = absolute(path.as_ref()) else {
            return Vec::new();
        };
        let Some(state) = self.inner.lock_state() else {
            return Vec::new();
        };
        let Some(owner) = find_owner_key(&state.directories, &path) else {
            return Vec::new();
        };
        state.directories[&owner].list(&path, max_depth, &filter)
    }

    /// The cached entry for `path`, if any.
    pub fn entry(&self, path: impl AsRef<Path>) -> Option<Entry<T>> {
        let path = absolute(path.as_ref()).ok()?;
        let state = self.inner.lock_state()?;
        let owner = find_owner_key(&state.directories, &path)?;
        state.directories[&owner].entry(&path).cloned()
    }

    /// Subscribes to create/update/delete callbacks. Callbacks run on the
    /// repository's callback thread, sorted by path within each event batch.
    pub fn add_cache_observer(&self, observer: Arc<dyn CacheObserver<T>>) -> i64 {
        self.inner.observers.add(observer)
    }

    /// Subscribes a collapsed observer that receives `on_next` for every
    /// change kind.
    pub fn add_observer(&self, observer: Arc<dyn EntryObserver<T>>) -> i64 {
        self.inner.observers.add_entry_observer(observer)
    }

    pub fn remove_observer(&self, handle: i64) -> bool {
        self.inner.observers.remove(handle)
    }

    /// Shuts the repository down: closes the watchers, drains and joins the
    /// callback thread, and drops the cache. Idempotent. Operations after
    /// close fail with [`WatchError::Closed`] or return empty results.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.watcher.close();
        if let Some(symlinks) = &self.inner.symlinks {
            symlinks.close();
        }
        self.inner.executor.shutdown();
        self.inner.registry.clear();
        if let Some(mut state) = self.inner.lock_state() {
            state.directories.clear();
            state.pending.clear();
        }
        self.inner.observers.clear();
    }

    #[cfg(test)]
    fn handle_event_sync(&self, event: &Event) {
        self.inner.handle_event(event);
    }
}

impl<T> RepoInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn lock_state(&self) -> Option<MutexGuard<'_, TreeState<T>>> {
        let guard = self.state.try_lock_for(STATE_LOCK_TIMEOUT);
        if guard.is_none() {
            tracing::warn!(
                target = "arbor.watch",
                timeout_secs = STATE_LOCK_TIMEOUT.as_secs(),
                "state lock wait exceeded, skipping operation"
            );
        }
        guard
    }

    fn open_cached(&self, path: &Path, max_depth: i32) -> Result<CachedDirectory<T>, OpenError> {
        let registry_filter = self.registry_filter();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = CachedDirectory::open(
                path,
                max_depth,
                Arc::clone(&self.converter),
                Arc::clone(&self.lister),
                self.symlinks.is_some(),
                Arc::clone(&registry_filter),
            );
            match result {
                Err(OpenError::Io(ref err))
                    if err.kind() == io::ErrorKind::PermissionDenied && attempt < OPEN_RETRIES =>
                {
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
                other => return other,
            }
        }
    }

    fn registry_filter(&self) -> arbor_core::PathFilter {
        // Shares the live registry, so a mirror built early still honors
        // roots registered later when it rescans.
        let registry = Arc::clone(&self.registry);
        Arc::new(move |tp: &TypedPath| registry.accept(tp.path()))
    }

    /// Creates or refreshes the cached directory for a newly registered
    /// root. Never emits callbacks.
    fn install_root(
        &self,
        state: &mut TreeState<T>,
        path: &Path,
        max_depth: i32,
        link_changes: &mut LinkChanges,
    ) -> Result<(), WatchError> {
        if let Some(owner) = find_owner_key(&state.directories, path) {
            let owner_dir = state.directories.get_mut(&owner).expect("owner key exists");
            if owner != path && covers(&owner, owner_dir.max_depth(), path, max_depth) {
                // An existing broader mirror already holds this subtree;
                // refresh it in place.
                let _ = owner_dir.update(&TypedPath::stat(path), false);
                return Ok(());
            }
        }
        if let Some(existing) = state.directories.get(path) {
            if existing.max_depth() >= max_depth {
                return Ok(());
            }
        }
        match self.open_cached(path, max_depth) {
            Ok(dir) => self.adopt_directory(state, dir, link_changes),
            Err(OpenError::NotADirectory) => match self.open_cached(path, -1) {
                Ok(dir) => self.adopt_directory(state, dir, link_changes),
                Err(OpenError::NotFound) => {
                    state.pending.insert(path.to_path_buf());
                }
                Err(OpenError::NotADirectory) => unreachable!("depth -1 accepts any kind"),
                Err(OpenError::Io(err)) => {
                    return Err(WatchError::Io(io::Error::new(err.kind(), err.message().to_owned())))
                }
            },
            Err(OpenError::NotFound) => {
                state.pending.insert(path.to_path_buf());
                tracing::debug!(
                    target = "arbor.watch",
                    path = %path.display(),
                    "root does not exist yet, leaving pending"
                );
            }
            Err(OpenError::Io(err)) => {
                return Err(WatchError::Io(io::Error::new(err.kind(), err.message().to_owned())))
            }
        }
        Ok(())
    }

    /// Inserts `dir`, prunes nested mirrors it fully covers, and queues
    /// symlink watches for the entries it brought in.
    fn adopt_directory(
        &self,
        state: &mut TreeState<T>,
        dir: CachedDirectory<T>,
        link_changes: &mut LinkChanges,
    ) {
        let root = dir.path().to_path_buf();
        let max_depth = dir.max_depth();
        if self.symlinks.is_some() {
            let mut entries = dir.list(&root, arbor_core::DEPTH_INFINITE, &|_| true);
            entries.push(dir.root_entry().clone());
            for entry in entries {
                if entry.typed_path().is_symlink() {
                    self.queue_link_add(link_changes, entry.path());
                }
            }
        }
        state.directories.insert(root.clone(), dir);

        let nested: Vec<PathBuf> = state
            .directories
            .keys()
            .filter(|key| *key != &root && key.starts_with(&root))
            .cloned()
            .collect();
        for key in nested {
            let nested_depth = state.directories[&key].max_depth();
            if covers(&root, max_depth, &key, nested_depth) {
                state.directories.remove(&key);
            }
        }
    }

    fn queue_link_add(&self, link_changes: &mut LinkChanges, path: &Path) {
        let depth = self.registry.max_depth_for(path).unwrap_or(0).max(0);
        link_changes.add.push((path.to_path_buf(), depth));
    }

    fn apply_link_changes(&self, link_changes: LinkChanges) {
        let Some(symlinks) = &self.symlinks else {
            return;
        };
        for path in link_changes.remove {
            symlinks.remove_symlink(&path);
        }
        for (path, max_depth) in link_changes.add {
            match symlinks.add_symlink(&path, max_depth) {
                Ok(()) => {}
                Err(WatchError::SymlinkLoop(loop_path)) => {
                    tracing::warn!(
                        target = "arbor.watch",
                        path = %loop_path.display(),
                        "symlink loop detected, not following"
                    );
                    let entry_error = EntryError::from(io::Error::other(format!(
                        "symlink loop at {}",
                        loop_path.display()
                    )));
                    self.observers.on_error(&entry_error);
                }
                Err(err) => {
                    tracing::debug!(
                        target = "arbor.watch",
                        path = %path.display(),
                        error = %err,
                        "failed to watch symlink target"
                    );
                }
            }
        }
    }

    /// The per-event state machine. Runs only on the callback thread.
    fn handle_event(&self, event: &Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let typed = event.typed_path();
        let path = typed.path().to_path_buf();
        if event.kind() == EventKind::Error {
            // Not a change notification; the cache stays as it is.
            let entry_error = EntryError::from(io::Error::other(format!(
                "watcher reported an error at {}",
                path.display()
            )));
            self.observers.on_error(&entry_error);
            return;
        }
        let mut callbacks: Vec<Callback<T>> = Vec::new();
        let mut link_changes = LinkChanges::default();

        {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            if typed.exists() {
                if let Some(owner) = find_owner_key(&state.directories, &path) {
                    let rescan = event.kind() == EventKind::Overflow;
                    let dir = state.directories.get_mut(&owner).expect("owner key exists");
                    let diff = dir.update(typed, rescan);
                    self.collect_diff(diff, &mut callbacks, &mut link_changes);
                } else if state.pending.remove(&path) {
                    self.materialize_pending(&mut state, &path, &mut callbacks, &mut link_changes);
                }
            } else {
                self.handle_delete(&mut state, &path, &mut callbacks, &mut link_changes);
            }
        }

        self.apply_link_changes(link_changes);
        self.dispatch(callbacks);
    }

    /// A registered root that was absent now exists: build its mirror and
    /// report everything in it as created.
    fn materialize_pending(
        &self,
        state: &mut TreeState<T>,
        path: &Path,
        callbacks: &mut Vec<Callback<T>>,
        link_changes: &mut LinkChanges,
    ) {
        let max_depth = self.registry.max_depth_for(path).unwrap_or(0);
        let opened = match self.open_cached(path, max_depth) {
            Err(OpenError::NotADirectory) => self.open_cached(path, -1),
            other => other,
        };
        match opened {
            Ok(dir) => {
                callbacks.push(Callback::Create(dir.root_entry().clone()));
                for entry in dir.list(path, arbor_core::DEPTH_INFINITE, &|_| true) {
                    callbacks.push(Callback::Create(entry));
                }
                self.adopt_directory(state, dir, link_changes);
            }
            Err(err) => {
                // Lost the race with a deletion, or the root is unreadable;
                // stay pending and wait for the next event.
                tracing::debug!(
                    target = "arbor.watch",
                    path = %path.display(),
                    error = %err,
                    "pending root failed to materialize"
                );
                state.pending.insert(path.to_path_buf());
            }
        }
    }

    /// `path` is gone. Every mirror it owned or lived in sheds the affected
    /// entries, and exact registered roots go back to pending so their
    /// re-creation is observed.
    fn handle_delete(
        &self,
        state: &mut TreeState<T>,
        path: &Path,
        callbacks: &mut Vec<Callback<T>>,
        link_changes: &mut LinkChanges,
    ) {
        let keys: Vec<PathBuf> = state
            .directories
            .keys()
            .filter(|key| key.starts_with(path) || path.starts_with(key))
            .cloned()
            .collect();
        for key in keys {
            if key.starts_with(path) {
                // The whole mirror is inside the deleted subtree.
                let Some(dir) = state.directories.remove(&key) else {
                    continue;
                };
                let mut removed = dir.list(&key, arbor_core::DEPTH_INFINITE, &|_| true);
                removed.push(dir.root_entry().clone());
                self.push_deletes(removed, callbacks, link_changes);
                if self.registry.registered_exactly(&key) {
                    state.pending.insert(key);
                }
            } else {
                let dir = state.directories.get_mut(&key).expect("key just listed");
                let removed = dir.remove(path);
                self.push_deletes(removed, callbacks, link_changes);
            }
        }
        if self.registry.registered_exactly(path) {
            state.pending.insert(path.to_path_buf());
        }
    }

    fn push_deletes(
        &self,
        removed: Vec<Entry<T>>,
        callbacks: &mut Vec<Callback<T>>,
        link_changes: &mut LinkChanges,
    ) {
        for entry in removed {
            if entry.typed_path().is_symlink() {
                link_changes.remove.push(entry.path().to_path_buf());
            }
            callbacks.push(Callback::Delete(entry.as_nonexistent()));
        }
    }

    fn collect_diff(
        &self,
        diff: Diff<T>,
        callbacks: &mut Vec<Callback<T>>,
        link_changes: &mut LinkChanges,
    ) {
        for entry in diff.deleted() {
            if entry.typed_path().is_symlink() {
                link_changes.remove.push(entry.path().to_path_buf());
            }
            callbacks.push(Callback::Delete(entry.clone()));
        }
        for (previous, current) in diff.updated() {
            match (
                previous.typed_path().is_symlink(),
                current.typed_path().is_symlink(),
            ) {
                (false, true) => self.queue_link_add(link_changes, current.path()),
                (true, false) => link_changes.remove.push(current.path().to_path_buf()),
                _ => {}
            }
            callbacks.push(Callback::Update(previous.clone(), current.clone()));
        }
        for entry in diff.created() {
            if entry.typed_path().is_symlink() {
                self.queue_link_add(link_changes, entry.path());
            }
            callbacks.push(Callback::Create(entry.clone()));
        }
    }

    /// Invokes subscriber callbacks for one event batch, sorted by path.
    /// Runs on the callback thread with the state lock released, so
    /// subscribers may call back into the repository.
    fn dispatch(&self, mut callbacks: Vec<Callback<T>>) {
        callbacks.sort_by(|a, b| a.path().cmp(b.path()));
        for callback in callbacks {
            match callback {
                Callback::Create(entry) => self.observers.on_create(&entry),
                Callback::Update(previous, current) => self.observers.on_update(&previous, &current),
                Callback::Delete(entry) => self.observers.on_delete(&entry),
            }
        }
    }
}

/// The most specific cached directory whose bounds contain `path`.
fn find_owner_key<T>(
    directories: &BTreeMap<PathBuf, CachedDirectory<T>>,
    path: &Path,
) -> Option<PathBuf>
where
    T: Clone + PartialEq,
{
    directories
        .iter()
        .rev()
        .find(|(root, dir)| {
            matches!(
                arbor_core::relative_depth(root, path),
                Some(d) if d <= dir.max_depth()
            )
        })
        .map(|(root, _)| root.clone())
}

/// Whether a mirror rooted at `root` with `root_depth` fully contains a
/// mirror rooted at `path` with `path_depth`.
fn covers(root: &Path, root_depth: i32, path: &Path, path_depth: i32) -> bool {
    let Some(d) = arbor_core::relative_depth(root, path) else {
        return false;
    };
    if root_depth == arbor_core::DEPTH_INFINITE {
        return true;
    }
    if path_depth == arbor_core::DEPTH_INFINITE {
        return false;
    }
    if d > root_depth {
        return false;
    }
    let remaining = if d == -1 { root_depth } else { root_depth - (d + 1) };
    remaining >= path_depth
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
