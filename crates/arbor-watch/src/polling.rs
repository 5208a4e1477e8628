//! Polling fallback watcher.
//!
//! Keeps a modification-time snapshot of every registered root and diffs it
//! against a fresh scan on each tick. No OS facilities beyond `stat`, so it
//! works on network mounts and platforms where `notify` misbehaves, at the
//! cost of latency proportional to the poll interval.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use arbor_core::observers::{run_isolated, Observers};
use arbor_core::{
    accept_all, diff_entries, CachedDirectory, Converter, DirectoryLister, DirectoryRegistry,
    EntryMap, OpenError, OsDirectoryLister, TypedPath, DEPTH_INFINITE,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::WatchError;
use crate::event::{Event, EventKind};
use crate::watcher::{EventObserver, PathWatcher};

struct PollInner {
    registry: DirectoryRegistry,
    observers: Observers<dyn EventObserver>,
    snapshot: Mutex<EntryMap<SystemTime>>,
    converter: Converter<SystemTime>,
    lister: Arc<dyn DirectoryLister>,
    follow_links: bool,
    closed: AtomicBool,
}

impl PollInner {
    fn emit(&self, event: &Event) {
        for observer in self.observers.snapshot() {
            run_isolated("on_event", || observer.on_event(event));
        }
    }

    /// Fresh mtime entries for every registered root. Roots that are plain
    /// files are kept as single leaf entries; missing roots contribute
    /// nothing (and will diff as deletions).
    fn scan_registered(&self) -> EntryMap<SystemTime> {
        let mut out = EntryMap::new();
        for (root, max_depth) in self.registry.registered() {
            self.scan_root(&root, max_depth, &mut out);
        }
        out
    }

    fn scan_root(&self, root: &Path, max_depth: i32, out: &mut EntryMap<SystemTime>) {
        let opened = CachedDirectory::open(
            root,
            max_depth,
            Arc::clone(&self.converter),
            Arc::clone(&self.lister),
            self.follow_links,
            accept_all(),
        );
        let opened = match opened {
            Err(OpenError::NotADirectory) => CachedDirectory::open(
                root,
                -1,
                Arc::clone(&self.converter),
                Arc::clone(&self.lister),
                self.follow_links,
                accept_all(),
            ),
            other => other,
        };
        match opened {
            Ok(dir) => {
                out.insert(root.to_path_buf(), dir.root_entry().clone());
                for entry in dir.list(root, DEPTH_INFINITE, &|_| true) {
                    out.insert(entry.path().to_path_buf(), entry);
                }
            }
            Err(OpenError::NotFound) => {}
            Err(err) => {
                tracing::debug!(
                    target = "arbor.watch",
                    root = %root.display(),
                    error = %err,
                    "polling scan failed"
                );
            }
        }
    }

    /// One scan-and-diff round. Split out from the timer loop so tests can
    /// drive it deterministically.
    fn poll_once(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let new = self.scan_registered();
        let old = std::mem::replace(&mut *self.snapshot.lock(), new.clone());
        let diff = diff_entries(&old, &new);
        for entry in diff.deleted() {
            self.emit(&Event::new(entry.typed_path().clone(), EventKind::Delete));
        }
        for (_, current) in diff.updated() {
            self.emit(&Event::new(current.typed_path().clone(), EventKind::Modify));
        }
        for entry in diff.created() {
            self.emit(&Event::new(entry.typed_path().clone(), EventKind::Create));
        }
    }
}

pub struct PollingPathWatcher {
    inner: Arc<PollInner>,
    stop_tx: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollingPathWatcher {
    pub fn new(interval: Duration, follow_links: bool) -> Result<PollingPathWatcher, WatchError> {
        PollingPathWatcher::with_lister(interval, follow_links, Arc::new(OsDirectoryLister))
    }

    pub fn with_lister(
        interval: Duration,
        follow_links: bool,
        lister: Arc<dyn DirectoryLister>,
    ) -> Result<PollingPathWatcher, WatchError> {
        let converter: Converter<SystemTime> = Arc::new(move |tp: &TypedPath| {
            let meta = if follow_links {
                std::fs::metadata(tp.path())
            } else {
                std::fs::symlink_metadata(tp.path())
            }?;
            meta.modified().or_else(|_: io::Error| {
                // Some file systems report no mtime; pin those entries to the
                // epoch so they still diff by existence and type.
                Ok(SystemTime::UNIX_EPOCH)
            })
        });
        let inner = Arc::new(PollInner {
            registry: DirectoryRegistry::new(),
            observers: Observers::new(),
            snapshot: Mutex::new(EntryMap::new()),
            converter,
            lister,
            follow_links,
            closed: AtomicBool::new(false),
        });

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let tick_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("arbor-poll".to_owned())
            .spawn(move || run_poll_loop(tick_inner, interval, stop_rx))
            .map_err(WatchError::Io)?;

        Ok(PollingPathWatcher {
            inner,
            stop_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Runs one poll round immediately on the calling thread.
    pub fn poll_once(&self) {
        self.inner.poll_once();
    }
}

impl PathWatcher for PollingPathWatcher {
    fn register(&self, path: &Path, max_depth: i32) -> Result<bool, WatchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }
        let newly = self.inner.registry.add_directory(path, max_depth);
        // Seed the snapshot so already-present files do not surface as
        // creations on the next tick.
        let mut seeded = EntryMap::new();
        self.inner.scan_root(path, max_depth, &mut seeded);
        self.inner.snapshot.lock().extend(seeded);
        Ok(newly)
    }

    fn unregister(&self, path: &Path) {
        self.inner.registry.remove_directory(path);
        let registry = &self.inner.registry;
        self.inner
            .snapshot
            .lock()
            .retain(|key, _| registry.accept(key));
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
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target = "arbor.watch", "poll thread panicked");
            }
        }
        self.inner.registry.clear();
        self.inner.snapshot.lock().clear();
        self.inner.observers.clear();
    }
}

impl Drop for PollingPathWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_poll_loop(inner: Arc<PollInner>, interval: Duration, stop_rx: Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            default(interval) => inner.poll_once(),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::watcher::event_observer;

    /// Long enough that the background thread never ticks during a test;
    /// every round is driven through `poll_once`.
    const MANUAL: Duration = Duration::from_secs(3600);

    fn collect_events(watcher: &PollingPathWatcher) -> Arc<PlMutex<Vec<(PathBuf, EventKind)>>> {
        let log = Arc::new(PlMutex::new(Vec::new()));
        let sink = log.clone();
        watcher.add_observer(event_observer(move |event| {
            sink.lock().push((event.path().to_path_buf(), event.kind()));
        }));
        log
    }

    #[test]
    fn register_seeds_the_snapshot_silently() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pre.txt"), b"").unwrap();

        let watcher = PollingPathWatcher::new(MANUAL, false).unwrap();
        let log = collect_events(&watcher);
        watcher.register(dir.path(), DEPTH_INFINITE).unwrap();

        watcher.poll_once();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn created_and_deleted_files_surface_as_events() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = PollingPathWatcher::new(MANUAL, false).unwrap();
        let log = collect_events(&watcher);
        watcher.register(dir.path(), DEPTH_INFINITE).unwrap();

        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"").unwrap();
        watcher.poll_once();
        // The parent directory's mtime changed too, so a Modify for it may
        // accompany the creation.
        assert!(log.lock().contains(&(file.clone(), EventKind::Create)));
        assert!(!log.lock().iter().any(|(_, k)| *k == EventKind::Delete));

        log.lock().clear();
        std::fs::remove_file(&file).unwrap();
        watcher.poll_once();
        assert!(log.lock().contains(&(file, EventKind::Delete)));
    }

    #[test]
    fn touch_without_mtime_change_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let watcher = PollingPathWatcher::new(MANUAL, false).unwrap();
        let log = collect_events(&watcher);
        watcher.register(dir.path(), DEPTH_INFINITE).unwrap();

        // Nothing changed between rounds.
        watcher.poll_once();
        watcher.poll_once();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn a_file_root_is_tracked_as_a_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("leaf.txt");
        std::fs::write(&file, b"").unwrap();

        let watcher = PollingPathWatcher::new(MANUAL, false).unwrap();
        let log = collect_events(&watcher);
        watcher.register(&file, 0).unwrap();

        std::fs::remove_file(&file).unwrap();
        watcher.poll_once();
        assert_eq!(log.lock().as_slice(), &[(file, EventKind::Delete)]);
    }

    #[test]
    fn unregister_stops_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = PollingPathWatcher::new(MANUAL, false).unwrap();
        let log = collect_events(&watcher);
        watcher.register(dir.path(), DEPTH_INFINITE).unwrap();

        watcher.unregister(dir.path());
        std::fs::write(dir.path().join("late.txt"), b"").unwrap();
        watcher.poll_once();
        assert!(log.lock().is_empty());
    }
}
