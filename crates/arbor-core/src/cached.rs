//! Depth-bounded in-memory mirror of one directory subtree.
//!
//! A [`CachedDirectory`] owns the entries for a single registered root. It is
//! a plain data structure: no locking, no watching. The orchestrator mutates
//! it in response to watcher events and reads it to answer queries.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::diff::{diff_entries, Diff};
use crate::entry::{Converter, Entry, EntryError, EntryMap};
use crate::lister::DirectoryLister;
use crate::path::TypedPath;
use crate::registry::{relative_depth, DEPTH_INFINITE};

/// Inclusion filter applied to scanned children.
pub type PathFilter = Arc<dyn Fn(&TypedPath) -> bool + Send + Sync>;

pub fn accept_all() -> PathFilter {
    Arc::new(|_| true)
}

/// Why a root could not be opened as a cached directory. `NotADirectory` and
/// `NotFound` are ordinary outcomes the caller is expected to branch on, not
/// failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("not a directory")]
    NotADirectory,
    #[error("no such path")]
    NotFound,
    #[error(transparent)]
    Io(EntryError),
}

pub struct CachedDirectory<T> {
    path: PathBuf,
    max_depth: i32,
    root: Entry<T>,
    /// Descendants only; the root entry is held separately so it always
    /// exists.
    entries: EntryMap<T>,
    converter: Converter<T>,
    lister: Arc<dyn DirectoryLister>,
    follow_links: bool,
    filter: PathFilter,
}

impl<T> std::fmt::Debug for CachedDirectory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDirectory")
            .field("path", &self.path)
            .field("max_depth", &self.max_depth)
            .field("follow_links", &self.follow_links)
            .finish_non_exhaustive()
    }
}

impl<T> CachedDirectory<T>
where
    T: Clone + PartialEq,
{
    /// Scans `path` to depth `max_depth` and builds the mirror.
    ///
    /// A `max_depth` of `-1` caches only the root entry itself and accepts
    /// non-directories; that is how regular files are registered as leaves.
    ///
    /// A root whose own listing fails comes back as `OpenError::Io`; listing
    /// failures deeper in the tree are swallowed by the scan instead.
    pub fn open(
        path: impl Into<PathBuf>,
        max_depth: i32,
        converter: Converter<T>,
        lister: Arc<dyn DirectoryLister>,
        follow_links: bool,
        filter: PathFilter,
    ) -> Result<CachedDirectory<T>, OpenError> {
        let path = path.into();
        let typed = TypedPath::stat(&path);
        if !typed.exists() {
            return Err(OpenError::NotFound);
        }
        if max_depth >= 0 && !typed.is_directory() {
            return Err(OpenError::NotADirectory);
        }
        let root = Entry::new(typed.clone(), &converter);
        let mut dir = CachedDirectory {
            path,
            max_depth,
            root,
            entries: EntryMap::new(),
            converter,
            lister,
            follow_links,
            filter,
        };
        if max_depth >= 0 {
            let children = match dir.lister.list(dir.path()) {
                Ok(children) => children,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(OpenError::NotFound);
                }
                Err(err) => return Err(OpenError::Io(err.into())),
            };
            let mut entries = EntryMap::new();
            dir.scan_children(children, max_depth, &mut entries);
            dir.entries = entries;
        }
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_depth(&self) -> i32 {
        self.max_depth
    }

    pub fn root_entry(&self) -> &Entry<T> {
        &self.root
    }

    /// Cached entry for `path`, if any.
    pub fn entry(&self, path: &Path) -> Option<&Entry<T>> {
        if path == self.path {
            Some(&self.root)
        } else {
            self.entries.get(path)
        }
    }

    /// Lists cached entries under `origin` to `max_depth` levels below it,
    /// filtered. `origin` itself is excluded unless `max_depth` is `-1`, in
    /// which case only `origin`'s entry is returned. Purely a cache read.
    pub fn list(
        &self,
        origin: &Path,
        max_depth: i32,
        filter: &dyn Fn(&Entry<T>) -> bool,
    ) -> Vec<Entry<T>> {
        if max_depth < 0 {
            return match self.entry(origin) {
                Some(entry) if filter(entry) => vec![entry.clone()],
                _ => Vec::new(),
            };
        }
        if origin != self.path && relative_depth(&self.path, origin).is_none() {
            return Vec::new();
        }
        self.entries
            .values()
            .filter(|entry| {
                matches!(relative_depth(origin, entry.path()), Some(d) if (0..=max_depth).contains(&d))
            })
            .filter(|entry| filter(entry))
            .cloned()
            .collect()
    }

    /// Re-examines `typed_path` and reconciles the cache with what is now on
    /// disk, returning the resulting diff in path order.
    ///
    /// The subtree under `typed_path` is re-scanned (bounded by the depth
    /// budget remaining at that point); with `rescan_subtree` the whole
    /// cached tree is re-scanned from the root instead, which is how
    /// overflows are absorbed.
    pub fn update(&mut self, typed_path: &TypedPath, rescan_subtree: bool) -> Diff<T> {
        if rescan_subtree || typed_path.path() == self.path {
            return self.update_root();
        }
        let path = typed_path.path();
        let Some(depth) = relative_depth(&self.path, path) else {
            return Diff::default();
        };
        if depth > self.max_depth {
            return Diff::default();
        }

        // Several levels may have appeared at once and only the deepest path
        // got an event. Widen the scope to the topmost uncached ancestor so
        // the intermediate directories are discovered in the same pass.
        let scope = self.uncached_ancestor(path);
        let (scope_typed, depth) = if scope == path {
            (typed_path.clone(), depth)
        } else {
            let scope_typed = TypedPath::stat(&scope);
            let depth = relative_depth(&self.path, &scope).unwrap_or(depth);
            (scope_typed, depth)
        };
        let scope_path = scope_typed.path().to_path_buf();

        let old_scope = self.take_scope(&scope_path);
        let mut new_scope = EntryMap::new();
        if scope_typed.exists() && (self.filter)(&scope_typed) {
            new_scope.insert(
                scope_path.clone(),
                Entry::new(scope_typed.clone(), &self.converter),
            );
            let children_remaining = remaining_below(self.max_depth, depth);
            if self.should_descend(&scope_typed) && children_remaining >= 0 {
                self.scan(&scope_typed, children_remaining, &mut new_scope);
            }
        }

        let diff = diff_entries(&old_scope, &new_scope);
        self.entries.extend(new_scope);
        diff
    }

    /// Removes `path` and everything under it, returning the removed entries
    /// in path order with their cached file-type bits intact.
    pub fn remove(&mut self, path: &Path) -> Vec<Entry<T>> {
        self.take_scope(path).into_values().collect()
    }

    fn update_root(&mut self) -> Diff<T> {
        let typed = TypedPath::stat(&self.path);
        let new_root = Entry::new(typed.clone(), &self.converter);
        let mut new_entries = EntryMap::new();
        if self.max_depth >= 0 && typed.is_directory() {
            self.scan(&typed, self.max_depth, &mut new_entries);
        }

        let mut old_map = self.entries.clone();
        old_map.insert(self.path.clone(), self.root.clone());
        let mut new_map = new_entries.clone();
        new_map.insert(self.path.clone(), new_root.clone());

        let diff = diff_entries(&old_map, &new_map);
        self.root = new_root;
        self.entries = new_entries;
        diff
    }

    /// Walks up from `path` to the shallowest ancestor (strictly below the
    /// root) that is not yet cached. Returns `path` itself when its parent is
    /// already known.
    fn uncached_ancestor(&self, path: &Path) -> PathBuf {
        let mut current = path.to_path_buf();
        while let Some(parent) = current.parent() {
            if parent == self.path || self.entries.contains_key(parent) {
                break;
            }
            current = parent.to_path_buf();
        }
        current
    }

    /// Detaches the cached entries at and below `path`.
    fn take_scope(&mut self, path: &Path) -> EntryMap<T> {
        let mut scope = EntryMap::new();
        let keys: Vec<PathBuf> = self
            .entries
            .range(path.to_path_buf()..)
            .take_while(|(k, _)| k.starts_with(path))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                scope.insert(key, entry);
            }
        }
        scope
    }

    fn should_descend(&self, typed: &TypedPath) -> bool {
        typed.is_directory() && (self.follow_links || !typed.is_symlink())
    }

    /// Recursively lists `origin`'s children into `out`. `remaining` is how
    /// many further levels below those children may be descended. Listing
    /// failures are swallowed: a subtree that cannot be read right now simply
    /// contributes nothing, and the diff treats its old entries as deletions.
    fn scan(&self, origin: &TypedPath, remaining: i32, out: &mut EntryMap<T>) {
        let children = match self.lister.list(origin.path()) {
            Ok(children) => children,
            Err(err) => {
                tracing::debug!(
                    target = "arbor.core",
                    path = %origin.path().display(),
                    error = %err,
                    "listing failed during scan"
                );
                return;
            }
        };
        self.scan_children(children, remaining, out);
    }

    fn scan_children(&self, children: Vec<TypedPath>, remaining: i32, out: &mut EntryMap<T>) {
        for child in children {
            if (self.filter)(&child) {
                out.insert(
                    child.path().to_path_buf(),
                    Entry::new(child.clone(), &self.converter),
                );
            }
            if self.should_descend(&child) && remaining > 0 {
                self.scan(&child, decrement(remaining), out);
            }
        }
    }
}

fn decrement(remaining: i32) -> i32 {
    if remaining == DEPTH_INFINITE {
        DEPTH_INFINITE
    } else {
        remaining - 1
    }
}

/// Depth budget below the children of a node `depth` levels under the root.
fn remaining_below(max_depth: i32, depth: i32) -> i32 {
    if max_depth == DEPTH_INFINITE {
        DEPTH_INFINITE
    } else {
        max_depth - (depth + 1)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use super::*;
    use crate::lister::{DirectoryLister, OsDirectoryLister};

    fn name_of(tp: &TypedPath) -> io::Result<String> {
        Ok(tp
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    fn open(
        path: &Path,
        max_depth: i32,
    ) -> Result<CachedDirectory<String>, OpenError> {
        CachedDirectory::open(
            path,
            max_depth,
            Arc::new(name_of),
            Arc::new(OsDirectoryLister),
            false,
            accept_all(),
        )
    }

    fn names(entries: &[Entry<String>]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.value().unwrap().clone())
            .collect()
    }

    #[test]
    fn open_scans_to_the_depth_bound() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), b"").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"").unwrap();

        let cached = open(dir.path(), 1).unwrap();
        let all = cached.list(dir.path(), DEPTH_INFINITE, &|_| true);
        assert_eq!(names(&all), vec!["a", "b", "top.txt"]);

        let deep = open(dir.path(), DEPTH_INFINITE).unwrap();
        let all = deep.list(dir.path(), DEPTH_INFINITE, &|_| true);
        assert_eq!(names(&all), vec!["a", "b", "c.txt", "top.txt"]);
    }

    #[test]
    fn list_bounds_relative_depth_and_excludes_origin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();

        let cached = open(dir.path(), DEPTH_INFINITE).unwrap();
        assert_eq!(names(&cached.list(dir.path(), 0, &|_| true)), vec!["a"]);

        let under_a = cached.list(&dir.path().join("a"), 0, &|_| true);
        assert_eq!(names(&under_a), vec!["b"]);

        let only_a = cached.list(&dir.path().join("a"), -1, &|_| true);
        assert_eq!(names(&only_a), vec!["a"]);
    }

    #[test]
    fn open_missing_and_non_directory_roots() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            open(&dir.path().join("gone"), 0).unwrap_err(),
            OpenError::NotFound
        );

        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"").unwrap();
        assert_eq!(open(&file, 0).unwrap_err(), OpenError::NotADirectory);

        // Depth -1 accepts a plain file as a leaf root.
        let leaf = open(&file, -1).unwrap();
        assert!(leaf.root_entry().typed_path().is_file());
        assert_eq!(names(&leaf.list(&file, -1, &|_| true)), vec!["f.txt"]);
    }

    #[test]
    fn open_surfaces_a_root_listing_failure() {
        struct Denying;
        impl DirectoryLister for Denying {
            fn list(&self, _dir: &Path) -> io::Result<Vec<TypedPath>> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let err = CachedDirectory::<String>::open(
            dir.path(),
            0,
            Arc::new(name_of),
            Arc::new(Denying),
            false,
            accept_all(),
        )
        .unwrap_err();
        match err {
            OpenError::Io(err) => assert_eq!(err.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected an I/O failure, got {other:?}"),
        }
    }

    #[test]
    fn update_reflects_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cached = open(dir.path(), DEPTH_INFINITE).unwrap();

        let file = dir.path().join("new.txt");
        std::fs::write(&file, b"").unwrap();
        let diff = cached.update(&TypedPath::stat(&file), false);

        assert_eq!(diff.created().len(), 1);
        assert_eq!(diff.created()[0].path(), file);
        assert!(diff.updated().is_empty() && diff.deleted().is_empty());
        assert!(cached.entry(&file).is_some());
    }

    #[test]
    fn update_of_a_new_directory_picks_up_its_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut cached = open(dir.path(), DEPTH_INFINITE).unwrap();

        std::fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        std::fs::write(dir.path().join("sub/inner/x.txt"), b"").unwrap();
        let diff = cached.update(&TypedPath::stat(dir.path().join("sub")), false);

        let created: Vec<_> = diff.created().iter().map(|e| e.path().to_owned()).collect();
        assert_eq!(
            created,
            vec![
                dir.path().join("sub"),
                dir.path().join("sub/inner"),
                dir.path().join("sub/inner/x.txt"),
            ]
        );
    }

    #[test]
    fn update_for_a_deep_path_discovers_uncached_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let mut cached = open(dir.path(), DEPTH_INFINITE).unwrap();

        // Only the leaf gets an event; the intermediate directory must be
        // discovered in the same pass.
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/b.txt"), b"").unwrap();
        let diff = cached.update(&TypedPath::stat(dir.path().join("a/b.txt")), false);

        let created: Vec<_> = diff.created().iter().map(|e| e.path().to_owned()).collect();
        assert_eq!(
            created,
            vec![dir.path().join("a"), dir.path().join("a/b.txt")]
        );
        assert!(cached.entry(&dir.path().join("a")).is_some());
    }

    #[test]
    fn update_honors_the_depth_bound_for_new_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let mut cached = open(dir.path(), 0).unwrap();

        std::fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        let diff = cached.update(&TypedPath::stat(dir.path().join("sub")), false);

        let created: Vec<_> = diff.created().iter().map(|e| e.path().to_owned()).collect();
        // Depth 0 covers children of the root only; sub/inner is out of scope.
        assert_eq!(created, vec![dir.path().join("sub")]);
    }

    #[test]
    fn update_after_deletion_reports_the_subtree_gone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x.txt"), b"").unwrap();
        let mut cached = open(dir.path(), DEPTH_INFINITE).unwrap();

        std::fs::remove_dir_all(dir.path().join("sub")).unwrap();
        let diff = cached.update(&TypedPath::stat(dir.path().join("sub")), false);

        let deleted: Vec<_> = diff.deleted().iter().map(|e| e.path().to_owned()).collect();
        assert_eq!(
            deleted,
            vec![dir.path().join("sub"), dir.path().join("sub/x.txt")]
        );
        assert!(diff.deleted().iter().all(|e| !e.typed_path().exists()));
        assert!(cached.entry(&dir.path().join("sub")).is_none());
    }

    #[test]
    fn rescan_reconciles_everything_from_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"").unwrap();
        let mut cached = open(dir.path(), DEPTH_INFINITE).unwrap();

        std::fs::remove_file(dir.path().join("old.txt")).unwrap();
        std::fs::write(dir.path().join("new.txt"), b"").unwrap();
        let diff = cached.update(&TypedPath::stat(dir.path()), true);

        assert_eq!(diff.created().len(), 1);
        assert_eq!(diff.created()[0].path(), dir.path().join("new.txt"));
        assert_eq!(diff.deleted().len(), 1);
        assert_eq!(diff.deleted()[0].path(), dir.path().join("old.txt"));
    }

    #[test]
    fn remove_detaches_the_subtree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x.txt"), b"").unwrap();
        std::fs::write(dir.path().join("subzero"), b"").unwrap();
        let mut cached = open(dir.path(), DEPTH_INFINITE).unwrap();

        let removed = cached.remove(&dir.path().join("sub"));
        let paths: Vec<_> = removed.iter().map(|e| e.path().to_owned()).collect();
        assert_eq!(
            paths,
            vec![dir.path().join("sub"), dir.path().join("sub/x.txt")]
        );
        // Sibling with a shared name prefix is untouched.
        assert!(cached.entry(&dir.path().join("subzero")).is_some());
    }

    #[test]
    fn filter_excludes_entries_but_not_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("skip")).unwrap();
        std::fs::write(dir.path().join("skip/kept.txt"), b"").unwrap();

        let filter: PathFilter = Arc::new(|tp: &TypedPath| {
            tp.path().file_name().map(|n| n != "skip").unwrap_or(true)
        });
        let cached = CachedDirectory::<String>::open(
            dir.path(),
            DEPTH_INFINITE,
            Arc::new(name_of),
            Arc::new(OsDirectoryLister),
            false,
            filter,
        )
        .unwrap();

        let all = cached.list(dir.path(), DEPTH_INFINITE, &|_| true);
        assert_eq!(names(&all), vec!["kept.txt"]);
    }
}
