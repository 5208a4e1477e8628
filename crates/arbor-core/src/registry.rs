//! Registered-root bookkeeping.
//!
//! [`DirectoryRegistry`] records which roots a consumer asked to mirror and
//! at what depth, and answers membership questions for event filtering. It
//! performs no I/O and owns its own lock, so watcher backends and the cache
//! can share one instance.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Marker for unbounded recursion depth. Depth arithmetic saturates, so the
/// marker survives subtraction.
pub const DEPTH_INFINITE: i32 = i32::MAX;

/// Depth of `path` below `root`: `-1` for the root itself, `0` for a direct
/// child, and so on. `None` when `path` is not under `root`.
pub fn relative_depth(root: &Path, path: &Path) -> Option<i32> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.components().count() as i32 - 1)
}

#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    roots: Mutex<BTreeMap<PathBuf, i32>>,
}

impl DirectoryRegistry {
    pub fn new() -> DirectoryRegistry {
        DirectoryRegistry::default()
    }

    /// Records `path` with `max_depth`. Returns `true` when the root is new
    /// or the recorded depth was widened; repeat registrations at the same or
    /// a narrower depth return `false`. Depth never narrows.
    pub fn add_directory(&self, path: &Path, max_depth: i32) -> bool {
        let mut roots = self.roots.lock();
        match roots.get_mut(path) {
            Some(existing) if *existing >= max_depth => false,
            Some(existing) => {
                *existing = max_depth;
                true
            }
            None => {
                roots.insert(path.to_path_buf(), max_depth);
                true
            }
        }
    }

    pub fn remove_directory(&self, path: &Path) {
        self.roots.lock().remove(path);
    }

    /// Whether `path` is an exact registered root.
    pub fn registered_exactly(&self, path: &Path) -> bool {
        self.roots.lock().contains_key(path)
    }

    /// Whether `path` falls within any registered root's depth bound.
    pub fn accept(&self, path: &Path) -> bool {
        self.roots
            .lock()
            .iter()
            .any(|(root, max_depth)| covers(root, *max_depth, path))
    }

    /// Like [`accept`](Self::accept), but also true for ancestors of a
    /// registered root. Scans must descend through such directories to reach
    /// the entries they cover.
    pub fn accept_prefix(&self, path: &Path) -> bool {
        let roots = self.roots.lock();
        roots
            .iter()
            .any(|(root, max_depth)| covers(root, *max_depth, path) || root.starts_with(path))
    }

    /// The depth budget left when listing under `path`: the maximum, over all
    /// roots covering `path`, of the registered depth minus the distance
    /// already descended. `None` when no root covers `path`.
    pub fn max_depth_for(&self, path: &Path) -> Option<i32> {
        self.roots
            .lock()
            .iter()
            .filter_map(|(root, max_depth)| {
                let depth = relative_depth(root, path)?;
                if depth > *max_depth {
                    return None;
                }
                Some(remaining_depth(*max_depth, depth))
            })
            .max()
    }

    /// Snapshot of registered roots, path-ordered.
    pub fn registered(&self) -> Vec<(PathBuf, i32)> {
        self.roots
            .lock()
            .iter()
            .map(|(p, d)| (p.clone(), *d))
            .collect()
    }

    pub fn clear(&self) {
        self.roots.lock().clear();
    }
}

fn covers(root: &Path, max_depth: i32, path: &Path) -> bool {
    relative_depth(root, path).is_some_and(|depth| depth <= max_depth)
}

fn remaining_depth(max_depth: i32, depth: i32) -> i32 {
    if max_depth == DEPTH_INFINITE {
        DEPTH_INFINITE
    } else {
        // depth -1 is the root itself, so the full budget remains.
        max_depth - (depth + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_honors_the_depth_bound() {
        let registry = DirectoryRegistry::new();
        registry.add_directory(Path::new("/r"), 1);

        assert!(registry.accept(Path::new("/r")));
        assert!(registry.accept(Path::new("/r/a")));
        assert!(registry.accept(Path::new("/r/a/b")));
        assert!(!registry.accept(Path::new("/r/a/b/c")));
        assert!(!registry.accept(Path::new("/other")));
    }

    #[test]
    fn accept_prefix_includes_ancestors_of_roots() {
        let registry = DirectoryRegistry::new();
        registry.add_directory(Path::new("/r/a/b"), 0);

        assert!(registry.accept_prefix(Path::new("/r")));
        assert!(registry.accept_prefix(Path::new("/r/a")));
        assert!(registry.accept_prefix(Path::new("/r/a/b/c")));
        assert!(!registry.accept_prefix(Path::new("/r/z")));
        assert!(!registry.accept(Path::new("/r")));
    }

    #[test]
    fn depth_only_widens() {
        let registry = DirectoryRegistry::new();
        assert!(registry.add_directory(Path::new("/r"), 1));
        assert!(!registry.add_directory(Path::new("/r"), 0));
        assert_eq!(registry.max_depth_for(Path::new("/r")), Some(1));
        assert!(registry.add_directory(Path::new("/r"), DEPTH_INFINITE));
        assert_eq!(registry.max_depth_for(Path::new("/r")), Some(DEPTH_INFINITE));
    }

    #[test]
    fn max_depth_for_subtracts_descended_distance() {
        let registry = DirectoryRegistry::new();
        registry.add_directory(Path::new("/r"), 2);

        assert_eq!(registry.max_depth_for(Path::new("/r")), Some(2));
        assert_eq!(registry.max_depth_for(Path::new("/r/a")), Some(1));
        assert_eq!(registry.max_depth_for(Path::new("/r/a/b")), Some(0));
        assert_eq!(registry.max_depth_for(Path::new("/r/a/b/c")), Some(-1));
        assert_eq!(registry.max_depth_for(Path::new("/r/a/b/c/d")), None);
    }

    #[test]
    fn overlapping_roots_take_the_widest_budget() {
        let registry = DirectoryRegistry::new();
        registry.add_directory(Path::new("/r"), 0);
        registry.add_directory(Path::new("/r/a"), 3);

        assert_eq!(registry.max_depth_for(Path::new("/r/a")), Some(3));
        // Covered by /r/a at distance 0.
        assert_eq!(registry.max_depth_for(Path::new("/r/a/b")), Some(2));
    }

    #[test]
    fn remove_forgets_the_root() {
        let registry = DirectoryRegistry::new();
        registry.add_directory(Path::new("/r"), DEPTH_INFINITE);
        registry.remove_directory(Path::new("/r"));
        assert!(!registry.accept(Path::new("/r/a")));
        assert!(registry.registered().is_empty());
    }
}
