//! Single-level directory listing seam.
//!
//! The cache never calls `read_dir` directly; it goes through a
//! [`DirectoryLister`] so tests and embedders can substitute their own view
//! of the file system.

use std::fs;
use std::io;
use std::path::Path;

use crate::path::TypedPath;

pub trait DirectoryLister: Send + Sync {
    /// Lists the immediate children of `dir` with their file-type bits.
    ///
    /// Fails with `NotADirectory`/`NotFound` the way `read_dir` does; the
    /// caller decides whether that is fatal.
    fn list(&self, dir: &Path) -> io::Result<Vec<TypedPath>>;
}

/// The real file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsDirectoryLister;

impl DirectoryLister for OsDirectoryLister {
    fn list(&self, dir: &Path) -> io::Result<Vec<TypedPath>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            out.push(TypedPath::stat(entry.path()));
        }
        // read_dir order is platform-dependent; sort for determinism.
        out.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_children_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let listed = OsDirectoryLister.list(dir.path()).unwrap();
        let names: Vec<_> = listed
            .iter()
            .map(|tp| tp.path().file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["a", "b.txt"]);
        assert!(listed[0].is_directory());
        assert!(listed[1].is_file());
    }

    #[test]
    fn listing_a_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"").unwrap();
        assert!(OsDirectoryLister.list(&file).is_err());
    }

    #[test]
    fn listing_a_missing_path_fails_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = OsDirectoryLister.list(&dir.path().join("gone")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
