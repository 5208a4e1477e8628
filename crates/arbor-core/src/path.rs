//! Path-with-file-type model.
//!
//! A [`TypedPath`] bundles an absolute path with the file-type bits that were
//! observed when the path was last examined. The bits are a snapshot: they are
//! captured once (via [`TypedPath::stat`]) and never silently refreshed, so a
//! value can be passed across threads without re-touching the file system.

use std::fs;
use std::path::{Path, PathBuf};

/// File-type bits captured from a single examination of a path.
///
/// `is_symlink` comes from `lstat` and composes with the other bits: a symlink
/// to a directory reports both `is_symlink` and `is_directory`. A path whose
/// link node exists but whose target cannot be examined reports `exists` with
/// neither `is_file` nor `is_directory` set (kind unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileType {
    exists: bool,
    file: bool,
    dir: bool,
    symlink: bool,
}

impl FileType {
    pub const NONEXISTENT: FileType = FileType {
        exists: false,
        file: false,
        dir: false,
        symlink: false,
    };

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_file(&self) -> bool {
        self.file
    }

    pub fn is_directory(&self) -> bool {
        self.dir
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink
    }
}

/// An absolute path plus the [`FileType`] observed for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedPath {
    path: PathBuf,
    file_type: FileType,
}

impl TypedPath {
    /// Examines `path` and captures its current file-type bits.
    ///
    /// Uses `symlink_metadata` for the symlink bit and, only when the path is
    /// a symlink, a second (following) `metadata` call for the target kind.
    /// Stat failures are not errors here: an unexaminable path simply comes
    /// back nonexistent (or, for a dangling link, existing with unknown kind).
    pub fn stat(path: impl Into<PathBuf>) -> TypedPath {
        let path = path.into();
        let file_type = match fs::symlink_metadata(&path) {
            Ok(lmeta) if lmeta.file_type().is_symlink() => match fs::metadata(&path) {
                Ok(meta) => FileType {
                    exists: true,
                    file: meta.is_file(),
                    dir: meta.is_dir(),
                    symlink: true,
                },
                // Dangling link: the link node exists, the target kind is unknown.
                Err(_) => FileType {
                    exists: true,
                    file: false,
                    dir: false,
                    symlink: true,
                },
            },
            Ok(lmeta) => FileType {
                exists: true,
                file: lmeta.is_file(),
                dir: lmeta.is_dir(),
                symlink: false,
            },
            Err(_) => FileType::NONEXISTENT,
        };
        TypedPath { path, file_type }
    }

    /// A `TypedPath` for a path known (or assumed) to be absent.
    pub fn nonexistent(path: impl Into<PathBuf>) -> TypedPath {
        TypedPath {
            path: path.into(),
            file_type: FileType::NONEXISTENT,
        }
    }

    /// Builds a `TypedPath` from already-known bits, without touching disk.
    pub fn with_file_type(path: impl Into<PathBuf>, file_type: FileType) -> TypedPath {
        TypedPath {
            path: path.into(),
            file_type,
        }
    }

    /// The same path re-marked as nonexistent. Used when reporting deletions
    /// for entries whose cached bits still describe the removed file.
    pub fn as_nonexistent(&self) -> TypedPath {
        TypedPath {
            path: self.path.clone(),
            file_type: FileType::NONEXISTENT,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn exists(&self) -> bool {
        self.file_type.exists
    }

    pub fn is_file(&self) -> bool {
        self.file_type.file
    }

    pub fn is_directory(&self) -> bool {
        self.file_type.dir
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type.symlink
    }
}
