//! Cache entries: a [`TypedPath`] paired with a caller-derived value.
//!
//! The value is produced by a [`Converter`] at scan time. Converter failures
//! are captured inside the entry as an [`EntryError`] rather than aborting the
//! traversal, so one unreadable path never prevents its siblings from being
//! cached.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::path::TypedPath;

/// Derives the cached value for a path. Runs during scans, so it must be
/// callable from the watcher callback thread.
pub type Converter<T> = Arc<dyn Fn(&TypedPath) -> io::Result<T> + Send + Sync>;

/// A converter failure captured inside an [`Entry`].
///
/// `io::Error` is neither `Clone` nor `Eq`, so the kind and rendered message
/// are kept instead. Two failures with the same kind and message compare
/// equal, which is what the diff engine needs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EntryError {
    kind: io::ErrorKind,
    message: String,
}

impl EntryError {
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for EntryError {
    fn from(err: io::Error) -> Self {
        EntryError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One cached path: its file-type bits and its derived value (or the failure
/// that produced it). Entries are immutable; updates replace them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    typed_path: TypedPath,
    value: Result<T, EntryError>,
}

impl<T> Entry<T> {
    /// Runs `converter` for `typed_path`, capturing any failure in the entry.
    pub fn new(typed_path: TypedPath, converter: &Converter<T>) -> Entry<T> {
        let value = converter(&typed_path).map_err(EntryError::from);
        Entry { typed_path, value }
    }

    /// Builds an entry whose value is already known.
    pub fn resolved(typed_path: TypedPath, value: T) -> Entry<T> {
        Entry {
            typed_path,
            value: Ok(value),
        }
    }

    pub fn typed_path(&self) -> &TypedPath {
        &self.typed_path
    }

    pub fn path(&self) -> &std::path::Path {
        self.typed_path.path()
    }

    pub fn value(&self) -> Result<&T, &EntryError> {
        self.value.as_ref()
    }

    /// The same entry with its path re-marked nonexistent, for delete
    /// notifications. The cached value is kept so subscribers can see what
    /// was lost.
    pub fn as_nonexistent(&self) -> Entry<T>
    where
        T: Clone,
    {
        Entry {
            typed_path: self.typed_path.as_nonexistent(),
            value: self.value.clone(),
        }
    }
}

/// Path-keyed entry map. `BTreeMap` keeps iteration (and therefore every
/// derived callback batch) in lexicographic path order.
pub type EntryMap<T> = BTreeMap<PathBuf, Entry<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn name_converter() -> Converter<String> {
        Arc::new(|tp: &TypedPath| {
            let name = tp
                .path()
                .file_name()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no file name"))?;
            Ok(name.to_string_lossy().into_owned())
        })
    }

    #[test]
    fn converter_result_is_captured() {
        let converter = name_converter();
        let entry = Entry::new(TypedPath::nonexistent("/tmp/x/file.txt"), &converter);
        assert_eq!(entry.value(), Ok(&"file.txt".to_string()));

        let entry = Entry::new(TypedPath::nonexistent("/"), &converter);
        let err = entry.value().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn as_nonexistent_preserves_the_value() {
        let entry = Entry::resolved(TypedPath::nonexistent("/tmp/a"), 7u32);
        let gone = entry.as_nonexistent();
        assert_eq!(gone.value(), Ok(&7));
        assert!(!gone.typed_path().exists());
    }
}
