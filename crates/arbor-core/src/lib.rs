//! Core data model for the arbor file-tree cache.
//!
//! This crate has no watcher: it defines typed paths, cache entries and their
//! diff engine, the registered-root bookkeeping, observer fan-out, and the
//! depth-bounded [`CachedDirectory`] mirror that `arbor-watch` keeps live.

pub mod cached;
pub mod diff;
pub mod entry;
pub mod lister;
pub mod observers;
pub mod path;
pub mod registry;

pub use cached::{accept_all, CachedDirectory, OpenError, PathFilter};
pub use diff::{diff_entries, CacheObserver, Diff};
pub use entry::{Converter, Entry, EntryError, EntryMap};
pub use lister::{DirectoryLister, OsDirectoryLister};
pub use observers::{CacheObservers, EntryObserver, Observers};
pub use path::{FileType, TypedPath};
pub use registry::{relative_depth, DirectoryRegistry, DEPTH_INFINITE};
