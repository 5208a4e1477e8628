//! Watcher backends and the live file-tree repository.
//!
//! The [`PathWatcher`] trait is the seam between event production and cache
//! maintenance: [`NotifyPathWatcher`] wraps the OS facility,
//! [`PollingPathWatcher`] diffs periodic scans for platforms without one,
//! and [`ManualPathWatcher`] lets tests inject events deterministically.
//! [`FileTreeRepository`] consumes any of them and keeps
//! [`arbor_core::CachedDirectory`] mirrors consistent, delivering ordered
//! change callbacks from a single thread.

pub mod error;
pub mod event;
mod executor;
pub mod notify_watcher;
pub mod polling;
pub mod repository;
pub mod symlink;
pub mod watcher;

pub use error::WatchError;
pub use event::{Event, EventKind};
pub use notify_watcher::NotifyPathWatcher;
pub use polling::PollingPathWatcher;
pub use repository::FileTreeRepository;
pub use symlink::SymlinkWatcher;
pub use watcher::{event_observer, EventObserver, ManualPathWatcher, PathWatcher};
