use std::io;
use std::path::PathBuf;

/// Errors surfaced by watcher registration and the repository API.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Registering the path would follow a symlink back into itself.
    #[error("symlink loop at {0}")]
    SymlinkLoop(PathBuf),

    /// The component has been closed; the operation was not performed.
    #[error("watcher is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("watch backend error: {0}")]
    Notify(#[from] notify::Error),
}
