use arbor_core::TypedPath;

/// What a watcher backend observed for a path.
///
/// `Overflow` means the backend lost events and the consumer must rescan;
/// `Error` carries no path-level detail beyond the path itself (the watcher
/// reports the underlying failure through its error observer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Delete,
    Modify,
    Overflow,
    Error,
}

/// A watcher notification: the affected path with the file-type bits observed
/// when the event was formed, plus the change kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    typed_path: TypedPath,
    kind: EventKind,
}

impl Event {
    pub fn new(typed_path: TypedPath, kind: EventKind) -> Event {
        Event { typed_path, kind }
    }

    pub fn typed_path(&self) -> &TypedPath {
        &self.typed_path
    }

    pub fn path(&self) -> &std::path::Path {
        self.typed_path.path()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The same event re-pointed at `typed_path`. Used when symlink target
    /// events are replayed against the linking paths.
    pub fn with_typed_path(&self, typed_path: TypedPath) -> Event {
        Event {
            typed_path,
            kind: self.kind,
        }
    }
}
