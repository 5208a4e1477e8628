//! Diff engine over path-keyed entry maps.
//!
//! Comparing an old and a new snapshot partitions the union of their keys
//! into created, updated, and deleted sets. Every key lands in at most one
//! set, and batches come out in lexicographic path order because the inputs
//! are `BTreeMap`s.

use crate::entry::{Entry, EntryError, EntryMap};

/// Receives cache change notifications. `on_error` has a default no-op body
/// since most subscribers only care about entry churn.
pub trait CacheObserver<T>: Send + Sync {
    fn on_create(&self, entry: &Entry<T>);
    fn on_update(&self, previous: &Entry<T>, current: &Entry<T>);
    fn on_delete(&self, entry: &Entry<T>);
    fn on_error(&self, _error: &EntryError) {}
}

/// The ordered outcome of comparing two snapshots.
#[derive(Debug, Clone)]
pub struct Diff<T> {
    created: Vec<Entry<T>>,
    updated: Vec<(Entry<T>, Entry<T>)>,
    deleted: Vec<Entry<T>>,
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Diff {
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn created(&self) -> &[Entry<T>] {
        &self.created
    }

    pub fn updated(&self) -> &[(Entry<T>, Entry<T>)] {
        &self.updated
    }

    pub fn deleted(&self) -> &[Entry<T>] {
        &self.deleted
    }

    pub fn push_created(&mut self, entry: Entry<T>) {
        self.created.push(entry);
    }

    pub fn push_updated(&mut self, previous: Entry<T>, current: Entry<T>) {
        self.updated.push((previous, current));
    }

    pub fn push_deleted(&mut self, entry: Entry<T>) {
        self.deleted.push(entry);
    }

    /// Replays the diff against an observer, each set in path order.
    pub fn notify(&self, observer: &dyn CacheObserver<T>) {
        for entry in &self.deleted {
            observer.on_delete(entry);
        }
        for (previous, current) in &self.updated {
            observer.on_update(previous, current);
        }
        for entry in &self.created {
            observer.on_create(entry);
        }
    }
}

/// Compares two snapshots of the same subtree.
///
/// A key only in `new` is a creation; only in `old`, a deletion (reported
/// with the entry re-marked nonexistent); in both, an update only when the
/// entry actually changed in value or file type.
pub fn diff_entries<T>(old: &EntryMap<T>, new: &EntryMap<T>) -> Diff<T>
where
    T: Clone + PartialEq,
{
    let mut diff = Diff::default();
    for (path, old_entry) in old {
        match new.get(path) {
            Some(new_entry) => {
                if old_entry != new_entry {
                    diff.push_updated(old_entry.clone(), new_entry.clone());
                }
            }
            None => diff.push_deleted(old_entry.as_nonexistent()),
        }
    }
    for (path, new_entry) in new {
        if !old.contains_key(path) {
            diff.push_created(new_entry.clone());
        }
    }
    diff
}
