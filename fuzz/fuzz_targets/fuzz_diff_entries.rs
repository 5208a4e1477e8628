#![no_main]

use std::collections::BTreeSet;
use std::path::PathBuf;

use arbor_core::{diff_entries, Entry, EntryMap, TypedPath};
use libfuzzer_sys::fuzz_target;

// Builds two arbitrary snapshots from the input and checks that the diff is
// a proper partition: every key lands in exactly one of created / updated /
// deleted / unchanged, updates really changed, and batches are path-sorted.
fuzz_target!(|data: &[u8]| {
    let mut old: EntryMap<u8> = EntryMap::new();
    let mut new: EntryMap<u8> = EntryMap::new();

    for record in data.chunks_exact(4) {
        let path = PathBuf::from(format!("/r/{:02x}", record[0] % 64));
        let flags = record[1];
        if flags & 1 != 0 {
            old.insert(
                path.clone(),
                Entry::resolved(TypedPath::nonexistent(&path), record[2]),
            );
        }
        if flags & 2 != 0 {
            new.insert(
                path.clone(),
                Entry::resolved(TypedPath::nonexistent(&path), record[3]),
            );
        }
    }

    let diff = diff_entries(&old, &new);

    let created: Vec<PathBuf> = diff.created().iter().map(|e| e.path().into()).collect();
    let updated: Vec<PathBuf> = diff.updated().iter().map(|(_, c)| c.path().into()).collect();
    let deleted: Vec<PathBuf> = diff.deleted().iter().map(|e| e.path().into()).collect();

    for set in [&created, &updated, &deleted] {
        let mut sorted = (*set).clone();
        sorted.sort();
        assert_eq!(*set, sorted, "diff output must be path-sorted");
    }

    let created: BTreeSet<PathBuf> = created.into_iter().collect();
    let updated: BTreeSet<PathBuf> = updated.into_iter().collect();
    let deleted: BTreeSet<PathBuf> = deleted.into_iter().collect();

    assert!(created.is_disjoint(&updated));
    assert!(created.is_disjoint(&deleted));
    assert!(updated.is_disjoint(&deleted));

    for (path, entry) in &new {
        let in_old = old.get(path);
        match in_old {
            None => assert!(created.contains(path)),
            Some(previous) if previous != entry => assert!(updated.contains(path)),
            Some(_) => {
                assert!(!created.contains(path));
                assert!(!updated.contains(path));
                assert!(!deleted.contains(path));
            }
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            assert!(deleted.contains(path));
        } else {
            assert!(!deleted.contains(path));
        }
    }
    for entry in diff.deleted() {
        assert!(!entry.typed_path().exists());
    }
});
