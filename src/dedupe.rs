use std::collections::BTreeSet;

use crate::store::{SeenRecordSet, StateStore, StoreError};

/// Detects conversation record files that have not been counted before.
///
/// The seen-set grows monotonically and is flushed to durable storage on
/// every commit. Committing is the caller's responsibility and must happen
/// only after the new-record delta has been reported, so a crash between
/// detection and commit can at worst double-detect, never silently drop.
#[derive(Debug)]
pub struct ConversationDeduper {
    seen: SeenRecordSet,
    store: StateStore,
    initialized: bool,
}

impl ConversationDeduper {
    pub fn new(seen: SeenRecordSet, store: StateStore) -> Self {
        Self {
            seen,
            store,
            initialized: false,
        }
    }

    /// Pure set difference against the seen-set; no state is mutated.
    pub fn find_new(&self, on_disk: &BTreeSet<String>) -> BTreeSet<String> {
        on_disk.difference(&self.seen.ids).cloned().collect()
    }

    /// True once the first commit of this process lifetime has happened.
    /// Records present before that are treated as pre-existing population,
    /// not as new-conversation events.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Adds `new_ids` to the seen-set and flushes it. Committing ids that
    /// are already present is a no-op and skips the flush.
    pub fn commit(&mut self, new_ids: &BTreeSet<String>) -> Result<(), StoreError> {
        self.initialized = true;

        let mut inserted = false;
        for id in new_ids {
            inserted |= self.seen.ids.insert(id.clone());
        }
        if !inserted {
            return Ok(());
        }
        self.store.save_seen_records(&self.seen)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn deduper_in(tmp: &TempDir, seen: &[&str]) -> ConversationDeduper {
        let store = StateStore::new(tmp.path().to_path_buf());
        let set = SeenRecordSet { ids: ids(seen) };
        ConversationDeduper::new(set, store)
    }

    #[test]
    fn find_new_is_set_difference() {
        let tmp = TempDir::new().expect("temp dir");
        let deduper = deduper_in(&tmp, &["proj/a", "proj/b"]);

        let new = deduper.find_new(&ids(&["proj/a", "proj/b", "proj/c"]));
        assert_eq!(new, ids(&["proj/c"]));
    }

    #[test]
    fn find_new_is_idempotent_without_commit() {
        let tmp = TempDir::new().expect("temp dir");
        let deduper = deduper_in(&tmp, &["proj/a"]);
        let on_disk = ids(&["proj/a", "proj/b"]);

        assert_eq!(deduper.find_new(&on_disk), deduper.find_new(&on_disk));
    }

    #[test]
    fn commit_twice_is_a_no_op_second_time() {
        let tmp = TempDir::new().expect("temp dir");
        let mut deduper = deduper_in(&tmp, &[]);
        let new = ids(&["proj/a", "proj/b"]);

        deduper.commit(&new).expect("first commit");
        assert!(deduper.find_new(&new).is_empty());

        deduper.commit(&new).expect("second commit");
        assert!(deduper.find_new(&new).is_empty());
        assert_eq!(deduper.seen_count(), 2);
    }

    #[test]
    fn committed_ids_survive_reload() {
        let tmp = TempDir::new().expect("temp dir");
        let store = StateStore::new(tmp.path().to_path_buf());

        let mut deduper = deduper_in(&tmp, &[]);
        deduper.commit(&ids(&["proj/a"])).expect("commit");

        let reloaded = store.load_seen_records().expect("load");
        let deduper = ConversationDeduper::new(reloaded, store);
        assert!(deduper.find_new(&ids(&["proj/a"])).is_empty());
        assert_eq!(deduper.find_new(&ids(&["proj/a", "proj/b"])), ids(&["proj/b"]));
    }

    #[test]
    fn initialized_flips_on_first_commit_even_when_empty() {
        let tmp = TempDir::new().expect("temp dir");
        let mut deduper = deduper_in(&tmp, &[]);

        assert!(!deduper.initialized());
        deduper.commit(&BTreeSet::new()).expect("commit");
        assert!(deduper.initialized());
    }
}
