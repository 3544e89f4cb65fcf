//! Revision cursor bookkeeping for one sync session.
//!
//! The cursor tracks three things: the committed watermark (`last_sync_rev`),
//! the highest revision the session itself has written (`next_sync_rev`), and
//! the set of self-caused revisions (`known_new_revs`). Together they let the
//! end-of-session change scan distinguish "something else touched the folder,
//! sync again" from "only our own writes landed, we are done".

use std::collections::BTreeSet;

use crate::types::{ChangeRecord, ChangeSet, Rev};

/// Per-session revision cursor. Owned by the session; reset between runs only
/// via [`SyncCursor::reset`].
#[derive(Debug, Clone, Default)]
pub struct SyncCursor {
    /// Watermark of the last acknowledged commit. `None` until the folder has
    /// completed a first sync.
    last_sync_rev: Option<Rev>,
    /// Highest revision produced by this session's own writes.
    next_sync_rev: Rev,
    /// Revisions caused by this session's own writes, excluded from
    /// needs-upload classification.
    known_new_revs: BTreeSet<Rev>,
}

impl SyncCursor {
    pub fn new(last_sync_rev: Option<Rev>) -> Self {
        Self { last_sync_rev, next_sync_rev: 0, known_new_revs: BTreeSet::new() }
    }

    /// A folder that has never committed a watermark is in initial sync.
    pub fn is_initial_sync(&self) -> bool {
        self.last_sync_rev.is_none()
    }

    pub fn last_sync_rev(&self) -> Option<Rev> {
        self.last_sync_rev
    }

    pub fn next_sync_rev(&self) -> Rev {
        self.next_sync_rev
    }

    /// Revision floor for the end-of-session change scan: everything at or
    /// below it has either been committed or was written by us.
    pub fn query_after(&self) -> Rev {
        self.last_sync_rev.unwrap_or(0).max(self.next_sync_rev)
    }

    /// Raise the self-write high-water mark. Never lowers it.
    pub fn set_next_sync_rev(&mut self, rev: Rev) {
        self.next_sync_rev = self.next_sync_rev.max(rev);
    }

    /// Record revisions from our own store writes (put/merge responses). These
    /// advance the watermark without triggering another sync pass.
    pub fn add_put_response_revs(&mut self, revs: &[Rev]) {
        for &rev in revs {
            self.known_new_revs.insert(rev);
            self.next_sync_rev = self.next_sync_rev.max(rev);
        }
    }

    /// Split a batch of observed changes into self-caused and external ones.
    pub fn classify(&self, changes: &[ChangeRecord]) -> ChangeSet {
        let mut set = ChangeSet::default();
        for change in changes {
            set.highest_rev = Some(set.highest_rev.map_or(change.rev, |h: Rev| h.max(change.rev)));
            if self.known_new_revs.contains(&change.rev) {
                set.known.push(change.clone());
            } else {
                set.needs_upload.push(change.clone());
            }
        }
        set
    }

    /// Advance the watermark from a classified change batch. Returns `true`
    /// when external changes were present, meaning the folder needs another
    /// sync pass to pick them up.
    ///
    /// The math: with an external change present, the watermark stops just
    /// short of the lowest one so the next scan re-reads it; with only
    /// self-caused changes it jumps to the highest observed revision. Either
    /// way it never falls below our own write high-water mark, and since the
    /// scan only returns revisions above the old watermark it never regresses.
    pub fn advance(&mut self, set: &ChangeSet) -> bool {
        let mut last = self.last_sync_rev.unwrap_or(0);
        let has_external = !set.needs_upload.is_empty();
        if has_external {
            let lowest_new =
                set.needs_upload.iter().map(|c| c.rev).min().unwrap_or(last + 1);
            last = lowest_new - 1;
        } else if let Some(highest) = set.highest_rev {
            last = last.max(highest);
        }
        last = last.max(self.next_sync_rev);
        self.last_sync_rev = Some(last);
        has_external
    }

    /// Acknowledge a successful commit of the current watermark: self-caused
    /// revisions at or below it no longer need tracking.
    pub fn commit_acknowledged(&mut self) {
        if let Some(last) = self.last_sync_rev {
            self.known_new_revs.retain(|&rev| rev > last);
        }
    }

    /// Drop all per-run tracking, keeping only the committed watermark.
    pub fn reset(&mut self) {
        self.next_sync_rev = 0;
        self.known_new_revs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str, rev: Rev) -> ChangeRecord {
        ChangeRecord { id: id.to_string(), rev }
    }

    #[test]
    fn missing_watermark_means_initial_sync() {
        assert!(SyncCursor::new(None).is_initial_sync());
        assert!(!SyncCursor::new(Some(0)).is_initial_sync());
    }

    #[test]
    fn own_writes_are_excluded_from_upload() {
        let mut cursor = SyncCursor::new(Some(100));
        cursor.add_put_response_revs(&[101, 102]);

        let set = cursor.classify(&[change("a", 101), change("b", 102), change("c", 103)]);
        let upload: Vec<Rev> = set.needs_upload.iter().map(|c| c.rev).collect();
        assert_eq!(upload, vec![103]);
        assert_eq!(set.known.len(), 2);
        assert_eq!(set.highest_rev, Some(103));
    }

    #[test]
    fn external_change_parks_watermark_below_it() {
        let mut cursor = SyncCursor::new(Some(100));
        cursor.add_put_response_revs(&[101]);

        let set = cursor.classify(&[change("own", 101), change("ext", 105)]);
        let more = cursor.advance(&set);
        assert!(more);
        // 104 would skip the external change at 105; 101 is our own write.
        assert_eq!(cursor.last_sync_rev(), Some(104));
    }

    #[test]
    fn only_own_writes_advance_to_highest() {
        let mut cursor = SyncCursor::new(Some(100));
        cursor.add_put_response_revs(&[101, 105]);

        let set = cursor.classify(&[change("a", 101), change("b", 105)]);
        let more = cursor.advance(&set);
        assert!(!more);
        assert_eq!(cursor.last_sync_rev(), Some(105));
    }

    #[test]
    fn empty_scan_still_covers_own_writes() {
        let mut cursor = SyncCursor::new(Some(100));
        cursor.add_put_response_revs(&[107]);

        let more = cursor.advance(&ChangeSet::default());
        assert!(!more);
        assert_eq!(cursor.last_sync_rev(), Some(107));
    }

    #[test]
    fn watermark_never_regresses() {
        let mut cursor = SyncCursor::new(Some(200));
        let set = cursor.classify(&[change("ext", 201)]);
        cursor.advance(&set);
        assert_eq!(cursor.last_sync_rev(), Some(200));

        // A second pass over the same range converges.
        let more = cursor.advance(&cursor.classify(&[]));
        assert!(!more);
        assert_eq!(cursor.last_sync_rev(), Some(200));
    }

    #[test]
    fn commit_prunes_covered_known_revs() {
        let mut cursor = SyncCursor::new(Some(100));
        cursor.add_put_response_revs(&[101, 110]);

        let set = cursor.classify(&[change("a", 101)]);
        cursor.advance(&set);
        assert_eq!(cursor.last_sync_rev(), Some(110));
        cursor.commit_acknowledged();

        // Nothing below the committed watermark is tracked any more.
        let set = cursor.classify(&[change("a", 101), change("b", 110)]);
        assert!(set.known.is_empty());
    }

    #[test]
    fn query_floor_is_max_of_watermark_and_own_writes() {
        let mut cursor = SyncCursor::new(Some(100));
        assert_eq!(cursor.query_after(), 100);
        cursor.add_put_response_revs(&[120]);
        assert_eq!(cursor.query_after(), 120);
    }
}
