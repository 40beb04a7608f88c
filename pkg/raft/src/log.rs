//! In-memory replicated log, mirrored to the durable state store.

use crate::protos::{LogEntry, LogIndex, Term};

/// Ordered, 1-indexed sequence of log entries. Index 0 is the implicit
/// "nothing has happened yet" position; `entries[0]` in the backing vector
/// corresponds to log index 1.
#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: Vec::new() }
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Log { entries }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at 1-indexed `index`, or `None` if out of range.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get((index - 1) as usize).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn slice_from(&self, start_index: LogIndex) -> &[LogEntry] {
        if start_index == 0 || start_index > self.last_index() {
            return &[];
        }
        &self.entries[(start_index - 1) as usize..]
    }

    /// Appends a single entry, returning its newly assigned 1-indexed
    /// position.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// True iff `prev_idx == 0` or the local entry at `prev_idx` carries
    /// `prev_term`.
    pub fn matches(&self, prev_idx: LogIndex, prev_term: Term) -> bool {
        if prev_idx == 0 {
            return true;
        }
        self.term_at(prev_idx) == Some(prev_term)
    }

    /// Follower-side reconciliation of an `AppendEntries` payload. Returns
    /// `true` if accepted. Never truncates entries beyond the range the
    /// leader mentioned in this call.
    pub fn reconcile(&mut self, prev_idx: LogIndex, prev_term: Term, new_entries: &[LogEntry]) -> bool {
        if prev_idx > self.last_index() {
            return false;
        }
        if prev_idx > 0 && self.term_at(prev_idx) != Some(prev_term) {
            return false;
        }

        if prev_idx == 0 && !new_entries.is_empty() {
            if let (Some(first_new), Some(first_local)) = (new_entries.first(), self.entries.first()) {
                if first_new.term != first_local.term {
                    self.entries.clear();
                }
            }
        }

        for (i, new_entry) in new_entries.iter().enumerate() {
            let idx = prev_idx + 1 + i as u64;
            match self.term_at(idx) {
                Some(local_term) if local_term != new_entry.term => {
                    self.entries.truncate((idx - 1) as usize);
                    self.entries.push(new_entry.clone());
                }
                Some(_) => {
                    // Terms match at this slot; leave the existing entry untouched.
                }
                None => {
                    self.entries.push(new_entry.clone());
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term) -> LogEntry {
        LogEntry::new(term, "SUBSCRIBE", vec!["a@x".into()])
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let mut log = Log::new();
        assert_eq!(log.append(entry(1)), 1);
        assert_eq!(log.append(entry(1)), 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn matches_empty_prev_idx_zero() {
        let log = Log::new();
        assert!(log.matches(0, 0));
    }

    #[test]
    fn reconcile_rejects_future_prev_idx() {
        let mut log = Log::new();
        assert!(!log.reconcile(5, 1, &[entry(1)]));
    }

    #[test]
    fn reconcile_rejects_term_mismatch_at_prev_idx() {
        let mut log = Log::from_entries(vec![entry(1)]);
        assert!(!log.reconcile(1, 2, &[entry(2)]));
    }

    #[test]
    fn reconcile_truncates_on_conflicting_term() {
        let mut log = Log::from_entries(vec![entry(1), entry(1)]);
        assert!(log.reconcile(1, 1, &[entry(2)]));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn reconcile_leaves_untouched_entries_past_new_range() {
        let mut log = Log::from_entries(vec![entry(1), entry(1), entry(1)]);
        assert!(log.reconcile(1, 1, &[entry(1)]));
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn reconcile_clears_on_first_entry_term_mismatch_at_zero() {
        let mut log = Log::from_entries(vec![entry(5)]);
        assert!(log.reconcile(0, 0, &[entry(1), entry(1)]));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(1), Some(1));
    }

    #[test]
    fn reconcile_is_noop_when_terms_already_match() {
        let mut log = Log::from_entries(vec![entry(1)]);
        assert!(log.reconcile(0, 0, &[entry(1)]));
        assert_eq!(log.last_index(), 1);
    }
}
