use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

/// A notification that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExhaustedNotification {
    pub subject_id: String,
    /// Last value we tried to push
    pub count: u64,
    pub attempts: usize,
    pub timestamp_ms: i64,
    /// Issue order within the notifier: a higher sequence carries a newer count
    pub sequence: u64,
}

/// Subjects whose downstream count is known to be stale.
///
/// One entry per subject; the most recently issued notification wins, not
/// the one that failed last. The sweeper re-checks every entry before
/// sampling. A successful delivery clears the entry only if it was issued
/// no earlier than the failed one.
#[derive(Debug, Default)]
pub struct ExhaustedLedger {
    entries: DashMap<String, ExhaustedNotification>,
}

impl ExhaustedLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: ExhaustedNotification) {
        match self.entries.entry(entry.subject_id.clone()) {
            Entry::Occupied(mut held) => {
                if held.get().sequence <= entry.sequence {
                    held.insert(entry);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    /// Drop the subject's entry if it was issued at or before `sequence`.
    /// Returns true when an entry was removed.
    pub fn clear_through(&self, subject_id: &str, sequence: u64) -> bool {
        self.entries.remove_if(subject_id, |_, e| e.sequence <= sequence).is_some()
    }

    #[must_use]
    pub fn contains(&self, subject_id: &str) -> bool {
        self.entries.contains_key(subject_id)
    }

    /// Oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<ExhaustedNotification> {
        let mut out: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms).then_with(|| a.subject_id.cmp(&b.subject_id)));
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
