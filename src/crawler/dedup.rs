use dashmap::DashSet;
use tracing::trace;

/// Set of request fingerprints currently owned by the scheduler.
///
/// A fingerprint stays in the set while its request is queued, in flight, or
/// finished successfully. It is only removed after a terminal failure so the
/// same request can be pushed again.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: DashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fingerprint; false if it was already present
    pub fn insert(&self, fingerprint: &str) -> bool {
        // DashSet::insert is atomic per shard, so concurrent callers see exactly one winner
        let inserted = self.seen.insert(fingerprint.to_string());
        if !inserted {
            trace!("Duplicate fingerprint rejected: {}", fingerprint);
        }
        inserted
    }

    pub fn remove(&self, fingerprint: &str) -> bool {
        self.seen.remove(fingerprint).is_some()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
