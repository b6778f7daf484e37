//! Fetch statistics and N+1 detection.
//!
//! Every statement the session sends to the [`Loader`](lazyorm_core::Loader)
//! is counted in [`SessionStatistics`]. Single-row fetches are also fed to
//! the [`FetchTracker`], which warns when the same (entity, group) pair keeps
//! being loaded one row at a time: the classic N+1 pattern that a batch size
//! on the entity would collapse.

use std::collections::HashMap;

/// Counters for statements issued by one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    /// Statements sent to the loader (any kind).
    pub prepare_statement_count: usize,
    /// Entity rows received from the loader.
    pub entity_load_count: usize,
    /// Statements that covered more than one identity.
    pub batch_fetch_count: usize,
    /// Collection content loads.
    pub collection_fetch_count: usize,
}

impl SessionStatistics {
    pub(crate) fn record_statement(&mut self, rows: usize) {
        self.prepare_statement_count += 1;
        self.entity_load_count += rows;
    }

    pub(crate) fn record_batch(&mut self) {
        self.batch_fetch_count += 1;
    }

    pub(crate) fn record_collection(&mut self) {
        self.collection_fetch_count += 1;
    }

    /// Reset every counter to zero.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Summary of fetch tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Total number of single-row fetches recorded
    pub total_fetches: usize,
    /// Number of distinct (entity, group) pairs fetched
    pub groups_fetched: usize,
    /// Number of pairs that reached the threshold
    pub potential_n1: usize,
}

/// Tracks single-row lazy fetches for N+1 detection.
#[derive(Debug)]
pub struct FetchTracker {
    /// (entity, group) -> fetch count
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    enabled: bool,
}

impl Default for FetchTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchTracker {
    /// Create a tracker with the default threshold (3).
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            threshold: 3,
            enabled: true,
        }
    }

    /// Set the warning threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Enable or disable tracking.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Get the current threshold.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Check if tracking is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record one single-row fetch of `group` for `entity`.
    ///
    /// Emits a warning exactly once per pair, when its count reaches the
    /// threshold.
    pub fn record_fetch(&mut self, entity: &'static str, group: &'static str) {
        if !self.enabled {
            return;
        }

        let count = self.counts.entry((entity, group)).or_insert(0);
        *count += 1;
        let count = *count;

        if count == self.threshold {
            self.emit_warning(entity, group, count);
        }
    }

    fn emit_warning(&self, entity: &'static str, group: &'static str, count: usize) {
        tracing::warn!(
            target: "lazyorm::n1",
            entity = entity,
            group = group,
            fetches = count,
            threshold = self.threshold,
            "N+1 fetch pattern detected; consider a batch size on the entity"
        );
    }

    /// Count for one pair.
    #[must_use]
    pub fn count_for(&self, entity: &'static str, group: &'static str) -> usize {
        self.counts.get(&(entity, group)).copied().unwrap_or(0)
    }

    /// Reset all counts.
    pub fn reset(&mut self) {
        self.counts.clear();
    }

    /// Summarize recorded fetches.
    #[must_use]
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            total_fetches: self.counts.values().sum(),
            groups_fetched: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|&&c| c >= self.threshold)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts_per_pair() {
        let mut tracker = FetchTracker::new().with_threshold(2);
        tracker.record_fetch("Human", "base");
        tracker.record_fetch("Human", "base");
        tracker.record_fetch("Human", "photo");

        assert_eq!(tracker.count_for("Human", "base"), 2);
        assert_eq!(tracker.count_for("Human", "photo"), 1);
        assert_eq!(tracker.count_for("Dog", "base"), 0);

        let stats = tracker.stats();
        assert_eq!(stats.total_fetches, 3);
        assert_eq!(stats.groups_fetched, 2);
        assert_eq!(stats.potential_n1, 1);
    }

    #[test]
    fn test_disabled_tracker_ignores_fetches() {
        let mut tracker = FetchTracker::new().with_enabled(false);
        tracker.record_fetch("Human", "base");
        assert_eq!(tracker.count_for("Human", "base"), 0);
        assert!(!tracker.is_enabled());
    }

    #[test]
    fn test_reset() {
        let mut tracker = FetchTracker::new();
        tracker.record_fetch("Human", "base");
        tracker.reset();
        assert_eq!(tracker.stats(), FetchStats::default());
    }

    #[test]
    fn test_statistics_clear() {
        let mut stats = SessionStatistics::default();
        stats.record_statement(3);
        stats.record_batch();
        stats.record_collection();
        assert_eq!(stats.prepare_statement_count, 1);
        assert_eq!(stats.entity_load_count, 3);
        stats.clear();
        assert_eq!(stats, SessionStatistics::default());
    }
}
