//! Governor statistics.
//!
//! Per-entity level counters plus a governor-wide event block, all
//! lock-free atomics updated on the idle path and snapshotted from
//! anywhere.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// PER-LEVEL COUNTERS
// ============================================================================

/// Entry and residency accounting for one entity's level table.
#[derive(Debug)]
pub struct LevelStats {
    entries: Vec<AtomicU64>,
    residency_us: Vec<AtomicU64>,
}

impl LevelStats {
    /// Counters for a table of `levels` levels, all zero.
    pub fn new(levels: usize) -> Self {
        LevelStats {
            entries: (0..levels).map(|_| AtomicU64::new(0)).collect(),
            residency_us: (0..levels).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Number of levels tracked.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no levels are tracked.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count one entry into `level`.
    #[inline]
    pub fn note_entry(&self, level: usize) {
        if let Some(c) = self.entries.get(level) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Accumulate observed residency for `level`.
    #[inline]
    pub fn note_residency(&self, level: usize, us: u64) {
        if let Some(c) = self.residency_us.get(level) {
            c.fetch_add(us, Ordering::Relaxed);
        }
    }

    /// Entries recorded for `level`.
    #[inline]
    pub fn entry_count(&self, level: usize) -> u64 {
        self.entries
            .get(level)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Total residency recorded for `level`, microseconds.
    #[inline]
    pub fn total_residency_us(&self, level: usize) -> u64 {
        self.residency_us
            .get(level)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

// ============================================================================
// GOVERNOR EVENT COUNTERS
// ============================================================================

/// Governor-wide event counters.
#[derive(Debug)]
#[repr(align(64))]
pub struct GovernorStats {
    selections: AtomicU64,
    denied: AtomicU64,
    predictions: AtomicU64,
    restrictions: AtomicU64,
    invalidations: AtomicU64,
    preempted_configures: AtomicU64,
    hardware_failures: AtomicU64,
    restore_failures: AtomicU64,
    suspend_entries: AtomicU64,
}

/// Plain-value copy of [`GovernorStats`] at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GovernorSnapshot {
    /// Selection passes run.
    pub selections: u64,
    /// Passes where no level qualified.
    pub denied: u64,
    /// Accepted duration predictions.
    pub predictions: u64,
    /// Predictor level restrictions.
    pub restrictions: u64,
    /// Validation-timer invalidations delivered.
    pub invalidations: u64,
    /// Cluster configures abandoned after revalidation.
    pub preempted_configures: u64,
    /// Device mode programming failures (rolled back).
    pub hardware_failures: u64,
    /// Rollback restore failures (fatal).
    pub restore_failures: u64,
    /// Suspend entries driven through the governor.
    pub suspend_entries: u64,
}

impl GovernorStats {
    /// All counters zero.
    pub const fn new() -> Self {
        GovernorStats {
            selections: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            predictions: AtomicU64::new(0),
            restrictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            preempted_configures: AtomicU64::new(0),
            hardware_failures: AtomicU64::new(0),
            restore_failures: AtomicU64::new(0),
            suspend_entries: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn note_selection(&self) {
        self.selections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_prediction(&self) {
        self.predictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_restriction(&self) {
        self.restrictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_preempted_configure(&self) {
        self.preempted_configures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_hardware_failure(&self) {
        self.hardware_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_restore_failure(&self) {
        self.restore_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn note_suspend_entry(&self) {
        self.suspend_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter at one instant.
    pub fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            selections: self.selections.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            predictions: self.predictions.load(Ordering::Relaxed),
            restrictions: self.restrictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            preempted_configures: self.preempted_configures.load(Ordering::Relaxed),
            hardware_failures: self.hardware_failures.load(Ordering::Relaxed),
            restore_failures: self.restore_failures.load(Ordering::Relaxed),
            suspend_entries: self.suspend_entries.load(Ordering::Relaxed),
        }
    }
}

impl Default for GovernorStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_stats_accumulate() {
        let s = LevelStats::new(3);
        s.note_entry(1);
        s.note_entry(1);
        s.note_residency(1, 250);
        s.note_residency(1, 750);
        assert_eq!(s.entry_count(1), 2);
        assert_eq!(s.total_residency_us(1), 1000);
        assert_eq!(s.entry_count(0), 0);
    }

    #[test]
    fn test_level_stats_ignore_out_of_range() {
        let s = LevelStats::new(2);
        s.note_entry(7);
        s.note_residency(7, 10);
        assert_eq!(s.entry_count(7), 0);
        assert_eq!(s.total_residency_us(7), 0);
    }

    #[test]
    fn test_governor_snapshot_tracks_events() {
        let s = GovernorStats::new();
        s.note_selection();
        s.note_selection();
        s.note_denied();
        s.note_restore_failure();
        let snap = s.snapshot();
        assert_eq!(snap.selections, 2);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.restore_failures, 1);
        assert_eq!(snap.predictions, 0);
    }
}
