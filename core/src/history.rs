//! Residency history rings.
//!
//! Every CPU and every cluster keeps a small ring of recent
//! (level, observed residency) samples. The predictor consumes these
//! rings; the coordinator feeds them on every idle exit. A wake caused
//! by the prediction-validation timer is not a real wakeup, so the
//! following sample is merged into the previous slot instead of
//! starting a new one.

// ============================================================================
// CONSTANTS
// ============================================================================

/// Ring capacity; prediction requires a full ring.
pub const MAX_SAMPLES: usize = 10;

/// Cluster samples older than this are dropped from the usable count
/// before each cluster prediction (microseconds).
pub const CLUSTER_SAMPLE_EXPIRY_US: u64 = 40_000;

// ============================================================================
// CPU HISTORY
// ============================================================================

/// Per-CPU residency ring plus prediction bookkeeping.
#[derive(Debug, Clone)]
pub struct CpuHistory {
    pub(crate) residency_us: [u32; MAX_SAMPLES],
    pub(crate) level: [Option<usize>; MAX_SAMPLES],
    head: usize,
    count: usize,
    /// A validation timer fired; the next prediction consumes this.
    invalid: bool,
    /// The last wake WAS the validation timer, so the next sample
    /// continues the interrupted residency.
    timer_wake: bool,
    /// Absolute time the in-flight prediction expects the CPU to wake
    /// (0 = no prediction outstanding).
    predicted_wake_us: u64,
}

impl CpuHistory {
    /// Empty history.
    pub const fn new() -> Self {
        CpuHistory {
            residency_us: [0; MAX_SAMPLES],
            level: [None; MAX_SAMPLES],
            head: 0,
            count: 0,
            invalid: false,
            timer_wake: false,
            predicted_wake_us: 0,
        }
    }

    /// Number of valid samples, saturating at [`MAX_SAMPLES`].
    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count
    }

    /// True once every slot has been written at least once.
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.count == MAX_SAMPLES
    }

    /// Append a sample, merging into the previous slot after a
    /// validation-timer wake. Returns the new sample count.
    pub fn record(&mut self, level: usize, residency_us: u32) -> usize {
        if self.timer_wake {
            self.head = if self.head == 0 { MAX_SAMPLES - 1 } else { self.head - 1 };
            self.residency_us[self.head] =
                self.residency_us[self.head].saturating_add(residency_us);
            self.timer_wake = false;
        } else {
            self.residency_us[self.head] = residency_us;
        }
        self.level[self.head] = Some(level);

        if self.count < MAX_SAMPLES {
            self.count += 1;
        }
        self.head = (self.head + 1) % MAX_SAMPLES;
        self.count
    }

    /// Reset samples and the outstanding prediction. The invalid and
    /// timer-wake flags survive so an in-flight validation window
    /// still resolves correctly.
    pub fn clear(&mut self) {
        self.residency_us = [0; MAX_SAMPLES];
        self.level = [None; MAX_SAMPLES];
        self.head = 0;
        self.count = 0;
        self.predicted_wake_us = 0;
    }

    /// Mark the last prediction window void (validation timer fired).
    #[inline]
    pub fn set_invalid(&mut self) {
        self.invalid = true;
    }

    /// Consume a pending invalidation: clears it, flags the next
    /// sample as a timer-wake continuation, drops the outstanding
    /// prediction. Returns true when there was one to consume.
    pub fn consume_invalid(&mut self) -> bool {
        if !self.invalid {
            return false;
        }
        self.invalid = false;
        self.timer_wake = true;
        self.predicted_wake_us = 0;
        true
    }

    /// True when the next sample will merge into the previous slot.
    #[inline(always)]
    pub fn timer_wake(&self) -> bool {
        self.timer_wake
    }

    /// Absolute predicted wake time, 0 when none.
    #[inline(always)]
    pub fn predicted_wake_us(&self) -> u64 {
        self.predicted_wake_us
    }

    /// Publish the wake time implied by an accepted prediction.
    #[inline]
    pub fn set_predicted_wake(&mut self, abs_us: u64) {
        self.predicted_wake_us = abs_us;
    }
}

impl Default for CpuHistory {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CLUSTER HISTORY
// ============================================================================

/// Tri-state carry of the cluster predictor between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPredictFlag {
    /// No carried outcome.
    Idle,
    /// A level-failure pattern was seen; the next call reports the
    /// full-ring mean instead of rescanning.
    LevelFailure,
    /// The deepest level was entered off a CPU-aggregate prediction;
    /// the next call skips its carried outcome once.
    FullSleep,
}

/// Pending cluster entry awaiting its residency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryWindow {
    /// No measurement pending.
    Closed,
    /// Record whichever level next exits (opened when selection chose
    /// default-or-nothing off a prediction).
    AnyLevel {
        /// Absolute entry time.
        entry_us: u64,
    },
    /// Record only if the exited level matches.
    Level {
        /// Level index entered.
        idx: usize,
        /// Absolute entry time.
        entry_us: u64,
    },
}

/// Per-cluster residency ring with entry-time tracking and the
/// predictor carry flag.
#[derive(Debug, Clone)]
pub struct ClusterHistory {
    pub(crate) residency_us: [u32; MAX_SAMPLES],
    pub(crate) level: [Option<usize>; MAX_SAMPLES],
    pub(crate) entry_time_us: [u64; MAX_SAMPLES],
    head: usize,
    count: usize,
    invalid: bool,
    timer_wake: bool,
    pub(crate) flag: ClusterPredictFlag,
    window: EntryWindow,
}

impl ClusterHistory {
    /// Empty history.
    pub const fn new() -> Self {
        ClusterHistory {
            residency_us: [0; MAX_SAMPLES],
            level: [None; MAX_SAMPLES],
            entry_time_us: [0; MAX_SAMPLES],
            head: 0,
            count: 0,
            invalid: false,
            timer_wake: false,
            flag: ClusterPredictFlag::Idle,
            window: EntryWindow::Closed,
        }
    }

    /// Number of usable samples.
    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count
    }

    /// True once the ring is full.
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.count == MAX_SAMPLES
    }

    /// Predictor carry flag.
    #[inline(always)]
    pub fn flag(&self) -> ClusterPredictFlag {
        self.flag
    }

    /// Open the measurement window for an entered level
    /// (`None` = record whichever level exits next).
    pub fn open_window(&mut self, idx: Option<usize>, now_us: u64) {
        self.window = match idx {
            Some(idx) => EntryWindow::Level { idx, entry_us: now_us },
            None => EntryWindow::AnyLevel { entry_us: now_us },
        };
    }

    /// Close the window, recording a sample if the exited level
    /// matches the pending entry. Timer wakes merge into the previous
    /// slot as for CPUs. Returns the residency recorded, or `None`
    /// when the exit did not match the window.
    pub fn finish_sample(&mut self, idx: usize, now_us: u64) -> Option<u32> {
        let entry_us = match self.window {
            EntryWindow::AnyLevel { entry_us } => entry_us,
            EntryWindow::Level { idx: entered, entry_us } if entered == idx => entry_us,
            _ => return None,
        };
        let residency = now_us.saturating_sub(entry_us) as u32;
        // On a timer merge the entry time stays with the pre-merge slot.
        self.entry_time_us[self.head] = entry_us;

        if self.timer_wake {
            self.head = if self.head == 0 { MAX_SAMPLES - 1 } else { self.head - 1 };
            self.residency_us[self.head] =
                self.residency_us[self.head].saturating_add(residency);
            self.timer_wake = false;
        } else {
            self.residency_us[self.head] = residency;
        }
        self.level[self.head] = Some(idx);
        self.window = EntryWindow::Closed;

        if self.count < MAX_SAMPLES {
            self.count += 1;
        }
        self.head = (self.head + 1) % MAX_SAMPLES;
        Some(residency)
    }

    /// Drop stale samples from the usable count. Only runs on a full
    /// ring; refilled slots restore the count.
    pub fn expire_stale(&mut self, now_us: u64) {
        if self.count != MAX_SAMPLES {
            return;
        }
        for i in 0..MAX_SAMPLES {
            if now_us.saturating_sub(self.entry_time_us[i]) > CLUSTER_SAMPLE_EXPIRY_US {
                self.count = self.count.saturating_sub(1);
            }
        }
    }

    /// Mark the last prediction window void (cluster timer fired).
    #[inline]
    pub fn set_invalid(&mut self) {
        self.invalid = true;
    }

    /// Consume a pending invalidation; also drops the carry flag.
    pub fn consume_invalid(&mut self) -> bool {
        if !self.invalid {
            return false;
        }
        self.invalid = false;
        self.timer_wake = true;
        self.flag = ClusterPredictFlag::Idle;
        true
    }

    /// True when the next sample will merge into the previous slot.
    #[inline(always)]
    pub fn timer_wake(&self) -> bool {
        self.timer_wake
    }

    /// Full reset, flags included.
    pub fn clear(&mut self) {
        *self = ClusterHistory::new();
    }
}

impl Default for ClusterHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_ring_saturates() {
        let mut h = CpuHistory::new();
        for i in 0..MAX_SAMPLES {
            assert_eq!(h.record(0, 100), i + 1);
        }
        assert!(h.is_full());
        // Capacity-many more records: count stays pinned, ring wraps.
        for _ in 0..MAX_SAMPLES {
            assert_eq!(h.record(1, 200), MAX_SAMPLES);
        }
        assert!(h.residency_us.iter().all(|&r| r == 200));
        assert!(h.level.iter().all(|&l| l == Some(1)));
    }

    #[test]
    fn test_timer_wake_merges_previous_slot() {
        let mut h = CpuHistory::new();
        h.record(2, 300);
        h.set_invalid();
        assert!(h.consume_invalid());
        assert!(h.timer_wake());
        // The wake was synthetic: this residency continues the sleep.
        h.record(2, 450);
        assert_eq!(h.residency_us[0], 750);
        assert!(!h.timer_wake());
        assert_eq!(h.count(), 2);
    }

    #[test]
    fn test_consume_invalid_once() {
        let mut h = CpuHistory::new();
        h.set_predicted_wake(1234);
        h.set_invalid();
        assert!(h.consume_invalid());
        assert_eq!(h.predicted_wake_us(), 0);
        assert!(!h.consume_invalid());
    }

    #[test]
    fn test_cpu_clear_keeps_pending_window_flags() {
        let mut h = CpuHistory::new();
        h.record(1, 10);
        h.set_invalid();
        h.clear();
        assert_eq!(h.count(), 0);
        // The invalidation is still pending after a clear.
        assert!(h.consume_invalid());
    }

    #[test]
    fn test_cluster_window_gating() {
        let mut h = ClusterHistory::new();
        h.open_window(Some(2), 1000);
        // A different level exiting must not record.
        assert_eq!(h.finish_sample(1, 5000), None);
        assert_eq!(h.count(), 0);
        // Window stays open for the matching exit.
        assert_eq!(h.finish_sample(2, 5000), Some(4000));
        assert_eq!(h.count(), 1);
        assert_eq!(h.residency_us[0], 4000);
        assert_eq!(h.entry_time_us[0], 1000);
    }

    #[test]
    fn test_cluster_any_level_window() {
        let mut h = ClusterHistory::new();
        h.open_window(None, 2000);
        assert_eq!(h.finish_sample(0, 2500), Some(500));
        assert_eq!(h.count(), 1);
        assert_eq!(h.level[0], Some(0));
        assert_eq!(h.residency_us[0], 500);
        // Window closed: a second exit records nothing.
        assert_eq!(h.finish_sample(0, 3000), None);
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn test_cluster_expiry_reduces_count() {
        let mut h = ClusterHistory::new();
        for i in 0..MAX_SAMPLES {
            h.open_window(Some(1), i as u64 * 10);
            let _ = h.finish_sample(1, i as u64 * 10 + 5);
        }
        assert!(h.is_full());
        let now = CLUSTER_SAMPLE_EXPIRY_US + 200;
        h.expire_stale(now);
        // Samples entered in the first 200us are all stale by now.
        assert!(h.count() < MAX_SAMPLES);
    }

    #[test]
    fn test_cluster_expiry_needs_full_ring() {
        let mut h = ClusterHistory::new();
        h.open_window(Some(1), 0);
        assert_eq!(h.finish_sample(1, 5), Some(5));
        h.expire_stale(u64::MAX);
        assert_eq!(h.count(), 1);
    }
}
