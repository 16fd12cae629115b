//! Residency predictors.
//!
//! The CPU predictor runs a trimmed-mean/stddev estimate over the
//! sample ring with iterative outlier rejection, falling back to a
//! per-level failure scan that flags levels which consistently fail to
//! reach their break-even residency. The cluster predictor carries
//! only the failure scan plus a full-ring mean, with a small carry
//! flag linking consecutive calls.

use crate::history::{ClusterHistory, ClusterPredictFlag, CpuHistory, MAX_SAMPLES};
use crate::level::{ClusterLevel, CpuLevel};
use crate::math;

// ============================================================================
// THRESHOLDS
// ============================================================================

/// A CPU level is restricted once more than this many samples fell
/// short of its break-even residency.
pub const CPU_FAIL_THRESHOLD: usize = MAX_SAMPLES - 3;

/// Cluster counterpart of [`CPU_FAIL_THRESHOLD`]; clusters demand a
/// stronger pattern before restricting.
pub const CLUSTER_FAIL_THRESHOLD: usize = MAX_SAMPLES - 2;

/// Accept the trimmed mean outright when the deviation stays within
/// this many multiples below it.
const STDDEV_SPREAD: u64 = 6;

// ============================================================================
// CPU PREDICTION
// ============================================================================

/// Predictor hint to cap selection below a level that keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelRestriction {
    /// First level index selection must not reach.
    pub level: usize,
    /// Mean residency of the failing samples (microseconds).
    pub expected_us: u32,
}

/// Outcome of a CPU prediction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuPrediction {
    /// Predicted next idle duration; 0 means no prediction.
    pub duration_us: u64,
    /// Optional cap on the level scan.
    pub restrict: Option<LevelRestriction>,
}

impl CpuPrediction {
    /// No prediction available.
    #[inline(always)]
    pub const fn none() -> Self {
        CpuPrediction {
            duration_us: 0,
            restrict: None,
        }
    }
}

/// Predict the next idle duration for one CPU.
///
/// Mutates the history: consumes a pending invalidation, publishes the
/// predicted wake time on acceptance. Callers gate this on the
/// prediction tunable; a full ring is required for any estimate.
pub fn predict_cpu(
    history: &mut CpuHistory,
    levels: &[CpuLevel],
    ref_stddev_us: u32,
    now_us: u64,
) -> CpuPrediction {
    if history.consume_invalid() {
        return CpuPrediction::none();
    }
    if !history.is_full() {
        history.set_predicted_wake(0);
        return CpuPrediction::none();
    }

    // Trimmed mean with iterative outlier rejection: drop everything
    // above the running threshold, accept once the spread is tight,
    // otherwise exclude the current maximum and try again.
    let mut thresh = i64::MAX;
    loop {
        let mut sum: i64 = 0;
        let mut included: usize = 0;
        let mut max: i64 = 0;
        for i in 0..MAX_SAMPLES {
            let v = history.residency_us[i] as i64;
            if v <= thresh {
                sum += v;
                included += 1;
                if v > max {
                    max = v;
                }
            }
        }
        if included == 0 {
            break;
        }
        let mean = (sum / included as i64) as u64;

        let mut var_sum: u128 = 0;
        for i in 0..MAX_SAMPLES {
            let v = history.residency_us[i] as i64;
            if v <= thresh {
                let d = (v - mean as i64) as i128;
                var_sum += (d * d) as u128;
            }
        }
        let stddev = math::int_sqrt((var_sum / included as u128) as u64);

        if (mean > STDDEV_SPREAD * stddev && included >= MAX_SAMPLES - 1)
            || stddev <= ref_stddev_us as u64
        {
            history.set_predicted_wake(now_us + mean);
            return CpuPrediction {
                duration_us: mean,
                restrict: None,
            };
        } else if included > MAX_SAMPLES - 1 {
            thresh = max - 1;
        } else {
            break;
        }
    }

    // No statistical estimate. Unless the last wake was the synthetic
    // validation timer, look for a level that keeps undershooting its
    // break-even residency and cap the scan below it.
    if !history.timer_wake() {
        for j in 1..levels.len() {
            let mut failed: u64 = 0;
            let mut total: u64 = 0;
            for i in 0..MAX_SAMPLES {
                if history.level[i] == Some(j)
                    && history.residency_us[i] < levels[j].power.min_residency_us
                {
                    failed += 1;
                    total += history.residency_us[i] as u64;
                }
            }
            if failed as usize > CPU_FAIL_THRESHOLD {
                let expected = (total / failed) as u32;
                history.set_predicted_wake(now_us + expected as u64);
                return CpuPrediction {
                    duration_us: 0,
                    restrict: Some(LevelRestriction {
                        level: j,
                        expected_us: expected,
                    }),
                };
            }
        }
    }

    CpuPrediction::none()
}

// ============================================================================
// CLUSTER PREDICTION
// ============================================================================

/// Outcome of a cluster prediction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPrediction {
    /// Nothing usable.
    None,
    /// A level keeps failing its break-even residency; the mean of the
    /// failing samples bounds the expected sleep.
    LevelFailure {
        /// Mean residency of the failing samples.
        expected_us: u32,
    },
    /// Carried from an earlier failure hit: the full-ring mean bounds
    /// the expected sleep.
    FullRecord {
        /// Mean residency over the whole ring.
        expected_us: u32,
    },
}

impl ClusterPrediction {
    /// Expected sleep in microseconds, 0 when none.
    #[inline]
    pub fn expected_us(self) -> u64 {
        match self {
            ClusterPrediction::None => 0,
            ClusterPrediction::LevelFailure { expected_us }
            | ClusterPrediction::FullRecord { expected_us } => expected_us as u64,
        }
    }

    /// True when a usable estimate exists.
    #[inline(always)]
    pub fn is_some(self) -> bool {
        !matches!(self, ClusterPrediction::None)
    }
}

/// Predict the next cluster sleep duration.
///
/// Mutates the history: consumes invalidations, expires stale samples,
/// advances the carry flag. Callers gate this on the prediction
/// tunable and on the idle path (the suspend path never predicts).
pub fn predict_cluster(
    history: &mut ClusterHistory,
    levels: &[ClusterLevel],
    now_us: u64,
) -> ClusterPrediction {
    if history.consume_invalid() {
        return ClusterPrediction::None;
    }

    history.expire_stale(now_us);
    if !history.is_full() {
        history.flag = ClusterPredictFlag::Idle;
        return ClusterPrediction::None;
    }

    // A deep entry latched on the previous pass suppresses the carried
    // outcome exactly once.
    if history.flag == ClusterPredictFlag::FullSleep {
        history.flag = ClusterPredictFlag::Idle;
    }

    if !history.timer_wake() {
        if history.flag == ClusterPredictFlag::LevelFailure {
            let total: u64 = history.residency_us.iter().map(|&r| r as u64).sum();
            return ClusterPrediction::FullRecord {
                expected_us: (total / MAX_SAMPLES as u64) as u32,
            };
        }

        for j in 1..levels.len() {
            let mut failed: u64 = 0;
            let mut total: u64 = 0;
            for i in 0..MAX_SAMPLES {
                if history.level[i] == Some(j)
                    && history.residency_us[i] < levels[j].power.min_residency_us
                {
                    failed += 1;
                    total += history.residency_us[i] as u64;
                }
            }
            if failed as usize > CLUSTER_FAIL_THRESHOLD {
                history.flag = ClusterPredictFlag::LevelFailure;
                return ClusterPrediction::LevelFailure {
                    expected_us: (total / failed) as u32,
                };
            }
        }
    }

    ClusterPrediction::None
}
