//! Level selection.
//!
//! Pure decision logic for one CPU or one cluster: walk the level
//! table shallow to deep, skip gated levels, stop at hard barriers,
//! and keep the deepest level whose break-even residency fits the
//! expected sleep window. Selection never touches hardware; the
//! governor snapshots the inputs, runs these, then acts on the result.

use crate::level::{ClusterLevel, CpuLevel, LevelFlags};
use crate::mask::CpuMask;
use crate::predict::{CpuPrediction, LevelRestriction};

// ============================================================================
// CPU SELECTION
// ============================================================================

/// Snapshot of everything CPU selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct CpuSelectInputs<'a> {
    /// Level table, shallow to deep.
    pub levels: &'a [CpuLevel],
    /// Wakeup latency the CPU may tolerate right now.
    pub latency_budget_us: u32,
    /// Expected sleep length from the scheduler.
    pub sleep_us: u32,
    /// Next timer event, relative; `None` when no timer is queued.
    pub next_event_us: Option<u32>,
    /// System suspend underway: stay shallow.
    pub suspend_in_progress: bool,
    /// Margin added to predictions when arming the validation timer.
    pub timer_margin_us: u32,
}

/// Result of one CPU selection pass.
#[derive(Debug, Clone, Copy)]
pub struct CpuSelection {
    /// Chosen level, `None` when nothing qualifies (stay out of idle).
    pub level: Option<usize>,
    /// Reprogram the wakeup timer this far out before entry.
    pub wakeup_override_us: Option<u32>,
    /// Arm the prediction-validation timer this far out.
    pub validation_timer_us: Option<u32>,
    /// Accepted predicted sleep length, 0 when none.
    pub predicted_us: u64,
    /// Level restriction reported by the predictor, if any.
    pub restrict: Option<LevelRestriction>,
}

/// Select the deepest qualifying level for one CPU.
///
/// `allow` is the per-level policy gate. `predict` runs at most once,
/// and only when the wake window clears the shallowest level's
/// residency ceiling; otherwise `invalidate` runs instead, retiring
/// any outstanding prediction window.
pub fn select_cpu_level<A, P, I>(
    inputs: &CpuSelectInputs<'_>,
    allow: A,
    predict: P,
    invalidate: I,
) -> CpuSelection
where
    A: Fn(usize) -> bool,
    P: FnOnce() -> CpuPrediction,
    I: FnOnce(),
{
    let mut best: Option<usize> = None;
    let mut predicted: u64 = 0;
    let mut restrict: Option<LevelRestriction> = None;
    let mut next_wakeup_us = inputs.sleep_us;
    let mut wakeup_override_us: Option<u32> = None;
    let mut predict = Some(predict);
    let mut invalidate = Some(invalidate);

    for (i, level) in inputs.levels.iter().enumerate() {
        if !allow(i) {
            continue;
        }
        if i > 0 && inputs.suspend_in_progress {
            continue;
        }

        let lvl_latency_us = level.power.latency_us;
        if inputs.latency_budget_us < lvl_latency_us {
            break;
        }

        if let Some(next_event_us) = inputs.next_event_us {
            if next_event_us < lvl_latency_us {
                break;
            }
            if (next_event_us - lvl_latency_us) < inputs.sleep_us
                || next_event_us < inputs.sleep_us
            {
                next_wakeup_us = next_event_us - lvl_latency_us;
            }
        }

        if i == 0 {
            // Predict only when the raw window already clears the
            // shallowest ceiling; a short window cannot profit from it
            // and instead retires any outstanding validation window.
            if next_wakeup_us > level.power.max_residency_us {
                if let Some(f) = predict.take() {
                    let p = f();
                    predicted = p.duration_us;
                    restrict = p.restrict;
                    if predicted != 0 && predicted < level.power.min_residency_us as u64 {
                        predicted = 0;
                    }
                }
            } else if let Some(f) = invalidate.take() {
                f();
            }
        }

        if let Some(r) = restrict {
            if i >= r.level {
                break;
            }
        }

        let window_us = if predicted != 0 {
            predicted
        } else {
            next_wakeup_us as u64
        };
        if window_us >= level.power.min_residency_us as u64 {
            best = Some(i);
            wakeup_override_us = match inputs.next_event_us {
                Some(next_event_us) if next_event_us < inputs.sleep_us && i > 0 => {
                    Some(next_event_us - lvl_latency_us)
                }
                _ => None,
            };
        }
    }

    // Short predictions and level restrictions are double-checked by a
    // timer: if the CPU oversleeps the estimate, the timer wake marks
    // the prediction window invalid.
    let mut validation_timer_us = None;
    if predicted != 0 || restrict.is_some() {
        if let Some(best) = best {
            if best < inputs.levels.len() - 1 {
                let max_residency_us = inputs.levels[best].power.max_residency_us;
                let mut htime = (predicted.min(u32::MAX as u64) as u32)
                    .saturating_add(inputs.timer_margin_us);
                if htime == inputs.timer_margin_us {
                    htime = restrict.map(|r| r.expected_us).unwrap_or(0);
                } else if htime > max_residency_us {
                    htime = max_residency_us;
                }
                if next_wakeup_us > htime && (next_wakeup_us - htime) > max_residency_us {
                    validation_timer_us = Some(htime);
                }
            }
        }
    }

    CpuSelection {
        level: best,
        wakeup_override_us,
        validation_timer_us,
        predicted_us: predicted,
        restrict,
    }
}

// ============================================================================
// CLUSTER SELECTION
// ============================================================================

/// Snapshot of everything cluster selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct ClusterSelectInputs<'a> {
    /// Level table, shallow to deep.
    pub levels: &'a [ClusterLevel],
    /// CPUs currently voting (asleep or offline) in this cluster.
    pub members: CpuMask,
    /// Per-level vote masks; a level is reachable only when every
    /// current member voted at least this deep.
    pub level_votes: &'a [CpuMask],
    /// Number of CPUs online system-wide.
    pub online_cpus: usize,
    /// Tightest wakeup latency budget over the cluster's online CPUs.
    pub latency_budget_us: u32,
    /// Expected cluster sleep window.
    pub sleep_us: u64,
    /// Predicted sleep length, 0 when none.
    pub pred_us: u64,
    /// True when `pred_us` should gate residency instead of `sleep_us`.
    pub predicted: bool,
    /// Idle path (true) or suspend path (false).
    pub from_idle: bool,
    /// System suspend underway.
    pub suspend_in_progress: bool,
    /// Companion controller has not acknowledged the previous handoff.
    pub controller_busy: bool,
}

/// Select the deepest qualifying level for one cluster.
///
/// Runs without the cluster lock; the caller revalidates under the
/// lock before committing hardware to the result.
pub fn select_cluster_level<A>(inputs: &ClusterSelectInputs<'_>, allow: A) -> Option<usize>
where
    A: Fn(usize) -> bool,
{
    let mut best: Option<usize> = None;

    for (i, level) in inputs.levels.iter().enumerate() {
        if !allow(i) {
            continue;
        }
        if level.flags.contains(LevelFlags::LAST_CPU_ONLY) && inputs.online_cpus > 1 {
            continue;
        }
        if inputs.level_votes[i] != inputs.members {
            continue;
        }
        if inputs.from_idle && inputs.latency_budget_us < level.power.latency_us {
            break;
        }
        if inputs.suspend_in_progress
            && inputs.from_idle
            && level.flags.contains(LevelFlags::NOTIFY_CONTROLLER)
        {
            continue;
        }
        if level.flags.contains(LevelFlags::NOTIFY_CONTROLLER) && inputs.controller_busy {
            continue;
        }

        let window_us = if inputs.predicted {
            inputs.pred_us
        } else {
            inputs.sleep_us
        };
        if window_us >= level.power.min_residency_us as u64 {
            best = Some(i);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{ModeId, PowerParams};
    use alloc::vec;
    use alloc::vec::Vec;

    const MARGIN: u32 = 100;

    fn cpu_levels() -> Vec<CpuLevel> {
        vec![
            CpuLevel::new("wfi", ModeId::new(1), PowerParams::new(0, 1, 400)),
            CpuLevel::new("ret", ModeId::new(2), PowerParams::new(50, 500, 4000)),
            CpuLevel::new("pc", ModeId::new(3), PowerParams::new(500, 5000, u32::MAX)),
        ]
    }

    fn inputs<'a>(levels: &'a [CpuLevel]) -> CpuSelectInputs<'a> {
        CpuSelectInputs {
            levels,
            latency_budget_us: u32::MAX,
            sleep_us: 100_000,
            next_event_us: None,
            suspend_in_progress: false,
            timer_margin_us: MARGIN,
        }
    }

    fn no_predict() -> CpuPrediction {
        CpuPrediction::none()
    }

    #[test]
    fn test_deepest_qualifying_level_wins() {
        let levels = cpu_levels();
        let sel = select_cpu_level(&inputs(&levels), |_| true, no_predict, || {});
        assert_eq!(sel.level, Some(2));
        assert_eq!(sel.wakeup_override_us, None);
        assert_eq!(sel.validation_timer_us, None);
    }

    #[test]
    fn test_zero_latency_budget_stays_shallow() {
        let levels = cpu_levels();
        let mut ins = inputs(&levels);
        ins.latency_budget_us = 0;
        let sel = select_cpu_level(&ins, |_| true, no_predict, || {});
        assert_eq!(sel.level, Some(0));
    }

    #[test]
    fn test_short_window_disqualifies_all() {
        let levels = cpu_levels();
        let mut ins = inputs(&levels);
        ins.sleep_us = 0;
        let mut invalidated = false;
        let sel = select_cpu_level(&ins, |_| true, no_predict, || invalidated = true);
        assert_eq!(sel.level, None);
        // A window below the shallowest ceiling retires the prediction.
        assert!(invalidated);
    }

    #[test]
    fn test_next_event_caps_window_and_overrides_wakeup() {
        let levels = cpu_levels();
        let mut ins = inputs(&levels);
        ins.next_event_us = Some(600);
        let sel = select_cpu_level(&ins, |_| true, no_predict, || {});
        // 600us to the event: retention fits (550 left after latency),
        // power collapse does not.
        assert_eq!(sel.level, Some(1));
        assert_eq!(sel.wakeup_override_us, Some(550));
    }

    #[test]
    fn test_imminent_event_breaks_scan() {
        let levels = cpu_levels();
        let mut ins = inputs(&levels);
        ins.next_event_us = Some(20);
        let sel = select_cpu_level(&ins, |_| true, no_predict, || {});
        // Event closer than retention latency: only the shallow level
        // was evaluated, and 20us misses nothing at level 0.
        assert_eq!(sel.level, Some(0));
    }

    #[test]
    fn test_suspend_in_progress_pins_shallow() {
        let levels = cpu_levels();
        let mut ins = inputs(&levels);
        ins.suspend_in_progress = true;
        let sel = select_cpu_level(&ins, |_| true, no_predict, || {});
        assert_eq!(sel.level, Some(0));
    }

    #[test]
    fn test_disallowed_level_skipped() {
        let levels = cpu_levels();
        let sel = select_cpu_level(&inputs(&levels), |i| i != 2, no_predict, || {});
        assert_eq!(sel.level, Some(1));
    }

    #[test]
    fn test_short_prediction_blocks_deep_and_arms_timer() {
        let levels = cpu_levels();
        let sel = select_cpu_level(
            &inputs(&levels),
            |_| true,
            || CpuPrediction {
                duration_us: 300,
                restrict: None,
            },
            || {},
        );
        assert_eq!(sel.level, Some(0));
        assert_eq!(sel.predicted_us, 300);
        // Validation fires margin past the estimate.
        assert_eq!(sel.validation_timer_us, Some(400));
    }

    #[test]
    fn test_validation_timer_capped_at_level_ceiling() {
        let levels = cpu_levels();
        let sel = select_cpu_level(
            &inputs(&levels),
            |_| true,
            || CpuPrediction {
                duration_us: 3_950,
                restrict: None,
            },
            || {},
        );
        assert_eq!(sel.level, Some(1));
        assert_eq!(sel.validation_timer_us, Some(4_000));
    }

    #[test]
    fn test_restriction_caps_scan() {
        let levels = cpu_levels();
        let sel = select_cpu_level(
            &inputs(&levels),
            |_| true,
            || CpuPrediction {
                duration_us: 0,
                restrict: Some(LevelRestriction {
                    level: 1,
                    expected_us: 40,
                }),
            },
            || {},
        );
        assert_eq!(sel.level, Some(0));
        // No duration estimate: the timer takes the restriction mean.
        assert_eq!(sel.validation_timer_us, Some(40));
    }

    #[test]
    fn test_prediction_below_shallow_floor_discarded() {
        let mut levels = cpu_levels();
        levels[0].power.min_residency_us = 200;
        let ins = inputs(&levels);
        let sel = select_cpu_level(
            &ins,
            |_| true,
            || CpuPrediction {
                duration_us: 150,
                restrict: None,
            },
            || {},
        );
        // 150us is under even the shallowest floor, so the raw window
        // gates selection instead.
        assert_eq!(sel.predicted_us, 0);
        assert_eq!(sel.level, Some(2));
    }

    #[test]
    fn test_no_deep_window_skips_prediction() {
        let levels = cpu_levels();
        let mut ins = inputs(&levels);
        ins.sleep_us = 300; // under the level-0 ceiling of 400
        let mut ran = false;
        let sel = select_cpu_level(
            &ins,
            |_| true,
            || {
                ran = true;
                CpuPrediction::none()
            },
            || {},
        );
        assert!(!ran);
        assert_eq!(sel.level, Some(0));
    }

    // ------------------------------------------------------------------
    // Cluster selection
    // ------------------------------------------------------------------

    fn cluster_levels() -> Vec<ClusterLevel> {
        vec![
            ClusterLevel::new("active", ModeId::new(0), PowerParams::new(0, 0, 1000)),
            ClusterLevel::new("ret", ModeId::new(1), PowerParams::new(200, 2_000, 8_000)),
            ClusterLevel::new("off", ModeId::new(2), PowerParams::new(1_500, 9_000, u32::MAX))
                .with_flags(LevelFlags::NOTIFY_CONTROLLER | LevelFlags::RESET),
        ]
    }

    fn cluster_inputs<'a>(
        levels: &'a [ClusterLevel],
        votes: &'a [CpuMask],
    ) -> ClusterSelectInputs<'a> {
        ClusterSelectInputs {
            levels,
            members: CpuMask::first_n(4),
            level_votes: votes,
            online_cpus: 4,
            latency_budget_us: u32::MAX,
            sleep_us: 1_000_000,
            pred_us: 0,
            predicted: false,
            from_idle: true,
            suspend_in_progress: false,
            controller_busy: false,
        }
    }

    fn full_votes() -> Vec<CpuMask> {
        vec![CpuMask::first_n(4); 3]
    }

    #[test]
    fn test_cluster_deepest_with_unanimous_votes() {
        let levels = cluster_levels();
        let votes = full_votes();
        let sel = select_cluster_level(&cluster_inputs(&levels, &votes), |_| true);
        assert_eq!(sel, Some(2));
    }

    #[test]
    fn test_cluster_missing_vote_blocks_level() {
        let levels = cluster_levels();
        let mut votes = full_votes();
        let mut partial = CpuMask::first_n(4);
        partial.clear(3);
        votes[2] = partial;
        let sel = select_cluster_level(&cluster_inputs(&levels, &votes), |_| true);
        assert_eq!(sel, Some(1));
    }

    #[test]
    fn test_cluster_latency_budget_breaks_from_idle() {
        let levels = cluster_levels();
        let votes = full_votes();
        let mut ins = cluster_inputs(&levels, &votes);
        ins.latency_budget_us = 100;
        assert_eq!(select_cluster_level(&ins, |_| true), Some(0));
        // The suspend path ignores latency budgets.
        ins.from_idle = false;
        assert_eq!(select_cluster_level(&ins, |_| true), Some(2));
    }

    #[test]
    fn test_cluster_controller_busy_skips_notify_levels() {
        let levels = cluster_levels();
        let votes = full_votes();
        let mut ins = cluster_inputs(&levels, &votes);
        ins.controller_busy = true;
        assert_eq!(select_cluster_level(&ins, |_| true), Some(1));
    }

    #[test]
    fn test_cluster_suspend_skips_notify_levels_from_idle() {
        let levels = cluster_levels();
        let votes = full_votes();
        let mut ins = cluster_inputs(&levels, &votes);
        ins.suspend_in_progress = true;
        assert_eq!(select_cluster_level(&ins, |_| true), Some(1));
    }

    #[test]
    fn test_cluster_last_cpu_only_gate() {
        let mut levels = cluster_levels();
        levels[2] = ClusterLevel::new("off", ModeId::new(2), PowerParams::new(1_500, 9_000, u32::MAX))
            .with_flags(LevelFlags::LAST_CPU_ONLY);
        let votes = full_votes();
        let mut ins = cluster_inputs(&levels, &votes);
        assert_eq!(select_cluster_level(&ins, |_| true), Some(1));
        ins.online_cpus = 1;
        assert_eq!(select_cluster_level(&ins, |_| true), Some(2));
    }

    #[test]
    fn test_cluster_prediction_gates_residency() {
        let levels = cluster_levels();
        let votes = full_votes();
        let mut ins = cluster_inputs(&levels, &votes);
        ins.predicted = true;
        ins.pred_us = 2_500;
        // Prediction says 2.5ms: retention fits, power-off does not,
        // regardless of the huge raw window.
        assert_eq!(select_cluster_level(&ins, |_| true), Some(1));
    }

    #[test]
    fn test_cluster_nothing_qualifies() {
        let levels = cluster_levels();
        let votes = full_votes();
        let mut ins = cluster_inputs(&levels, &votes);
        ins.sleep_us = 0;
        // Level 0 has a zero floor, so an empty window still takes it.
        assert_eq!(select_cluster_level(&ins, |_| true), Some(0));
        let empty = [CpuMask::EMPTY; 3];
        ins.level_votes = &empty;
        assert_eq!(select_cluster_level(&ins, |_| true), None);
    }
}
