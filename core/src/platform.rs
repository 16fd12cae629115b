//! Platform integration surface.
//!
//! Everything the governor needs from the surrounding system comes
//! through [`PlatformOps`]: clocks, scheduler hints, mode programming,
//! the companion power controller and the validation timers. The
//! governor owns the decisions; the platform owns every side effect.

use crate::level::ModeId;
use crate::mask::CpuMask;
use crate::topology::ClusterId;

/// Opaque hardware error code reported by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwError {
    /// Platform-defined code.
    pub code: i32,
}

impl HwError {
    /// Wrap a platform error code.
    #[inline(always)]
    pub const fn new(code: i32) -> Self {
        HwError { code }
    }
}

/// Entity a policy gate is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityId {
    /// A CPU, by system id.
    Cpu(usize),
    /// A cluster, by arena id.
    Cluster(ClusterId),
}

/// Hooks the governor calls into the platform.
///
/// Only the clock, the scheduler window and mode programming are
/// mandatory; every optional concern defaults to a no-op that keeps
/// the governor functional on a bare platform.
pub trait PlatformOps: Send + Sync {
    /// Monotonic time in microseconds.
    fn now_us(&self) -> u64;

    /// Expected sleep length for `cpu` from the scheduler.
    fn sleep_length_us(&self, cpu: usize) -> u64;

    /// Program one companion device of `cluster` to `mode`.
    fn apply_mode(&self, cluster: ClusterId, device: usize, mode: ModeId)
        -> Result<(), HwError>;

    /// Next queued timer event for `cpu`, relative to now. `None` when
    /// no timer is queued.
    fn next_event_us(&self, _cpu: usize) -> Option<u64> {
        None
    }

    /// Tightest wakeup latency `cpu` may currently tolerate.
    fn latency_budget_us(&self, _cpu: usize) -> u32 {
        u32::MAX
    }

    /// Policy gate: may `entity` use `level` right now?
    fn is_level_allowed(&self, _entity: EntityId, _level: usize, _from_idle: bool) -> bool {
        true
    }

    /// A wakeup is already on its way to one of `cpus`.
    fn wake_pending(&self, _cpus: CpuMask) -> bool {
        false
    }

    /// Scope-wide reset notification around levels that lose state.
    fn notify_domain_reset(&self, _scope: u32, _entering: bool) {}

    /// Companion controller has not acknowledged the previous handoff.
    fn controller_busy(&self) -> bool {
        false
    }

    /// Hand the sleep window to the companion controller.
    /// `wake_cpus` is `None` when dynamic wake routing is disabled.
    fn controller_sleep(&self, _sleep_us: u64, _wake_cpus: Option<CpuMask>) -> Result<(), HwError> {
        Ok(())
    }

    /// Take the system back from the companion controller.
    fn controller_wake(&self, _from_idle: bool) {}

    /// Pull the programmed wakeup closer, `delay_us` from now.
    fn program_wakeup(&self, _delay_us: u64) {}

    /// Arm the prediction-validation timer for `cpu`.
    fn arm_cpu_validation_timer(&self, _cpu: usize, _delay_us: u64) {}

    /// Cancel the prediction-validation timer for `cpu`.
    fn cancel_cpu_validation_timer(&self, _cpu: usize) {}

    /// Arm the prediction-validation timer for `cluster`.
    fn arm_cluster_validation_timer(&self, _cluster: ClusterId, _delay_us: u64) {}

    /// Cancel the prediction-validation timer for `cluster`.
    fn cancel_cluster_validation_timer(&self, _cluster: ClusterId) {}
}
