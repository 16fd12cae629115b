//! Power level tables for CPUs and clusters.
//!
//! A level table is the ordered menu of sleep depths an entity may
//! enter: index 0 is the shallow always-safe mode, deeper indices
//! trade entry/exit latency for larger energy savings. Tables are
//! validated once at construction and never change afterwards.

use crate::{SomnusError, SomnusResult};

// ============================================================================
// MODE IDENTIFIER
// ============================================================================

/// Opaque platform mode identifier.
///
/// Carried through to the `apply_mode` capability unchanged; the core
/// never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeId(u32);

impl ModeId {
    /// Create a mode identifier from a raw platform value.
    #[inline(always)]
    pub const fn new(raw: u32) -> Self {
        ModeId(raw)
    }

    /// Raw platform value.
    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

// ============================================================================
// LEVEL FLAGS
// ============================================================================

bitflags::bitflags! {
    /// Behavioral attributes of a power level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LevelFlags: u32 {
        /// Power is physically lost: reset-domain collaborators must
        /// be notified around entry and exit.
        const RESET = 1 << 0;
        /// Entry requires a sleep handshake with the companion power
        /// controller (and clears all prediction state).
        const NOTIFY_CONTROLLER = 1 << 1;
        /// Cluster level usable only while at most one CPU is online
        /// system-wide.
        const LAST_CPU_ONLY = 1 << 2;
        /// Suppress the next-wake-CPU routing hint normally passed to
        /// the companion controller.
        const STATIC_ROUTING = 1 << 3;
    }
}

// ============================================================================
// POWER PARAMETERS
// ============================================================================

/// Cost model of one power level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerParams {
    /// Worst-case entry+exit latency in microseconds.
    pub latency_us: u32,
    /// Shortest residency for which entering breaks even.
    pub min_residency_us: u32,
    /// Residency beyond which the next deeper level pays off.
    pub max_residency_us: u32,
    /// Relative energy cost of one entry/exit transition.
    pub energy_overhead: u32,
}

impl PowerParams {
    /// Construct from the three timing figures, zero transition cost.
    pub const fn new(latency_us: u32, min_residency_us: u32, max_residency_us: u32) -> Self {
        PowerParams {
            latency_us,
            min_residency_us,
            max_residency_us,
            energy_overhead: 0,
        }
    }
}

// ============================================================================
// LEVELS
// ============================================================================

/// One sleep depth available to a CPU.
#[derive(Debug, Clone)]
pub struct CpuLevel {
    /// Human-readable mode name for logs and traces.
    pub name: &'static str,
    /// Platform mode handle.
    pub mode: ModeId,
    /// Cost model.
    pub power: PowerParams,
    /// Behavioral attributes.
    pub flags: LevelFlags,
}

impl CpuLevel {
    /// Plain level with no special attributes.
    pub const fn new(name: &'static str, mode: ModeId, power: PowerParams) -> Self {
        CpuLevel {
            name,
            mode,
            power,
            flags: LevelFlags::empty(),
        }
    }

    /// Same level with an attribute set added.
    pub const fn with_flags(mut self, flags: LevelFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// One sleep depth available to a cluster.
#[derive(Debug, Clone)]
pub struct ClusterLevel {
    /// Human-readable mode name for logs and traces.
    pub name: &'static str,
    /// Platform mode handle, applied to every device of the cluster.
    pub mode: ModeId,
    /// Cost model.
    pub power: PowerParams,
    /// Behavioral attributes.
    pub flags: LevelFlags,
    /// Minimum level a child must have voted for before its vote
    /// counts toward this level.
    pub min_child_level: usize,
}

impl ClusterLevel {
    /// Plain cluster level counting every child vote.
    pub const fn new(name: &'static str, mode: ModeId, power: PowerParams) -> Self {
        ClusterLevel {
            name,
            mode,
            power,
            flags: LevelFlags::empty(),
            min_child_level: 0,
        }
    }

    /// Same level with an attribute set added.
    pub const fn with_flags(mut self, flags: LevelFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Same level with a child-vote floor.
    pub const fn with_min_child_level(mut self, min_child_level: usize) -> Self {
        self.min_child_level = min_child_level;
        self
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

fn validate_power_ordering<'a>(
    params: impl Iterator<Item = &'a PowerParams>,
) -> SomnusResult<()> {
    let mut prev_latency = 0u32;
    let mut prev_min_res = 0u32;
    for p in params {
        if p.latency_us < prev_latency {
            return Err(SomnusError::InvalidLevels("latency must not decrease with depth"));
        }
        if p.min_residency_us < prev_min_res {
            return Err(SomnusError::InvalidLevels(
                "min residency must not decrease with depth",
            ));
        }
        if p.max_residency_us < p.min_residency_us {
            return Err(SomnusError::InvalidLevels("max residency below min residency"));
        }
        prev_latency = p.latency_us;
        prev_min_res = p.min_residency_us;
    }
    Ok(())
}

/// Validate a CPU level table: non-empty, costs monotone with depth.
pub fn validate_cpu_levels(levels: &[CpuLevel]) -> SomnusResult<()> {
    if levels.is_empty() {
        return Err(SomnusError::InvalidLevels("empty CPU level table"));
    }
    validate_power_ordering(levels.iter().map(|l| &l.power))
}

/// Validate a cluster level table: non-empty, costs monotone with
/// depth, child-vote floors within range.
pub fn validate_cluster_levels(levels: &[ClusterLevel], max_child_levels: usize) -> SomnusResult<()> {
    if levels.is_empty() {
        return Err(SomnusError::InvalidLevels("empty cluster level table"));
    }
    for l in levels {
        if l.min_child_level > max_child_levels {
            return Err(SomnusError::InvalidLevels("min_child_level beyond child table"));
        }
    }
    validate_power_ordering(levels.iter().map(|l| &l.power))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn cpu_table() -> Vec<CpuLevel> {
        vec![
            CpuLevel::new("wfi", ModeId::new(1), PowerParams::new(1, 1, 500)),
            CpuLevel::new("ret", ModeId::new(2), PowerParams::new(100, 500, 5000)),
            CpuLevel::new("pc", ModeId::new(3), PowerParams::new(800, 5000, u32::MAX)),
        ]
    }

    #[test]
    fn test_valid_cpu_table_passes() {
        assert!(validate_cpu_levels(&cpu_table()).is_ok());
    }

    #[test]
    fn test_empty_table_rejected() {
        assert!(validate_cpu_levels(&[]).is_err());
    }

    #[test]
    fn test_nonmonotonic_latency_rejected() {
        let mut t = cpu_table();
        t[2].power.latency_us = 50;
        assert!(matches!(
            validate_cpu_levels(&t),
            Err(SomnusError::InvalidLevels(_))
        ));
    }

    #[test]
    fn test_nonmonotonic_min_residency_rejected() {
        let mut t = cpu_table();
        t[1].power.min_residency_us = 0;
        t[1].power.max_residency_us = 400;
        t[2].power.min_residency_us = 300;
        // latency still monotone, residency floor is not
        let r = validate_cpu_levels(&t);
        assert!(r.is_err());
    }

    #[test]
    fn test_max_below_min_rejected() {
        let mut t = cpu_table();
        t[1].power.max_residency_us = 100;
        assert!(validate_cpu_levels(&t).is_err());
    }

    #[test]
    fn test_cluster_child_floor_checked() {
        let levels = vec![
            ClusterLevel::new("active", ModeId::new(0), PowerParams::new(0, 0, 1000)),
            ClusterLevel::new("off", ModeId::new(9), PowerParams::new(1000, 10000, u32::MAX))
                .with_min_child_level(5),
        ];
        assert!(validate_cluster_levels(&levels, 3).is_err());
        assert!(validate_cluster_levels(&levels, 5).is_ok());
    }
}
