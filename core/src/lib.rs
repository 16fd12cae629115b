//! # Somnus Core
//!
//! Idle decision core for multi-core, multi-cluster SoCs. Each CPU
//! carries a table of low-power levels ordered shallow to deep; CPUs
//! group into clusters, clusters into a tree, and every tree node has
//! its own level table. The governor picks the deepest level whose
//! entry cost the upcoming sleep window can absorb, coordinates the
//! last CPU into each cluster, and learns from observed residencies to
//! veto sleeps the schedule alone would have allowed.
//!
//! ## Components
//!
//! - **Topology**: frozen CPU/cluster tree with per-node level tables
//! - **Selection**: pure deepest-qualifying-level policy
//! - **Prediction**: residency rings and the trimmed-mean estimator
//! - **Governor**: voting, hardware commit, rollback, suspend, hotplug
//! - **Platform**: the trait the embedding system implements
//!
//! The crate never talks to hardware itself; everything an SoC does,
//! it does through [`platform::PlatformOps`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod governor;
pub mod history;
pub mod level;
pub mod mask;
pub mod math;
pub mod platform;
pub mod predict;
pub mod select;
pub mod stats;
pub mod topology;
pub mod trace;

pub use config::GovernorConfig;
pub use governor::Governor;
pub use level::{ClusterLevel, CpuLevel, LevelFlags, ModeId, PowerParams};
pub use mask::{CpuMask, MAX_CPUS};
pub use platform::{EntityId, HwError, PlatformOps};
pub use stats::GovernorSnapshot;
pub use topology::{ClusterId, Topology, TopologyBuilder};

/// Result type for governor operations
pub type SomnusResult<T> = Result<T, SomnusError>;

/// Governor error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SomnusError {
    /// A wakeup raced the commit; the cluster stays at its default
    /// level and the caller simply proceeds into CPU idle.
    Preempted,
    /// A companion device refused its level; hardware was restored to
    /// the default level.
    Hardware(HwError),
    /// Restoring the default level itself failed. The affected cluster
    /// is latched out of deep idle from here on.
    RestoreFailed {
        /// Device that refused the restore.
        device: usize,
        /// The underlying refusal.
        source: HwError,
    },
    /// The topology description is inconsistent.
    InvalidTopology(&'static str),
    /// A level table violates the required ordering.
    InvalidLevels(&'static str),
}
