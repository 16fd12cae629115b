//! Power topology arena.
//!
//! Clusters form a tree held in a flat arena indexed by [`ClusterId`];
//! a cluster's parent always has a smaller index, which is what makes
//! the tree provably acyclic. CPUs hang off their leaf cluster and are
//! keyed by their system id. All cross-CPU mutable state lives behind
//! per-entity locks inside the arena, so the governor itself can be
//! shared freely.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::AtomicBool;
use spin::Mutex;

use crate::history::{ClusterHistory, CpuHistory};
use crate::level::{validate_cluster_levels, validate_cpu_levels, ClusterLevel, CpuLevel};
use crate::mask::{CpuMask, MAX_CPUS};
use crate::stats::LevelStats;
use crate::{SomnusError, SomnusResult};

// ============================================================================
// IDS
// ============================================================================

/// Arena index of a cluster. Only minted by [`TopologyBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(usize);

impl ClusterId {
    /// Arena index.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// Vote state shared by the CPUs under one cluster. Guarded by the
/// cluster's lock; held only across vote updates and hardware commits,
/// never across recursion into the parent.
#[derive(Debug)]
pub(crate) struct ClusterSync {
    /// CPUs currently voting (idle or offline).
    pub members: CpuMask,
    /// Per-level accumulated votes.
    pub level_votes: Vec<CpuMask>,
    /// Level the hardware was last committed to.
    pub last_level: usize,
}

/// Idle-path position of one CPU.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnteredLevel {
    pub level: usize,
    pub entry_us: u64,
    pub from_idle: bool,
}

/// Per-CPU governor bookkeeping outside the history ring.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CpuRuntime {
    /// Set between enter and exit; `None` when the CPU is running.
    pub entered: Option<EnteredLevel>,
}

/// One cluster in the arena.
#[derive(Debug)]
pub struct Cluster {
    id: ClusterId,
    name: &'static str,
    parent: Option<ClusterId>,
    levels: Vec<ClusterLevel>,
    default_level: usize,
    /// Shallowest `min_child_level` over the table; child exits below
    /// this never involve the cluster.
    min_child_level: usize,
    /// Hierarchy depth reported to domain-reset notifications.
    aff_scope: u32,
    /// Every CPU under this cluster, transitively.
    child_cpus: CpuMask,
    /// Companion devices programmed on every level change.
    device_count: usize,
    pub(crate) sync: Mutex<ClusterSync>,
    pub(crate) history: Mutex<ClusterHistory>,
    pub(crate) stats: LevelStats,
    /// Latched after a failed rollback; pins the cluster to its
    /// default level forever.
    pub(crate) failed: AtomicBool,
}

impl Cluster {
    /// Arena id.
    #[inline(always)]
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// Display name.
    #[inline(always)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Parent cluster, `None` at the root.
    #[inline(always)]
    pub fn parent(&self) -> Option<ClusterId> {
        self.parent
    }

    /// Level table, shallowest first.
    #[inline(always)]
    pub fn levels(&self) -> &[ClusterLevel] {
        &self.levels
    }

    /// Index the hardware rests at between sleeps.
    #[inline(always)]
    pub fn default_level(&self) -> usize {
        self.default_level
    }

    /// Floor below which child exits never involve this cluster.
    #[inline(always)]
    pub fn min_child_level(&self) -> usize {
        self.min_child_level
    }

    /// Hierarchy depth reported to domain-reset notifications.
    #[inline(always)]
    pub fn aff_scope(&self) -> u32 {
        self.aff_scope
    }

    /// Every CPU under this cluster, transitively.
    #[inline(always)]
    pub fn child_cpus(&self) -> CpuMask {
        self.child_cpus
    }

    /// Companion devices programmed on every level change.
    #[inline(always)]
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Per-level entry statistics.
    #[inline(always)]
    pub fn level_stats(&self) -> &LevelStats {
        &self.stats
    }
}

/// One CPU in the arena.
#[derive(Debug)]
pub struct Cpu {
    id: usize,
    cluster: ClusterId,
    levels: Vec<CpuLevel>,
    pub(crate) history: Mutex<CpuHistory>,
    pub(crate) runtime: Mutex<CpuRuntime>,
    pub(crate) stats: LevelStats,
}

impl Cpu {
    /// System CPU id.
    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Owning leaf cluster.
    #[inline(always)]
    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Level table, shallowest first.
    #[inline(always)]
    pub fn levels(&self) -> &[CpuLevel] {
        &self.levels
    }

    /// Per-level entry statistics.
    #[inline(always)]
    pub fn level_stats(&self) -> &LevelStats {
        &self.stats
    }
}

// ============================================================================
// TOPOLOGY
// ============================================================================

/// Immutable cluster/CPU arena produced by [`TopologyBuilder`].
#[derive(Debug)]
pub struct Topology {
    clusters: Vec<Cluster>,
    cpus: BTreeMap<usize, Cpu>,
    root: ClusterId,
    all_cpus: CpuMask,
}

impl Topology {
    /// Look up a cluster.
    #[inline]
    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id.index())
    }

    /// Look up a CPU by system id.
    #[inline]
    pub fn cpu(&self, id: usize) -> Option<&Cpu> {
        self.cpus.get(&id)
    }

    /// All clusters, parents before children.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter()
    }

    /// All CPUs in id order.
    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.values()
    }

    /// The single root cluster.
    #[inline(always)]
    pub fn root(&self) -> ClusterId {
        self.root
    }

    /// Every registered CPU.
    #[inline(always)]
    pub fn all_cpus(&self) -> CpuMask {
        self.all_cpus
    }
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Debug)]
struct ClusterSpec {
    name: &'static str,
    parent: Option<ClusterId>,
    levels: Vec<ClusterLevel>,
    device_count: usize,
}

#[derive(Debug)]
struct CpuSpec {
    cluster: ClusterId,
    levels: Vec<CpuLevel>,
}

/// Registers clusters and CPUs, then validates the whole tree at once.
///
/// Clusters must be registered parents-first; the returned
/// [`ClusterId`] is the only way to reference one later.
#[derive(Debug)]
pub struct TopologyBuilder {
    clusters: Vec<ClusterSpec>,
    cpus: BTreeMap<usize, CpuSpec>,
}

impl TopologyBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        TopologyBuilder {
            clusters: Vec::new(),
            cpus: BTreeMap::new(),
        }
    }

    /// Register a cluster. `parent` is `None` for the root only.
    pub fn cluster(
        &mut self,
        name: &'static str,
        parent: Option<ClusterId>,
        levels: Vec<ClusterLevel>,
        device_count: usize,
    ) -> SomnusResult<ClusterId> {
        if let Some(p) = parent {
            if p.index() >= self.clusters.len() {
                return Err(SomnusError::InvalidTopology("parent cluster not registered"));
            }
        }
        let id = ClusterId(self.clusters.len());
        self.clusters.push(ClusterSpec {
            name,
            parent,
            levels,
            device_count,
        });
        Ok(id)
    }

    /// Register a CPU under `cluster`.
    pub fn cpu(
        &mut self,
        id: usize,
        cluster: ClusterId,
        levels: Vec<CpuLevel>,
    ) -> SomnusResult<()> {
        if id >= MAX_CPUS {
            return Err(SomnusError::InvalidTopology("CPU id beyond mask capacity"));
        }
        if cluster.index() >= self.clusters.len() {
            return Err(SomnusError::InvalidTopology("cluster not registered"));
        }
        if self.cpus.contains_key(&id) {
            return Err(SomnusError::InvalidTopology("CPU registered twice"));
        }
        self.cpus.insert(id, CpuSpec { cluster, levels });
        Ok(())
    }

    /// Validate and freeze the arena.
    pub fn build(self) -> SomnusResult<Topology> {
        let n = self.clusters.len();
        if n == 0 {
            return Err(SomnusError::InvalidTopology("no clusters"));
        }
        let roots = self.clusters.iter().filter(|c| c.parent.is_none()).count();
        if roots != 1 {
            return Err(SomnusError::InvalidTopology("exactly one root cluster required"));
        }
        if self.cpus.is_empty() {
            return Err(SomnusError::InvalidTopology("no CPUs"));
        }

        let mut child_cpus = vec![CpuMask::EMPTY; n];
        let mut max_child_levels = vec![0usize; n];
        for (&id, spec) in &self.cpus {
            validate_cpu_levels(&spec.levels)?;
            let ci = spec.cluster.index();
            child_cpus[ci].set(id);
            if spec.levels.len() > max_child_levels[ci] {
                max_child_levels[ci] = spec.levels.len();
            }
        }

        // Children carry larger indices than their parent, so one
        // reverse sweep settles subtree masks and depths bottom-up.
        let mut aff_scope = vec![1u32; n];
        for i in (0..n).rev() {
            if let Some(p) = self.clusters[i].parent {
                let pi = p.index();
                child_cpus[pi] = child_cpus[pi].or(child_cpus[i]);
                if self.clusters[i].levels.len() > max_child_levels[pi] {
                    max_child_levels[pi] = self.clusters[i].levels.len();
                }
                if aff_scope[i] + 1 > aff_scope[pi] {
                    aff_scope[pi] = aff_scope[i] + 1;
                }
            }
        }

        let mut root = ClusterId(0);
        for (i, spec) in self.clusters.iter().enumerate() {
            if spec.parent.is_none() {
                root = ClusterId(i);
            }
            if child_cpus[i].is_empty() {
                return Err(SomnusError::InvalidTopology("cluster has no CPUs"));
            }
            validate_cluster_levels(&spec.levels, max_child_levels[i])?;
        }

        let clusters = self
            .clusters
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let nlevels = spec.levels.len();
                let min_child_level = spec
                    .levels
                    .iter()
                    .map(|l| l.min_child_level)
                    .min()
                    .unwrap_or(0);
                Cluster {
                    id: ClusterId(i),
                    name: spec.name,
                    parent: spec.parent,
                    default_level: 0,
                    min_child_level,
                    aff_scope: aff_scope[i],
                    child_cpus: child_cpus[i],
                    device_count: spec.device_count,
                    sync: Mutex::new(ClusterSync {
                        members: CpuMask::EMPTY,
                        level_votes: vec![CpuMask::EMPTY; nlevels],
                        last_level: 0,
                    }),
                    history: Mutex::new(ClusterHistory::new()),
                    stats: LevelStats::new(nlevels),
                    failed: AtomicBool::new(false),
                    levels: spec.levels,
                }
            })
            .collect();

        let cpus = self
            .cpus
            .into_iter()
            .map(|(id, spec)| {
                let nlevels = spec.levels.len();
                let cpu = Cpu {
                    id,
                    cluster: spec.cluster,
                    history: Mutex::new(CpuHistory::new()),
                    runtime: Mutex::new(CpuRuntime::default()),
                    stats: LevelStats::new(nlevels),
                    levels: spec.levels,
                };
                (id, cpu)
            })
            .collect();

        let all_cpus = child_cpus[root.index()];
        Ok(Topology {
            clusters,
            cpus,
            root,
            all_cpus,
        })
    }
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{ModeId, PowerParams};

    fn cpu_levels() -> Vec<CpuLevel> {
        vec![
            CpuLevel::new("wfi", ModeId::new(1), PowerParams::new(1, 1, 400)),
            CpuLevel::new("pc", ModeId::new(3), PowerParams::new(500, 5000, u32::MAX)),
        ]
    }

    fn cluster_levels() -> Vec<ClusterLevel> {
        vec![
            ClusterLevel::new("active", ModeId::new(0), PowerParams::new(0, 0, 1000)),
            ClusterLevel::new("off", ModeId::new(2), PowerParams::new(1500, 9000, u32::MAX))
                .with_min_child_level(1),
        ]
    }

    fn two_cluster_tree() -> Topology {
        let mut b = TopologyBuilder::new();
        let root = b.cluster("soc", None, cluster_levels(), 1).unwrap();
        let cl0 = b.cluster("cl0", Some(root), cluster_levels(), 1).unwrap();
        let cl1 = b.cluster("cl1", Some(root), cluster_levels(), 1).unwrap();
        for cpu in 0..2 {
            b.cpu(cpu, cl0, cpu_levels()).unwrap();
        }
        for cpu in 2..4 {
            b.cpu(cpu, cl1, cpu_levels()).unwrap();
        }
        b.build().unwrap()
    }

    #[test]
    fn test_masks_and_depths() {
        let t = two_cluster_tree();
        let root = t.cluster(t.root()).unwrap();
        assert_eq!(root.child_cpus(), CpuMask::first_n(4));
        assert_eq!(root.aff_scope(), 2);
        let cl0 = t.cpu(0).unwrap().cluster();
        let cl0 = t.cluster(cl0).unwrap();
        assert_eq!(cl0.child_cpus(), CpuMask::first_n(2));
        assert_eq!(cl0.aff_scope(), 1);
        assert_eq!(cl0.parent(), Some(t.root()));
        assert_eq!(t.all_cpus(), CpuMask::first_n(4));
    }

    #[test]
    fn test_min_child_level_is_table_minimum() {
        let t = two_cluster_tree();
        // Level 0 carries the default floor of 0.
        assert_eq!(t.cluster(t.root()).unwrap().min_child_level(), 0);
    }

    #[test]
    fn test_duplicate_cpu_rejected() {
        let mut b = TopologyBuilder::new();
        let root = b.cluster("soc", None, cluster_levels(), 0).unwrap();
        b.cpu(0, root, cpu_levels()).unwrap();
        assert!(matches!(
            b.cpu(0, root, cpu_levels()),
            Err(SomnusError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_second_root_rejected() {
        let mut b = TopologyBuilder::new();
        let a = b.cluster("a", None, cluster_levels(), 0).unwrap();
        b.cluster("b", None, cluster_levels(), 0).unwrap();
        b.cpu(0, a, cpu_levels()).unwrap();
        assert!(matches!(
            b.build(),
            Err(SomnusError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_unregistered_parent_rejected() {
        let mut b = TopologyBuilder::new();
        let root = b.cluster("soc", None, cluster_levels(), 0).unwrap();
        let mut other = TopologyBuilder::new();
        other.cluster("x", None, cluster_levels(), 0).unwrap();
        let forged = other.cluster("y", None, cluster_levels(), 0).unwrap();
        assert!(matches!(
            b.cluster("cl", Some(forged), cluster_levels(), 0),
            Err(SomnusError::InvalidTopology(_))
        ));
        let _ = root;
    }

    #[test]
    fn test_empty_cluster_rejected() {
        let mut b = TopologyBuilder::new();
        let root = b.cluster("soc", None, cluster_levels(), 0).unwrap();
        b.cluster("empty", Some(root), cluster_levels(), 0).unwrap();
        b.cpu(0, root, cpu_levels()).unwrap();
        assert!(matches!(
            b.build(),
            Err(SomnusError::InvalidTopology("cluster has no CPUs"))
        ));
    }

    #[test]
    fn test_non_monotonic_cpu_table_rejected() {
        let mut b = TopologyBuilder::new();
        let root = b.cluster("soc", None, cluster_levels(), 0).unwrap();
        let bad = vec![
            CpuLevel::new("deep", ModeId::new(3), PowerParams::new(500, 5000, u32::MAX)),
            CpuLevel::new("shallow", ModeId::new(1), PowerParams::new(1, 1, 400)),
        ];
        b.cpu(0, root, bad).unwrap();
        assert!(matches!(b.build(), Err(SomnusError::InvalidLevels(_))));
    }

    #[test]
    fn test_cpu_id_capacity() {
        let mut b = TopologyBuilder::new();
        let root = b.cluster("soc", None, cluster_levels(), 0).unwrap();
        assert!(matches!(
            b.cpu(MAX_CPUS, root, cpu_levels()),
            Err(SomnusError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_min_child_level_beyond_child_table_rejected() {
        let mut b = TopologyBuilder::new();
        let levels = vec![
            ClusterLevel::new("active", ModeId::new(0), PowerParams::new(0, 0, 1000)),
            ClusterLevel::new("off", ModeId::new(2), PowerParams::new(1500, 9000, u32::MAX))
                .with_min_child_level(5),
        ];
        let root = b.cluster("soc", None, levels, 0).unwrap();
        b.cpu(0, root, cpu_levels()).unwrap();
        assert!(matches!(b.build(), Err(SomnusError::InvalidLevels(_))));
    }
}
