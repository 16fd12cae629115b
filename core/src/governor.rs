//! The governor: per-CPU level selection plus hierarchical cluster
//! coordination.
//!
//! CPUs vote on their way into idle; the last CPU into a cluster runs
//! an optimistic selection without the cluster lock, then revalidates
//! under the lock before committing hardware. A failed commit rolls
//! every device back to the default level; a failed rollback latches
//! the cluster out of deep idle entirely. Exits unwind in the opposite
//! order and feed the residency rings the predictors read.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::{GovernorConfig, Tunables};
use crate::history::ClusterPredictFlag;
use crate::level::LevelFlags;
use crate::mask::CpuMask;
use crate::platform::{EntityId, PlatformOps};
use crate::predict::{predict_cluster, predict_cpu, ClusterPrediction, CpuPrediction};
use crate::select::{
    select_cluster_level, select_cpu_level, ClusterSelectInputs, CpuSelectInputs, CpuSelection,
};
use crate::stats::{GovernorSnapshot, GovernorStats};
use crate::topology::{Cluster, ClusterId, Cpu, EnteredLevel, Topology};
use crate::trace::{TraceBuffer, TraceEvent, TraceEventKind};
use crate::{SomnusError, SomnusResult};

use alloc::vec::Vec;

const USEC_PER_SEC: u64 = 1_000_000;

/// Vote depth used by hotplug paths: deep enough for every level.
const VOTE_ALL_LEVELS: usize = usize::MAX;

#[inline(always)]
fn saturate_u32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

/// Aggregated wake outlook for one cluster.
#[derive(Debug, Clone, Copy)]
struct SleepWindow {
    /// Time until the earliest member timer fires.
    sleep_us: u64,
    /// Earliest member CPU prediction, relative; 0 when none.
    cpu_pred_us: u64,
    /// CPU owning the earliest timer.
    wake_cpu: usize,
}

// ============================================================================
// GOVERNOR
// ============================================================================

/// Idle governor over a frozen [`Topology`].
///
/// All methods take `&self`; internal state is fully lock-or-atomic,
/// so one instance serves every CPU concurrently.
pub struct Governor<P: PlatformOps> {
    platform: P,
    topology: Topology,
    config: GovernorConfig,
    tunables: Tunables,
    stats: GovernorStats,
    trace: TraceBuffer,
    online: AtomicU64,
    suspend_in_progress: AtomicBool,
}

impl<P: PlatformOps> core::fmt::Debug for Governor<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Governor")
            .field("online", &self.online_cpus())
            .field("suspend_in_progress", &self.suspend_in_progress)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: PlatformOps> Governor<P> {
    /// Build a governor over `topology`. CPUs absent from `online`
    /// start as permanent deep voters in all their ancestors, exactly
    /// as a runtime hotplug-off would leave them.
    pub fn new(topology: Topology, platform: P, config: GovernorConfig, online: CpuMask) -> Self {
        let online = online.and(topology.all_cpus());
        let gov = Governor {
            platform,
            topology,
            config,
            tunables: Tunables::new(config),
            stats: GovernorStats::new(),
            trace: TraceBuffer::new(),
            online: AtomicU64::new(online.bits()),
            suspend_in_progress: AtomicBool::new(false),
        };
        let offline = gov.topology.all_cpus().and_not(online);
        for cpu in offline.iter() {
            gov.mark_cpu_offline_boot(cpu);
        }
        log::info!(
            "governor ready: {} clusters, {} cpus, online {:#x}",
            gov.topology.clusters().count(),
            gov.topology.cpus().count(),
            online.bits()
        );
        gov
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Pick and commit an idle level for `cpu`. Returns the level the
    /// CPU should enter; when nothing qualifies, returns 0 without
    /// taking any votes, and the matching [`exit_idle`] is a no-op.
    ///
    /// [`exit_idle`]: Governor::exit_idle
    pub fn select_and_enter(&self, cpu_id: usize) -> usize {
        let Some(cpu) = self.topology.cpu(cpu_id) else {
            log::warn!("idle enter for unknown cpu {}", cpu_id);
            return 0;
        };
        self.stats.note_selection();

        let sel = self.cpu_idle_select(cpu);
        if sel.predicted_us != 0 {
            self.stats.note_prediction();
        }
        if sel.restrict.is_some() {
            self.stats.note_restriction();
        }
        let Some(level) = sel.level else {
            self.stats.note_denied();
            return 0;
        };

        if let Some(us) = sel.wakeup_override_us {
            self.platform.program_wakeup(us as u64);
        }
        if let Some(us) = sel.validation_timer_us {
            self.platform.arm_cpu_validation_timer(cpu_id, us as u64);
        }

        let now = self.platform.now_us();
        {
            let mut rt = cpu.runtime.lock();
            rt.entered = Some(EnteredLevel {
                level,
                entry_us: now,
                from_idle: true,
            });
        }
        cpu.stats.note_entry(level);
        self.trace.record(
            TraceEventKind::CpuEnter,
            now,
            cpu_id as u32,
            [level as u64, sel.predicted_us, 0, 0],
        );

        self.cpu_prepare(cpu, level, true);
        self.cluster_prepare(cpu.cluster(), CpuMask::single(cpu_id), level, true, cpu_id);
        level
    }

    /// Unwind after the sleep committed by [`select_and_enter`],
    /// record the observed residency and cancel validation timers.
    ///
    /// [`select_and_enter`]: Governor::select_and_enter
    pub fn exit_idle(&self, cpu_id: usize) -> SomnusResult<()> {
        let Some(cpu) = self.topology.cpu(cpu_id) else {
            return Ok(());
        };

        let entered = { cpu.runtime.lock().entered.take() };
        let mut fatal = None;
        if let Some(ent) = entered {
            if ent.from_idle {
                self.cluster_unprepare(
                    cpu.cluster(),
                    CpuMask::single(cpu_id),
                    ent.level,
                    true,
                    &mut fatal,
                );
                self.cpu_unprepare(cpu, ent.level, true);

                let now = self.platform.now_us();
                let residency = now.saturating_sub(ent.entry_us);
                cpu.stats.note_residency(ent.level, residency);
                if self.tunables.prediction() {
                    cpu.history.lock().record(ent.level, saturate_u32(residency));
                }
                self.trace.record(
                    TraceEventKind::CpuExit,
                    now,
                    cpu_id as u32,
                    [ent.level as u64, residency, 0, 0],
                );
            } else {
                // A suspend entry must unwind through suspend_exit.
                cpu.runtime.lock().entered = Some(ent);
                log::warn!("idle exit on cpu {} during suspend", cpu_id);
            }
        }

        // Validation timers guard only the window just left.
        if self.tunables.prediction() {
            self.platform.cancel_cpu_validation_timer(cpu_id);
            let mut next = Some(cpu.cluster());
            while let Some(id) = next {
                self.platform.cancel_cluster_validation_timer(id);
                next = self.topology.cluster(id).and_then(|c| c.parent());
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A CPU is leaving the system: it votes for every level in all
    /// its ancestors until it comes back.
    pub fn hotplug_offline(&self, cpu_id: usize) {
        let Some(cpu) = self.topology.cpu(cpu_id) else {
            return;
        };
        self.online
            .fetch_and(!CpuMask::single(cpu_id).bits(), Ordering::Relaxed);
        self.cluster_prepare(
            cpu.cluster(),
            CpuMask::single(cpu_id),
            VOTE_ALL_LEVELS,
            false,
            cpu_id,
        );
    }

    /// A CPU is coming back: withdraw its standing votes.
    pub fn hotplug_online(&self, cpu_id: usize) -> SomnusResult<()> {
        let Some(cpu) = self.topology.cpu(cpu_id) else {
            return Ok(());
        };
        self.online
            .fetch_or(CpuMask::single(cpu_id).bits(), Ordering::Relaxed);
        let mut fatal = None;
        self.cluster_unprepare(
            cpu.cluster(),
            CpuMask::single(cpu_id),
            VOTE_ALL_LEVELS,
            false,
            &mut fatal,
        );
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// System suspend is starting; selection stays shallow until
    /// [`suspend_end`].
    ///
    /// [`suspend_end`]: Governor::suspend_end
    pub fn suspend_begin(&self) {
        self.suspend_in_progress.store(true, Ordering::Relaxed);
    }

    /// System suspend is over.
    pub fn suspend_end(&self) {
        self.suspend_in_progress.store(false, Ordering::Relaxed);
    }

    /// Drive the final CPU into suspend: deepest allowed level with no
    /// residency gating. Returns the level entered, 0 when none is
    /// allowed.
    pub fn suspend_enter(&self, cpu_id: usize) -> usize {
        let Some(cpu) = self.topology.cpu(cpu_id) else {
            return 0;
        };
        let mut idx = None;
        for i in (0..cpu.levels().len()).rev() {
            if self
                .platform
                .is_level_allowed(EntityId::Cpu(cpu_id), i, false)
            {
                idx = Some(i);
                break;
            }
        }
        let Some(idx) = idx else {
            log::error!("no allowed suspend level for cpu {}", cpu_id);
            return 0;
        };
        self.stats.note_suspend_entry();
        {
            let mut rt = cpu.runtime.lock();
            rt.entered = Some(EnteredLevel {
                level: idx,
                entry_us: self.platform.now_us(),
                from_idle: false,
            });
        }
        self.cpu_prepare(cpu, idx, false);
        self.cluster_prepare(cpu.cluster(), CpuMask::single(cpu_id), idx, false, cpu_id);
        idx
    }

    /// Unwind a [`suspend_enter`].
    ///
    /// [`suspend_enter`]: Governor::suspend_enter
    pub fn suspend_exit(&self, cpu_id: usize) -> SomnusResult<()> {
        let Some(cpu) = self.topology.cpu(cpu_id) else {
            return Ok(());
        };
        let entered = { cpu.runtime.lock().entered.take() };
        let mut fatal = None;
        if let Some(ent) = entered {
            if !ent.from_idle {
                self.cluster_unprepare(
                    cpu.cluster(),
                    CpuMask::single(cpu_id),
                    ent.level,
                    false,
                    &mut fatal,
                );
                self.cpu_unprepare(cpu, ent.level, false);
            } else {
                cpu.runtime.lock().entered = Some(ent);
                log::warn!("suspend exit on cpu {} outside suspend", cpu_id);
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Request a fixed wakeup after suspend. The configured override
    /// wins whenever it is set and sooner; a zero request falls back
    /// to the override alone.
    pub fn set_suspend_wake_time(&self, requested_s: u32) {
        let override_s = self.config.suspend_wake_time_s;
        let effective = if requested_s == 0 {
            override_s
        } else if override_s != 0 && override_s < requested_s {
            override_s
        } else {
            requested_s
        };
        self.tunables.set_suspend_wake_time_s(effective);
    }

    /// The per-CPU validation timer fired: the outstanding prediction
    /// overslept and the next sample belongs to the same window.
    pub fn prediction_timer_expired(&self, cpu_id: usize) {
        if let Some(cpu) = self.topology.cpu(cpu_id) {
            cpu.history.lock().set_invalid();
            self.stats.note_invalidation();
        }
    }

    /// The cluster validation timer fired.
    pub fn cluster_timer_expired(&self, cluster_id: ClusterId) {
        if let Some(cluster) = self.topology.cluster(cluster_id) {
            cluster.history.lock().set_invalid();
            self.stats.note_invalidation();
        }
    }

    /// Refuse every level beyond the shallowest from now on.
    pub fn set_sleep_disabled(&self, v: bool) {
        self.tunables.set_sleep_disabled(v);
    }

    /// Toggle the residency predictors.
    pub fn set_prediction_enabled(&self, v: bool) {
        self.tunables.set_prediction(v);
    }

    /// Deviation bound for accepting predictions.
    pub fn set_ref_stddev_us(&self, v: u32) {
        self.tunables.set_ref_stddev_us(v);
    }

    /// Margin added to predictions when arming validation timers.
    pub fn set_timer_margin_us(&self, v: u32) {
        self.tunables.set_timer_margin_us(v);
    }

    /// The frozen topology this governor drives.
    #[inline(always)]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// CPUs currently online.
    #[inline(always)]
    pub fn online_cpus(&self) -> CpuMask {
        CpuMask::from_bits(self.online.load(Ordering::Relaxed))
    }

    /// Governor-wide event counters at one instant.
    pub fn stats(&self) -> GovernorSnapshot {
        self.stats.snapshot()
    }

    /// Copy of the decision trace, oldest first.
    pub fn trace_snapshot(&self) -> Vec<TraceEvent> {
        self.trace.snapshot()
    }

    // ------------------------------------------------------------------
    // CPU path
    // ------------------------------------------------------------------

    fn cpu_idle_select(&self, cpu: &Cpu) -> CpuSelection {
        if self.tunables.sleep_disabled() {
            return CpuSelection {
                level: Some(0),
                wakeup_override_us: None,
                validation_timer_us: None,
                predicted_us: 0,
                restrict: None,
            };
        }

        let now = self.platform.now_us();
        let sleep_us = saturate_u32(self.platform.sleep_length_us(cpu.id()));
        let next_event_us = self
            .platform
            .next_event_us(cpu.id())
            .map(saturate_u32)
            .filter(|&v| v != 0);

        let inputs = CpuSelectInputs {
            levels: cpu.levels(),
            latency_budget_us: self.platform.latency_budget_us(cpu.id()),
            sleep_us,
            next_event_us,
            suspend_in_progress: self.suspend_in_progress.load(Ordering::Relaxed),
            timer_margin_us: self.tunables.timer_margin_us(),
        };

        let prediction_on = self.tunables.prediction();
        let ref_stddev_us = self.tunables.ref_stddev_us();
        let predict = || {
            if !prediction_on {
                return CpuPrediction::none();
            }
            let mut h = cpu.history.lock();
            predict_cpu(&mut h, cpu.levels(), ref_stddev_us, now)
        };
        let invalidate = || {
            if !prediction_on {
                return;
            }
            cpu.history.lock().consume_invalid();
        };
        let allow = |i: usize| {
            self.platform
                .is_level_allowed(EntityId::Cpu(cpu.id()), i, true)
        };

        select_cpu_level(&inputs, allow, predict, invalidate)
    }

    fn cpu_prepare(&self, cpu: &Cpu, level: usize, from_idle: bool) {
        if !from_idle {
            return;
        }
        if let Some(l) = cpu.levels().get(level) {
            if l.flags.contains(LevelFlags::RESET) {
                self.platform.notify_domain_reset(0, true);
            }
        }
    }

    fn cpu_unprepare(&self, cpu: &Cpu, level: usize, from_idle: bool) {
        if !from_idle {
            return;
        }
        if let Some(l) = cpu.levels().get(level) {
            if l.flags.contains(LevelFlags::RESET) {
                self.platform.notify_domain_reset(0, false);
            }
        }
    }

    // ------------------------------------------------------------------
    // Cluster path
    // ------------------------------------------------------------------

    /// Earliest wake over the cluster's voting online members. On the
    /// suspend path the window is the configured wakeup or unbounded.
    fn cluster_sleep_window(
        &self,
        cluster: &Cluster,
        members: CpuMask,
        from_idle: bool,
        cur_cpu: usize,
    ) -> SleepWindow {
        if !from_idle {
            let secs = self.tunables.suspend_wake_time_s();
            let sleep_us = if secs == 0 {
                u64::MAX
            } else {
                secs as u64 * USEC_PER_SEC
            };
            return SleepWindow {
                sleep_us,
                cpu_pred_us: 0,
                wake_cpu: cur_cpu,
            };
        }

        let now = self.platform.now_us();
        let prediction_on = self.tunables.prediction();
        let mut next_event_abs = u64::MAX;
        let mut wake_cpu = cur_cpu;
        let mut pred_wake_abs = u64::MAX;
        for cpu_id in members.and(self.online_cpus()).iter() {
            let Some(cpu) = self.topology.cpu(cpu_id) else {
                continue;
            };
            if let Some(rel) = self.platform.next_event_us(cpu_id) {
                let abs = now.saturating_add(rel);
                if abs < next_event_abs {
                    next_event_abs = abs;
                    wake_cpu = cpu_id;
                }
            }
            if prediction_on {
                let stime = cpu.history.lock().predicted_wake_us();
                if stime != 0 && stime < pred_wake_abs {
                    pred_wake_abs = stime;
                }
            }
        }

        let sleep_us = if next_event_abs == u64::MAX {
            u64::MAX
        } else {
            next_event_abs.saturating_sub(now)
        };
        let cpu_pred_us = if pred_wake_abs != u64::MAX && pred_wake_abs > now {
            pred_wake_abs - now
        } else {
            0
        };
        SleepWindow {
            sleep_us,
            cpu_pred_us,
            wake_cpu,
        }
    }

    /// Optimistic cluster selection, no lock held across the decision.
    fn cluster_power_select(
        &self,
        cluster: &Cluster,
        from_idle: bool,
        cur_cpu: usize,
    ) -> (Option<usize>, bool) {
        if cluster.failed.load(Ordering::Relaxed) {
            return (None, false);
        }

        let (members, votes) = {
            let sync = cluster.sync.lock();
            (sync.members, sync.level_votes.clone())
        };
        let win = self.cluster_sleep_window(cluster, members, from_idle, cur_cpu);

        let mut pred_us: u64 = 0;
        let mut pred_mode = ClusterPrediction::None;
        let mut predicted = false;
        if from_idle && self.tunables.prediction() {
            let now = self.platform.now_us();
            {
                let mut h = cluster.history.lock();
                pred_mode = predict_cluster(&mut h, cluster.levels(), now);
            }
            pred_us = pred_mode.expected_us();
            if win.cpu_pred_us != 0 && pred_mode.is_some() && win.cpu_pred_us < pred_us {
                pred_us = win.cpu_pred_us;
            }
            predicted = pred_us != 0 && pred_mode.is_some() && pred_us < win.sleep_us;
        }

        let online = self.online_cpus();
        let online_in_cluster = cluster.child_cpus().and(online);
        let latency_budget_us = online_in_cluster
            .iter()
            .map(|c| self.platform.latency_budget_us(c))
            .min()
            .unwrap_or(u32::MAX);

        // Hotplug and suspend arrive with from_idle=false; while other
        // CPUs in the cluster still run, the idle gates apply.
        let mut eff_from_idle = from_idle;
        if !from_idle && online.weight() > 1 && cluster.child_cpus().intersects(online) {
            eff_from_idle = true;
        }

        let inputs = ClusterSelectInputs {
            levels: cluster.levels(),
            members,
            level_votes: &votes,
            online_cpus: online.weight() as usize,
            latency_budget_us,
            sleep_us: win.sleep_us,
            pred_us,
            predicted,
            from_idle: eff_from_idle,
            suspend_in_progress: self.suspend_in_progress.load(Ordering::Relaxed),
            controller_busy: self.platform.controller_busy(),
        };
        let allow = |i: usize| {
            self.platform
                .is_level_allowed(EntityId::Cluster(cluster.id()), i, eff_from_idle)
        };
        let best = select_cluster_level(&inputs, allow);

        // Deepest entry off a carried full-ring estimate: the next
        // prediction pass starts fresh.
        if let (Some(b), ClusterPrediction::FullRecord { .. }) = (best, pred_mode) {
            if b == cluster.levels().len() - 1 {
                cluster.history.lock().flag = ClusterPredictFlag::FullSleep;
            }
        }

        (best, predicted)
    }

    /// Record `cpus` as asleep at `child_idx` and, when the cluster
    /// just became fully idle, pick and commit a cluster level, then
    /// propagate upward.
    fn cluster_prepare(
        &self,
        id: ClusterId,
        cpus: CpuMask,
        child_idx: usize,
        from_idle: bool,
        cur_cpu: usize,
    ) {
        let Some(cluster) = self.topology.cluster(id) else {
            return;
        };
        if cluster.min_child_level() > child_idx {
            return;
        }

        {
            let mut sync = cluster.sync.lock();
            sync.members = sync.members.or(cpus);
            for (i, level) in cluster.levels().iter().enumerate() {
                if child_idx >= level.min_child_level {
                    sync.level_votes[i] = sync.level_votes[i].or(cpus);
                }
            }
            if sync.members != cluster.child_cpus() {
                return;
            }
        }

        // Last one in. Decide without the lock; configure revalidates.
        let (best, predicted) = self.cluster_power_select(cluster, from_idle, cur_cpu);

        let default = cluster.default_level();
        if (best.is_none() || best == Some(default)) && predicted && from_idle {
            // Prediction kept the cluster shallow: measure whatever
            // happens next so the estimate can be judged.
            let now = self.platform.now_us();
            cluster.history.lock().open_window(None, now);
            if best.is_none() {
                if let Some(l0) = cluster.levels().first() {
                    let delay = l0.power.max_residency_us as u64
                        + self.tunables.timer_margin_us() as u64;
                    self.platform.arm_cluster_validation_timer(id, delay);
                }
            }
        }
        let Some(best) = best else {
            return;
        };
        if self
            .cluster_configure(cluster, best, from_idle, predicted, cur_cpu)
            .is_err()
        {
            return;
        }
        if let Some(parent) = cluster.parent() {
            let members = { cluster.sync.lock().members };
            self.cluster_prepare(parent, members, best, from_idle, cur_cpu);
        }
    }

    /// Commit cluster hardware to `idx` under the lock, after
    /// revalidating that the optimistic selection still holds.
    fn cluster_configure(
        &self,
        cluster: &Cluster,
        idx: usize,
        from_idle: bool,
        predicted: bool,
        cur_cpu: usize,
    ) -> SomnusResult<()> {
        let now = self.platform.now_us();
        let mut sync = cluster.sync.lock();

        if sync.members != cluster.child_cpus() || self.platform.wake_pending(sync.members) {
            self.stats.note_preempted_configure();
            self.trace.record(
                TraceEventKind::ClusterAbort,
                now,
                cluster.id().index() as u32,
                [idx as u64, sync.members.bits(), 0, 0],
            );
            return Err(SomnusError::Preempted);
        }

        let level = &cluster.levels()[idx];
        if idx != cluster.default_level() {
            log::debug!("cluster {}: enter level {}", cluster.name(), idx);
            self.trace.record(
                TraceEventKind::ClusterEnter,
                now,
                cluster.id().index() as u32,
                [idx as u64, sync.members.bits(), 0, 0],
            );
            cluster.stats.note_entry(idx);
            if from_idle && self.tunables.prediction() {
                cluster.history.lock().open_window(Some(idx), now);
            }
        }

        for device in 0..cluster.device_count() {
            if let Err(e) = self.platform.apply_mode(cluster.id(), device, level.mode) {
                self.stats.note_hardware_failure();
                log::warn!(
                    "cluster {}: device {} refused level {}: code {}",
                    cluster.name(),
                    device,
                    idx,
                    e.code
                );
                return Err(self.rollback_devices(cluster, SomnusError::Hardware(e)));
            }
        }

        if level.flags.contains(LevelFlags::NOTIFY_CONTROLLER) {
            let win = self.cluster_sleep_window(cluster, sync.members, from_idle, cur_cpu);
            let wake_cpus = if level.flags.contains(LevelFlags::STATIC_ROUTING) {
                None
            } else {
                Some(CpuMask::single(win.wake_cpu))
            };
            if let Err(e) = self
                .platform
                .controller_sleep(win.sleep_us.saturating_add(1), wake_cpus)
            {
                self.stats.note_hardware_failure();
                log::warn!(
                    "cluster {}: controller refused sleep: code {}",
                    cluster.name(),
                    e.code
                );
                return Err(self.rollback_devices(cluster, SomnusError::Hardware(e)));
            }
            // The controller owns wake scheduling now; stale estimates
            // must not shorten the next window.
            self.clear_all_histories();
        }

        if level.flags.contains(LevelFlags::RESET) {
            self.platform.notify_domain_reset(cluster.aff_scope(), true);
        }

        sync.last_level = idx;
        if predicted && idx < cluster.levels().len() - 1 {
            let delay =
                level.power.max_residency_us as u64 + self.tunables.timer_margin_us() as u64;
            self.platform.arm_cluster_validation_timer(cluster.id(), delay);
        }
        Ok(())
    }

    /// Put every device back to the default level after a failed
    /// commit. A restore failure is fatal for the cluster: the latch
    /// pins it shallow from here on.
    fn rollback_devices(&self, cluster: &Cluster, cause: SomnusError) -> SomnusError {
        let default_mode = cluster.levels()[cluster.default_level()].mode;
        for device in 0..cluster.device_count() {
            if let Err(e) = self.platform.apply_mode(cluster.id(), device, default_mode) {
                self.stats.note_restore_failure();
                cluster.failed.store(true, Ordering::Relaxed);
                log::error!(
                    "cluster {}: device {} failed default restore: code {}",
                    cluster.name(),
                    device,
                    e.code
                );
                return SomnusError::RestoreFailed { device, source: e };
            }
        }
        cause
    }

    /// Withdraw `cpus` from the cluster and, when this is the first
    /// wakeup out of a committed level, restore hardware to default.
    /// The first fatal restore failure lands in `fatal`; unwinding
    /// continues regardless.
    fn cluster_unprepare(
        &self,
        id: ClusterId,
        cpus: CpuMask,
        child_idx: usize,
        from_idle: bool,
        fatal: &mut Option<SomnusError>,
    ) {
        let Some(cluster) = self.topology.cluster(id) else {
            return;
        };
        if cluster.min_child_level() > child_idx {
            return;
        }

        let now = self.platform.now_us();
        let default = cluster.default_level();
        let mut exited_level = default;

        {
            let mut sync = cluster.sync.lock();
            let first_cpu = sync.members == cluster.child_cpus();
            sync.members = sync.members.and_not(cpus);
            for (i, level) in cluster.levels().iter().enumerate() {
                if child_idx >= level.min_child_level {
                    sync.level_votes[i] = sync.level_votes[i].and_not(cpus);
                }
            }

            if from_idle && first_cpu && sync.last_level == default {
                // The cluster never left default despite the open
                // measurement window: record that as the outcome.
                if let Some(us) = cluster.history.lock().finish_sample(default, now) {
                    cluster.stats.note_residency(default, us as u64);
                }
            }

            if first_cpu && sync.last_level != default {
                let last = sync.last_level;
                let level = &cluster.levels()[last];

                if level.flags.contains(LevelFlags::NOTIFY_CONTROLLER) {
                    self.platform.controller_wake(from_idle);
                }
                log::debug!("cluster {}: exit level {}", cluster.name(), last);
                self.trace.record(
                    TraceEventKind::ClusterExit,
                    now,
                    id.index() as u32,
                    [last as u64, sync.members.bits(), 0, 0],
                );
                sync.last_level = default;
                exited_level = last;

                let default_mode = cluster.levels()[default].mode;
                for device in 0..cluster.device_count() {
                    if let Err(e) = self.platform.apply_mode(cluster.id(), device, default_mode) {
                        self.stats.note_restore_failure();
                        cluster.failed.store(true, Ordering::Relaxed);
                        log::error!(
                            "cluster {}: device {} failed default restore on exit: code {}",
                            cluster.name(),
                            device,
                            e.code
                        );
                        if fatal.is_none() {
                            *fatal = Some(SomnusError::RestoreFailed { device, source: e });
                        }
                    }
                }

                if level.flags.contains(LevelFlags::RESET) {
                    self.platform.notify_domain_reset(cluster.aff_scope(), false);
                }
                if from_idle {
                    if let Some(us) = cluster.history.lock().finish_sample(last, now) {
                        cluster.stats.note_residency(last, us as u64);
                    }
                }
            }
        }

        if let Some(parent) = cluster.parent() {
            self.cluster_unprepare(parent, cluster.child_cpus(), exited_level, from_idle, fatal);
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Offline-at-boot CPUs vote for everything in all ancestors.
    fn mark_cpu_offline_boot(&self, cpu_id: usize) {
        let Some(cpu) = self.topology.cpu(cpu_id) else {
            return;
        };
        let mut next = Some(cpu.cluster());
        while let Some(id) = next {
            let Some(cluster) = self.topology.cluster(id) else {
                break;
            };
            let mut sync = cluster.sync.lock();
            sync.members.set(cpu_id);
            let members = sync.members;
            for votes in sync.level_votes.iter_mut() {
                *votes = members;
            }
            next = cluster.parent();
        }
    }

    fn clear_all_histories(&self) {
        for cpu in self.topology.cpus() {
            cpu.history.lock().clear();
        }
        for cluster in self.topology.clusters() {
            cluster.history.lock().clear();
        }
    }
}
