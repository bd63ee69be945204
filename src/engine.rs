//! EAS engine
//!
//! Owns the per-CPU state, the energy model and the tunables, and turns
//! host scheduler events into load tracking updates and placement
//! decisions.
//!
//! ## Locking
//!
//! Event handlers take at most the rq state of the CPU they are called for
//! (two, in CPU index order, for migration). Host queries are made before a
//! lock is taken; the only host call made under our locks is
//! [`SchedulerHost::swap_running_tasks`].

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::EasConfig;
use crate::energy::{build_energy_model, EmCalibration, EnergyModel, WorkloadType};
use crate::error::{EasError, Timeout};
use crate::flt::{
    fixup_busy_time, record_runtime, windowed_demand, CpuCurr, CpuLoad, CpuSide, FltContext,
    FltEntity, FltEvent, GroupId, Scale, WindowUpdate,
};
use crate::grp_awr::{GroupAggregator, GroupHints};
use crate::host::{SchedPolicy, SchedulerEventSink, SchedulerHost};
use crate::percpu::{lock_pair, CpuRq, PerCpuArena};
use crate::placement::{select_task_cpu, Decision, Placement, PlacementEnv, PlacementRequest};
use crate::rotate::{misfit_check, try_rotate, MisfitOutcome};
use crate::rt::select_rt_cpu;
use crate::task::SchedulingExtension;
use crate::telemetry::{bump, Telemetry, TraceEvent};
use crate::topology::{ClusterId, CpuId, Topology};
use crate::tunables::Tunables;
use crate::{kdebug, kerror, kinfo, ktrace, kwarn, SCHED_CAPACITY_SCALE};

/// The model must describe exactly the topology's clusters.
fn check_model(model: &dyn EnergyModel, topology: &Topology) -> Result<(), EasError> {
    if model.nr_clusters() != topology.nr_clusters() {
        return Err(EasError::ModelMismatch {
            model: model.nr_clusters(),
            topology: topology.nr_clusters(),
        });
    }
    for ((id, desc), cluster) in topology.clusters().zip(model.clusters()) {
        if cluster.cpus != desc.cpus {
            return Err(EasError::ClusterMaskMismatch {
                cluster: id.index(),
                model: cluster.cpus.bits(),
                topology: desc.cpus.bits(),
            });
        }
    }
    Ok(())
}

pub struct EasEngine<H: SchedulerHost> {
    host: H,
    topology: Topology,
    model: Option<Box<dyn EnergyModel>>,
    tunables: Tunables,
    rqs: PerCpuArena<CpuRq>,
    groups: GroupAggregator,
    telemetry: Telemetry,
    /// Capacity ceiling of each cluster (thermal limit).
    ceilings: Vec<AtomicU64>,
}

impl<H: SchedulerHost> EasEngine<H> {
    /// Bring up the engine. A calibration that fails validation leaves the
    /// engine without an energy model: placement then only uses the
    /// fallback heuristics.
    pub fn new(
        host: H,
        topology: Topology,
        calibration: Option<&EmCalibration>,
        config: EasConfig,
    ) -> Result<Self, EasError> {
        config.apply_log_level();
        let model = match calibration.map(build_energy_model) {
            Some(Ok(model)) => match check_model(&*model, &topology) {
                Ok(()) => Some(model),
                Err(err) => {
                    kerror!("eas: {}; running without energy model", err);
                    None
                }
            },
            Some(Err(err)) => {
                kerror!("eas: bad energy model calibration: {}", err);
                None
            }
            None => {
                kwarn!("eas: no energy model calibration");
                None
            }
        };
        Ok(Self::assemble(host, topology, model, &config))
    }

    /// Bring up the engine from a firmware calibration blob. A blob that
    /// cannot be decoded is an error; a decoded calibration that fails
    /// validation degrades as in [`Self::new`].
    pub fn from_blob(
        host: H,
        topology: Topology,
        blob: &[u8],
        config: EasConfig,
    ) -> Result<Self, EasError> {
        let calibration = EmCalibration::from_blob(blob)?;
        Self::new(host, topology, Some(&calibration), config)
    }

    /// Bring up the engine with an already built model. Unlike [`Self::new`]
    /// a model that does not match the topology (cluster count or CPU
    /// masks) is an error.
    pub fn with_model(
        host: H,
        topology: Topology,
        model: Box<dyn EnergyModel>,
        config: EasConfig,
    ) -> Result<Self, EasError> {
        check_model(&*model, &topology)?;
        config.apply_log_level();
        Ok(Self::assemble(host, topology, Some(model), &config))
    }

    fn assemble(
        host: H,
        topology: Topology,
        model: Option<Box<dyn EnergyModel>>,
        config: &EasConfig,
    ) -> Self {
        let nr_clusters = topology.nr_clusters();
        let rqs = PerCpuArena::new(&topology, CpuRq::new);
        let ceilings = topology
            .clusters()
            .map(|(_, desc)| AtomicU64::new(desc.capacity))
            .collect();
        kinfo!(
            "eas: {} cpus in {} clusters, energy model {}",
            topology.nr_cpus(),
            nr_clusters,
            if model.is_some() { "on" } else { "off" }
        );
        Self {
            host,
            tunables: Tunables::new(config, nr_clusters),
            groups: GroupAggregator::new(nr_clusters),
            telemetry: Telemetry::new(),
            topology,
            model,
            rqs,
            ceilings,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn model(&self) -> Option<&dyn EnergyModel> {
        self.model.as_deref()
    }

    /// Runtime control surface.
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn groups(&self) -> &GroupAggregator {
        &self.groups
    }

    pub fn rq(&self, cpu: CpuId) -> Option<&CpuRq> {
        self.rqs.get(cpu)
    }

    fn env(&self) -> PlacementEnv<'_> {
        PlacementEnv::new(
            &self.topology,
            self.model(),
            &self.tunables,
            &self.groups,
            &self.rqs,
            &self.ceilings,
            &self.host,
        )
    }

    fn trace(&self, event: TraceEvent) {
        if self.tunables.telemetry() {
            self.telemetry.record(event);
        }
    }

    // ------------------------------------------------------------------
    // Energy model control
    // ------------------------------------------------------------------

    /// Make `workload` the active table of `cluster`.
    pub fn select_workload(&self, cluster: ClusterId, workload: WorkloadType) -> bool {
        match &self.model {
            Some(model) => model.select_workload_table(cluster, workload),
            None => false,
        }
    }

    /// Cap `cluster` at `freq_khz`; `None` lifts the cap. Needs an energy
    /// model to translate the frequency.
    pub fn set_thermal_ceiling(&self, cluster: ClusterId, freq_khz: Option<u32>) -> bool {
        let Some(slot) = self.ceilings.get(cluster.index()) else {
            return false;
        };
        let full = self.topology.cluster_capacity(cluster);
        let capacity = match freq_khz {
            None => full,
            Some(freq) => match self.model().and_then(|m| m.capacity_ceiling(cluster, freq)) {
                Some(cap) => cap.min(full),
                None => return false,
            },
        };
        slot.store(capacity, Ordering::Relaxed);
        kdebug!("eas: gear {} ceiling {}", cluster.index(), capacity);
        true
    }

    pub fn capacity_ceiling(&self, cluster: ClusterId) -> u64 {
        self.ceilings
            .get(cluster.index())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Group hints
    // ------------------------------------------------------------------

    /// Recompute the group gear hints and margins from the published
    /// per-CPU group demand.
    pub fn update_group_hints(&self, now: u64) -> GroupHints {
        let workload = self
            .model()
            .and_then(|m| m.active().workload(ClusterId(0)))
            .unwrap_or(WorkloadType::DEFAULT);
        let hints = self.groups.update_preferred_cluster(
            workload,
            &self.topology,
            self.model(),
            &self.tunables,
            |cpu, group| {
                self.rqs
                    .get(cpu)
                    .map(|rq| rq.published_group_demand(group))
                    .unwrap_or(0)
            },
        );
        self.trace(TraceEvent::GroupHints {
            at: now,
            hints: hints.hints,
        });
        hints
    }

    /// Change the group of `task`. `queued_on` is the CPU whose rq holds
    /// the task, if any, so its per-group counters follow.
    pub fn set_task_group(
        &self,
        task: &mut SchedulingExtension,
        group: Option<u8>,
        queued_on: Option<CpuId>,
    ) -> bool {
        let before = task.effective_group();
        if !task.set_custom_group(group) {
            return false;
        }
        let after = task.effective_group();
        if let Some(rq) = queued_on.and_then(|cpu| self.rqs.get(cpu)) {
            rq.lock().load.groups.regroup(before, after);
        }
        true
    }

    /// Host finished (or dropped) the active migration off `cpu`.
    pub fn active_migration_done(&self, cpu: CpuId) {
        if let Some(rq) = self.rqs.get_any(cpu) {
            rq.release_active_balance();
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn task_demand(&self, task: &SchedulingExtension) -> u64 {
        windowed_demand(&task.load)
    }

    pub fn cpu_demand(&self, cpu: CpuId) -> Option<u64> {
        self.rqs.get(cpu).map(|rq| rq.lock().load.demand())
    }

    pub fn cpu_group_demand(&self, cpu: CpuId, group: GroupId) -> Option<u64> {
        self.rqs.get(cpu).map(|rq| rq.lock().load.group_demand(group))
    }

    // ------------------------------------------------------------------
    // Load tracking helpers
    // ------------------------------------------------------------------

    fn flt_context(&self, cpu: CpuId) -> FltContext {
        let capacity = self.topology.capacity_orig(cpu);
        let cur = self.host.cpu_state(cpu).cur_freq_khz as u64;
        let max = self
            .model()
            .zip(self.topology.cluster_of(cpu))
            .and_then(|(model, cluster)| model.active().table(cluster).map(|t| t.max_freq() as u64))
            .unwrap_or(0);
        let freq = if cur == 0 || max == 0 {
            SCHED_CAPACITY_SCALE
        } else {
            cur * SCHED_CAPACITY_SCALE / max
        };
        FltContext {
            mode: self.tunables.flt_mode(),
            window_ns: self.tunables.window_ns(),
            scale: Scale::new(capacity, freq),
        }
    }

    /// Trace record for a CPU window update; clock regressions are counted.
    fn window_event(
        &self,
        cpu: CpuId,
        load: &CpuLoad,
        update: Option<WindowUpdate>,
        last: u64,
        wallclock: u64,
    ) -> Option<TraceEvent> {
        match update? {
            WindowUpdate::Rolled { windows } => {
                let window = &load.window;
                ktrace!("flt: {} rolled {} windows demand {}", cpu, windows, window.demand());
                Some(TraceEvent::Window {
                    at: wallclock,
                    cpu,
                    curr_sum: window.curr_sum(),
                    prev_sum: window.prev_sum(),
                    demand: window.demand(),
                })
            }
            WindowUpdate::Skipped if wallclock < last => {
                bump(&self.telemetry.cpu(cpu).clock_skips);
                None
            }
            _ => None,
        }
    }

    fn record_decision(&self, req: &PlacementRequest, decision: &Decision, now: u64) {
        let stats = self.telemetry.cpu(req.this_cpu);
        bump(&stats.placements);
        if decision.energy_evals > 0 {
            stats
                .energy_evals
                .fetch_add(decision.energy_evals as u64, Ordering::Relaxed);
        }
        if decision.placement.path.is_fallback() {
            bump(&stats.fallbacks);
        }
        let event = if req.policy == SchedPolicy::Realtime {
            TraceEvent::RtPlacement {
                at: now,
                task: req.task,
                cpu: decision.placement.cpu,
            }
        } else {
            TraceEvent::Placement {
                at: now,
                task: req.task,
                prev_cpu: Some(req.prev_cpu),
                cpu: decision.placement.cpu,
                path: decision.placement.path,
                candidates: decision.candidates,
                energy: decision.energy,
            }
        };
        self.trace(event);
    }
}

impl<H: SchedulerHost> SchedulerEventSink for EasEngine<H> {
    fn on_tick(&self, cpu: CpuId, curr: Option<&mut SchedulingExtension>, wallclock: u64) {
        let Some(rq) = self.rqs.get(cpu) else {
            return;
        };
        let mut curr = curr;
        let ctx = self.flt_context(cpu);

        let event = {
            let mut state = rq.lock();
            let last = state.load.window.mark_start();
            let running = match curr.as_deref() {
                Some(task) => CpuCurr::Task {
                    group: task.effective_group(),
                },
                None => CpuCurr::Idle,
            };
            let update = record_runtime(
                FltEntity::Cpu {
                    load: &mut state.load,
                    curr: running,
                },
                FltEvent::Update,
                wallclock,
                0,
                &ctx,
            );
            if let Some(task) = curr.as_deref_mut() {
                record_runtime(FltEntity::Task(&mut task.load), FltEvent::Update, wallclock, 0, &ctx);
            }
            rq.publish(&state.load);
            self.window_event(cpu, &state.load, update, last, wallclock)
        };
        if let Some(event) = event {
            self.trace(event);
        }

        if self.rqs.online_mask().first_cpu() == Some(cpu) {
            self.update_group_hints(wallclock);
        }

        let Some(running) = self.host.running_task(cpu) else {
            rq.lock().misfit = false;
            rq.set_misfit_since(None);
            return;
        };
        let env = self.env();
        let outcome = misfit_check(
            &env,
            &self.host,
            &self.telemetry,
            cpu,
            &running,
            curr.as_deref(),
            wallclock,
        );
        if matches!(outcome, MisfitOutcome::Fits | MisfitOutcome::Requested(_)) {
            return;
        }
        if try_rotate(&env, &self.host, &self.telemetry, cpu, wallclock).is_some() {
            if let Some(task) = curr.as_deref_mut() {
                task.rotation.rotations = task.rotation.rotations.saturating_add(1);
            }
        }
    }

    fn on_wakeup(&self, req: &PlacementRequest, task: &mut SchedulingExtension) -> Placement {
        let now = self.host.now_ns();
        let ctx = self.flt_context(req.prev_cpu);
        record_runtime(FltEntity::Task(&mut task.load), FltEvent::Wake, now, 0, &ctx);

        let env = self.env();
        let decision = if req.policy == SchedPolicy::Realtime {
            select_rt_cpu(&env, req, env.task_util(req.util_est, task))
        } else {
            select_task_cpu(&env, req, task)
        };
        self.record_decision(req, &decision, now);
        ktrace!(
            "eas: {} prev {} -> {:?} via {}",
            req.task,
            req.prev_cpu,
            decision.placement.cpu,
            decision.placement.path.as_str()
        );
        decision.placement
    }

    fn on_enqueue(&self, cpu: CpuId, task: &mut SchedulingExtension, wallclock: u64) {
        let Some(rq) = self.rqs.get(cpu) else {
            return;
        };
        let ctx = self.flt_context(cpu);
        record_runtime(FltEntity::Task(&mut task.load), FltEvent::Wake, wallclock, 0, &ctx);
        if let Some(group) = task.effective_group() {
            rq.lock().load.groups.task_arrived(group);
        }
    }

    fn on_dequeue(&self, cpu: CpuId, task: &mut SchedulingExtension, _wallclock: u64) {
        let Some(rq) = self.rqs.get(cpu) else {
            return;
        };
        if let Some(group) = task.effective_group() {
            if !rq.lock().load.groups.task_left(group) {
                kdebug!("eas: unbalanced dequeue of {} from {} on {}", task.id, group, cpu);
            }
        }
    }

    fn on_migrate(&self, src: CpuId, dst: CpuId, task: &mut SchedulingExtension, wallclock: u64) {
        let (Some(src_rq), Some(dst_rq)) = (self.rqs.get_any(src), self.rqs.get_any(dst)) else {
            return;
        };
        if src == dst {
            return;
        }
        let curr_of = |cpu: CpuId| match self.host.running_task(cpu) {
            Some(running) => CpuCurr::Task {
                group: running.group,
            },
            None => CpuCurr::Idle,
        };
        let (src_curr, dst_curr) = (curr_of(src), curr_of(dst));
        let (src_ctx, dst_ctx) = (self.flt_context(src), self.flt_context(dst));
        let group = task.effective_group();

        let mut pair = lock_pair(src_rq, dst_rq);
        let (src_state, dst_state) = pair.split();
        let Some(dst_state) = dst_state else {
            return;
        };
        fixup_busy_time(
            &mut task.load,
            group,
            CpuSide {
                load: &mut src_state.load,
                curr: src_curr,
                scale: src_ctx.scale,
            },
            CpuSide {
                load: &mut dst_state.load,
                curr: dst_curr,
                scale: dst_ctx.scale,
            },
            wallclock,
            src_ctx.mode,
            src_ctx.window_ns,
        );
        if let Some(group) = group {
            src_state.load.groups.task_left(group);
            dst_state.load.groups.task_arrived(group);
        }
        src_rq.publish(&src_state.load);
        dst_rq.publish(&dst_state.load);
    }

    fn on_context_switch(
        &self,
        cpu: CpuId,
        prev: Option<&mut SchedulingExtension>,
        next: Option<&mut SchedulingExtension>,
        wallclock: u64,
    ) {
        let Some(rq) = self.rqs.get(cpu) else {
            return;
        };
        let ctx = self.flt_context(cpu);
        let event = {
            let mut state = rq.lock();
            let last = state.load.window.mark_start();
            let running = match prev.as_deref() {
                Some(task) => CpuCurr::Task {
                    group: task.effective_group(),
                },
                None => CpuCurr::Idle,
            };
            let update = record_runtime(
                FltEntity::Cpu {
                    load: &mut state.load,
                    curr: running,
                },
                FltEvent::PutPrev,
                wallclock,
                0,
                &ctx,
            );
            if let Some(task) = prev {
                record_runtime(FltEntity::Task(&mut task.load), FltEvent::PutPrev, wallclock, 0, &ctx);
            }
            if let Some(task) = next {
                record_runtime(FltEntity::Task(&mut task.load), FltEvent::PickNext, wallclock, 0, &ctx);
                task.rotation.run_start = wallclock;
            }
            rq.publish(&state.load);
            self.window_event(cpu, &state.load, update, last, wallclock)
        };
        if let Some(event) = event {
            self.trace(event);
        }
    }

    fn on_irq_time(&self, cpu: CpuId, irq_ns: u64, wallclock: u64) {
        let Some(rq) = self.rqs.get(cpu) else {
            return;
        };
        let ctx = self.flt_context(cpu);
        let mut state = rq.lock();
        record_runtime(
            FltEntity::Cpu {
                load: &mut state.load,
                curr: CpuCurr::Idle,
            },
            FltEvent::IrqUpdate,
            wallclock,
            irq_ns,
            &ctx,
        );
        rq.publish(&state.load);
    }

    fn on_cpu_online(&self, cpu: CpuId) {
        let Some(rq) = self.rqs.get_any(cpu) else {
            kwarn!("eas: online of unknown {}", cpu);
            return;
        };
        rq.reset();
        rq.release_active_balance();
        if self.rqs.online(cpu) {
            kinfo!("eas: {} online", cpu);
        }
    }

    fn on_cpu_offline(&self, cpu: CpuId, deadline_ns: u64) -> Result<(), Timeout> {
        let Some(rq) = self.rqs.get_any(cpu) else {
            return Ok(());
        };
        if !self.rqs.offline(cpu) {
            return Ok(());
        }
        if let Err(timeout) = rq.wait_for_migration_idle(deadline_ns, || self.host.now_ns()) {
            kwarn!("eas: {} offline with migration in flight: {}", cpu, timeout);
            return Err(timeout);
        }
        rq.reset();
        kinfo!("eas: {} offline", cpu);
        Ok(())
    }
}
