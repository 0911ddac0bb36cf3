use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gpreagg_error::{DbError, OptionExt, Result, ResultExt};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, trace};

use super::task::{PerfCounters, ReductionMode};
use crate::arrays::descriptor::{RowDescriptor, align_len};
use crate::arrays::hash_slot::HashSlot;
use crate::arrays::slot_store::SlotStore;
use crate::config::settings::GpuPreAggConfig;
use crate::device::event::Event;
use crate::device::memory::{DeviceBuffer, HostBuffer};

pub type GenerationId = u64;

/// Estimates from the planner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanInfo {
    /// Expected number of groups.
    pub ngroups: usize,
    /// Expected bytes of variable length values per group.
    pub extra_per_group: usize,
}

/// Statistics collected across every task of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuPreAggStats {
    pub num_nogroup_tasks: usize,
    pub num_local_tasks: usize,
    pub num_global_tasks: usize,
    pub num_final_tasks: usize,
    pub plan_ngroups: usize,
    /// Highest number of groups observed in any output buffer.
    pub exec_ngroups: usize,
    pub plan_extra_size: usize,
    /// Highest extra area usage observed in any output buffer.
    pub exec_extra_size: usize,
    pub generations_created: usize,
    pub generations_terminated: usize,
    /// Input side retries.
    pub num_retries: usize,
    /// Output buffer rotations.
    pub num_rotations: usize,
    pub num_fallbacks: usize,
    pub num_out_of_resource: usize,
    /// Only collected if perfmon is enabled.
    pub perf: Option<PerfCounters>,
}

impl GpuPreAggStats {
    /// Number of tasks that completed a reduction.
    pub fn tasks_seen(&self) -> usize {
        self.num_nogroup_tasks + self.num_local_tasks + self.num_global_tasks + self.num_final_tasks
    }

    /// Render the statistics as a single line of JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize pre-aggregation stats")
    }

    pub(crate) fn count_task(&mut self, mode: ReductionMode) {
        match mode {
            ReductionMode::NoGroup => self.num_nogroup_tasks += 1,
            ReductionMode::Local => self.num_local_tasks += 1,
            ReductionMode::Global => self.num_global_tasks += 1,
            ReductionMode::FinalOnly => self.num_final_tasks += 1,
            ReductionMode::Undecided | ReductionMode::TerminationOnly => (),
        }
    }
}

/// Device memory of one generation of the output buffer.
#[derive(Debug, Clone)]
pub(crate) struct GenerationBuffers {
    pub(crate) final_slot: DeviceBuffer<SlotStore>,
    pub(crate) final_hash: DeviceBuffer<HashSlot>,
    /// Completes once the buffer header is on the device and the hash slot
    /// is initialized.
    pub(crate) ready: Event,
}

/// One instantiation of the output buffer.
#[derive(Debug)]
pub(crate) struct Generation {
    pub(crate) id: GenerationId,
    pub(crate) nrooms: usize,
    pub(crate) extra_capacity: usize,
    pub(crate) buffers: GenerationBuffers,
    /// Receives the final rows when the generation is terminated.
    pub(crate) host: HostBuffer<SlotStore>,
    /// Tasks currently attached.
    pub(crate) tasks_running: usize,
    /// No further task may attach.
    pub(crate) dereferenced: bool,
    pub(crate) terminator_appointed: bool,
    /// Highest row count reported by a task.
    pub(crate) nitems: usize,
    /// Highest extra area usage reported by a task.
    pub(crate) extra_usage: usize,
}

#[derive(Debug)]
pub(crate) struct SharedInner {
    /// Generation new tasks attach to.
    pub(crate) current: Option<GenerationId>,
    /// Generations holding device memory, including rotated generations
    /// waiting for their terminator.
    pub(crate) generations: HashMap<GenerationId, Generation>,
    next_generation: GenerationId,
    /// Capacity of the next generation.
    pub(crate) nrooms: usize,
    pub(crate) extra_capacity: usize,
    /// Set once the last chunk has been handed out. Generations attached
    /// after that are dereferenced right away.
    pub(crate) scan_done: bool,
    pub(crate) stats: GpuPreAggStats,
}

impl SharedInner {
    pub(crate) fn generation_mut(&mut self, id: GenerationId) -> Result<&mut Generation> {
        self.generations
            .get_mut(&id)
            .ok_or_else(|| DbError::new("Missing generation").with_field("generation", id))
    }

    pub(crate) fn publish_generation(
        &mut self,
        nrooms: usize,
        extra_capacity: usize,
        buffers: GenerationBuffers,
        host: HostBuffer<SlotStore>,
    ) -> GenerationId {
        let id = self.next_generation;
        self.next_generation += 1;
        self.generations.insert(
            id,
            Generation {
                id,
                nrooms,
                extra_capacity,
                buffers,
                host,
                tasks_running: 0,
                dereferenced: false,
                terminator_appointed: false,
                nitems: 0,
                extra_usage: 0,
            },
        );
        self.current = Some(id);
        self.stats.generations_created += 1;
        debug!(generation = id, %nrooms, %extra_capacity, "created output buffer generation");
        id
    }

    /// Mark a generation as dereferenced, no new task may attach to it.
    pub(crate) fn dereference(&mut self, id: GenerationId) -> Result<()> {
        let generation = self.generation_mut(id)?;
        generation.dereferenced = true;
        if self.current == Some(id) {
            self.current = None;
        }
        Ok(())
    }

    /// Detach a task from a generation.
    ///
    /// Returns true if the caller is responsible for appointing the
    /// terminator of the generation.
    pub(crate) fn detach(&mut self, id: GenerationId) -> Result<bool> {
        let generation = self.generation_mut(id)?;
        if generation.tasks_running == 0 {
            return Err(
                DbError::new("Bug? Detaching from generation without running tasks")
                    .with_field("generation", id),
            );
        }
        generation.tasks_running -= 1;

        let appoint = generation.tasks_running == 0
            && generation.dereferenced
            && !generation.terminator_appointed;
        if appoint {
            generation.terminator_appointed = true;
            trace!(generation = id, "appointed terminator");
        }

        Ok(appoint)
    }
}

/// Output buffer state shared by every task of a query.
#[derive(Debug)]
pub struct SharedFinalState {
    refcnt: AtomicUsize,
    desc: RowDescriptor,
    plan: PlanInfo,
    inner: Mutex<SharedInner>,
}

/// Counted reference to the shared state.
///
/// References must be given back with `release`.
#[derive(Debug)]
#[must_use]
pub struct SharedStateRef {
    state: Arc<SharedFinalState>,
}

impl SharedStateRef {
    /// Create the shared state, sizing the first output buffer from the plan
    /// estimates.
    pub fn create(desc: RowDescriptor, plan: PlanInfo, config: &GpuPreAggConfig) -> Self {
        let nrooms = initial_nrooms(&desc, plan, config);
        debug!(%nrooms, plan_ngroups = plan.ngroups, "created shared final state");

        let stats = GpuPreAggStats {
            plan_ngroups: plan.ngroups,
            plan_extra_size: plan.extra_per_group * plan.ngroups,
            ..Default::default()
        };

        SharedStateRef {
            state: Arc::new(SharedFinalState {
                refcnt: AtomicUsize::new(1),
                desc,
                plan,
                inner: Mutex::new(SharedInner {
                    current: None,
                    generations: HashMap::new(),
                    next_generation: 0,
                    nrooms,
                    extra_capacity: align_len(nrooms * plan.extra_per_group),
                    scan_done: false,
                    stats,
                }),
            }),
        }
    }

    /// Get another reference to the state.
    pub fn acquire(&self) -> Result<SharedStateRef> {
        self.state
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 { None } else { Some(n + 1) }
            })
            .map_err(|_| DbError::new("Bug? Acquiring released shared state"))?;

        Ok(SharedStateRef {
            state: self.state.clone(),
        })
    }

    /// Give back this reference.
    ///
    /// Releasing the last reference while a generation still holds device
    /// memory is a bug.
    pub fn release(self) -> Result<()> {
        let prev = self.state.refcnt.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            return Err(DbError::new("Bug? Shared state released more than once"));
        }
        if prev > 1 {
            return Ok(());
        }

        let inner = self.state.inner.lock();
        if !inner.generations.is_empty() {
            let attached: Vec<_> = inner.generations.keys().copied().collect();
            drop(inner);
            // Keep the state alive for whoever still has to terminate the
            // generations.
            self.state.refcnt.fetch_add(1, Ordering::AcqRel);
            return Err(
                DbError::new("Bug? Releasing shared state with attached device memory")
                    .with_field("generations", format!("{attached:?}")),
            );
        }
        trace!("released shared final state");

        Ok(())
    }

    pub fn refcnt(&self) -> usize {
        self.state.refcnt.load(Ordering::Acquire)
    }

    pub fn descriptor(&self) -> &RowDescriptor {
        &self.state.desc
    }

    pub fn plan(&self) -> PlanInfo {
        self.state.plan
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.state.inner.lock()
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> GpuPreAggStats {
        self.lock().stats.clone()
    }

    /// Number of generations currently holding device memory.
    pub fn num_generations(&self) -> usize {
        self.lock().generations.len()
    }

    /// Remove a terminated generation, freeing its device memory once the
    /// last task holding a copy of its pointers is gone.
    pub(crate) fn remove_generation(&self, id: GenerationId) -> Result<Generation> {
        let mut inner = self.lock();
        let generation = inner
            .generations
            .remove(&id)
            .required("generation to terminate")?;
        if inner.current == Some(id) {
            inner.current = None;
        }
        Ok(generation)
    }
}

/// Compute the capacity of the first output buffer.
///
/// Small buffers are expanded to fill a multiple of the chunk size since the
/// group estimate is often too low.
pub fn initial_nrooms(desc: &RowDescriptor, plan: PlanInfo, config: &GpuPreAggConfig) -> usize {
    let head_len = desc.slot_head_len();
    let unit_len = desc.slot_row_len() + align_len(plan.extra_per_group);

    let nrooms = (2.5 * plan.ngroups as f64) as usize + config.nrooms_margin;
    let length = head_len + unit_len * nrooms;

    let chunk = config.chunk_size;
    let target = if length < chunk / 2 {
        chunk
    } else if length < chunk {
        2 * chunk
    } else if length < 3 * chunk {
        3 * chunk
    } else {
        return nrooms;
    };

    usize::max(nrooms, target.saturating_sub(head_len) / unit_len)
}
