use std::sync::Arc;

use gpreagg_error::Result;
use tracing::debug;

use super::kernel;
use super::shared_state::{GenerationBuffers, GpuPreAggStats};
use super::task::{FinalPointers, ReductionMode, ReductionTask};
use crate::arrays::hash_slot::HashSlot;
use crate::arrays::slot_store::SlotStore;
use crate::config::settings::GpuPreAggConfig;
use crate::device::Device;
use crate::device::memory::HostBuffer;
use crate::device::program::DeviceProgram;
use crate::device::stream::Stream;

/// Result of attaching a task to the output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachOutcome {
    Attached,
    /// Device memory for a new generation couldn't be allocated. Shared state
    /// is unchanged.
    OutOfResource,
}

/// Decide how aggressively a task with `nrows` rows should reduce.
///
/// The planner's group estimate is blended with the highest observed group
/// count, moving toward the observed count as more tasks complete.
pub fn select_mode(
    stats: &GpuPreAggStats,
    warmup_tasks: usize,
    max_threads_per_block: usize,
    nrows: usize,
) -> ReductionMode {
    let warmup = warmup_tasks.max(1);
    let ratio = stats.tasks_seen().min(warmup) as f64 / warmup as f64;
    let real_groups = stats.plan_ngroups as f64 * (1.0 - ratio) + stats.exec_ngroups as f64 * ratio;

    if real_groups < (max_threads_per_block / 4) as f64 {
        ReductionMode::Local
    } else if real_groups < (nrows / 4) as f64 {
        ReductionMode::Global
    } else {
        ReductionMode::FinalOnly
    }
}

/// Attach a task to the current generation of the output buffer, creating
/// the generation if there is none.
///
/// The creating task enqueues the header transfer and initialization kernel
/// on `stream`, other tasks make `stream` wait for the initialization to
/// finish.
pub(crate) fn attach_task(
    device: &Device,
    program: &Arc<dyn DeviceProgram>,
    config: &GpuPreAggConfig,
    task: &mut ReductionTask,
    stream: &Stream,
) -> Result<AttachOutcome> {
    let mut inner = task.shared.lock();

    if task.mode == ReductionMode::Undecided {
        task.mode = select_mode(
            &inner.stats,
            config.strategy_warmup_tasks,
            device.properties().max_threads_per_block,
            task.nrooms,
        );
        debug!(task = task.id, mode = %task.mode, "selected reduction mode");
    }

    let generation = match inner.current {
        Some(id) => {
            let generation = inner.generation_mut(id)?;
            stream.wait_event(&generation.buffers.ready);
            id
        }
        None => {
            let nrooms = inner.nrooms;
            let extra_capacity = inner.extra_capacity;
            let store = SlotStore::new(task.shared.descriptor(), nrooms, extra_capacity);

            let final_slot = match device.alloc(store.length(), store.clone())? {
                Some(buf) => buf,
                None => return Ok(AttachOutcome::OutOfResource),
            };
            let final_hash = match device.alloc(
                HashSlot::length_for_rooms(nrooms)?,
                HashSlot::try_for_rooms(nrooms)?,
            )? {
                Some(buf) => buf,
                None => return Ok(AttachOutcome::OutOfResource),
            };
            let ready = device.create_event();

            let host = HostBuffer::new(store);
            task.perf.dma_send(stream.memcpy_htod(&final_slot, &host));

            let init_program = program.clone();
            let init_hash = final_hash.clone();
            stream.launch("gpupreagg_init_final", move || {
                kernel::init_final(init_program.as_ref(), &init_hash)
            });
            task.perf.num_kern_init += 1;
            stream.record_event(&ready);

            let buffers = GenerationBuffers {
                final_slot,
                final_hash,
                ready,
            };
            inner.publish_generation(nrooms, extra_capacity, buffers, host)
        }
    };

    let scan_done = inner.scan_done;
    let attached = inner.generation_mut(generation)?;
    attached.tasks_running += 1;
    let finals = FinalPointers {
        final_slot: attached.buffers.final_slot.clone(),
        final_hash: attached.buffers.final_hash.clone(),
    };

    // Nothing else will attach to this generation, so the last task to
    // finish against it terminates it.
    if task.is_last || scan_done {
        inner.dereference(generation)?;
        debug!(task = task.id, %generation, "dereferenced generation after end of scan");
    }
    drop(inner);

    task.generation = Some(generation);
    task.finals = Some(finals);

    Ok(AttachOutcome::Attached)
}
