use gpreagg_error::{DbError, OptionExt, Result};
use tracing::{debug, error, warn};

use super::GpuPreAgg;
use super::kernel::{Exhaustion, KernelStatus};
use super::process::{CompletedTask, fault_error};
use super::task::{ReductionMode, ReductionTask};
use crate::device::memory::DeviceCopy;
use crate::device::stream::StreamStatus;

/// What the caller should do with a task after it completed.
#[derive(Debug)]
pub enum Completion {
    /// The task is done, nothing further to do.
    Released,
    /// Submit the task again.
    Retry {
        task: ReductionTask,
        /// Set if the retry left a generation waiting for its terminator.
        terminator: Option<ReductionTask>,
    },
    /// The task was the last to detach from a dereferenced generation and
    /// has been turned into its terminator, submit it.
    BecomeTerminator(ReductionTask),
    /// The device could not evaluate the task's rows, drain it to evaluate
    /// them on the host.
    Fallback {
        task: ReductionTask,
        terminator: Option<ReductionTask>,
    },
    /// A terminator finished, drain it to get the rows of its generation.
    Drain(ReductionTask),
}

impl GpuPreAgg {
    /// Run the completion protocol for a task.
    ///
    /// Errors are fatal for the scan. The task's resources have been released
    /// when an error is returned.
    pub fn on_complete(&self, completed: CompletedTask) -> Result<Completion> {
        let CompletedTask { mut task, status } = completed;

        if task.is_terminator() {
            return self.complete_terminator(task, status);
        }

        if let Err(fault) = status {
            let err = fault_error(&task, &fault);
            error!(%err, "reduction task faulted");
            self.fail_task(task)?;
            return Err(err);
        }

        let kern = task.kern.lock().clone();
        match kern.status {
            KernelStatus::Success => {
                let generation = task.generation.required("attached generation")?;
                let appoint = {
                    let mut inner = task.shared.lock();
                    let stats = &mut inner.stats;
                    stats.count_task(task.mode);
                    stats.exec_ngroups = stats.exec_ngroups.max(kern.final_nitems);
                    stats.exec_extra_size = stats.exec_extra_size.max(kern.final_extra_usage);
                    if self.config.enable_perfmon {
                        stats.perf.get_or_insert_default().merge(&task.perf);
                    }

                    let gen_state = inner.generation_mut(generation)?;
                    gen_state.nitems = gen_state.nitems.max(kern.final_nitems);
                    gen_state.extra_usage = gen_state.extra_usage.max(kern.final_extra_usage);

                    inner.detach(generation)?
                };

                if appoint {
                    debug!(task = task.id, %generation, "task becomes terminator");
                    task.convert_to_terminator(generation);
                    return Ok(Completion::BecomeTerminator(task));
                }

                task.release_buffers();
                task.shared.release()?;
                Ok(Completion::Released)
            }
            KernelStatus::DataStoreNoSpace(Exhaustion::Input) => {
                let terminator = self.detach_task(&mut task)?;
                task.release_buffers();

                task.nrooms = task.nrooms.max(kern.nitems_real);
                task.extra_capacity = task.extra_capacity.max(kern.extra_real);
                task.is_retry = true;
                task.shared.lock().stats.num_retries += 1;
                debug!(
                    task = task.id,
                    nrooms = task.nrooms,
                    extra_capacity = task.extra_capacity,
                    "retrying task with larger working slot"
                );

                Ok(Completion::Retry { task, terminator })
            }
            KernelStatus::DataStoreNoSpace(Exhaustion::Output) => {
                if kern.progress_final {
                    let err = DbError::new("Bug? Output buffer exhausted after merge started")
                        .with_field("task", task.id);
                    self.fail_task(task)?;
                    return Err(err);
                }

                let generation = task.generation.required("attached generation")?;
                {
                    let mut inner = task.shared.lock();
                    let gen_state = inner.generation_mut(generation)?;
                    let rotated = !gen_state.dereferenced;
                    let (gen_nrooms, gen_extra) = (gen_state.nrooms, gen_state.extra_capacity);

                    inner.nrooms = inner.nrooms.max(2 * gen_nrooms).max(kern.nitems_real);
                    inner.extra_capacity = inner
                        .extra_capacity
                        .max(2 * gen_extra)
                        .max(kern.extra_real);
                    if rotated {
                        inner.dereference(generation)?;
                        inner.stats.num_rotations += 1;
                        debug!(
                            %generation,
                            next_nrooms = inner.nrooms,
                            next_extra_capacity = inner.extra_capacity,
                            "rotated output buffer"
                        );
                    }
                }

                let terminator = self.detach_task(&mut task)?;
                task.release_buffers();
                task.mode = ReductionMode::FinalOnly;
                task.is_retry = true;

                Ok(Completion::Retry { task, terminator })
            }
            KernelStatus::CpuReCheck(reason) => {
                if kern.progress_final {
                    let err = DbError::new("Bug? Recheck requested after merge started")
                        .with_field("task", task.id)
                        .with_field("reason", reason);
                    self.fail_task(task)?;
                    return Err(err);
                }
                if !self.config.cpu_fallback {
                    let err = DbError::new("Device could not evaluate rows and CPU fallback is disabled")
                        .with_field("task", task.id)
                        .with_field("reason", reason);
                    self.fail_task(task)?;
                    return Err(err);
                }

                warn!(task = task.id, %reason, "falling back to CPU");
                let terminator = self.detach_task(&mut task)?;
                task.release_buffers();
                task.cpu_fallback = true;
                task.shared.lock().stats.num_fallbacks += 1;

                Ok(Completion::Fallback { task, terminator })
            }
            KernelStatus::Error(reason) => {
                let err = DbError::new("Reduction kernel failed")
                    .with_field("task", task.id)
                    .with_field("reason", reason);
                error!(%err, "reduction task failed");
                self.fail_task(task)?;
                Err(err)
            }
        }
    }

    fn complete_terminator(
        &self,
        mut task: ReductionTask,
        status: StreamStatus,
    ) -> Result<Completion> {
        let generation = task.generation.required("generation to terminate")?;

        // Device memory is freed once the task drops its copies of the
        // pointers below.
        let terminated = task.shared.remove_generation(generation)?;
        task.release_buffers();

        if let Err(fault) = status {
            let err = fault_error(&task, &fault);
            error!(%err, "terminator faulted");
            drop(terminated);
            task.output = None;
            task.shared.release()?;
            return Err(err);
        }

        let bytes = terminated.host.lock().transfer_len();
        task.perf.dma_recv(bytes);
        {
            let mut inner = task.shared.lock();
            inner.stats.generations_terminated += 1;
            if self.config.enable_perfmon {
                inner.stats.perf.get_or_insert_default().merge(&task.perf);
            }
        }
        debug!(
            task = task.id,
            %generation,
            nrooms = terminated.nrooms,
            nitems = terminated.nitems,
            "terminated output buffer generation"
        );

        Ok(Completion::Drain(task))
    }

    /// Dereference the current generation if no task is attached to it.
    ///
    /// Returns the terminator of the generation, its device memory is freed
    /// once the terminator ran.
    pub fn flush_current(&self) -> Result<Option<ReductionTask>> {
        let shared = self.shared()?;
        let mut inner = shared.lock();
        let generation = match inner.current {
            Some(generation) => generation,
            None => return Ok(None),
        };
        let gen_state = inner.generation_mut(generation)?;
        if gen_state.tasks_running != 0 {
            return Ok(None);
        }
        gen_state.terminator_appointed = true;
        inner.dereference(generation)?;
        inner.stats.num_rotations += 1;
        drop(inner);

        debug!(%generation, "flushed idle output buffer");
        let terminator = ReductionTask::new_terminator(self.next_id(), shared.acquire()?, generation);

        Ok(Some(terminator))
    }

    /// Detach a task from its generation.
    ///
    /// If that left a dereferenced generation without running tasks, returns
    /// a new terminator for it.
    pub(crate) fn detach_task(&self, task: &mut ReductionTask) -> Result<Option<ReductionTask>> {
        let generation = match task.generation.take() {
            Some(generation) => generation,
            None => return Ok(None),
        };
        task.finals = None;

        let appoint = task.shared.lock().detach(generation)?;
        if !appoint {
            return Ok(None);
        }

        let terminator = ReductionTask::new_terminator(self.next_id(), task.shared.acquire()?, generation);
        debug!(task = terminator.id, %generation, "synthesized terminator");

        Ok(Some(terminator))
    }

    /// Release everything held by a task that can't continue.
    ///
    /// A generation left without running tasks still gets dereferenced so it
    /// won't be attached to again, its memory is freed on abort.
    fn fail_task(&self, mut task: ReductionTask) -> Result<()> {
        task.release_buffers();
        if let Some(generation) = task.generation.take() {
            let mut inner = task.shared.lock();
            inner.dereference(generation)?;
            // Nobody will terminate this generation.
            let _ = inner.detach(generation)?;
            if let Some(gen_state) = inner.generations.get_mut(&generation) {
                gen_state.terminator_appointed = true;
            }
        }
        task.shared.release()
    }
}
