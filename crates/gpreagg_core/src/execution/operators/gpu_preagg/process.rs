use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use gpreagg_error::{DbError, OptionExt, Result};
use tracing::{debug, trace};

use super::GpuPreAgg;
use super::kernel::{self, KernControl, MainKernel};
use super::strategy::{AttachOutcome, attach_task};
use super::task::{FinalPointers, ReductionMode, ReductionTask, TaskBuffers};
use crate::arrays::chunk::InputChunk;
use crate::arrays::hash_slot::HashSlot;
use crate::arrays::slot_store::SlotStore;
use crate::device::memory::{DeviceBuffer, HostBuffer};
use crate::device::stream::{DeviceFault, Stream, StreamStatus};

/// Outcome of submitting a task.
#[derive(Debug)]
pub enum Submit {
    /// The task is running on the device.
    Running(TaskHandle),
    /// Not enough device memory to run the task right now. The task should
    /// be submitted again once some other task completed.
    OutOfResource {
        task: ReductionTask,
        /// Set if giving up the attachment left a generation waiting for its
        /// terminator.
        terminator: Option<ReductionTask>,
    },
}

/// A task whose device work has completed, successfully or not.
#[derive(Debug)]
pub struct CompletedTask {
    pub(crate) task: ReductionTask,
    /// Fault raised on the task's stream, if any.
    pub(crate) status: StreamStatus,
}

impl CompletedTask {
    pub fn task(&self) -> &ReductionTask {
        &self.task
    }

    pub fn status(&self) -> &StreamStatus {
        &self.status
    }
}

/// Handle to a task running on the device.
///
/// Resolves once the completion callback of the task's stream ran.
#[derive(Debug)]
pub struct TaskHandle {
    task: Option<ReductionTask>,
    status: oneshot::Receiver<StreamStatus>,
}

impl TaskHandle {
    pub fn task_id(&self) -> Option<u64> {
        self.task.as_ref().map(|t| t.id)
    }

    /// Block the current thread until the task completes.
    pub fn wait(self) -> Result<CompletedTask> {
        futures::executor::block_on(self)
    }
}

impl Future for TaskHandle {
    type Output = Result<CompletedTask>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let status = match Pin::new(&mut self.status).poll(cx) {
            Poll::Ready(Ok(status)) => status,
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(DbError::new(
                    "Stream dropped completion callback of task",
                )));
            }
            Poll::Pending => return Poll::Pending,
        };

        let task = match self.task.take() {
            Some(task) => task,
            None => return Poll::Ready(Err(DbError::new("Task handle polled after completion"))),
        };

        Poll::Ready(Ok(CompletedTask { task, status }))
    }
}

impl GpuPreAgg {
    /// Submit a task for execution on the device.
    ///
    /// Never blocks on the device, the returned handle resolves once the
    /// task's work completed.
    pub fn submit(&self, mut task: ReductionTask) -> Result<Submit> {
        if task.is_terminator() {
            return self.submit_terminator(task);
        }
        if task.cpu_fallback {
            return Err(DbError::new("Bug? Submitting task that fell back to CPU")
                .with_field("task", task.id));
        }
        if task.generation.is_some() {
            return Err(DbError::new("Bug? Submitting task still attached to a generation")
                .with_field("task", task.id));
        }

        let stream = self.device.create_stream();
        match attach_task(&self.device, &self.program, &self.config, &mut task, &stream)? {
            AttachOutcome::Attached => (),
            AttachOutcome::OutOfResource => {
                task.shared.lock().stats.num_out_of_resource += 1;
                debug!(task = task.id, "out of device memory for output buffer");
                return Ok(Submit::OutOfResource {
                    task,
                    terminator: None,
                });
            }
        }

        let buffers = match self.alloc_task_buffers(&mut task, &stream)? {
            Some(buffers) => buffers,
            None => {
                debug!(task = task.id, "out of device memory for task buffers");
                let terminator = self.detach_task(&mut task)?;
                task.release_buffers();
                task.shared.lock().stats.num_out_of_resource += 1;
                return Ok(Submit::OutOfResource { task, terminator });
            }
        };

        let finals = task.finals.clone().required("output buffer pointers")?;
        *task.kern.lock() = KernControl::new(task.mode);
        task.perf.dma_send(stream.memcpy_htod(&buffers.kern, &task.kern));

        let main = MainKernel {
            program: self.program.clone(),
            max_threads_per_block: self.device.properties().max_threads_per_block,
            kern: buffers.kern.clone(),
            input: buffers.input.clone(),
            slot: buffers.slot.clone(),
            hash: buffers.hash.clone(),
            final_slot: finals.final_slot,
            final_hash: finals.final_hash,
        };
        stream.launch("gpupreagg_main", move || main.run());
        task.perf.num_kern_main += 1;
        task.perf.dma_recv(stream.memcpy_dtoh(&task.kern, &buffers.kern));

        trace!(task = task.id, mode = %task.mode, stream = stream.id(), "submitted reduction task");
        task.buffers = Some(buffers);

        Ok(Submit::Running(self.complete_on(task, stream)))
    }

    /// Allocate the private buffers of a task and enqueue their transfers.
    ///
    /// Returns None if the device is out of memory, buffers allocated so far
    /// are freed.
    fn alloc_task_buffers(
        &self,
        task: &mut ReductionTask,
        stream: &Stream,
    ) -> Result<Option<TaskBuffers>> {
        let device = &self.device;
        let input = task.input.clone().required("input chunk")?;

        let kern = match device.alloc(KernControl::LEN, KernControl::new(task.mode))? {
            Some(buf) => buf,
            None => return Ok(None),
        };

        let input = match self.alloc_input(task, stream, input)? {
            Some(buf) => buf,
            None => return Ok(None),
        };

        let store = SlotStore::new(self.program.descriptor(), task.nrooms, task.extra_capacity);
        let slot = match device.alloc(store.length(), store.clone())? {
            Some(buf) => buf,
            None => return Ok(None),
        };
        task.perf.dma_send(stream.memcpy_htod(&slot, &HostBuffer::new(store)));

        let hash = match task.mode {
            ReductionMode::Local | ReductionMode::Global => {
                match device.alloc(
                    HashSlot::length_for_rooms(task.nrooms)?,
                    HashSlot::try_for_rooms(task.nrooms)?,
                )? {
                    Some(buf) => Some(buf),
                    None => return Ok(None),
                }
            }
            _ => None,
        };

        Ok(Some(TaskBuffers {
            kern,
            input,
            slot,
            hash,
        }))
    }

    /// Allocate device memory for the input chunk and enqueue loading it.
    ///
    /// Chunks flagged for direct transfer are read from storage straight
    /// into the I/O mapped pool. If that pool is exhausted the chunk is
    /// copied from host memory instead.
    fn alloc_input(
        &self,
        task: &mut ReductionTask,
        stream: &Stream,
        input: InputChunk,
    ) -> Result<Option<DeviceBuffer<InputChunk>>> {
        let len = input.byte_len();

        if task.direct_io {
            let placeholder = InputChunk::new_row(Vec::new());
            if let Some(buf) = self.device.alloc_io_mapped(len, placeholder)? {
                let dst = buf.clone();
                stream.launch("direct_read", move || {
                    *dst.lock() = input;
                    Ok(())
                });
                task.perf.num_direct_read += 1;
                task.perf.bytes_direct_read += len;
                return Ok(Some(buf));
            }
            debug!(task = task.id, "I/O mapped pool exhausted, falling back to host copy");
            task.direct_io = false;
        }

        let host = HostBuffer::new(input.clone());
        match self.device.alloc(len, input)? {
            Some(buf) => {
                task.perf.dma_send(stream.memcpy_htod(&buf, &host));
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Submit the terminator of a generation.
    ///
    /// Every task attached to the generation has completed, so the output
    /// buffer is drained to its host mirror.
    fn submit_terminator(&self, mut task: ReductionTask) -> Result<Submit> {
        let generation = task.generation.required("generation to terminate")?;
        let (buffers, host) = {
            let mut inner = task.shared.lock();
            let gen_state = inner.generation_mut(generation)?;
            if gen_state.tasks_running != 0 || !gen_state.dereferenced {
                return Err(DbError::new("Bug? Terminating generation still in use")
                    .with_field("generation", generation)
                    .with_field("tasks_running", gen_state.tasks_running)
                    .with_field("dereferenced", gen_state.dereferenced));
            }
            (gen_state.buffers.clone(), gen_state.host.clone())
        };

        let stream = self.device.create_stream();
        stream.wait_event(&buffers.ready);

        if self.program.descriptor().has_varlena() {
            let program = self.program.clone();
            let final_slot = buffers.final_slot.clone();
            stream.launch("gpupreagg_fixup_varlena", move || {
                kernel::fixup_final(program.as_ref(), &final_slot)
            });
            task.perf.num_kern_fixup += 1;
        }

        stream.memcpy_dtoh(&host, &buffers.final_slot);
        task.output = Some(host);
        task.finals = Some(FinalPointers {
            final_slot: buffers.final_slot,
            final_hash: buffers.final_hash,
        });

        debug!(task = task.id, %generation, "submitted terminator");

        Ok(Submit::Running(self.complete_on(task, stream)))
    }

    /// Register the completion callback of `task` on `stream`.
    fn complete_on(&self, mut task: ReductionTask, stream: Stream) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        stream.add_callback(move |status: StreamStatus| {
            if let Err(fault) = &status {
                trace!(%fault, "task stream faulted");
            }
            // Receiver is gone if the handle was dropped, nothing to report
            // to.
            let _ = tx.send(status);
        });
        task.stream = Some(stream);

        TaskHandle {
            task: Some(task),
            status: rx,
        }
    }
}

/// Convert a stream fault into a hard error.
pub(crate) fn fault_error(task: &ReductionTask, fault: &DeviceFault) -> DbError {
    DbError::new("Device fault while running reduction task")
        .with_field("task", task.id)
        .with_field("mode", task.mode)
        .with_field("fault", fault)
}
