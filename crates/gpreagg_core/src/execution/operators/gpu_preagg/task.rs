use std::fmt;

use serde::Serialize;

use super::kernel::KernControl;
use super::shared_state::{GenerationId, SharedStateRef};
use crate::arrays::chunk::InputChunk;
use crate::arrays::hash_slot::HashSlot;
use crate::arrays::slot_store::SlotStore;
use crate::device::memory::{DeviceBuffer, HostBuffer};
use crate::device::stream::Stream;

/// Granularity at which a task reduces its rows before touching the shared
/// output buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReductionMode {
    #[default]
    Undecided,
    /// No grouping keys, every row reduces into a single row.
    NoGroup,
    /// Reduce within each block, then within the task, then into the output.
    Local,
    /// Reduce within the task, then into the output.
    Global,
    /// Write projected rows straight into the output.
    FinalOnly,
    /// Drain the output buffer, no reduction.
    TerminationOnly,
}

impl fmt::Display for ReductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undecided => "UNDECIDED",
            Self::NoGroup => "NOGROUP",
            Self::Local => "LOCAL",
            Self::Global => "GLOBAL",
            Self::FinalOnly => "FINAL",
            Self::TerminationOnly => "TERMINATION",
        };
        write!(f, "{s}")
    }
}

/// Advisory counters for transfers and kernel launches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerfCounters {
    pub num_dma_send: usize,
    pub bytes_dma_send: usize,
    pub num_dma_recv: usize,
    pub bytes_dma_recv: usize,
    pub num_direct_read: usize,
    pub bytes_direct_read: usize,
    pub num_kern_main: usize,
    pub num_kern_init: usize,
    pub num_kern_fixup: usize,
}

impl PerfCounters {
    pub fn merge(&mut self, other: &PerfCounters) {
        self.num_dma_send += other.num_dma_send;
        self.bytes_dma_send += other.bytes_dma_send;
        self.num_dma_recv += other.num_dma_recv;
        self.bytes_dma_recv += other.bytes_dma_recv;
        self.num_direct_read += other.num_direct_read;
        self.bytes_direct_read += other.bytes_direct_read;
        self.num_kern_main += other.num_kern_main;
        self.num_kern_init += other.num_kern_init;
        self.num_kern_fixup += other.num_kern_fixup;
    }

    pub(crate) fn dma_send(&mut self, bytes: usize) {
        self.num_dma_send += 1;
        self.bytes_dma_send += bytes;
    }

    pub(crate) fn dma_recv(&mut self, bytes: usize) {
        self.num_dma_recv += 1;
        self.bytes_dma_recv += bytes;
    }
}

/// Device memory exclusively owned by a task while it's running.
#[derive(Debug)]
pub(crate) struct TaskBuffers {
    pub(crate) kern: DeviceBuffer<KernControl>,
    pub(crate) input: DeviceBuffer<InputChunk>,
    pub(crate) slot: DeviceBuffer<SlotStore>,
    /// Only allocated for modes reducing within the task.
    pub(crate) hash: Option<DeviceBuffer<HashSlot>>,
}

/// Copies of the shared output buffer pointers.
#[derive(Debug, Clone)]
pub(crate) struct FinalPointers {
    pub(crate) final_slot: DeviceBuffer<SlotStore>,
    pub(crate) final_hash: DeviceBuffer<HashSlot>,
}

/// Work on a single input chunk, or the termination of one generation of the
/// output buffer.
#[derive(Debug)]
pub struct ReductionTask {
    pub(crate) id: u64,
    pub(crate) shared: SharedStateRef,
    /// None for terminators.
    pub(crate) input: Option<InputChunk>,
    pub(crate) mode: ReductionMode,
    pub(crate) is_last: bool,
    pub(crate) is_retry: bool,
    pub(crate) direct_io: bool,
    pub(crate) cpu_fallback: bool,
    /// Capacity of the working slot.
    pub(crate) nrooms: usize,
    /// Extra area capacity of the working slot.
    pub(crate) extra_capacity: usize,
    /// Generation the task is attached to, or terminates.
    pub(crate) generation: Option<GenerationId>,
    pub(crate) stream: Option<Stream>,
    pub(crate) buffers: Option<TaskBuffers>,
    pub(crate) finals: Option<FinalPointers>,
    /// Host copy of the control block, written back after the kernel ran.
    pub(crate) kern: HostBuffer<KernControl>,
    /// Set on terminators, receives the rows of the output buffer.
    pub(crate) output: Option<HostBuffer<SlotStore>>,
    pub(crate) perf: PerfCounters,
}

impl ReductionTask {
    pub(crate) fn new(
        id: u64,
        shared: SharedStateRef,
        input: InputChunk,
        is_last: bool,
        extra_capacity: usize,
    ) -> Self {
        let mode = if shared.descriptor().num_group_keys() == 0 {
            ReductionMode::NoGroup
        } else {
            ReductionMode::Undecided
        };

        ReductionTask {
            id,
            nrooms: input.num_rows_estimate(),
            extra_capacity,
            direct_io: input.direct_io(),
            input: Some(input),
            shared,
            mode,
            is_last,
            is_retry: false,
            cpu_fallback: false,
            generation: None,
            stream: None,
            buffers: None,
            finals: None,
            kern: HostBuffer::new(KernControl::default()),
            output: None,
            perf: PerfCounters::default(),
        }
    }

    /// Create a zero-work task draining `generation`.
    pub(crate) fn new_terminator(id: u64, shared: SharedStateRef, generation: GenerationId) -> Self {
        ReductionTask {
            id,
            shared,
            input: None,
            mode: ReductionMode::TerminationOnly,
            is_last: false,
            is_retry: false,
            direct_io: false,
            cpu_fallback: false,
            nrooms: 0,
            extra_capacity: 0,
            generation: Some(generation),
            stream: None,
            buffers: None,
            finals: None,
            kern: HostBuffer::new(KernControl::default()),
            output: None,
            perf: PerfCounters::default(),
        }
    }

    /// Turn this task into the terminator of the generation it was attached
    /// to.
    ///
    /// Counters of the reduction have already been collected and are reset.
    pub(crate) fn convert_to_terminator(&mut self, generation: GenerationId) {
        self.mode = ReductionMode::TerminationOnly;
        self.perf = PerfCounters::default();
        self.generation = Some(generation);
        self.input = None;
        self.buffers = None;
        self.finals = None;
        self.stream = None;
    }

    /// Drop all device memory held by this task.
    pub(crate) fn release_buffers(&mut self) {
        self.buffers = None;
        self.finals = None;
        self.stream = None;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> ReductionMode {
        self.mode
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn is_retry(&self) -> bool {
        self.is_retry
    }

    pub fn is_terminator(&self) -> bool {
        self.mode == ReductionMode::TerminationOnly
    }

    pub fn direct_io(&self) -> bool {
        self.direct_io
    }

    pub fn cpu_fallback(&self) -> bool {
        self.cpu_fallback
    }

    pub fn generation(&self) -> Option<GenerationId> {
        self.generation
    }

    pub fn input(&self) -> Option<&InputChunk> {
        self.input.as_ref()
    }

    pub fn perf(&self) -> &PerfCounters {
        &self.perf
    }
}
