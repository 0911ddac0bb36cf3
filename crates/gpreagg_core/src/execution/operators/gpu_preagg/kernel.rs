//! Kernels run on the device for a reduction task.

use std::sync::Arc;

use gpreagg_error::DbError;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use super::task::ReductionMode;
use crate::arrays::chunk::InputChunk;
use crate::arrays::hash_slot::HashSlot;
use crate::arrays::scalar::ScalarValue;
use crate::arrays::slot_store::SlotStore;
use crate::device::memory::{DeviceBuffer, DeviceCopy};
use crate::device::program::{DeviceProgram, KernelError};
use crate::device::stream::DeviceFault;

/// Which buffer ran out of space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// The working slot or local hash of the task.
    Input,
    /// The shared output buffer.
    Output,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KernelStatus {
    #[default]
    Success,
    DataStoreNoSpace(Exhaustion),
    /// The device could not evaluate some row, the host should.
    CpuReCheck(String),
    Error(String),
}

impl From<KernelError> for KernelStatus {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::CpuReCheck { reason } => KernelStatus::CpuReCheck(reason),
            KernelError::Fatal { reason } => KernelStatus::Error(reason),
        }
    }
}

impl From<DbError> for KernelStatus {
    fn from(err: DbError) -> Self {
        KernelStatus::Error(err.to_string())
    }
}

/// Control block of a reduction task, written by the host before launch and
/// by the device during execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernControl {
    pub mode: ReductionMode,
    pub status: KernelStatus,
    /// Rows actually in the input.
    pub nitems_real: usize,
    /// Extra bytes needed by the projected input.
    pub extra_real: usize,
    /// Set once the kernel started modifying the output buffer.
    pub progress_final: bool,
    /// Groups added to the output buffer.
    pub num_groups: usize,
    /// Rows in the output buffer after this task.
    pub final_nitems: usize,
    /// Extra area usage of the output buffer after this task.
    pub final_extra_usage: usize,
}

impl KernControl {
    pub const LEN: usize = 64;

    pub fn new(mode: ReductionMode) -> Self {
        KernControl {
            mode,
            ..Default::default()
        }
    }
}

impl DeviceCopy for KernControl {
    fn transfer_len(&self) -> usize {
        Self::LEN
    }
}

type KernResult<T> = Result<T, KernelStatus>;

/// Arguments of the main reduction kernel.
#[derive(Debug)]
pub(crate) struct MainKernel {
    pub(crate) program: Arc<dyn DeviceProgram>,
    pub(crate) max_threads_per_block: usize,
    pub(crate) kern: DeviceBuffer<KernControl>,
    pub(crate) input: DeviceBuffer<InputChunk>,
    pub(crate) slot: DeviceBuffer<SlotStore>,
    pub(crate) hash: Option<DeviceBuffer<HashSlot>>,
    pub(crate) final_slot: DeviceBuffer<SlotStore>,
    pub(crate) final_hash: DeviceBuffer<HashSlot>,
}

impl MainKernel {
    pub(crate) fn run(self) -> Result<(), DeviceFault> {
        let mut kern = self.kern.lock();
        kern.status = match self.execute(&mut kern) {
            Ok(()) => KernelStatus::Success,
            Err(status) => status,
        };
        Ok(())
    }

    fn execute(&self, kern: &mut KernControl) -> KernResult<()> {
        let rows = self.projection(kern)?;
        let partials = match kern.mode {
            ReductionMode::NoGroup => self.reduce_nogroup(rows)?,
            ReductionMode::Local => {
                let mut blocks = Vec::new();
                for block in rows.chunks(self.max_threads_per_block) {
                    blocks.extend(self.reduce_block(block)?);
                }
                self.reduce_local_hash(blocks)?
            }
            ReductionMode::Global => self.reduce_local_hash(rows)?,
            ReductionMode::FinalOnly => rows,
            mode => {
                return Err(KernelStatus::Error(format!(
                    "Unexpected reduction mode for main kernel: {mode}"
                )));
            }
        };
        self.merge_final(kern, partials)
    }

    /// Project input rows into the working slot.
    fn projection(&self, kern: &mut KernControl) -> KernResult<Vec<Vec<ScalarValue>>> {
        let input = self.input.lock();
        let mut slot = self.slot.lock();

        kern.nitems_real = input.num_rows();
        if input.num_rows() > slot.nrooms() {
            return Err(KernelStatus::DataStoreNoSpace(Exhaustion::Input));
        }

        let projected = input
            .rows()
            .iter()
            .map(|row| self.program.projection(row))
            .collect::<Result<Vec<_>, _>>()?;

        kern.extra_real = projected
            .iter()
            .map(|row| SlotStore::extra_required(row))
            .sum();
        if !slot.has_room(projected.len(), kern.extra_real) {
            return Err(KernelStatus::DataStoreNoSpace(Exhaustion::Input));
        }

        for row in &projected {
            if slot.append_row(row)?.is_none() {
                return Err(KernelStatus::Error(
                    "Working slot ran out of space after capacity check".to_string(),
                ));
            }
        }

        Ok(slot.rows()?)
    }

    fn reduce_nogroup(&self, rows: Vec<Vec<ScalarValue>>) -> KernResult<Vec<Vec<ScalarValue>>> {
        let mut blocks = Vec::new();
        for block in rows.chunks(self.max_threads_per_block) {
            let mut iter = block.iter();
            if let Some(first) = iter.next() {
                let mut acc = first.clone();
                for row in iter {
                    self.program.local_calc(&mut acc, row)?;
                }
                blocks.push(acc);
            }
        }

        let mut iter = blocks.into_iter();
        let mut acc = match iter.next() {
            Some(acc) => acc,
            None => return Ok(Vec::new()),
        };
        for row in iter {
            self.program.local_calc(&mut acc, &row)?;
        }
        Ok(vec![acc])
    }

    /// Reduce a single block by key.
    fn reduce_block(&self, block: &[Vec<ScalarValue>]) -> KernResult<Vec<Vec<ScalarValue>>> {
        let mut hash = HashSlot::try_for_rooms(block.len())?;
        let mut groups = Vec::new();
        for row in block {
            self.reduce_into(&mut hash, &mut groups, row.clone())?;
        }
        Ok(groups)
    }

    /// Reduce rows by key using the task's local hash slot.
    fn reduce_local_hash(&self, rows: Vec<Vec<ScalarValue>>) -> KernResult<Vec<Vec<ScalarValue>>> {
        let hash = self.hash.as_ref().ok_or_else(|| {
            KernelStatus::Error("Missing local hash slot for reduction".to_string())
        })?;
        let mut hash = hash.lock();
        if hash.capacity() < HashSlot::capacity_for_rooms(rows.len())? {
            return Err(KernelStatus::DataStoreNoSpace(Exhaustion::Input));
        }
        hash.reset();

        let mut groups = Vec::new();
        for row in rows {
            self.reduce_into(&mut hash, &mut groups, row)?;
        }
        Ok(groups)
    }

    fn reduce_into(
        &self,
        hash: &mut HashSlot,
        groups: &mut Vec<Vec<ScalarValue>>,
        row: Vec<ScalarValue>,
    ) -> KernResult<()> {
        let h = self.program.hash_value(&row);
        let found = hash.find(h, |idx| Ok(self.program.key_matches(&groups[idx], &row)))?;
        match found {
            Some(idx) => self.program.local_calc(&mut groups[idx], &row)?,
            None => {
                hash.insert(h, groups.len())?;
                groups.push(row);
            }
        }
        Ok(())
    }

    /// Merge partial rows into the output buffer.
    ///
    /// All new values are computed before anything is written. If the buffer
    /// can't hold the result, nothing is written.
    fn merge_final(&self, kern: &mut KernControl, partials: Vec<Vec<ScalarValue>>) -> KernResult<()> {
        let mut final_slot = self.final_slot.lock();
        let mut final_hash = self.final_hash.lock();

        let mut updates: HashMap<usize, Vec<ScalarValue>> = HashMap::new();
        let mut inserts: Vec<Vec<ScalarValue>> = Vec::new();
        let mut pending = HashSlot::try_for_rooms(partials.len())?;

        for row in partials {
            let h = self.program.hash_value(&row);
            let existing = final_hash.find(h, |idx| {
                let current = final_slot.row(idx)?;
                Ok(self.program.key_matches(&current, &row))
            })?;

            match existing {
                Some(idx) => {
                    let acc = match updates.entry(idx) {
                        Entry::Occupied(ent) => ent.into_mut(),
                        Entry::Vacant(ent) => ent.insert(final_slot.row(idx)?),
                    };
                    self.program.global_calc(acc, &row)?;
                }
                None => {
                    let found =
                        pending.find(h, |idx| Ok(self.program.key_matches(&inserts[idx], &row)))?;
                    match found {
                        Some(idx) => self.program.global_calc(&mut inserts[idx], &row)?,
                        None => {
                            pending.insert(h, inserts.len())?;
                            inserts.push(row);
                        }
                    }
                }
            }
        }

        let mut extra: usize = inserts.iter().map(|row| SlotStore::extra_required(row)).sum();
        for (idx, row) in &updates {
            extra += SlotStore::changed_extra_required(&final_slot.row(*idx)?, row);
        }

        kern.final_nitems = final_slot.nitems();
        kern.final_extra_usage = final_slot.extra_usage();
        if !final_slot.has_room(inserts.len(), extra) {
            return Err(KernelStatus::DataStoreNoSpace(Exhaustion::Output));
        }
        if updates.is_empty() && inserts.is_empty() {
            return Ok(());
        }

        kern.progress_final = true;
        for (idx, row) in updates {
            if !final_slot.update_row(idx, &row)? {
                return Err(KernelStatus::Error(
                    "Output buffer ran out of space after capacity check".to_string(),
                ));
            }
        }
        kern.num_groups = inserts.len();
        for row in inserts {
            let h = self.program.hash_value(&row);
            let idx = final_slot.append_row(&row)?.ok_or_else(|| {
                KernelStatus::Error("Output buffer ran out of rooms after capacity check".to_string())
            })?;
            final_hash.insert(h, idx)?;
        }

        kern.final_nitems = final_slot.nitems();
        kern.final_extra_usage = final_slot.extra_usage();

        Ok(())
    }
}

/// Initialize the hash slot of a new output buffer.
pub(crate) fn init_final(
    program: &dyn DeviceProgram,
    final_hash: &DeviceBuffer<HashSlot>,
) -> Result<(), DeviceFault> {
    program.init_final_hash(&mut final_hash.lock());
    Ok(())
}

/// Rewrite device pointers of the output buffer into host relative offsets.
pub(crate) fn fixup_final(
    program: &dyn DeviceProgram,
    final_slot: &DeviceBuffer<SlotStore>,
) -> Result<(), DeviceFault> {
    program
        .fixup_varlena(&mut final_slot.lock())
        .map(|_| ())
        .map_err(|e| DeviceFault::Launch {
            op: "gpupreagg_fixup_varlena",
            message: e.reason().to_string(),
        })
}
