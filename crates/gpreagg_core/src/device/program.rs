use std::fmt::Debug;

use gpreagg_error::{DbError, Result};

use crate::arrays::descriptor::RowDescriptor;
use crate::arrays::hash_slot::HashSlot;
use crate::arrays::scalar::ScalarValue;
use crate::arrays::slot_store::SlotStore;

/// Error raised by a device function for a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The device could not evaluate the row, the host can evaluate it
    /// instead.
    CpuReCheck { reason: String },
    /// The row can't be evaluated anywhere.
    Fatal { reason: String },
}

impl KernelError {
    pub fn recheck(reason: impl Into<String>) -> Self {
        KernelError::CpuReCheck {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        KernelError::Fatal {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::CpuReCheck { reason } | Self::Fatal { reason } => reason,
        }
    }
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// A compiled device program for one pre-aggregation.
///
/// Provides the per-row device functions the reduction kernel is built from.
/// The same functions are used by the host when a task falls back to the CPU.
pub trait DeviceProgram: Debug + Sync + Send {
    /// Descriptor of the rows produced by `projection`.
    fn descriptor(&self) -> &RowDescriptor;

    /// Build the initial partial state for one input row.
    fn projection(&self, input: &[ScalarValue]) -> KernelResult<Vec<ScalarValue>>;

    /// Build the initial partial state for one input row on the host.
    ///
    /// Used for rows the device asked to be rechecked on the CPU.
    fn host_projection(&self, input: &[ScalarValue]) -> Result<Vec<ScalarValue>> {
        self.projection(input)
            .map_err(|e| DbError::new("Failed to evaluate row on host").with_field("reason", e.reason()))
    }

    /// Hash the grouping keys of a projected row.
    fn hash_value(&self, row: &[ScalarValue]) -> u64;

    /// Check if two projected rows have equal grouping keys.
    fn key_matches(&self, a: &[ScalarValue], b: &[ScalarValue]) -> bool;

    /// Accumulate `src` into `acc` within a single task.
    fn local_calc(&self, acc: &mut [ScalarValue], src: &[ScalarValue]) -> KernelResult<()>;

    /// Accumulate `src` into a row of the shared output buffer.
    fn global_calc(&self, acc: &mut [ScalarValue], src: &[ScalarValue]) -> KernelResult<()>;

    /// Initialize the hash slot of a fresh output buffer.
    fn init_final_hash(&self, hash: &mut HashSlot) {
        hash.reset();
    }

    /// Rewrite device pointers in the output buffer into host relative
    /// offsets.
    fn fixup_varlena(&self, store: &mut SlotStore) -> KernelResult<usize> {
        store
            .fixup_varlena()
            .map_err(|e| KernelError::fatal(e.to_string()))
    }
}
