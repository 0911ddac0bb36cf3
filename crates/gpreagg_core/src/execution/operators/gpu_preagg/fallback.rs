use gpreagg_error::{Result, ResultExt};
use tracing::debug;

use crate::arrays::chunk::InputChunk;
use crate::arrays::scalar::ScalarValue;
use crate::device::program::DeviceProgram;

/// Evaluate the projection of every row of `input` on the host.
///
/// Produces one partial row per input row, the final aggregation combines
/// them with everything drained from the device.
pub fn project_on_host(
    program: &dyn DeviceProgram,
    input: &InputChunk,
) -> Result<Vec<Vec<ScalarValue>>> {
    debug!(rows = input.num_rows(), "projecting chunk on host");
    input
        .rows()
        .iter()
        .map(|row| program.host_projection(row))
        .collect::<Result<Vec<_>>>()
        .context("Failed to project chunk on host")
}
