use super::descriptor::align_len;
use super::scalar::ScalarValue;
use crate::device::memory::DeviceCopy;

/// Length of the header preceding the rows of an input chunk.
const CHUNK_HEAD_LEN: usize = 64;
/// Per-row overhead of the row format (tuple header and item pointer).
const ROW_HEAD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFormat {
    /// Rows stored one after another, the row count is exact.
    Row,
    /// Rows packed into blocks.
    ///
    /// The number of rows per block is an estimate, the exact number of rows
    /// is only known once the blocks have been read on the device.
    Block { nblocks: usize, nrows_per_block: usize },
}

/// A batch of input rows processed by a single task.
#[derive(Debug, Clone, PartialEq)]
pub struct InputChunk {
    format: ChunkFormat,
    rows: Vec<Vec<ScalarValue>>,
    /// If blocks should be loaded directly from storage into device memory.
    direct_io: bool,
}

impl InputChunk {
    pub fn new_row(rows: Vec<Vec<ScalarValue>>) -> Self {
        InputChunk {
            format: ChunkFormat::Row,
            rows,
            direct_io: false,
        }
    }

    pub fn new_block(rows: Vec<Vec<ScalarValue>>, nblocks: usize, nrows_per_block: usize) -> Self {
        InputChunk {
            format: ChunkFormat::Block {
                nblocks,
                nrows_per_block,
            },
            rows,
            direct_io: false,
        }
    }

    /// Request direct storage-to-device transfer for this chunk.
    ///
    /// Only block chunks can be transferred directly, this is ignored for row
    /// chunks.
    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io && matches!(self.format, ChunkFormat::Block { .. });
        self
    }

    pub const fn format(&self) -> ChunkFormat {
        self.format
    }

    pub const fn direct_io(&self) -> bool {
        self.direct_io
    }

    pub fn rows(&self) -> &[Vec<ScalarValue>] {
        &self.rows
    }

    /// Actual number of rows in the chunk.
    ///
    /// Only the device may rely on this for block chunks.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Number of rows the host expects to be in this chunk.
    pub fn num_rows_estimate(&self) -> usize {
        match self.format {
            ChunkFormat::Row => self.rows.len(),
            ChunkFormat::Block {
                nblocks,
                nrows_per_block,
            } => nblocks * nrows_per_block,
        }
    }

    /// Total bytes of out of line values in the chunk.
    pub fn varlena_len(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .map(|v| align_len(v.varlena_len()))
            .sum()
    }

    /// Length in bytes of this chunk when transferred to the device.
    pub fn byte_len(&self) -> usize {
        let rows_len: usize = self
            .rows
            .iter()
            .map(|row| align_len(ROW_HEAD_LEN + row.len() * 9))
            .sum();
        CHUNK_HEAD_LEN + rows_len + self.varlena_len()
    }
}

impl DeviceCopy for InputChunk {
    fn transfer_len(&self) -> usize {
        self.byte_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_estimate_differs_from_actual() {
        let rows = vec![vec![ScalarValue::Int64(1)]; 10];
        let chunk = InputChunk::new_block(rows, 2, 4);

        assert_eq!(8, chunk.num_rows_estimate());
        assert_eq!(10, chunk.num_rows());
    }

    #[test]
    fn direct_io_only_for_blocks() {
        let chunk = InputChunk::new_row(Vec::new()).with_direct_io(true);
        assert!(!chunk.direct_io());

        let chunk = InputChunk::new_block(Vec::new(), 0, 16).with_direct_io(true);
        assert!(chunk.direct_io());
    }
}
