use gpreagg_error::{DbError, Result};

use super::datatype::DataType;
use super::scalar::ScalarValue;

/// Alignment used for all buffer length computations.
pub const BUFFER_ALIGN: usize = 8;

/// Fixed length of a slot store header, not including per-column metadata.
const SLOT_HEAD_BASE_LEN: usize = 64;
/// Length of the metadata for a single column in a slot store header.
const SLOT_COLMETA_LEN: usize = 16;
/// Width of a single datum in a slot, plus one byte for the null flag.
const SLOT_DATUM_LEN: usize = std::mem::size_of::<u64>() + 1;

pub const fn align_len(len: usize) -> usize {
    (len + BUFFER_ALIGN - 1) & !(BUFFER_ALIGN - 1)
}

/// How the device builds the initial partial state for an output column from
/// a single input row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnAction {
    /// Copy an input column, the column is part of the grouping key.
    GroupingKey { input: usize },
    /// Constant value.
    Const(ScalarValue),
    /// NULL constant.
    ConstNull,
    /// Number of rows. Counts every row if `input` is None, otherwise only
    /// rows where the input is not null.
    NRows { input: Option<usize> },
    /// Partial minimum.
    PMin { input: usize },
    /// Partial maximum.
    PMax { input: usize },
    /// Partial sum.
    PSum { input: usize },
    /// Partial sum of squares.
    PSumX2 { input: usize },
    /// Partial sum of x for rows where both x and y are not null.
    PCovX { x: usize, y: usize },
    /// Partial sum of y for rows where both x and y are not null.
    PCovY { x: usize, y: usize },
    PCovX2 { x: usize, y: usize },
    PCovY2 { x: usize, y: usize },
    PCovXY { x: usize, y: usize },
}

impl ColumnAction {
    pub const fn is_grouping_key(&self) -> bool {
        matches!(self, ColumnAction::GroupingKey { .. })
    }

    /// Input columns read by this action.
    pub fn inputs(&self) -> Vec<usize> {
        match self {
            Self::GroupingKey { input }
            | Self::PMin { input }
            | Self::PMax { input }
            | Self::PSum { input }
            | Self::PSumX2 { input } => vec![*input],
            Self::NRows { input } => input.iter().copied().collect(),
            Self::PCovX { x, y }
            | Self::PCovY { x, y }
            | Self::PCovX2 { x, y }
            | Self::PCovY2 { x, y }
            | Self::PCovXY { x, y } => vec![*x, *y],
            Self::Const(_) | Self::ConstNull => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDesc {
    pub name: String,
    pub datatype: DataType,
    pub action: ColumnAction,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, datatype: DataType, action: ColumnAction) -> Self {
        ColumnDesc {
            name: name.into(),
            datatype,
            action,
        }
    }
}

/// Describes the rows produced by the pre-aggregation, grouping keys
/// followed by partial aggregate states in whatever order the planner chose.
#[derive(Debug, Clone, PartialEq)]
pub struct RowDescriptor {
    columns: Vec<ColumnDesc>,
}

impl RowDescriptor {
    pub fn try_new(columns: impl IntoIterator<Item = ColumnDesc>) -> Result<Self> {
        let columns: Vec<_> = columns.into_iter().collect();
        if columns.is_empty() {
            return Err(DbError::new("Row descriptor requires at least one column"));
        }

        for col in &columns {
            let numeric_state = matches!(
                col.action,
                ColumnAction::PSumX2 { .. }
                    | ColumnAction::PCovX { .. }
                    | ColumnAction::PCovY { .. }
                    | ColumnAction::PCovX2 { .. }
                    | ColumnAction::PCovY2 { .. }
                    | ColumnAction::PCovXY { .. }
            );
            if numeric_state && col.datatype != DataType::Float64 {
                return Err(
                    DbError::new("Partial variance/covariance states must be Float64")
                        .with_field("column", &col.name)
                        .with_field("datatype", col.datatype),
                );
            }
            if matches!(col.action, ColumnAction::NRows { .. }) && col.datatype != DataType::Int64
            {
                return Err(DbError::new("Partial row counts must be Int64")
                    .with_field("column", &col.name)
                    .with_field("datatype", col.datatype));
            }
        }

        Ok(RowDescriptor { columns })
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_group_keys(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| c.action.is_grouping_key())
            .count()
    }

    /// Indices of the grouping key columns.
    pub fn key_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| c.action.is_grouping_key().then_some(idx))
    }

    /// If any column is stored out of line.
    pub fn has_varlena(&self) -> bool {
        self.columns.iter().any(|c| c.datatype.is_varlena())
    }

    /// Length of a slot store header for this descriptor.
    pub fn slot_head_len(&self) -> usize {
        align_len(SLOT_HEAD_BASE_LEN + SLOT_COLMETA_LEN * self.columns.len())
    }

    /// Length of a single slot row not including any extra space.
    pub fn slot_row_len(&self) -> usize {
        align_len(SLOT_DATUM_LEN * self.columns.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_columns_in_order() {
        let desc = RowDescriptor::try_new([
            ColumnDesc::new("k1", DataType::Int64, ColumnAction::GroupingKey { input: 0 }),
            ColumnDesc::new("cnt", DataType::Int64, ColumnAction::NRows { input: None }),
            ColumnDesc::new("k2", DataType::Utf8, ColumnAction::GroupingKey { input: 1 }),
        ])
        .unwrap();

        assert_eq!(vec![0, 2], desc.key_columns().collect::<Vec<_>>());
        assert_eq!(2, desc.num_group_keys());
        assert!(desc.has_varlena());
    }

    #[test]
    fn reject_non_float_covariance() {
        let res = RowDescriptor::try_new([ColumnDesc::new(
            "cov",
            DataType::Int64,
            ColumnAction::PCovXY { x: 0, y: 1 },
        )]);
        assert!(res.is_err());
    }

    #[test]
    fn slot_lengths_aligned() {
        let desc = RowDescriptor::try_new([ColumnDesc::new(
            "s",
            DataType::Float64,
            ColumnAction::PSum { input: 0 },
        )])
        .unwrap();

        assert_eq!(0, desc.slot_head_len() % BUFFER_ALIGN);
        assert_eq!(16, desc.slot_row_len());
    }
}
