use std::cmp::Ordering;

use ahash::RandomState;
use gpreagg_error::{DbError, Result};

use super::program::{DeviceProgram, KernelError, KernelResult};
use crate::arrays::datatype::DataType;
use crate::arrays::descriptor::{ColumnAction, ColumnDesc, RowDescriptor};
use crate::arrays::scalar::ScalarValue;

/// State used for hashing grouping keys.
const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Longest variable length value the device evaluates by default.
pub const DEFAULT_MAX_DEVICE_VARLENA: usize = 1024;

/// Device program computing partial aggregates from the column actions of a
/// row descriptor.
#[derive(Debug, Clone)]
pub struct ReferenceProgram {
    desc: RowDescriptor,
    /// Variable length values longer than this can't be handled on the device
    /// and are rechecked on the CPU.
    max_device_varlena: usize,
}

impl ReferenceProgram {
    pub fn new(desc: RowDescriptor) -> Self {
        ReferenceProgram {
            desc,
            max_device_varlena: DEFAULT_MAX_DEVICE_VARLENA,
        }
    }

    pub fn with_max_device_varlena(mut self, len: usize) -> Self {
        self.max_device_varlena = len;
        self
    }

    fn project_row(&self, input: &[ScalarValue], on_device: bool) -> KernelResult<Vec<ScalarValue>> {
        self.desc
            .columns()
            .iter()
            .map(|col| self.project_column(col, input, on_device))
            .collect()
    }

    fn project_column(
        &self,
        col: &ColumnDesc,
        input: &[ScalarValue],
        on_device: bool,
    ) -> KernelResult<ScalarValue> {
        let get = |idx: usize| {
            input.get(idx).ok_or_else(|| {
                KernelError::fatal(format!(
                    "Input column {idx} out of range for row with {} columns",
                    input.len()
                ))
            })
        };

        Ok(match &col.action {
            ColumnAction::GroupingKey { input }
            | ColumnAction::PMin { input }
            | ColumnAction::PMax { input }
            | ColumnAction::PSum { input } => {
                let value = get(*input)?;
                if on_device {
                    self.check_device_value(value)?;
                }
                cast(value, col.datatype)?
            }
            ColumnAction::Const(value) => value.clone(),
            ColumnAction::ConstNull => ScalarValue::Null,
            ColumnAction::NRows { input: None } => ScalarValue::Int64(1),
            ColumnAction::NRows { input: Some(input) } => {
                ScalarValue::Int64(if get(*input)?.is_null() { 0 } else { 1 })
            }
            ColumnAction::PSumX2 { input } => match get(*input)? {
                ScalarValue::Null => ScalarValue::Null,
                value => {
                    let v = as_f64(value)?;
                    ScalarValue::Float64(v * v)
                }
            },
            ColumnAction::PCovX { x, y }
            | ColumnAction::PCovY { x, y }
            | ColumnAction::PCovX2 { x, y }
            | ColumnAction::PCovY2 { x, y }
            | ColumnAction::PCovXY { x, y } => {
                let (x, y) = (get(*x)?, get(*y)?);
                if x.is_null() || y.is_null() {
                    return Ok(ScalarValue::Null);
                }
                let (x, y) = (as_f64(x)?, as_f64(y)?);
                let v = match col.action {
                    ColumnAction::PCovX { .. } => x,
                    ColumnAction::PCovY { .. } => y,
                    ColumnAction::PCovX2 { .. } => x * x,
                    ColumnAction::PCovY2 { .. } => y * y,
                    _ => x * y,
                };
                ScalarValue::Float64(v)
            }
        })
    }

    fn check_device_value(&self, value: &ScalarValue) -> KernelResult<()> {
        if value.varlena_len() > self.max_device_varlena {
            return Err(KernelError::recheck(format!(
                "variable length value of {} bytes exceeds device limit of {}",
                value.varlena_len(),
                self.max_device_varlena
            )));
        }
        Ok(())
    }

    fn combine(&self, acc: &mut [ScalarValue], src: &[ScalarValue]) -> KernelResult<()> {
        if acc.len() != self.desc.num_columns() || src.len() != self.desc.num_columns() {
            return Err(KernelError::fatal("Unexpected number of columns in partial row"));
        }

        for ((col, acc), src) in self.desc.columns().iter().zip(acc.iter_mut()).zip(src) {
            if src.is_null() {
                continue;
            }
            if acc.is_null() {
                *acc = src.clone();
                continue;
            }

            match &col.action {
                ColumnAction::GroupingKey { .. }
                | ColumnAction::Const(_)
                | ColumnAction::ConstNull => (),
                ColumnAction::NRows { .. } | ColumnAction::PSum { .. } => add(acc, src)?,
                ColumnAction::PMin { .. } => {
                    if compare(src, acc)? == Ordering::Less {
                        *acc = src.clone();
                    }
                }
                ColumnAction::PMax { .. } => {
                    if compare(src, acc)? == Ordering::Greater {
                        *acc = src.clone();
                    }
                }
                ColumnAction::PSumX2 { .. }
                | ColumnAction::PCovX { .. }
                | ColumnAction::PCovY { .. }
                | ColumnAction::PCovX2 { .. }
                | ColumnAction::PCovY2 { .. }
                | ColumnAction::PCovXY { .. } => add(acc, src)?,
            }
        }

        Ok(())
    }
}

impl DeviceProgram for ReferenceProgram {
    fn descriptor(&self) -> &RowDescriptor {
        &self.desc
    }

    fn projection(&self, input: &[ScalarValue]) -> KernelResult<Vec<ScalarValue>> {
        self.project_row(input, true)
    }

    fn host_projection(&self, input: &[ScalarValue]) -> Result<Vec<ScalarValue>> {
        self.project_row(input, false).map_err(|e| {
            DbError::new("Failed to evaluate row on host").with_field("reason", e.reason())
        })
    }

    fn hash_value(&self, row: &[ScalarValue]) -> u64 {
        let mut result = 0;
        for (idx, col) in self.desc.key_columns().enumerate() {
            let hash = match row.get(col) {
                None | Some(ScalarValue::Null) => HASH_RANDOM_STATE.hash_one(1),
                Some(ScalarValue::Boolean(v)) => HASH_RANDOM_STATE.hash_one(v),
                Some(ScalarValue::Int64(v)) => HASH_RANDOM_STATE.hash_one(v),
                Some(ScalarValue::Float64(v)) => HASH_RANDOM_STATE.hash_one(v.to_ne_bytes()),
                Some(ScalarValue::Utf8(v)) => HASH_RANDOM_STATE.hash_one(v),
            };
            result = if idx > 0 {
                combine_hashes(hash, result)
            } else {
                hash
            };
        }
        result
    }

    fn key_matches(&self, a: &[ScalarValue], b: &[ScalarValue]) -> bool {
        self.desc.key_columns().all(|col| match (a.get(col), b.get(col)) {
            (Some(ScalarValue::Float64(a)), Some(ScalarValue::Float64(b))) => {
                a.total_cmp(b) == Ordering::Equal
            }
            (a, b) => a == b,
        })
    }

    fn local_calc(&self, acc: &mut [ScalarValue], src: &[ScalarValue]) -> KernelResult<()> {
        self.combine(acc, src)
    }

    fn global_calc(&self, acc: &mut [ScalarValue], src: &[ScalarValue]) -> KernelResult<()> {
        self.combine(acc, src)
    }
}

/// Combines two hashes into one hash.
const fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}

fn cast(value: &ScalarValue, datatype: DataType) -> KernelResult<ScalarValue> {
    Ok(match (value, datatype) {
        (ScalarValue::Null, _) => ScalarValue::Null,
        (ScalarValue::Boolean(_), DataType::Boolean)
        | (ScalarValue::Int64(_), DataType::Int64)
        | (ScalarValue::Float64(_), DataType::Float64)
        | (ScalarValue::Utf8(_), DataType::Utf8) => value.clone(),
        (ScalarValue::Int64(v), DataType::Float64) => ScalarValue::Float64(*v as f64),
        (value, datatype) => {
            return Err(KernelError::fatal(format!(
                "Cannot store '{value}' in a column of type {datatype}"
            )));
        }
    })
}

fn as_f64(value: &ScalarValue) -> KernelResult<f64> {
    match value {
        ScalarValue::Int64(v) => Ok(*v as f64),
        ScalarValue::Float64(v) => Ok(*v),
        other => Err(KernelError::fatal(format!("Not a numeric value: {other}"))),
    }
}

fn add(acc: &mut ScalarValue, src: &ScalarValue) -> KernelResult<()> {
    match (acc, src) {
        (ScalarValue::Int64(a), ScalarValue::Int64(b)) => {
            *a = a
                .checked_add(*b)
                .ok_or_else(|| KernelError::recheck("integer out of range"))?;
        }
        (ScalarValue::Float64(a), ScalarValue::Float64(b)) => *a += b,
        (acc, src) => {
            return Err(KernelError::fatal(format!("Cannot add '{src}' to '{acc}'")));
        }
    }
    Ok(())
}

fn compare(a: &ScalarValue, b: &ScalarValue) -> KernelResult<Ordering> {
    Ok(match (a, b) {
        (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => a.cmp(b),
        (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a.cmp(b),
        (ScalarValue::Float64(a), ScalarValue::Float64(b)) => a.total_cmp(b),
        (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => a.cmp(b),
        (a, b) => return Err(KernelError::fatal(format!("Cannot compare '{a}' with '{b}'"))),
    })
}
