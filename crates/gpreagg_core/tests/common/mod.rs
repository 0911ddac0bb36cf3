use std::collections::BTreeMap;
use std::sync::Arc;

use gpreagg_core::arrays::chunk::InputChunk;
use gpreagg_core::arrays::datatype::DataType;
use gpreagg_core::arrays::descriptor::{ColumnAction, ColumnDesc, RowDescriptor};
use gpreagg_core::arrays::scalar::ScalarValue;
use gpreagg_core::config::settings::GpuPreAggConfig;
use gpreagg_core::device::program::DeviceProgram;
use gpreagg_core::device::{Device, DeviceProperties};
use gpreagg_core::execution::operators::gpu_preagg::GpuPreAgg;
use gpreagg_core::execution::operators::gpu_preagg::shared_state::PlanInfo;

pub fn device() -> Device {
    Device::try_new(DeviceProperties::default()).unwrap()
}

/// `k` (int key), `sum(v)` and `count(*)`.
pub fn keyed_desc() -> RowDescriptor {
    RowDescriptor::try_new([
        ColumnDesc::new("k", DataType::Int64, ColumnAction::GroupingKey { input: 0 }),
        ColumnDesc::new("sum", DataType::Int64, ColumnAction::PSum { input: 1 }),
        ColumnDesc::new("cnt", DataType::Int64, ColumnAction::NRows { input: None }),
    ])
    .unwrap()
}

/// Rows `(key, 1)` for the given keys.
pub fn keyed_rows(keys: impl IntoIterator<Item = i64>) -> Vec<Vec<ScalarValue>> {
    keys.into_iter()
        .map(|k| vec![ScalarValue::Int64(k), ScalarValue::Int64(1)])
        .collect()
}

pub fn preagg(
    device: &Device,
    program: Arc<dyn DeviceProgram>,
    ngroups: usize,
    config: GpuPreAggConfig,
    chunks: Vec<InputChunk>,
) -> GpuPreAgg {
    GpuPreAgg::try_new(
        device.clone(),
        program,
        PlanInfo {
            ngroups,
            extra_per_group: 0,
        },
        config,
        chunks.into_iter(),
    )
    .unwrap()
}

/// Combine partial rows by grouping key, like the final aggregation on the
/// host would.
pub fn finalize(
    program: &dyn DeviceProgram,
    rows: Vec<Vec<ScalarValue>>,
) -> BTreeMap<String, Vec<ScalarValue>> {
    let mut groups: BTreeMap<String, Vec<ScalarValue>> = BTreeMap::new();
    for row in rows {
        let key = program
            .descriptor()
            .key_columns()
            .map(|col| row[col].to_string())
            .collect::<Vec<_>>()
            .join(",");
        match groups.get_mut(&key) {
            Some(acc) => program.local_calc(acc, &row).unwrap(),
            None => {
                groups.insert(key, row);
            }
        }
    }
    groups
}
