use std::collections::HashMap;
use std::sync::LazyLock;

use gpreagg_error::{DbError, Result};

use crate::arrays::scalar::ScalarValue;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_NROOMS_MARGIN: usize = 200;
pub const DEFAULT_STRATEGY_WARMUP_TASKS: usize = 30;
pub const DEFAULT_MAX_INFLIGHT_TASKS: usize = 8;

/// Configuration for the pre-aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuPreAggConfig {
    pub enable_gpupreagg: bool,
    pub cpu_fallback: bool,
    pub chunk_size: usize,
    pub nrooms_margin: usize,
    pub strategy_warmup_tasks: usize,
    pub max_inflight_tasks: usize,
    pub enable_perfmon: bool,
}

impl Default for GpuPreAggConfig {
    fn default() -> Self {
        GpuPreAggConfig {
            enable_gpupreagg: true,
            cpu_fallback: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            nrooms_margin: DEFAULT_NROOMS_MARGIN,
            strategy_warmup_tasks: DEFAULT_STRATEGY_WARMUP_TASKS,
            max_inflight_tasks: DEFAULT_MAX_INFLIGHT_TASKS,
            enable_perfmon: false,
        }
    }
}

impl GpuPreAggConfig {
    pub fn set_from_scalar(&mut self, name: &str, value: &ScalarValue) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get_as_scalar(&self, name: &str) -> Result<ScalarValue> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        Ok((func.get)(self))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def_conf = Self::default();

        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        let scalar = (func.get)(&def_conf);
        (func.set)(&scalar, self)
    }

    /// Names and descriptions of all settings.
    pub fn descriptions() -> impl Iterator<Item = (&'static str, &'static str)> {
        GET_SET_FUNCTIONS
            .iter()
            .map(|(name, func)| (*name, func.description))
    }
}

struct SettingFunctions {
    description: &'static str,
    set: fn(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()>,
    get: fn(conf: &GpuPreAggConfig) -> ScalarValue,
}

impl SettingFunctions {
    const fn new<S: ConfigSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_scalar as _,
            get: S::get_as_scalar as _,
        }
    }
}

fn insert_setting<S: ConfigSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<EnableGpuPreAgg>(&mut map);
    insert_setting::<CpuFallback>(&mut map);
    insert_setting::<ChunkSize>(&mut map);
    insert_setting::<NRoomsMargin>(&mut map);
    insert_setting::<StrategyWarmupTasks>(&mut map);
    insert_setting::<MaxInflightTasks>(&mut map);
    insert_setting::<EnablePerfmon>(&mut map);

    map
});

pub trait ConfigSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()>;
    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue;
}

fn validate_range(name: &str, val: usize, min: usize, max: usize) -> Result<()> {
    if val < min {
        return Err(DbError::new(format!("{name} cannot be less than {min}")));
    }
    if val > max {
        return Err(DbError::new(format!("{name} cannot be greater than {max}")));
    }
    Ok(())
}

pub struct EnableGpuPreAgg;

impl ConfigSetting for EnableGpuPreAgg {
    const NAME: &'static str = "enable_gpupreagg";
    const DESCRIPTION: &'static str = "Enables pre-aggregation on the device";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()> {
        conf.enable_gpupreagg = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue {
        conf.enable_gpupreagg.into()
    }
}

pub struct CpuFallback;

impl ConfigSetting for CpuFallback {
    const NAME: &'static str = "cpu_fallback";
    const DESCRIPTION: &'static str =
        "Re-evaluate chunks on the host when the device can't evaluate them";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()> {
        conf.cpu_fallback = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue {
        conf.cpu_fallback.into()
    }
}

const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 1024 * 1024 * 1024;

pub struct ChunkSize;

impl ConfigSetting for ChunkSize {
    const NAME: &'static str = "chunk_size";
    const DESCRIPTION: &'static str = "Bytes of a standard chunk, used for sizing output buffers";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        validate_range("Chunk size", val, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)?;
        conf.chunk_size = val;
        Ok(())
    }

    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue {
        conf.chunk_size.into()
    }
}

pub struct NRoomsMargin;

impl ConfigSetting for NRoomsMargin {
    const NAME: &'static str = "nrooms_margin";
    const DESCRIPTION: &'static str = "Rows added to the estimated group count of output buffers";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        validate_range("Rooms margin", val, 0, 1 << 24)?;
        conf.nrooms_margin = val;
        Ok(())
    }

    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue {
        conf.nrooms_margin.into()
    }
}

pub struct StrategyWarmupTasks;

impl ConfigSetting for StrategyWarmupTasks {
    const NAME: &'static str = "strategy_warmup_tasks";
    const DESCRIPTION: &'static str =
        "Tasks after which the reduction mode relies only on observed group counts";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        validate_range("Strategy warmup tasks", val, 1, 10_000)?;
        conf.strategy_warmup_tasks = val;
        Ok(())
    }

    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue {
        conf.strategy_warmup_tasks.into()
    }
}

pub struct MaxInflightTasks;

impl ConfigSetting for MaxInflightTasks {
    const NAME: &'static str = "max_inflight_tasks";
    const DESCRIPTION: &'static str = "Maximum number of tasks running on the device at once";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()> {
        let val = scalar.try_as_usize()?;
        validate_range("Max inflight tasks", val, 1, 1024)?;
        conf.max_inflight_tasks = val;
        Ok(())
    }

    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue {
        conf.max_inflight_tasks.into()
    }
}

pub struct EnablePerfmon;

impl ConfigSetting for EnablePerfmon {
    const NAME: &'static str = "enable_perfmon";
    const DESCRIPTION: &'static str = "Collect transfer and kernel counters for every task";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut GpuPreAggConfig) -> Result<()> {
        conf.enable_perfmon = scalar.try_as_bool()?;
        Ok(())
    }

    fn get_as_scalar(conf: &GpuPreAggConfig) -> ScalarValue {
        conf.enable_perfmon.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_reset() {
        let mut conf = GpuPreAggConfig::default();
        conf.set_from_scalar("chunk_size", &ScalarValue::Int64(8192))
            .unwrap();
        assert_eq!(ScalarValue::Int64(8192), conf.get_as_scalar("chunk_size").unwrap());

        conf.reset("chunk_size").unwrap();
        assert_eq!(DEFAULT_CHUNK_SIZE, conf.chunk_size);
    }

    #[test]
    fn reject_out_of_range() {
        let mut conf = GpuPreAggConfig::default();
        conf.set_from_scalar("max_inflight_tasks", &ScalarValue::Int64(0))
            .unwrap_err();
        conf.set_from_scalar("chunk_size", &ScalarValue::Int64(-1))
            .unwrap_err();
        assert_eq!(GpuPreAggConfig::default(), conf);
    }

    #[test]
    fn unknown_setting() {
        let mut conf = GpuPreAggConfig::default();
        conf.set_from_scalar("does_not_exist", &true.into())
            .unwrap_err();
        assert_eq!(7, GpuPreAggConfig::descriptions().count());
    }
}
