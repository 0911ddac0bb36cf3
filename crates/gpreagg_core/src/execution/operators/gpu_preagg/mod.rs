//! Pre-aggregation of input chunks on the device.
//!
//! Every input chunk becomes a `ReductionTask`. Tasks reduce their rows on
//! the device and merge the partial results into an output buffer shared by
//! every task of the query. Once no more tasks can attach to an output
//! buffer, the last task detaching from it becomes its terminator and drains
//! it back to the host.
//!
//! If an output buffer fills up it's rotated: no further tasks attach to it,
//! and the next task to attach creates a new, larger, buffer. The rotated
//! buffer gets its own terminator once every task attached to it completed.

pub mod completion;
pub mod driver;
pub mod fallback;
pub mod kernel;
pub mod process;
pub mod shared_state;
pub mod source;
pub mod strategy;
pub mod task;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gpreagg_error::{DbError, OptionExt, Result};
use process::TaskHandle;
use shared_state::{GpuPreAggStats, PlanInfo, SharedStateRef};
use source::{ChunkSource, Lookahead};
use task::ReductionTask;
use tracing::{debug, error, warn};

use crate::arrays::chunk::InputChunk;
use crate::arrays::datatype::DataType;
use crate::arrays::descriptor::{ColumnAction, RowDescriptor, align_len};
use crate::arrays::scalar::ScalarValue;
use crate::config::settings::GpuPreAggConfig;
use crate::device::Device;
use crate::device::program::DeviceProgram;

/// Pre-aggregation of a single scan.
#[derive(Debug)]
pub struct GpuPreAgg {
    device: Device,
    program: Arc<dyn DeviceProgram>,
    config: GpuPreAggConfig,
    /// Our own reference to the shared state, taken on finish or abort.
    shared: Option<SharedStateRef>,
    source: Lookahead,
    next_task_id: AtomicU64,
}

impl GpuPreAgg {
    pub fn try_new<S>(
        device: Device,
        program: Arc<dyn DeviceProgram>,
        plan: PlanInfo,
        config: GpuPreAggConfig,
        source: S,
    ) -> Result<Self>
    where
        S: ChunkSource + Send + 'static,
    {
        if !config.enable_gpupreagg {
            return Err(DbError::new("GPU pre-aggregation is disabled")
                .with_field("setting", "enable_gpupreagg"));
        }

        let shared = SharedStateRef::create(program.descriptor().clone(), plan, &config);

        Ok(GpuPreAgg {
            device,
            program,
            config,
            shared: Some(shared),
            source: Lookahead::new(Box::new(source)),
            next_task_id: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &GpuPreAggConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &RowDescriptor {
        self.program.descriptor()
    }

    fn shared(&self) -> Result<&SharedStateRef> {
        self.shared.as_ref().required("shared state")
    }

    fn next_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a task for the next input chunk.
    ///
    /// Returns None once the scan is exhausted.
    pub fn next_task(&mut self) -> Result<Option<ReductionTask>> {
        let (chunk, is_last) = match self.source.next()? {
            Some(next) => next,
            None => return Ok(None),
        };

        let shared = self.shared()?;
        if is_last {
            shared.lock().scan_done = true;
        }

        let extra_capacity = working_extra_capacity(self.program.descriptor(), &chunk);
        let task = ReductionTask::new(self.next_id(), shared.acquire()?, chunk, is_last, extra_capacity);
        debug!(task = task.id(), %is_last, mode = %task.mode(), "created reduction task");

        Ok(Some(task))
    }

    /// Snapshot of the statistics of the scan.
    pub fn stats(&self) -> Result<GpuPreAggStats> {
        let mut stats = self.shared()?.stats();
        if !self.config.enable_perfmon {
            stats.perf = None;
        }
        Ok(stats)
    }

    /// Drain the rows of a terminator or a task that fell back to the CPU.
    ///
    /// Consumes the task, giving back its reference to the shared state.
    pub fn drain(&self, mut task: ReductionTask) -> Result<Vec<Vec<ScalarValue>>> {
        let rows = if task.is_terminator() {
            let output = task.output.take().required("terminator output")?;
            let rows = output.lock().rows()?;
            rows
        } else if task.cpu_fallback {
            let input = task.input.take().required("input for CPU fallback")?;
            fallback::project_on_host(self.program.as_ref(), &input)?
        } else {
            return Err(DbError::new("Bug? Draining task without output")
                .with_field("task", task.id)
                .with_field("mode", task.mode));
        };

        task.release_buffers();
        task.shared.release()?;

        Ok(rows)
    }

    /// Give back our reference to the shared state once every task has been
    /// drained or released.
    pub fn finish(&mut self) -> Result<GpuPreAggStats> {
        let stats = self.stats()?;
        let shared = self.shared.take().required("shared state")?;
        if shared.refcnt() != 1 {
            let refcnt = shared.refcnt();
            self.shared = Some(shared);
            return Err(DbError::new("Bug? Finishing with tasks still referencing shared state")
                .with_field("refcnt", refcnt));
        }
        shared.release()?;

        Ok(stats)
    }

    /// Cancel the scan.
    ///
    /// Waits for every in flight task, then frees all device memory without
    /// transferring anything back and gives back every reference to the
    /// shared state.
    pub fn abort(&mut self, in_flight: Vec<TaskHandle>, pending: Vec<ReductionTask>) -> Result<()> {
        let mut tasks = pending;
        let mut first_err: Option<DbError> = None;

        for handle in in_flight {
            match handle.wait() {
                Ok(completed) => tasks.push(completed.task),
                Err(e) => {
                    warn!(%e, "in flight task lost during abort");
                    first_err.get_or_insert(e);
                }
            }
        }

        for task in &mut tasks {
            task.release_buffers();
        }

        if let Some(shared) = &self.shared {
            let mut inner = shared.lock();
            let dropped = inner.generations.len();
            inner.generations.clear();
            inner.current = None;
            debug!(%dropped, "dropped output buffer generations on abort");
        }

        for task in tasks {
            if let Err(e) = task.shared.release() {
                error!(%e, "failed to release task reference during abort");
                first_err.get_or_insert(e);
            }
        }
        if let Some(shared) = self.shared.take() {
            if let Err(e) = shared.release() {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Extra area needed by the working slot to hold the projection of every row
/// in `chunk`.
fn working_extra_capacity(desc: &RowDescriptor, chunk: &InputChunk) -> usize {
    let varlena_cols: Vec<_> = desc
        .columns()
        .iter()
        .filter(|col| col.datatype == DataType::Utf8)
        .collect();
    if varlena_cols.is_empty() {
        return 0;
    }

    chunk
        .rows()
        .iter()
        .map(|row| {
            varlena_cols
                .iter()
                .map(|col| match &col.action {
                    ColumnAction::Const(value) => align_len(value.varlena_len()),
                    action => action
                        .inputs()
                        .into_iter()
                        .filter_map(|idx| row.get(idx))
                        .map(|v| align_len(v.varlena_len()))
                        .sum::<usize>(),
                })
                .sum::<usize>()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::descriptor::ColumnDesc;
    use crate::device::DeviceProperties;
    use crate::device::reference::ReferenceProgram;

    fn desc() -> RowDescriptor {
        RowDescriptor::try_new([
            ColumnDesc::new("k", DataType::Utf8, ColumnAction::GroupingKey { input: 0 }),
            ColumnDesc::new("tag", DataType::Utf8, ColumnAction::Const("abc".into())),
            ColumnDesc::new("cnt", DataType::Int64, ColumnAction::NRows { input: None }),
        ])
        .unwrap()
    }

    fn chunk(keys: &[&str]) -> InputChunk {
        InputChunk::new_row(keys.iter().map(|k| vec![(*k).into()]).collect())
    }

    #[test]
    fn extra_capacity_covers_projection() {
        let desc = desc();
        let chunk = chunk(&["a", "bbbbbbbbbb"]);

        let program = ReferenceProgram::new(desc.clone());
        let required: usize = chunk
            .rows()
            .iter()
            .map(|row| {
                crate::arrays::slot_store::SlotStore::extra_required(
                    &program.projection(row).unwrap(),
                )
            })
            .sum();

        assert_eq!(required, working_extra_capacity(&desc, &chunk));
    }

    #[test]
    fn disabled_engine_refuses_to_start() {
        let device = Device::try_new(DeviceProperties::default()).unwrap();
        let config = GpuPreAggConfig {
            enable_gpupreagg: false,
            ..Default::default()
        };

        GpuPreAgg::try_new(
            device,
            Arc::new(ReferenceProgram::new(desc())),
            PlanInfo::default(),
            config,
            Vec::<InputChunk>::new().into_iter(),
        )
        .unwrap_err();
    }

    #[test]
    fn last_task_marks_scan_done() {
        let device = Device::try_new(DeviceProperties::default()).unwrap();
        let mut agg = GpuPreAgg::try_new(
            device,
            Arc::new(ReferenceProgram::new(desc())),
            PlanInfo::default(),
            GpuPreAggConfig::default(),
            vec![chunk(&["a"]), chunk(&["b"])].into_iter(),
        )
        .unwrap();

        let first = agg.next_task().unwrap().unwrap();
        assert!(!first.is_last());
        assert!(!agg.shared().unwrap().lock().scan_done);

        let second = agg.next_task().unwrap().unwrap();
        assert!(second.is_last());
        assert!(agg.shared().unwrap().lock().scan_done);
        assert!(agg.next_task().unwrap().is_none());

        assert_eq!(3, agg.shared().unwrap().refcnt());
        agg.abort(Vec::new(), vec![first, second]).unwrap();
    }
}
