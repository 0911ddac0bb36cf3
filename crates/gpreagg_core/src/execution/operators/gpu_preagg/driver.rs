use std::collections::VecDeque;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use gpreagg_error::{DbError, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::GpuPreAgg;
use super::completion::Completion;
use super::process::{Submit, TaskHandle};
use super::shared_state::GpuPreAggStats;
use super::task::ReductionTask;
use crate::arrays::scalar::ScalarValue;

/// Number of times submitting is retried while nothing is running, without
/// a reduction task starting in between, before giving up.
const MAX_IDLE_OOM_RETRIES: usize = 3;

/// Partially aggregated rows of a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreAggOutput {
    /// One or more partial rows per group.
    pub rows: Vec<Vec<ScalarValue>>,
    pub stats: GpuPreAggStats,
}

#[derive(Debug, Default)]
struct RunState {
    in_flight: FuturesUnordered<TaskHandle>,
    /// Tasks waiting for submission, terminators go first.
    pending: VecDeque<ReductionTask>,
    rows: Vec<Vec<ScalarValue>>,
}

impl RunState {
    fn push_terminator(&mut self, terminator: Option<ReductionTask>) {
        if let Some(terminator) = terminator {
            self.pending.push_front(terminator);
        }
    }
}

/// Runs a pre-aggregation to completion.
#[derive(Debug)]
pub struct PreAggDriver {
    agg: GpuPreAgg,
}

impl PreAggDriver {
    pub fn new(agg: GpuPreAgg) -> Self {
        PreAggDriver { agg }
    }

    /// Process every chunk of the scan, returning all partial rows.
    ///
    /// On error the scan is aborted, releasing all device memory.
    pub fn run(mut self) -> Result<PreAggOutput> {
        let mut state = RunState::default();

        match futures::executor::block_on(self.drive(&mut state)) {
            Ok(()) => {
                let stats = self.agg.finish()?;
                let summary = stats.to_json()?;
                info!(rows = state.rows.len(), stats = %summary, "pre-aggregation finished");
                Ok(PreAggOutput {
                    rows: state.rows,
                    stats,
                })
            }
            Err(e) => {
                error!(%e, "pre-aggregation failed, aborting");
                let in_flight: Vec<_> = state.in_flight.into_iter().collect();
                let pending: Vec<_> = state.pending.into_iter().collect();
                if let Err(abort_err) = self.agg.abort(in_flight, pending) {
                    error!(%abort_err, "failed to abort pre-aggregation");
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self, state: &mut RunState) -> Result<()> {
        let max_inflight = self.agg.config().max_inflight_tasks.max(1);
        let mut scan_exhausted = false;
        let mut idle_oom = 0;

        loop {
            let mut out_of_resource = false;
            while state.in_flight.len() < max_inflight {
                let task = match state.pending.pop_front() {
                    Some(task) => task,
                    None if !scan_exhausted => match self.agg.next_task()? {
                        Some(task) => task,
                        None => {
                            scan_exhausted = true;
                            continue;
                        }
                    },
                    None => break,
                };

                let is_terminator = task.is_terminator();
                match self.agg.submit(task)? {
                    Submit::Running(handle) => {
                        // Terminators only give back memory, a reduction task
                        // starting is what counts as progress.
                        if !is_terminator {
                            idle_oom = 0;
                        }
                        state.in_flight.push(handle);
                    }
                    Submit::OutOfResource { task, terminator } => {
                        state.pending.push_front(task);
                        state.push_terminator(terminator);
                        out_of_resource = true;
                        break;
                    }
                }
            }

            if state.in_flight.is_empty() {
                if !out_of_resource {
                    debug_assert!(state.pending.is_empty() && scan_exhausted);
                    return Ok(());
                }
                idle_oom += 1;
                if idle_oom > MAX_IDLE_OOM_RETRIES {
                    return Err(DbError::new("Out of device memory with no tasks running")
                        .with_field("retries", MAX_IDLE_OOM_RETRIES)
                        .with_field("in_use", self.agg.device().memory_stats().in_use()));
                }

                if matches!(state.pending.front(), Some(task) if task.is_terminator()) {
                    continue;
                }

                // Nothing running will free memory, an idle output buffer
                // is the only thing left to give up.
                if let Some(terminator) = self.agg.flush_current()? {
                    debug!("flushing idle output buffer to free device memory");
                    state.pending.push_front(terminator);
                    continue;
                }

                warn!(%idle_oom, "out of device memory with no tasks running, retrying");
                continue;
            }

            let completed = match state.in_flight.next().await {
                Some(completed) => completed?,
                None => continue,
            };

            match self.agg.on_complete(completed)? {
                Completion::Released => (),
                Completion::Retry { task, terminator } => {
                    state.pending.push_front(task);
                    state.push_terminator(terminator);
                }
                Completion::BecomeTerminator(task) => state.pending.push_front(task),
                Completion::Fallback { task, terminator } => {
                    state.push_terminator(terminator);
                    let rows = self.agg.drain(task)?;
                    state.rows.extend(rows);
                }
                Completion::Drain(task) => {
                    let rows = self.agg.drain(task)?;
                    state.rows.extend(rows);
                }
            }
        }
    }
}
