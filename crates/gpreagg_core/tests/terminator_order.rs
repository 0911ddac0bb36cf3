mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{device, finalize, keyed_desc, keyed_rows, preagg};
use gpreagg_core::arrays::chunk::InputChunk;
use gpreagg_core::arrays::scalar::ScalarValue;
use gpreagg_core::config::settings::GpuPreAggConfig;
use gpreagg_core::device::program::DeviceProgram;
use gpreagg_core::device::reference::ReferenceProgram;
use gpreagg_core::execution::operators::gpu_preagg::completion::Completion;
use gpreagg_core::execution::operators::gpu_preagg::process::{Submit, TaskHandle};
use gpreagg_core::execution::operators::gpu_preagg::task::ReductionTask;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const MAX_IN_FLIGHT: usize = 4;

/// Run a scan completing in flight tasks in random order, checking that
/// every generation is terminated exactly once.
fn run_random_order(seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    let config = GpuPreAggConfig {
        chunk_size: 4096,
        strategy_warmup_tasks: 3,
        ..Default::default()
    };
    // 1200 keys spread over 12 chunks, every key appears 3 times.
    let chunks = (0..12)
        .map(|i| InputChunk::new_row(keyed_rows((0..300).map(|j| (i * 300 + j) % 1200))))
        .collect();
    let mut agg = preagg(&device, program.clone(), 2, config, chunks);

    let mut in_flight: Vec<TaskHandle> = Vec::new();
    let mut pending: Vec<ReductionTask> = Vec::new();
    let mut terminated = HashSet::new();
    let mut rows = Vec::new();
    let mut scan_exhausted = false;

    loop {
        while in_flight.len() < MAX_IN_FLIGHT {
            let task = match pending.pop() {
                Some(task) => task,
                None if !scan_exhausted => match agg.next_task().unwrap() {
                    Some(task) => task,
                    None => {
                        scan_exhausted = true;
                        continue;
                    }
                },
                None => break,
            };
            match agg.submit(task).unwrap() {
                Submit::Running(handle) => in_flight.push(handle),
                Submit::OutOfResource { .. } => panic!("unexpected out of resource"),
            }
        }
        if in_flight.is_empty() {
            break;
        }

        let idx = rng.random_range(0..in_flight.len());
        let completed = in_flight.swap_remove(idx).wait().unwrap();
        if completed.task().is_terminator() {
            let generation = completed.task().generation().unwrap();
            assert!(
                terminated.insert(generation),
                "generation {generation} terminated twice (seed {seed})"
            );
        }

        match agg.on_complete(completed).unwrap() {
            Completion::Released => (),
            Completion::Retry { task, terminator } => {
                pending.push(task);
                pending.extend(terminator);
            }
            Completion::BecomeTerminator(task) => pending.push(task),
            Completion::Drain(task) => rows.extend(agg.drain(task).unwrap()),
            Completion::Fallback { .. } => panic!("unexpected fallback"),
        }
    }

    let stats = agg.finish().unwrap();
    assert_eq!(stats.generations_created, terminated.len(), "seed {seed}");
    assert_eq!(stats.generations_created, stats.generations_terminated);

    let groups = finalize(program.as_ref(), rows);
    assert_eq!(1200, groups.len());
    for row in groups.values() {
        assert_eq!(ScalarValue::Int64(3), row[2], "seed {seed}");
    }
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn one_terminator_per_generation() {
    logutil::init_test();

    for seed in 0..16 {
        run_random_order(seed);
    }
}
