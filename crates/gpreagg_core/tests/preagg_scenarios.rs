mod common;

use std::sync::Arc;

use common::{device, finalize, keyed_desc, keyed_rows, preagg};
use gpreagg_core::arrays::chunk::InputChunk;
use gpreagg_core::arrays::datatype::DataType;
use gpreagg_core::arrays::descriptor::{ColumnAction, ColumnDesc, RowDescriptor};
use gpreagg_core::arrays::scalar::ScalarValue;
use gpreagg_core::config::settings::GpuPreAggConfig;
use gpreagg_core::device::program::DeviceProgram;
use gpreagg_core::device::reference::ReferenceProgram;
use gpreagg_core::execution::operators::gpu_preagg::completion::Completion;
use gpreagg_core::execution::operators::gpu_preagg::driver::PreAggDriver;
use gpreagg_core::execution::operators::gpu_preagg::process::Submit;
use gpreagg_core::execution::operators::gpu_preagg::task::ReductionMode;

fn sum_desc() -> RowDescriptor {
    RowDescriptor::try_new([ColumnDesc::new(
        "sum",
        DataType::Int64,
        ColumnAction::PSum { input: 0 },
    )])
    .unwrap()
}

fn value_chunk(values: &[i64]) -> InputChunk {
    InputChunk::new_row(values.iter().map(|v| vec![ScalarValue::Int64(*v)]).collect())
}

#[test]
fn nogroup_sums_across_chunks() {
    logutil::init_test();

    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(sum_desc()));
    let chunks = vec![
        value_chunk(&[1, 2, 3, 4]),
        value_chunk(&[20]),
        value_chunk(&[5, 5, 5, 5, 10]),
    ];

    let agg = preagg(&device, program.clone(), 1, GpuPreAggConfig::default(), chunks);
    let output = PreAggDriver::new(agg).run().unwrap();

    let groups = finalize(program.as_ref(), output.rows);
    assert_eq!(1, groups.len());
    assert_eq!(vec![ScalarValue::Int64(60)], groups[""]);
    assert_eq!(3, output.stats.num_nogroup_tasks);
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn nogroup_same_result_for_single_chunk() {
    let values: Vec<i64> = (1..=100).collect();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(sum_desc()));

    let single = {
        let agg = preagg(
            &device(),
            program.clone(),
            1,
            GpuPreAggConfig::default(),
            vec![value_chunk(&values)],
        );
        finalize(program.as_ref(), PreAggDriver::new(agg).run().unwrap().rows)
    };

    let split = {
        let chunks = values.chunks(7).map(value_chunk).collect();
        let agg = preagg(&device(), program.clone(), 1, GpuPreAggConfig::default(), chunks);
        finalize(program.as_ref(), PreAggDriver::new(agg).run().unwrap().rows)
    };

    assert_eq!(single, split);
    assert_eq!(vec![ScalarValue::Int64(5050)], single[""]);
}

#[test]
fn rotation_with_underestimated_groups() {
    logutil::init_test();

    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    let config = GpuPreAggConfig {
        chunk_size: 4096,
        strategy_warmup_tasks: 2,
        max_inflight_tasks: 1,
        ..Default::default()
    };
    // 5000 distinct keys, every key appears twice.
    let chunks = (0..4)
        .map(|i| InputChunk::new_row(keyed_rows((0..2500).map(|j| (i * 2500 + j) % 5000))))
        .collect();
    let mut agg = preagg(&device, program.clone(), 2, config, chunks);

    // Step through the tasks one at a time to see the mode each ran with.
    let mut modes = Vec::new();
    let mut rows = Vec::new();
    let mut pending = Vec::new();
    loop {
        let task = match pending.pop() {
            Some(task) => task,
            None => match agg.next_task().unwrap() {
                Some(task) => task,
                None => break,
            },
        };
        let handle = match agg.submit(task).unwrap() {
            Submit::Running(handle) => handle,
            Submit::OutOfResource { .. } => panic!("unexpected out of resource"),
        };

        let completed = handle.wait().unwrap();
        // Retries after a rotation are forced to FINAL-ONLY, only first
        // attempts show what the selector picked.
        if !completed.task().is_terminator() && !completed.task().is_retry() {
            modes.push(completed.task().mode());
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

    assert_eq!(ReductionMode::Local, modes[0]);
    assert!(
        modes[1..]
            .iter()
            .any(|m| matches!(m, ReductionMode::Global | ReductionMode::FinalOnly)),
        "modes: {modes:?}"
    );

    let stats = agg.finish().unwrap();
    assert!(stats.num_rotations >= 1);
    assert_eq!(stats.generations_created, stats.generations_terminated);

    let groups = finalize(program.as_ref(), rows);
    assert_eq!(5000, groups.len());
    for row in groups.values() {
        assert_eq!(ScalarValue::Int64(2), row[1]);
        assert_eq!(ScalarValue::Int64(2), row[2]);
    }
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn input_retry_does_not_double_count() {
    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    // Block chunks claiming far fewer rows than they hold.
    let chunks = (0..3)
        .map(|_| InputChunk::new_block(keyed_rows((0..200).map(|k| k % 10)), 2, 5))
        .collect();

    let agg = preagg(&device, program.clone(), 10, GpuPreAggConfig::default(), chunks);
    let output = PreAggDriver::new(agg).run().unwrap();
    assert_eq!(3, output.stats.num_retries);

    let groups = finalize(program.as_ref(), output.rows);
    assert_eq!(10, groups.len());
    for row in groups.values() {
        assert_eq!(ScalarValue::Int64(60), row[1]);
        assert_eq!(ScalarValue::Int64(60), row[2]);
    }
}

#[test]
fn varlena_keys_survive_fixup() {
    let desc = RowDescriptor::try_new([
        ColumnDesc::new("name", DataType::Utf8, ColumnAction::GroupingKey { input: 0 }),
        ColumnDesc::new("min", DataType::Float64, ColumnAction::PMin { input: 1 }),
        ColumnDesc::new("max", DataType::Float64, ColumnAction::PMax { input: 1 }),
    ])
    .unwrap();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(desc));
    let names = ["alpha", "a much longer name than the others", "", "gamma"];
    let chunks = (0..4)
        .map(|i| {
            InputChunk::new_row(
                names
                    .iter()
                    .enumerate()
                    .map(|(j, n)| vec![ScalarValue::from(*n), ScalarValue::Float64((i * 10 + j) as f64)])
                    .collect(),
            )
        })
        .collect();

    let device = device();
    let agg = preagg(&device, program.clone(), 4, GpuPreAggConfig::default(), chunks);
    let output = PreAggDriver::new(agg).run().unwrap();

    let groups = finalize(program.as_ref(), output.rows);
    assert_eq!(names.len(), groups.len());
    for (j, name) in names.iter().enumerate() {
        let row = &groups[*name];
        assert_eq!(ScalarValue::from(*name), row[0]);
        assert_eq!(ScalarValue::Float64(j as f64), row[1]);
        assert_eq!(ScalarValue::Float64((30 + j) as f64), row[2]);
    }
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn recheck_falls_back_to_host() {
    let desc = RowDescriptor::try_new([
        ColumnDesc::new("name", DataType::Utf8, ColumnAction::GroupingKey { input: 0 }),
        ColumnDesc::new("cnt", DataType::Int64, ColumnAction::NRows { input: None }),
    ])
    .unwrap();
    let program: Arc<dyn DeviceProgram> =
        Arc::new(ReferenceProgram::new(desc).with_max_device_varlena(8));
    let long = "longer than the device allows";
    let chunks = vec![
        InputChunk::new_row(vec![vec!["a".into()], vec!["b".into()]]),
        InputChunk::new_row(vec![vec!["a".into()], vec![long.into()]]),
        InputChunk::new_row(vec![vec!["b".into()]]),
    ];

    let device = device();
    let agg = preagg(&device, program.clone(), 3, GpuPreAggConfig::default(), chunks);
    let output = PreAggDriver::new(agg).run().unwrap();
    assert_eq!(1, output.stats.num_fallbacks);

    let groups = finalize(program.as_ref(), output.rows);
    assert_eq!(ScalarValue::Int64(2), groups["a"][1]);
    assert_eq!(ScalarValue::Int64(2), groups["b"][1]);
    assert_eq!(ScalarValue::Int64(1), groups[long][1]);
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn perf_counters_only_with_perfmon() {
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    let chunks = || vec![InputChunk::new_row(keyed_rows(0..100))];

    let agg = preagg(&device(), program.clone(), 100, GpuPreAggConfig::default(), chunks());
    let output = PreAggDriver::new(agg).run().unwrap();
    assert_eq!(None, output.stats.perf);

    let config = GpuPreAggConfig {
        enable_perfmon: true,
        ..Default::default()
    };
    let agg = preagg(&device(), program, 100, config, chunks());
    let output = PreAggDriver::new(agg).run().unwrap();
    let perf = output.stats.perf.unwrap();
    assert_eq!(1, perf.num_kern_main);
    assert_eq!(1, perf.num_kern_init);
    assert!(perf.num_dma_send > 0);
    assert!(perf.num_dma_recv > 0);
}
