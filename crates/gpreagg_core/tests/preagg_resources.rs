mod common;

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use common::{device, finalize, keyed_desc, keyed_rows, preagg};
use gpreagg_core::arrays::chunk::InputChunk;
use gpreagg_core::arrays::datatype::DataType;
use gpreagg_core::arrays::descriptor::{ColumnAction, ColumnDesc, RowDescriptor};
use gpreagg_core::arrays::scalar::ScalarValue;
use gpreagg_core::config::settings::GpuPreAggConfig;
use gpreagg_core::device::program::DeviceProgram;
use gpreagg_core::device::reference::ReferenceProgram;
use gpreagg_core::device::{Device, DeviceProperties};
use gpreagg_core::execution::operators::gpu_preagg::driver::PreAggDriver;
use gpreagg_core::execution::operators::gpu_preagg::process::Submit;

fn keyed_chunks(n: usize) -> Vec<InputChunk> {
    (0..n)
        .map(|_| InputChunk::new_row(keyed_rows((0..50).map(|k| k % 5))))
        .collect()
}

fn assert_keyed_counts(program: &dyn DeviceProgram, rows: Vec<Vec<ScalarValue>>, expected: i64) {
    let groups = finalize(program, rows);
    assert_eq!(5, groups.len());
    for row in groups.values() {
        assert_eq!(ScalarValue::Int64(expected), row[1]);
        assert_eq!(ScalarValue::Int64(expected), row[2]);
    }
}

#[test]
fn first_attach_out_of_memory_then_success() {
    logutil::init_test();

    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    device.inject_alloc_failures(1);

    let agg = preagg(&device, program.clone(), 5, GpuPreAggConfig::default(), keyed_chunks(4));
    let output = PreAggDriver::new(agg).run().unwrap();

    assert_eq!(1, output.stats.num_out_of_resource);
    assert_eq!(1, output.stats.generations_created);
    assert_keyed_counts(program.as_ref(), output.rows, 40);
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn out_of_memory_leaves_shared_state_untouched() {
    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    let mut agg = preagg(&device, program, 5, GpuPreAggConfig::default(), keyed_chunks(1));

    device.inject_alloc_failures(1);
    let task = agg.next_task().unwrap().unwrap();
    let task = match agg.submit(task).unwrap() {
        Submit::OutOfResource { task, terminator } => {
            assert!(terminator.is_none());
            task
        }
        Submit::Running(_) => panic!("expected out of resource"),
    };
    assert_eq!(None, task.generation());
    assert_eq!(0, agg.stats().unwrap().generations_created);
    assert_eq!(0, device.memory_stats().in_use());

    agg.abort(Vec::new(), vec![task]).unwrap();
}

#[test]
fn direct_io_falls_back_to_host_copy() {
    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    let config = GpuPreAggConfig {
        enable_perfmon: true,
        max_inflight_tasks: 1,
        ..Default::default()
    };
    let chunks = (0..3)
        .map(|_| {
            InputChunk::new_block(keyed_rows((0..50).map(|k| k % 5)), 5, 10).with_direct_io(true)
        })
        .collect();
    device.inject_io_map_failures(1);

    let agg = preagg(&device, program.clone(), 5, config, chunks);
    let output = PreAggDriver::new(agg).run().unwrap();

    let perf = output.stats.perf.unwrap();
    assert_eq!(2, perf.num_direct_read);
    assert_keyed_counts(program.as_ref(), output.rows, 30);
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn device_fault_is_fatal_and_leaks_nothing() {
    logutil::init_test();

    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    device.inject_launch_faults(1);

    let agg = preagg(&device, program, 5, GpuPreAggConfig::default(), keyed_chunks(6));
    let err = PreAggDriver::new(agg).run().unwrap_err();

    assert!(err.get_msg().contains("Device fault"), "error: {err}");
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn recheck_without_fallback_is_fatal() {
    let desc = RowDescriptor::try_new([
        ColumnDesc::new("name", DataType::Utf8, ColumnAction::GroupingKey { input: 0 }),
        ColumnDesc::new("cnt", DataType::Int64, ColumnAction::NRows { input: None }),
    ])
    .unwrap();
    let program: Arc<dyn DeviceProgram> =
        Arc::new(ReferenceProgram::new(desc).with_max_device_varlena(4));
    let config = GpuPreAggConfig {
        cpu_fallback: false,
        ..Default::default()
    };
    let chunks = vec![
        InputChunk::new_row(vec![vec!["ok".into()]]),
        InputChunk::new_row(vec![vec!["too long for the device".into()]]),
    ];

    let device = device();
    let agg = preagg(&device, program, 2, config, chunks);
    let err = PreAggDriver::new(agg).run().unwrap_err();

    assert!(err.get_msg().contains("CPU fallback is disabled"), "error: {err}");
    assert!(err.get_field("task").is_some());
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn output_buffer_without_room_for_task_is_fatal() {
    logutil::init_test();

    // Room for an output buffer, but not for it and the buffers of a large
    // task at the same time.
    let device = Device::try_new(DeviceProperties {
        memory_capacity: 160 * 1024,
        ..Default::default()
    })
    .unwrap();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    let chunks = vec![InputChunk::new_row(keyed_rows(0..20_000))];
    let agg = preagg(&device, program, 5, GpuPreAggConfig::default(), chunks);

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(PreAggDriver::new(agg).run());
    });
    let result = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("driver did not return");

    let err = result.unwrap_err();
    assert!(err.get_msg().contains("Out of device memory"), "error: {err}");
    assert_eq!(0, device.memory_stats().in_use());
}

#[test]
fn abort_frees_device_memory() {
    let device = device();
    let program: Arc<dyn DeviceProgram> = Arc::new(ReferenceProgram::new(keyed_desc()));
    let mut agg = preagg(&device, program, 5, GpuPreAggConfig::default(), keyed_chunks(3));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let task = agg.next_task().unwrap().unwrap();
        match agg.submit(task).unwrap() {
            Submit::Running(handle) => handles.push(handle),
            Submit::OutOfResource { .. } => panic!("unexpected out of resource"),
        }
    }
    let pending = agg.next_task().unwrap().unwrap();
    assert_ne!(0, device.memory_stats().in_use());

    agg.abort(handles, vec![pending]).unwrap();
    assert_eq!(0, device.memory_stats().in_use());
}
