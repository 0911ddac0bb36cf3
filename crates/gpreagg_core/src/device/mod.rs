//! In-process device used to run the pre-aggregation kernels.
//!
//! The device has a fixed memory budget, an I/O-mapped pool for direct
//! storage transfers, and executes stream operations on its own thread pool.

pub mod event;
pub mod memory;
pub mod program;
pub mod reference;
pub mod stream;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use event::Event;
use gpreagg_error::{DbError, Result};
use memory::{DeviceBuffer, DeviceCopy, MemoryPool, MemoryPoolStats};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use stream::{LaunchFaults, Stream};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProperties {
    pub name: String,
    /// Maximum number of threads in a single block.
    pub max_threads_per_block: usize,
    /// Bytes of device memory.
    pub memory_capacity: usize,
    /// Bytes of device memory reachable by direct storage transfers.
    pub io_map_capacity: usize,
    /// Number of host threads executing device work.
    pub num_threads: usize,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        DeviceProperties {
            name: "simulated".to_string(),
            max_threads_per_block: 1024,
            memory_capacity: 256 * 1024 * 1024,
            io_map_capacity: 16 * 1024 * 1024,
            num_threads: num_cpus::get().clamp(1, 8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMemoryStats {
    pub memory: MemoryPoolStats,
    pub io_map: MemoryPoolStats,
}

impl DeviceMemoryStats {
    /// Total bytes currently allocated from either pool.
    pub fn in_use(&self) -> usize {
        self.memory.used + self.io_map.used
    }
}

#[derive(Debug)]
struct DeviceInner {
    props: DeviceProperties,
    memory: Arc<MemoryPool>,
    io_map: Arc<MemoryPool>,
    pool: Arc<ThreadPool>,
    launch_faults: Arc<LaunchFaults>,
    next_id: AtomicU64,
}

/// Handle to a device, cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn try_new(props: DeviceProperties) -> Result<Self> {
        if props.max_threads_per_block == 0 {
            return Err(DbError::new("Device requires at least one thread per block"));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(props.num_threads.max(1))
            .thread_name(|idx| format!("gpreagg-device-{idx}"))
            .build()
            .map_err(|e| DbError::with_source("Failed to build device thread pool", Box::new(e)))?;

        // Device addresses start above zero so a zero address is never valid.
        let next_addr = Arc::new(AtomicU64::new(0x1_0000));

        info!(name = %props.name, memory = props.memory_capacity, threads = props.num_threads, "created device");

        Ok(Device {
            inner: Arc::new(DeviceInner {
                memory: Arc::new(MemoryPool::new(
                    "memory",
                    props.memory_capacity,
                    next_addr.clone(),
                )),
                io_map: Arc::new(MemoryPool::new("io_map", props.io_map_capacity, next_addr)),
                props,
                pool: Arc::new(pool),
                launch_faults: Arc::new(LaunchFaults::default()),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.props
    }

    /// Allocate device memory holding `value`.
    ///
    /// Returns `Ok(None)` if the device is out of memory.
    pub fn alloc<T: DeviceCopy>(&self, size: usize, value: T) -> Result<Option<DeviceBuffer<T>>> {
        Self::alloc_from(&self.inner.memory, size, value)
    }

    /// Allocate memory from the I/O-mapped pool.
    ///
    /// Returns `Ok(None)` if the pool is exhausted.
    pub fn alloc_io_mapped<T: DeviceCopy>(
        &self,
        size: usize,
        value: T,
    ) -> Result<Option<DeviceBuffer<T>>> {
        Self::alloc_from(&self.inner.io_map, size, value)
    }

    fn alloc_from<T: DeviceCopy>(
        pool: &Arc<MemoryPool>,
        size: usize,
        value: T,
    ) -> Result<Option<DeviceBuffer<T>>> {
        if size > isize::MAX as usize {
            return Err(DbError::new("Device allocation size too large").with_field("size", size));
        }
        Ok(pool
            .try_reserve(size)
            .map(|reservation| DeviceBuffer::new(reservation, value)))
    }

    pub fn create_stream(&self) -> Stream {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(%id, "created stream");
        Stream::new(id, self.inner.pool.clone(), self.inner.launch_faults.clone())
    }

    pub fn create_event(&self) -> Event {
        Event::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn memory_stats(&self) -> DeviceMemoryStats {
        DeviceMemoryStats {
            memory: self.inner.memory.stats(),
            io_map: self.inner.io_map.stats(),
        }
    }

    /// Make the next `count` allocations from device memory fail.
    pub fn inject_alloc_failures(&self, count: usize) {
        self.inner.memory.inject_failures(count);
    }

    /// Make the next `count` allocations from the I/O-mapped pool fail.
    pub fn inject_io_map_failures(&self, count: usize) {
        self.inner.io_map.inject_failures(count);
    }

    /// Make the next `count` kernel launches fault.
    pub fn inject_launch_faults(&self, count: usize) {
        self.inner.launch_faults.inject(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Value(Vec<i64>);

    impl DeviceCopy for Value {
        fn transfer_len(&self) -> usize {
            self.0.len() * 8
        }
    }

    fn small_device() -> Device {
        Device::try_new(DeviceProperties {
            memory_capacity: 8 * 1024,
            io_map_capacity: 1024,
            num_threads: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn alloc_out_of_memory() {
        let device = small_device();
        let a = device.alloc(6 * 1024, Value(Vec::new())).unwrap();
        assert!(a.is_some());
        let b = device.alloc(4 * 1024, Value(Vec::new())).unwrap();
        assert!(b.is_none());

        drop(a);
        assert_eq!(0, device.memory_stats().in_use());
    }

    #[test]
    fn io_map_separate_from_memory() {
        let device = small_device();
        let a = device.alloc_io_mapped(1024, Value(Vec::new())).unwrap();
        assert!(a.is_some());
        let b = device.alloc_io_mapped(1, Value(Vec::new())).unwrap();
        assert!(b.is_none());
        let c = device.alloc(1024, Value(Vec::new())).unwrap();
        assert!(c.is_some());
    }

    #[test]
    fn transfer_round_trip() {
        let device = small_device();
        let stream = device.create_stream();

        let host = memory::HostBuffer::new(Value(vec![1, 2, 3]));
        let dev = device.alloc(24, Value(Vec::new())).unwrap().unwrap();

        let n = stream.memcpy_htod(&dev, &host);
        assert_eq!(24, n);
        let d = dev.clone();
        stream.launch("double", move || {
            d.lock().0.iter_mut().for_each(|v| *v *= 2);
            Ok(())
        });
        stream.memcpy_dtoh(&host, &dev);
        stream.synchronize().unwrap();

        assert_eq!(Value(vec![2, 4, 6]), *host.lock());
    }
}
