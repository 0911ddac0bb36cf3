use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::trace;

/// Alignment of device allocations.
pub const DEVICE_MEM_ALIGN: usize = 1024;

pub const fn device_align(len: usize) -> usize {
    (len + DEVICE_MEM_ALIGN - 1) & !(DEVICE_MEM_ALIGN - 1)
}

/// Values that can be copied between host and device memory.
pub trait DeviceCopy: Clone + Send + 'static {
    /// Number of bytes moved when copying this value.
    fn transfer_len(&self) -> usize;

    /// Called on the copy after it landed in device memory at `addr`.
    fn on_device(&mut self, _addr: u64) {}

    /// Called on the copy after it landed in host memory.
    fn on_host(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPoolStats {
    pub capacity: usize,
    pub used: usize,
    pub peak: usize,
    pub num_allocations: usize,
}

/// Byte budget for a region of device memory.
#[derive(Debug)]
pub(crate) struct MemoryPool {
    name: &'static str,
    capacity: usize,
    stats: Mutex<MemoryPoolStats>,
    /// Allocation attempts that should fail as if the pool were exhausted.
    injected_failures: AtomicUsize,
    /// Shared with other pools on the same device so addresses never overlap.
    next_addr: Arc<AtomicU64>,
}

impl MemoryPool {
    pub(crate) fn new(name: &'static str, capacity: usize, next_addr: Arc<AtomicU64>) -> Self {
        MemoryPool {
            name,
            capacity,
            stats: Mutex::new(MemoryPoolStats {
                capacity,
                ..Default::default()
            }),
            injected_failures: AtomicUsize::new(0),
            next_addr,
        }
    }

    pub(crate) fn inject_failures(&self, count: usize) {
        self.injected_failures.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn stats(&self) -> MemoryPoolStats {
        *self.stats.lock()
    }

    /// Try to reserve `size` bytes, returns None if the pool is exhausted.
    pub(crate) fn try_reserve(self: &Arc<Self>, size: usize) -> Option<Reservation> {
        let size = device_align(size.max(1));

        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            trace!(pool = self.name, %size, "injected allocation failure");
            return None;
        }

        {
            let mut stats = self.stats.lock();
            if stats.used + size > self.capacity {
                trace!(pool = self.name, %size, used = stats.used, "pool exhausted");
                return None;
            }
            stats.used += size;
            stats.peak = usize::max(stats.peak, stats.used);
            stats.num_allocations += 1;
        }

        let addr = self.next_addr.fetch_add(size as u64, Ordering::Relaxed);

        Some(Reservation {
            pool: self.clone(),
            addr,
            size,
        })
    }

    fn free(&self, size: usize) {
        let mut stats = self.stats.lock();
        debug_assert!(stats.used >= size);
        stats.used -= size;
        stats.num_allocations -= 1;
    }
}

/// A reserved range of device memory, returned to the pool on drop.
#[derive(Debug)]
pub(crate) struct Reservation {
    pool: Arc<MemoryPool>,
    addr: u64,
    size: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.free(self.size);
    }
}

/// Handle to a device allocation holding a `T`.
///
/// Cloning the handle copies the "pointer", the allocation is freed once
/// every handle has been dropped.
pub struct DeviceBuffer<T> {
    inner: Arc<DeviceAllocation<T>>,
}

struct DeviceAllocation<T> {
    reservation: Reservation,
    data: Mutex<T>,
}

impl<T> DeviceBuffer<T> {
    pub(crate) fn new(reservation: Reservation, mut value: T) -> Self
    where
        T: DeviceCopy,
    {
        value.on_device(reservation.addr);
        DeviceBuffer {
            inner: Arc::new(DeviceAllocation {
                reservation,
                data: Mutex::new(value),
            }),
        }
    }

    /// Device address of the allocation.
    pub fn addr(&self) -> u64 {
        self.inner.reservation.addr
    }

    /// Size in bytes of the allocation.
    pub fn size(&self) -> usize {
        self.inner.reservation.size
    }

    /// Access the device side value.
    ///
    /// Only device operations (kernels, transfers) should touch the value.
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.data.lock()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        DeviceBuffer {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &self.size())
            .finish()
    }
}

/// Host memory that can be the source or destination of a transfer.
///
/// Shared with the stream while a transfer is pending.
#[derive(Debug, Default)]
pub struct HostBuffer<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> HostBuffer<T> {
    pub fn new(value: T) -> Self {
        HostBuffer {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T> Clone for HostBuffer<T> {
    fn clone(&self) -> Self {
        HostBuffer {
            inner: self.inner.clone(),
        }
    }
}
