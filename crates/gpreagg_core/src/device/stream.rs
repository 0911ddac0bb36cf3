use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::ThreadPool;
use tracing::{trace, warn};

use super::event::Event;
use super::memory::{DeviceBuffer, DeviceCopy, HostBuffer};

/// Error raised by the device runtime while executing a stream operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    /// A kernel failed to launch or aborted while running.
    Launch { op: &'static str, message: String },
    /// A memory transfer failed.
    Transfer { op: &'static str, message: String },
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launch { op, message } => write!(f, "kernel '{op}' failed: {message}"),
            Self::Transfer { op, message } => write!(f, "transfer '{op}' failed: {message}"),
        }
    }
}

/// Status passed to stream callbacks.
///
/// Once an operation on a stream faults, every later kernel and transfer on
/// that stream is skipped and every later callback sees the fault.
pub type StreamStatus = Result<(), DeviceFault>;

type DeviceOp = Box<dyn FnOnce() -> Result<(), DeviceFault> + Send>;
type Callback = Box<dyn FnOnce(StreamStatus) + Send>;

enum StreamOp {
    Exec { name: &'static str, op: DeviceOp },
    Record(Event),
    Wait(Event),
    Callback(Callback),
}

impl fmt::Debug for StreamOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec { name, .. } => write!(f, "Exec({name})"),
            Self::Record(ev) => write!(f, "Record({})", ev.id()),
            Self::Wait(ev) => write!(f, "Wait({})", ev.id()),
            Self::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// Faults to inject into kernel launches, shared by all streams of a device.
#[derive(Debug, Default)]
pub(crate) struct LaunchFaults {
    remaining: AtomicUsize,
}

impl LaunchFaults {
    pub(crate) fn inject(&self, count: usize) {
        self.remaining.fetch_add(count, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug)]
struct StreamState {
    ops: VecDeque<StreamOp>,
    /// If a worker is currently executing (or waiting to execute) ops for
    /// this stream.
    active: bool,
    fault: Option<DeviceFault>,
}

#[derive(Debug)]
struct StreamInner {
    id: u64,
    pool: Arc<ThreadPool>,
    faults: Arc<LaunchFaults>,
    state: Mutex<StreamState>,
}

/// Ordered queue of device operations.
///
/// Operations are executed in submission order on the device thread pool.
/// Enqueuing never blocks, waiting on an event from another stream parks the
/// stream until the event completes.
#[derive(Debug, Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(id: u64, pool: Arc<ThreadPool>, faults: Arc<LaunchFaults>) -> Self {
        Stream {
            inner: Arc::new(StreamInner {
                id,
                pool,
                faults,
                state: Mutex::new(StreamState {
                    ops: VecDeque::new(),
                    active: false,
                    fault: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Copy a host value into device memory.
    ///
    /// Returns the number of bytes that will be transferred.
    pub fn memcpy_htod<T: DeviceCopy>(&self, dst: &DeviceBuffer<T>, src: &HostBuffer<T>) -> usize {
        let len = src.lock().transfer_len();
        let dst = dst.clone();
        let src = src.clone();
        self.enqueue(StreamOp::Exec {
            name: "memcpy_htod",
            op: Box::new(move || {
                let mut value = src.lock().clone();
                value.on_device(dst.addr());
                *dst.lock() = value;
                Ok(())
            }),
        });
        len
    }

    /// Copy a device value back to host memory.
    ///
    /// Returns the number of bytes that will be transferred, based on the
    /// current host value.
    pub fn memcpy_dtoh<T: DeviceCopy>(&self, dst: &HostBuffer<T>, src: &DeviceBuffer<T>) -> usize {
        let len = dst.lock().transfer_len();
        let dst = dst.clone();
        let src = src.clone();
        self.enqueue(StreamOp::Exec {
            name: "memcpy_dtoh",
            op: Box::new(move || {
                let mut value = src.lock().clone();
                value.on_host();
                *dst.lock() = value;
                Ok(())
            }),
        });
        len
    }

    /// Launch a kernel.
    pub fn launch<F>(&self, name: &'static str, kernel: F)
    where
        F: FnOnce() -> Result<(), DeviceFault> + Send + 'static,
    {
        self.enqueue(StreamOp::Exec {
            name,
            op: Box::new(kernel),
        })
    }

    /// Complete `event` once all previously enqueued operations have run.
    pub fn record_event(&self, event: &Event) {
        self.enqueue(StreamOp::Record(event.clone()))
    }

    /// Hold back later operations until `event` completes.
    pub fn wait_event(&self, event: &Event) {
        self.enqueue(StreamOp::Wait(event.clone()))
    }

    /// Run `callback` on a device thread once all previously enqueued
    /// operations have run.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(StreamStatus) + Send + 'static,
    {
        self.enqueue(StreamOp::Callback(Box::new(callback)))
    }

    /// Block until every operation enqueued so far has run.
    pub fn synchronize(&self) -> StreamStatus {
        let event = Event::new(u64::MAX);
        self.record_event(&event);
        event.synchronize();
        match &self.inner.state.lock().fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    fn enqueue(&self, op: StreamOp) {
        let mut state = self.inner.state.lock();
        trace!(stream = self.inner.id, ?op, "enqueue stream op");
        state.ops.push_back(op);
        if !state.active {
            state.active = true;
            drop(state);
            StreamInner::schedule(self.inner.clone());
        }
    }
}

impl StreamInner {
    fn schedule(inner: Arc<Self>) {
        let pool = inner.pool.clone();
        pool.spawn(move || inner.run());
    }

    fn run(self: Arc<Self>) {
        loop {
            let op = {
                let mut state = self.state.lock();
                match state.ops.pop_front() {
                    Some(op) => op,
                    None => {
                        state.active = false;
                        return;
                    }
                }
            };

            match op {
                StreamOp::Exec { name, op } => {
                    if self.state.lock().fault.is_some() {
                        trace!(stream = self.id, %name, "skipping op on faulted stream");
                        continue;
                    }

                    let result = if self.faults.take() {
                        Err(DeviceFault::Launch {
                            op: name,
                            message: "injected fault".to_string(),
                        })
                    } else {
                        op()
                    };

                    if let Err(fault) = result {
                        warn!(stream = self.id, %fault, "device op faulted");
                        self.state.lock().fault = Some(fault);
                    }
                }
                StreamOp::Record(event) => event.complete(),
                StreamOp::Wait(event) => {
                    let resume = self.clone();
                    let waiter = event.add_waiter(Box::new(move || Self::schedule(resume)));
                    if waiter.is_none() {
                        // Parked, the stream stays active and is rescheduled
                        // once the event completes.
                        return;
                    }
                }
                StreamOp::Callback(callback) => {
                    let status = match &self.state.lock().fault {
                        Some(fault) => Err(fault.clone()),
                        None => Ok(()),
                    };
                    callback(status);
                }
            }
        }
    }
}
