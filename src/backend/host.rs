//! Host backend: an in-process emulated accelerator.
//!
//! Every stream is a FIFO command queue drained by its own worker thread, so
//! enqueued copies really do complete asynchronously with respect to the
//! caller. Events are condition-variable latches set by the stream worker
//! when it reaches them. Device counters are atomics.
//!
//! Besides the [`DeviceBackend`] operations, this backend can allocate
//! counters and update them in stream order, which is what a simulated
//! sampler needs.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use super::{
    downcast, DeviceBackend, DeviceCounter, DeviceEvent, DeviceStream, DeviceType, HostMirror,
};
use crate::error::{MetricsError, Result};

const NAME: &str = "host";

type Job = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// HostEvent
// ---------------------------------------------------------------------------

/// One-shot latch signalled by a stream worker.
#[derive(Debug, Default)]
struct HostEvent {
    done: Mutex<bool>,
    cond: Condvar,
}

impl HostEvent {
    fn signal(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *lock(&self.done)
    }

    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self
                .cond
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

// ---------------------------------------------------------------------------
// HostStream
// ---------------------------------------------------------------------------

/// A command queue executed in order by a dedicated worker thread.
struct HostStream {
    id: usize,
    rank: usize,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostStream {
    fn spawn(id: usize, rank: usize) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("host-stream-{}-{}", rank, id))
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(|e| MetricsError::device(NAME, "create_stream", e.to_string()))?;

        debug!(rank, stream = id, "Spawned host stream worker");

        Ok(Arc::new(Self {
            id,
            rank,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }))
    }

    fn enqueue(&self, op: &'static str, job: Job) -> Result<()> {
        match lock(&self.sender).as_ref() {
            Some(tx) => tx
                .send(job)
                .map_err(|_| MetricsError::device(NAME, op, "stream worker has exited")),
            None => Err(MetricsError::device(NAME, op, "stream has been shut down")),
        }
    }

    /// Block until everything enqueued so far has run.
    fn drain(&self) -> Result<()> {
        let event = Arc::new(HostEvent::default());
        let signal = Arc::clone(&event);
        self.enqueue("synchronize", Box::new(move || signal.signal()))?;
        event.wait();
        Ok(())
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued jobs and exit.
        lock(&self.sender).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!(rank = self.rank, stream = self.id, "Host stream worker panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HostBackend
// ---------------------------------------------------------------------------

/// Emulated accelerator backed by host threads.
///
/// The "current device" is tracked per backend rather than per thread.
pub struct HostBackend {
    num_devices: usize,
    current: AtomicUsize,
    next_stream_id: AtomicUsize,
    compute_streams: Mutex<Vec<Option<Arc<HostStream>>>>,
    streams: Mutex<Vec<Weak<HostStream>>>,
}

impl HostBackend {
    /// Create a host backend exposing a single device.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// Create a host backend exposing `num_devices` devices (at least one).
    pub fn with_devices(num_devices: usize) -> Self {
        let num_devices = num_devices.max(1);
        debug!(num_devices, "Initialized HostBackend");
        Self {
            num_devices,
            current: AtomicUsize::new(0),
            next_stream_id: AtomicUsize::new(0),
            compute_streams: Mutex::new(vec![None; num_devices]),
            streams: Mutex::new(Vec::new()),
        }
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.num_devices {
            return Err(MetricsError::InvalidRank {
                rank,
                count: self.num_devices,
            });
        }
        Ok(())
    }

    fn spawn_stream(&self, rank: usize) -> Result<Arc<HostStream>> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = HostStream::spawn(id, rank)?;
        let mut streams = lock(&self.streams);
        streams.retain(|s| s.strong_count() > 0);
        streams.push(Arc::downgrade(&stream));
        Ok(stream)
    }

    fn compute_stream(&self, rank: usize) -> Result<Arc<HostStream>> {
        self.check_rank(rank)?;
        let mut compute = lock(&self.compute_streams);
        if let Some(stream) = &compute[rank] {
            return Ok(Arc::clone(stream));
        }
        let stream = self.spawn_stream(rank)?;
        compute[rank] = Some(Arc::clone(&stream));
        Ok(stream)
    }

    fn stream_of<'a>(&self, stream: &'a DeviceStream) -> Result<&'a Arc<HostStream>> {
        downcast(stream.inner::<Arc<HostStream>>(), NAME, "stream")
    }

    /// Allocate a zeroed device counter on `rank`.
    pub fn alloc_counter(&self, rank: usize) -> Result<DeviceCounter> {
        self.check_rank(rank)?;
        Ok(DeviceCounter::new(rank, Arc::new(AtomicI64::new(0))))
    }

    /// Enqueue `counter += delta` on `stream`.
    pub fn add_async(&self, counter: &DeviceCounter, delta: i64, stream: &DeviceStream) -> Result<()> {
        let cell = Arc::clone(downcast(
            counter.inner::<Arc<AtomicI64>>(),
            NAME,
            "counter",
        )?);
        trace!(rank = stream.rank(), delta, "host add_async");
        self.stream_of(stream)?.enqueue(
            "add_async",
            Box::new(move || {
                cell.fetch_add(delta, Ordering::SeqCst);
            }),
        )
    }

    /// Enqueue a host callback on `stream`; it runs once all earlier work
    /// on the stream has finished and holds back everything after it.
    pub fn launch_host_fn<F>(&self, stream: &DeviceStream, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.stream_of(stream)?.enqueue("launch_host_fn", Box::new(f))
    }

    /// Block until every live stream on `rank` has drained.
    pub fn synchronize(&self, rank: usize) -> Result<()> {
        let compute = self.compute_stream(rank)?;
        let others: Vec<Arc<HostStream>> = lock(&self.streams)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| s.rank == rank && !Arc::ptr_eq(s, &compute))
            .collect();

        compute.drain()?;
        for stream in &others {
            stream.drain()?;
        }
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for HostBackend {
    fn device_type(&self) -> DeviceType {
        DeviceType::Host
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.num_devices)
    }

    fn current_device(&self) -> Result<usize> {
        Ok(self.current.load(Ordering::SeqCst))
    }

    fn set_device(&self, rank: usize) -> Result<()> {
        self.check_rank(rank)?;
        self.current.store(rank, Ordering::SeqCst);
        Ok(())
    }

    fn create_stream(&self, rank: usize) -> Result<DeviceStream> {
        self.check_rank(rank)?;
        let stream = self.spawn_stream(rank)?;
        Ok(DeviceStream::new(rank, stream))
    }

    fn current_stream(&self, rank: usize) -> Result<DeviceStream> {
        let stream = self.compute_stream(rank)?;
        Ok(DeviceStream::new(rank, stream))
    }

    fn wait_stream(&self, waiter: &DeviceStream, target: &DeviceStream) -> Result<()> {
        let waiter = self.stream_of(waiter)?;
        let target = self.stream_of(target)?;
        if Arc::ptr_eq(waiter, target) {
            return Ok(());
        }

        let marker = Arc::new(HostEvent::default());
        let signal = Arc::clone(&marker);
        target.enqueue("wait_stream", Box::new(move || signal.signal()))?;
        waiter.enqueue("wait_stream", Box::new(move || marker.wait()))?;
        trace!(waiter = waiter.id, target = target.id, "host wait_stream");
        Ok(())
    }

    fn check_counter(&self, counter: &DeviceCounter) -> Result<()> {
        downcast(counter.inner::<Arc<AtomicI64>>(), NAME, "counter")?;
        self.check_rank(counter.rank())
    }

    fn alloc_host_mirror(&self, pinned: bool) -> Result<HostMirror> {
        Ok(HostMirror::new(pinned, Arc::new(AtomicI64::new(0))))
    }

    fn copy_to_host_async(
        &self,
        dst: &HostMirror,
        src: &DeviceCounter,
        stream: &DeviceStream,
    ) -> Result<()> {
        let dst = Arc::clone(downcast(dst.inner::<Arc<AtomicI64>>(), NAME, "host mirror")?);
        let src = Arc::clone(downcast(src.inner::<Arc<AtomicI64>>(), NAME, "counter")?);
        trace!(rank = stream.rank(), "host copy_to_host_async");
        self.stream_of(stream)?.enqueue(
            "copy_to_host_async",
            Box::new(move || dst.store(src.load(Ordering::SeqCst), Ordering::SeqCst)),
        )
    }

    fn record_event(&self, stream: &DeviceStream) -> Result<DeviceEvent> {
        let event = Arc::new(HostEvent::default());
        let signal = Arc::clone(&event);
        self.stream_of(stream)?
            .enqueue("record_event", Box::new(move || signal.signal()))?;
        Ok(DeviceEvent::new(event))
    }

    fn query_event(&self, event: &DeviceEvent) -> Result<bool> {
        Ok(downcast(event.inner::<Arc<HostEvent>>(), NAME, "event")?.is_done())
    }

    fn synchronize_event(&self, event: &DeviceEvent) -> Result<()> {
        downcast(event.inner::<Arc<HostEvent>>(), NAME, "event")?.wait();
        Ok(())
    }

    fn read_host_mirror(&self, mirror: &HostMirror) -> Result<i64> {
        Ok(downcast(mirror.inner::<Arc<AtomicI64>>(), NAME, "host mirror")?.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HostBackend {
        HostBackend::new()
    }

    /// Block `stream` until `gate` is signalled.
    fn hold(stream: &DeviceStream, gate: &Arc<HostEvent>) {
        let gate = Arc::clone(gate);
        stream
            .inner::<Arc<HostStream>>()
            .unwrap()
            .enqueue("hold", Box::new(move || gate.wait()))
            .unwrap();
    }

    #[test]
    fn test_device_queries() {
        let b = HostBackend::with_devices(2);
        assert_eq!(b.device_type(), DeviceType::Host);
        assert_eq!(b.device_count().unwrap(), 2);
        assert_eq!(b.current_device().unwrap(), 0);
        b.set_device(1).unwrap();
        assert_eq!(b.current_device().unwrap(), 1);
    }

    #[test]
    fn test_with_zero_devices_clamps_to_one() {
        assert_eq!(HostBackend::with_devices(0).device_count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_rank() {
        let b = backend();
        assert!(matches!(
            b.set_device(1).unwrap_err(),
            MetricsError::InvalidRank { rank: 1, count: 1 }
        ));
        assert!(b.create_stream(5).is_err());
        assert!(b.current_stream(5).is_err());
        assert!(b.alloc_counter(5).is_err());
    }

    #[test]
    fn test_copy_observes_prior_compute_work() {
        let b = backend();
        let compute = b.current_stream(0).unwrap();
        let copy = b.create_stream(0).unwrap();
        let counter = b.alloc_counter(0).unwrap();
        let mirror = b.alloc_host_mirror(true).unwrap();

        b.add_async(&counter, 7, &compute).unwrap();
        b.add_async(&counter, 3, &compute).unwrap();
        b.wait_stream(&copy, &compute).unwrap();
        b.copy_to_host_async(&mirror, &counter, &copy).unwrap();
        let event = b.record_event(&copy).unwrap();

        b.synchronize_event(&event).unwrap();
        assert!(b.query_event(&event).unwrap());
        assert_eq!(b.read_host_mirror(&mirror).unwrap(), 10);
        assert!(mirror.is_pinned());
    }

    #[test]
    fn test_wait_stream_orders_copy_after_compute() {
        let b = backend();
        let compute = b.current_stream(0).unwrap();
        let copy = b.create_stream(0).unwrap();
        let counter = b.alloc_counter(0).unwrap();
        let mirror = b.alloc_host_mirror(false).unwrap();

        let gate = Arc::new(HostEvent::default());
        hold(&compute, &gate);
        b.add_async(&counter, 5, &compute).unwrap();

        b.wait_stream(&copy, &compute).unwrap();
        b.copy_to_host_async(&mirror, &counter, &copy).unwrap();
        let event = b.record_event(&copy).unwrap();

        // The copy stream cannot pass the compute stream while it is held.
        assert!(!b.query_event(&event).unwrap());
        assert_eq!(b.read_host_mirror(&mirror).unwrap(), 0);

        gate.signal();
        b.synchronize_event(&event).unwrap();
        assert_eq!(b.read_host_mirror(&mirror).unwrap(), 5);
    }

    #[test]
    fn test_event_unready_until_stream_reaches_it() {
        let b = backend();
        let stream = b.create_stream(0).unwrap();
        let gate = Arc::new(HostEvent::default());
        hold(&stream, &gate);

        let event = b.record_event(&stream).unwrap();
        assert!(!b.query_event(&event).unwrap());

        gate.signal();
        b.synchronize_event(&event).unwrap();
        assert!(b.query_event(&event).unwrap());
    }

    #[test]
    fn test_wait_stream_same_stream_is_noop() {
        let b = backend();
        let compute = b.current_stream(0).unwrap();
        let again = b.current_stream(0).unwrap();
        b.wait_stream(&compute, &again).unwrap();
        let event = b.record_event(&compute).unwrap();
        b.synchronize_event(&event).unwrap();
    }

    #[test]
    fn test_synchronize_drains_all_streams() {
        let b = backend();
        let compute = b.current_stream(0).unwrap();
        let copy = b.create_stream(0).unwrap();
        let counter = b.alloc_counter(0).unwrap();
        let mirror = b.alloc_host_mirror(true).unwrap();

        b.add_async(&counter, 11, &compute).unwrap();
        b.wait_stream(&copy, &compute).unwrap();
        b.copy_to_host_async(&mirror, &counter, &copy).unwrap();

        b.synchronize(0).unwrap();
        assert_eq!(b.read_host_mirror(&mirror).unwrap(), 11);
    }

    #[test]
    fn test_foreign_handles_rejected() {
        let b = backend();
        let bogus_stream = DeviceStream::new(0, 1u8);
        let bogus_event = DeviceEvent::new(1u8);
        let bogus_counter = DeviceCounter::new(0, 1u8);
        let mirror = b.alloc_host_mirror(true).unwrap();

        assert!(matches!(
            b.record_event(&bogus_stream).unwrap_err(),
            MetricsError::ForeignHandle { handle: "stream", .. }
        ));
        assert!(matches!(
            b.query_event(&bogus_event).unwrap_err(),
            MetricsError::ForeignHandle { handle: "event", .. }
        ));
        let copy = b.create_stream(0).unwrap();
        assert!(matches!(
            b.copy_to_host_async(&mirror, &bogus_counter, &copy).unwrap_err(),
            MetricsError::ForeignHandle { handle: "counter", .. }
        ));
    }

    #[test]
    fn test_check_counter() {
        let b = HostBackend::with_devices(2);
        assert!(b.check_counter(&b.alloc_counter(1).unwrap()).is_ok());
        assert!(matches!(
            b.check_counter(&DeviceCounter::new(0, 1u8)).unwrap_err(),
            MetricsError::ForeignHandle { backend: "host", handle: "counter" }
        ));
        let other = HostBackend::with_devices(4);
        assert!(matches!(
            b.check_counter(&other.alloc_counter(3).unwrap()).unwrap_err(),
            MetricsError::InvalidRank { rank: 3, count: 2 }
        ));
    }

    #[test]
    fn test_launch_host_fn_holds_stream() {
        let b = backend();
        let stream = b.create_stream(0).unwrap();
        let (release, gate) = std::sync::mpsc::channel::<()>();
        b.launch_host_fn(&stream, move || {
            let _ = gate.recv();
        })
        .unwrap();
        let event = b.record_event(&stream).unwrap();
        assert!(!b.query_event(&event).unwrap());

        release.send(()).unwrap();
        b.synchronize_event(&event).unwrap();
        assert!(b.query_event(&event).unwrap());
    }

    #[test]
    fn test_dropping_stream_finishes_queued_work() {
        let b = backend();
        let compute = b.current_stream(0).unwrap();
        let counter = b.alloc_counter(0).unwrap();
        let mirror = b.alloc_host_mirror(true).unwrap();

        b.add_async(&counter, 7, &compute).unwrap();
        b.synchronize(0).unwrap();
        {
            let copy = b.create_stream(0).unwrap();
            b.copy_to_host_async(&mirror, &counter, &copy).unwrap();
        }
        // Dropping the last handle joins the worker after its queue drains.
        assert_eq!(b.read_host_mirror(&mirror).unwrap(), 7);
    }
}
