//! CUDA backend for metric copies on NVIDIA GPUs.
//!
//! Loads the CUDA driver at runtime (no link-time dependency). Falls back
//! gracefully if CUDA is not available: `CudaBackend::try_new()` returns
//! `Err` and the backend selector moves on to the next option.
//!
//! - The compute stream is the legacy default stream of each device's
//!   primary context.
//! - Copy streams are created with `CU_STREAM_NON_BLOCKING` so they do not
//!   implicitly synchronize with the default stream; ordering comes only
//!   from `wait_stream`.
//! - Events are created with `CU_EVENT_DISABLE_TIMING`.

use std::ffi::c_void;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace, warn};

use super::{
    downcast, DeviceBackend, DeviceCounter, DeviceEvent, DeviceStream, DeviceType, HostMirror,
};
use crate::error::{MetricsError, Result};

pub mod ffi;

use ffi::{CUcontext, CUdeviceptr, CUevent, CUstream, CudaApi};

const NAME: &str = "cuda";

// ---------------------------------------------------------------------------
// RAII handles
// ---------------------------------------------------------------------------

struct CudaStream {
    raw: CUstream,
    ctx: CUcontext,
    owned: bool,
    api: Arc<CudaApi>,
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        if self.owned && !self.raw.is_null() {
            if let Err(e) = self.api.stream_destroy(self.raw) {
                warn!(error = %e, "CUDA: failed to destroy stream");
            }
        }
    }
}

struct CudaEvent {
    raw: CUevent,
    ctx: CUcontext,
    api: Arc<CudaApi>,
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        // Destroying a pending event is allowed; the driver frees it once
        // the recorded work completes.
        if let Err(e) = self.api.event_destroy(self.raw) {
            warn!(error = %e, "CUDA: failed to destroy event");
        }
    }
}

/// An 8-byte host buffer, page-locked or pageable.
struct CudaHostBuffer {
    ptr: *mut i64,
    pinned: bool,
    api: Arc<CudaApi>,
}

impl Drop for CudaHostBuffer {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        if self.pinned {
            if let Err(e) = self.api.mem_free_host(self.ptr as *mut c_void) {
                warn!(error = %e, "CUDA: failed to free pinned host memory");
            }
        } else {
            // SAFETY: pageable buffers come from Box::into_raw in alloc_host_mirror.
            drop(unsafe { Box::from_raw(self.ptr) });
        }
    }
}

/// Device address of a sampler accumulator.
struct CudaCounter {
    ptr: CUdeviceptr,
}

// SAFETY: the raw handles are opaque driver objects or host pointers owned
// by the wrapper; the driver API is thread-safe and the collector orders all
// host-side accesses through events.
unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}
unsafe impl Send for CudaEvent {}
unsafe impl Sync for CudaEvent {}
unsafe impl Send for CudaHostBuffer {}
unsafe impl Sync for CudaHostBuffer {}

/// Wrap a device allocation holding a 64-bit accumulator.
///
/// # Safety
///
/// `ptr` must address at least 8 bytes of device memory on `rank` that stay
/// allocated for as long as the returned counter may be copied from.
pub unsafe fn device_counter(rank: usize, ptr: CUdeviceptr) -> DeviceCounter {
    DeviceCounter::new(rank, CudaCounter { ptr })
}

// ---------------------------------------------------------------------------
// CudaBackend
// ---------------------------------------------------------------------------

/// CUDA backend.
///
/// Primary contexts are retained lazily per device and stay retained for the
/// life of the process.
pub struct CudaBackend {
    api: Arc<CudaApi>,
    num_devices: usize,
    contexts: Mutex<Vec<Option<usize>>>,
}

impl CudaBackend {
    /// Attempt to create a new CUDA backend.
    ///
    /// Returns `Err` if the driver library cannot be loaded, `cuInit` fails,
    /// or no device is visible.
    pub fn try_new() -> Result<Self> {
        let api = Arc::new(CudaApi::load().map_err(|reason| MetricsError::BackendUnavailable {
            backend: NAME,
            reason,
        })?);

        let num_devices = api.device_count()?;
        if num_devices == 0 {
            return Err(MetricsError::BackendUnavailable {
                backend: NAME,
                reason: "no CUDA devices visible".to_string(),
            });
        }

        debug!(num_devices, "CudaBackend initialized");

        Ok(Self {
            api,
            num_devices,
            contexts: Mutex::new(vec![None; num_devices]),
        })
    }

    /// Primary context of `rank`, retained on first use.
    fn context(&self, rank: usize) -> Result<CUcontext> {
        if rank >= self.num_devices {
            return Err(MetricsError::InvalidRank {
                rank,
                count: self.num_devices,
            });
        }
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ctx) = contexts[rank] {
            return Ok(ctx as CUcontext);
        }
        let ctx = self.api.primary_context(rank)?;
        contexts[rank] = Some(ctx as usize);
        Ok(ctx)
    }

    /// Make `rank`'s primary context current on the calling thread.
    fn bind(&self, rank: usize) -> Result<CUcontext> {
        let ctx = self.context(rank)?;
        self.api.set_current(ctx)?;
        Ok(ctx)
    }

    /// Wrap a stream the caller owns, such as a framework's current stream,
    /// so samplers can report where their accumulators are updated.
    ///
    /// # Safety
    ///
    /// `raw` must be a stream of `rank`'s primary context that outlives the
    /// returned handle. The handle never destroys it.
    pub unsafe fn external_stream(&self, rank: usize, raw: CUstream) -> Result<DeviceStream> {
        let ctx = self.context(rank)?;
        Ok(DeviceStream::new(
            rank,
            CudaStream {
                raw,
                ctx,
                owned: false,
                api: Arc::clone(&self.api),
            },
        ))
    }

    fn stream_of<'a>(&self, stream: &'a DeviceStream) -> Result<&'a CudaStream> {
        downcast(stream.inner::<CudaStream>(), NAME, "stream")
    }

    fn event_of<'a>(&self, event: &'a DeviceEvent) -> Result<&'a CudaEvent> {
        downcast(event.inner::<CudaEvent>(), NAME, "event")
    }

    fn new_event(&self, ctx: CUcontext) -> Result<CudaEvent> {
        self.api.set_current(ctx)?;
        let raw = self.api.event_create()?;
        Ok(CudaEvent {
            raw,
            ctx,
            api: Arc::clone(&self.api),
        })
    }
}

impl DeviceBackend for CudaBackend {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.num_devices)
    }

    fn current_device(&self) -> Result<usize> {
        Ok(self.api.current_device()?.unwrap_or(0))
    }

    fn set_device(&self, rank: usize) -> Result<()> {
        self.bind(rank)?;
        Ok(())
    }

    fn create_stream(&self, rank: usize) -> Result<DeviceStream> {
        let ctx = self.bind(rank)?;
        let raw = self.api.stream_create()?;
        debug!(rank, "Created CUDA copy stream");
        Ok(DeviceStream::new(
            rank,
            CudaStream {
                raw,
                ctx,
                owned: true,
                api: Arc::clone(&self.api),
            },
        ))
    }

    fn current_stream(&self, rank: usize) -> Result<DeviceStream> {
        let ctx = self.context(rank)?;
        Ok(DeviceStream::new(
            rank,
            CudaStream {
                raw: std::ptr::null_mut(),
                ctx,
                owned: false,
                api: Arc::clone(&self.api),
            },
        ))
    }

    fn wait_stream(&self, waiter: &DeviceStream, target: &DeviceStream) -> Result<()> {
        let waiter = self.stream_of(waiter)?;
        let target = self.stream_of(target)?;

        let marker = self.new_event(target.ctx)?;
        self.api.event_record(marker.raw, target.raw)?;
        self.api.set_current(waiter.ctx)?;
        self.api.stream_wait_event(waiter.raw, marker.raw)?;
        trace!("CUDA wait_stream");
        Ok(())
    }

    fn check_counter(&self, counter: &DeviceCounter) -> Result<()> {
        downcast(counter.inner::<CudaCounter>(), NAME, "counter")?;
        self.context(counter.rank()).map(|_| ())
    }

    fn alloc_host_mirror(&self, pinned: bool) -> Result<HostMirror> {
        let bytesize = std::mem::size_of::<i64>();
        let ptr = if pinned {
            let ptr = self.api.mem_host_alloc(bytesize)? as *mut i64;
            // SAFETY: freshly allocated, 8 bytes, suitably aligned.
            unsafe { ptr.write(0) };
            ptr
        } else {
            Box::into_raw(Box::new(0i64))
        };
        Ok(HostMirror::new(
            pinned,
            CudaHostBuffer {
                ptr,
                pinned,
                api: Arc::clone(&self.api),
            },
        ))
    }

    fn copy_to_host_async(
        &self,
        dst: &HostMirror,
        src: &DeviceCounter,
        stream: &DeviceStream,
    ) -> Result<()> {
        let dst = downcast(dst.inner::<CudaHostBuffer>(), NAME, "host mirror")?;
        let src = downcast(src.inner::<CudaCounter>(), NAME, "counter")?;
        let stream = self.stream_of(stream)?;

        self.api.set_current(stream.ctx)?;
        // SAFETY: dst is an owned 8-byte host buffer that outlives the copy
        // (the collector keeps it alive); src validity is the caller's
        // contract from device_counter().
        unsafe {
            self.api.memcpy_dtoh_async(
                dst.ptr as *mut c_void,
                src.ptr,
                std::mem::size_of::<i64>(),
                stream.raw,
            )
        }
    }

    fn record_event(&self, stream: &DeviceStream) -> Result<DeviceEvent> {
        let stream = self.stream_of(stream)?;
        let event = self.new_event(stream.ctx)?;
        self.api.event_record(event.raw, stream.raw)?;
        Ok(DeviceEvent::new(event))
    }

    fn query_event(&self, event: &DeviceEvent) -> Result<bool> {
        let event = self.event_of(event)?;
        self.api.set_current(event.ctx)?;
        self.api.event_query(event.raw)
    }

    fn synchronize_event(&self, event: &DeviceEvent) -> Result<()> {
        let event = self.event_of(event)?;
        self.api.set_current(event.ctx)?;
        self.api.event_synchronize(event.raw)
    }

    fn read_host_mirror(&self, mirror: &HostMirror) -> Result<i64> {
        let buf = downcast(mirror.inner::<CudaHostBuffer>(), NAME, "host mirror")?;
        // SAFETY: ptr is a live 8-byte allocation owned by the mirror.
        Ok(unsafe { std::ptr::read_volatile(buf.ptr) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests only run real work when a CUDA device is present.

    #[test]
    fn test_try_new_reports_unavailable_cleanly() {
        match CudaBackend::try_new() {
            Ok(backend) => assert!(backend.device_count().unwrap() > 0),
            Err(e) => assert!(matches!(e, MetricsError::BackendUnavailable { .. }
                | MetricsError::Device { .. })),
        }
    }

    #[test]
    fn test_event_on_fresh_stream_completes() {
        let Ok(backend) = CudaBackend::try_new() else {
            return;
        };
        let stream = backend.create_stream(0).unwrap();
        let compute = backend.current_stream(0).unwrap();
        backend.wait_stream(&stream, &compute).unwrap();
        let event = backend.record_event(&stream).unwrap();
        backend.synchronize_event(&event).unwrap();
        assert!(backend.query_event(&event).unwrap());
    }

    #[test]
    fn test_foreign_counter_rejected() {
        let Ok(backend) = CudaBackend::try_new() else {
            return;
        };
        let err = backend.check_counter(&DeviceCounter::new(0, 1u8)).unwrap_err();
        assert!(matches!(err, MetricsError::ForeignHandle { handle: "counter", .. }));
    }

    #[test]
    fn test_host_mirror_starts_zeroed() {
        let Ok(backend) = CudaBackend::try_new() else {
            return;
        };
        backend.set_device(0).unwrap();
        for pinned in [true, false] {
            let mirror = backend.alloc_host_mirror(pinned).unwrap();
            assert_eq!(mirror.is_pinned(), pinned);
            assert_eq!(backend.read_host_mirror(&mirror).unwrap(), 0);
        }
    }
}
