//! Ascend NPU backend.
//!
//! Same contract as the CUDA backend, expressed with AscendCL: the compute
//! stream is the device's default stream, copy streams come from
//! `aclrtCreateStream`, and readiness is checked with
//! `aclrtQueryEventStatus`. Unlike CUDA there are no explicit contexts;
//! `aclrtSetDevice` binds the calling thread to a device.

use std::ffi::c_void;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{
    downcast, DeviceBackend, DeviceCounter, DeviceEvent, DeviceStream, DeviceType, HostMirror,
};
use crate::error::{MetricsError, Result};

pub mod ffi;

use ffi::{AclApi, AclrtEvent, AclrtStream};

const NAME: &str = "npu";

struct AclStream {
    raw: AclrtStream,
    rank: usize,
    owned: bool,
    api: Arc<AclApi>,
}

impl Drop for AclStream {
    fn drop(&mut self) {
        if self.owned && !self.raw.is_null() {
            if let Err(e) = self.api.stream_destroy(self.raw) {
                warn!(error = %e, rank = self.rank, "Ascend: failed to destroy stream");
            }
        }
    }
}

struct AclEvent {
    raw: AclrtEvent,
    api: Arc<AclApi>,
}

impl Drop for AclEvent {
    fn drop(&mut self) {
        if let Err(e) = self.api.event_destroy(self.raw) {
            warn!(error = %e, "Ascend: failed to destroy event");
        }
    }
}

/// An 8-byte buffer from `aclrtMallocHost`.
struct AclHostBuffer {
    ptr: *mut i64,
    api: Arc<AclApi>,
}

impl Drop for AclHostBuffer {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        if let Err(e) = self.api.free_host(self.ptr as *mut c_void) {
            warn!(error = %e, "Ascend: failed to free host memory");
        }
    }
}

struct AclCounter {
    ptr: usize,
}

// SAFETY: see the CUDA backend; the same reasoning applies to AscendCL
// handles and the owned host buffers.
unsafe impl Send for AclStream {}
unsafe impl Sync for AclStream {}
unsafe impl Send for AclEvent {}
unsafe impl Sync for AclEvent {}
unsafe impl Send for AclHostBuffer {}
unsafe impl Sync for AclHostBuffer {}

/// Wrap a device allocation holding a 64-bit accumulator.
///
/// # Safety
///
/// `ptr` must address at least 8 bytes of device memory on `rank` that stay
/// allocated for as long as the returned counter may be copied from.
pub unsafe fn device_counter(rank: usize, ptr: *mut c_void) -> DeviceCounter {
    DeviceCounter::new(rank, AclCounter { ptr: ptr as usize })
}

/// Ascend backend.
pub struct AscendBackend {
    api: Arc<AclApi>,
    num_devices: usize,
}

impl AscendBackend {
    /// Attempt to create a new Ascend backend.
    pub fn try_new() -> Result<Self> {
        let api = Arc::new(AclApi::load().map_err(|reason| MetricsError::BackendUnavailable {
            backend: NAME,
            reason,
        })?);

        let num_devices = api.device_count()?;
        if num_devices == 0 {
            return Err(MetricsError::BackendUnavailable {
                backend: NAME,
                reason: "no Ascend devices visible".to_string(),
            });
        }

        debug!(num_devices, "AscendBackend initialized");
        Ok(Self { api, num_devices })
    }

    fn bind(&self, rank: usize) -> Result<()> {
        if rank >= self.num_devices {
            return Err(MetricsError::InvalidRank {
                rank,
                count: self.num_devices,
            });
        }
        self.api.set_device(rank)
    }

    /// Wrap a stream the caller owns, such as a framework's current stream.
    ///
    /// # Safety
    ///
    /// `raw` must be a stream on `rank` that outlives the returned handle.
    /// The handle never destroys it.
    pub unsafe fn external_stream(&self, rank: usize, raw: AclrtStream) -> Result<DeviceStream> {
        if rank >= self.num_devices {
            return Err(MetricsError::InvalidRank {
                rank,
                count: self.num_devices,
            });
        }
        Ok(DeviceStream::new(
            rank,
            AclStream {
                raw,
                rank,
                owned: false,
                api: Arc::clone(&self.api),
            },
        ))
    }

    fn stream_of<'a>(&self, stream: &'a DeviceStream) -> Result<&'a AclStream> {
        downcast(stream.inner::<AclStream>(), NAME, "stream")
    }

    fn event_of<'a>(&self, event: &'a DeviceEvent) -> Result<&'a AclEvent> {
        downcast(event.inner::<AclEvent>(), NAME, "event")
    }

    fn new_event(&self) -> Result<AclEvent> {
        let raw = self.api.event_create()?;
        Ok(AclEvent {
            raw,
            api: Arc::clone(&self.api),
        })
    }
}

impl DeviceBackend for AscendBackend {
    fn device_type(&self) -> DeviceType {
        DeviceType::Npu
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.num_devices)
    }

    fn current_device(&self) -> Result<usize> {
        Ok(self.api.current_device().unwrap_or(0))
    }

    fn set_device(&self, rank: usize) -> Result<()> {
        self.bind(rank)
    }

    fn create_stream(&self, rank: usize) -> Result<DeviceStream> {
        self.bind(rank)?;
        let raw = self.api.stream_create()?;
        debug!(rank, "Created Ascend copy stream");
        Ok(DeviceStream::new(
            rank,
            AclStream {
                raw,
                rank,
                owned: true,
                api: Arc::clone(&self.api),
            },
        ))
    }

    fn current_stream(&self, rank: usize) -> Result<DeviceStream> {
        if rank >= self.num_devices {
            return Err(MetricsError::InvalidRank {
                rank,
                count: self.num_devices,
            });
        }
        Ok(DeviceStream::new(
            rank,
            AclStream {
                raw: std::ptr::null_mut(),
                rank,
                owned: false,
                api: Arc::clone(&self.api),
            },
        ))
    }

    fn wait_stream(&self, waiter: &DeviceStream, target: &DeviceStream) -> Result<()> {
        let waiter = self.stream_of(waiter)?;
        let target = self.stream_of(target)?;

        self.bind(target.rank)?;
        let marker = self.new_event()?;
        self.api.event_record(marker.raw, target.raw)?;
        self.bind(waiter.rank)?;
        self.api.stream_wait_event(waiter.raw, marker.raw)?;
        trace!("Ascend wait_stream");
        Ok(())
    }

    fn check_counter(&self, counter: &DeviceCounter) -> Result<()> {
        downcast(counter.inner::<AclCounter>(), NAME, "counter")?;
        if counter.rank() >= self.num_devices {
            return Err(MetricsError::InvalidRank {
                rank: counter.rank(),
                count: self.num_devices,
            });
        }
        Ok(())
    }

    /// Always page-locked: `aclrtMemcpyAsync` only accepts host memory from
    /// `aclrtMallocHost`, so a pageable request is overridden.
    fn alloc_host_mirror(&self, pinned: bool) -> Result<HostMirror> {
        if !pinned {
            warn!("Ascend: pageable host mirrors are not supported by aclrtMemcpyAsync, using pinned memory");
        }
        let ptr = self.api.malloc_host(std::mem::size_of::<i64>())? as *mut i64;
        // SAFETY: freshly allocated, 8 bytes, suitably aligned.
        unsafe { ptr.write(0) };
        Ok(HostMirror::new(
            true,
            AclHostBuffer {
                ptr,
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
        let dst = downcast(dst.inner::<AclHostBuffer>(), NAME, "host mirror")?;
        let src = downcast(src.inner::<AclCounter>(), NAME, "counter")?;
        let stream = self.stream_of(stream)?;

        self.bind(stream.rank)?;
        // SAFETY: dst is an owned 8-byte host buffer kept alive by the
        // collector; src validity is the caller's contract from
        // device_counter().
        unsafe {
            self.api.memcpy_dtoh_async(
                dst.ptr as *mut c_void,
                src.ptr as *const c_void,
                std::mem::size_of::<i64>(),
                stream.raw,
            )
        }
    }

    fn record_event(&self, stream: &DeviceStream) -> Result<DeviceEvent> {
        let stream = self.stream_of(stream)?;
        self.bind(stream.rank)?;
        let event = self.new_event()?;
        self.api.event_record(event.raw, stream.raw)?;
        Ok(DeviceEvent::new(event))
    }

    fn query_event(&self, event: &DeviceEvent) -> Result<bool> {
        self.api.event_query(self.event_of(event)?.raw)
    }

    fn synchronize_event(&self, event: &DeviceEvent) -> Result<()> {
        self.api.event_synchronize(self.event_of(event)?.raw)
    }

    fn read_host_mirror(&self, mirror: &HostMirror) -> Result<i64> {
        let buf = downcast(mirror.inner::<AclHostBuffer>(), NAME, "host mirror")?;
        // SAFETY: ptr is a live 8-byte allocation owned by the mirror.
        Ok(unsafe { std::ptr::read_volatile(buf.ptr) })
    }
}
