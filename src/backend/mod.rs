//! Device backend trait and opaque device handles.
//!
//! Defines [`DeviceBackend`], the handful of runtime operations the metrics
//! collector needs from an accelerator: a dedicated stream, a cross-stream
//! ordering primitive, non-blocking device-to-host copies into host mirrors,
//! and completion events. Each accelerator family provides one
//! implementation; the collector only ever talks to the trait.

#[cfg(feature = "ascend")]
pub mod ascend;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MetricsError, Result};

/// Accelerator family a backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// In-process emulated device.
    Host,
    /// NVIDIA GPUs through the CUDA driver API.
    Cuda,
    /// Ascend NPUs through the CANN runtime.
    Npu,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Host => "host",
            DeviceType::Cuda => "cuda",
            DeviceType::Npu => "npu",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(DeviceType::Host),
            "cuda" | "gpu" => Ok(DeviceType::Cuda),
            "npu" | "ascend" => Ok(DeviceType::Npu),
            other => Err(MetricsError::InvalidConfig(format!(
                "unknown device type '{}'. Valid values: host, cuda, npu",
                other
            ))),
        }
    }
}

type Opaque = Box<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// An ordered device command queue bound to one device rank.
pub struct DeviceStream {
    rank: usize,
    inner: Opaque,
}

impl DeviceStream {
    pub(crate) fn new<T: Any + Send + Sync>(rank: usize, inner: T) -> Self {
        Self {
            rank,
            inner: Box::new(inner),
        }
    }

    /// Device rank the stream executes on.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub(crate) fn inner<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStream").field("rank", &self.rank).finish()
    }
}

/// A completion marker recorded on a stream.
///
/// Satisfied once every command enqueued on that stream before the record
/// has finished.
pub struct DeviceEvent {
    inner: Opaque,
}

impl DeviceEvent {
    pub(crate) fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub(crate) fn inner<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceEvent(..)")
    }
}

/// A device-resident 64-bit accumulator owned by a sampler.
pub struct DeviceCounter {
    rank: usize,
    inner: Opaque,
}

impl DeviceCounter {
    pub(crate) fn new<T: Any + Send + Sync>(rank: usize, inner: T) -> Self {
        Self {
            rank,
            inner: Box::new(inner),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub(crate) fn inner<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for DeviceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCounter").field("rank", &self.rank).finish()
    }
}

/// Host memory that receives a copied [`DeviceCounter`] value.
///
/// Only meaningful after the event recorded behind the copy has completed.
pub struct HostMirror {
    pinned: bool,
    inner: Opaque,
}

impl HostMirror {
    pub(crate) fn new<T: Any + Send + Sync>(pinned: bool, inner: T) -> Self {
        Self {
            pinned,
            inner: Box::new(inner),
        }
    }

    /// Whether the mirror lives in page-locked memory.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub(crate) fn inner<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for HostMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMirror")
            .field("pinned", &self.pinned)
            .finish()
    }
}

/// Downcast a handle's payload, reporting handles from another backend.
pub(crate) fn downcast<'a, T: 'static>(
    payload: Option<&'a T>,
    backend: &'static str,
    handle: &'static str,
) -> Result<&'a T> {
    payload.ok_or(MetricsError::ForeignHandle { backend, handle })
}

// ---------------------------------------------------------------------------
// DeviceBackend
// ---------------------------------------------------------------------------

/// Runtime operations needed to mirror device counters onto the host.
///
/// None of these calls block on device work except
/// [`synchronize_event`](DeviceBackend::synchronize_event).
pub trait DeviceBackend: Send + Sync {
    /// Accelerator family this backend drives.
    fn device_type(&self) -> DeviceType;

    /// Short name used in logs and errors.
    fn name(&self) -> &'static str {
        self.device_type().as_str()
    }

    /// Number of visible devices.
    fn device_count(&self) -> Result<usize>;

    /// Rank of the device bound to the calling thread.
    fn current_device(&self) -> Result<usize>;

    /// Bind the calling thread to `rank`.
    fn set_device(&self, rank: usize) -> Result<()>;

    /// Create a new stream on `rank`, independent of the compute stream.
    fn create_stream(&self, rank: usize) -> Result<DeviceStream>;

    /// The stream that compute work (and sampler accumulator updates) is
    /// issued on for `rank`.
    fn current_stream(&self, rank: usize) -> Result<DeviceStream>;

    /// Make `waiter` wait for all work currently queued on `target`.
    ///
    /// Encodes an ordering dependency only; the host does not block.
    fn wait_stream(&self, waiter: &DeviceStream, target: &DeviceStream) -> Result<()>;

    /// Check that `counter` was allocated through this backend.
    fn check_counter(&self, counter: &DeviceCounter) -> Result<()>;

    /// Whether page-locked host memory can be allocated.
    fn is_pin_memory_available(&self) -> bool {
        true
    }

    /// Allocate a zero-initialized host mirror for one 64-bit counter.
    fn alloc_host_mirror(&self, pinned: bool) -> Result<HostMirror>;

    /// Enqueue a non-blocking copy of `src` into `dst` on `stream`.
    fn copy_to_host_async(
        &self,
        dst: &HostMirror,
        src: &DeviceCounter,
        stream: &DeviceStream,
    ) -> Result<()>;

    /// Record a completion event on `stream`.
    fn record_event(&self, stream: &DeviceStream) -> Result<DeviceEvent>;

    /// Non-blocking readiness check.
    fn query_event(&self, event: &DeviceEvent) -> Result<bool>;

    /// Block the calling thread until `event` has completed.
    fn synchronize_event(&self, event: &DeviceEvent) -> Result<()>;

    /// Read the value held by a host mirror.
    fn read_host_mirror(&self, mirror: &HostMirror) -> Result<i64>;
}

/// Select the best available accelerator backend.
///
/// Priority: CUDA (if the `cuda` feature is enabled) > Ascend (if the
/// `ascend` feature is enabled) > host emulation.
pub fn select_backend() -> Arc<dyn DeviceBackend> {
    #[cfg(feature = "cuda")]
    {
        match cuda::CudaBackend::try_new() {
            Ok(backend) => {
                info!("Selected CUDA backend");
                return Arc::new(backend);
            }
            Err(e) => {
                info!(error = %e, "CUDA not available, trying next backend");
            }
        }
    }

    #[cfg(feature = "ascend")]
    {
        match ascend::AscendBackend::try_new() {
            Ok(backend) => {
                info!("Selected Ascend backend");
                return Arc::new(backend);
            }
            Err(e) => {
                info!(error = %e, "Ascend not available, falling back to host");
            }
        }
    }

    info!("Selected host backend");
    Arc::new(host::HostBackend::new())
}

/// Resolve a backend for an explicitly requested device type.
///
/// Unlike [`select_backend`] this never falls back: asking for an
/// accelerator that is not compiled in or not present is an error.
pub fn backend_for(device_type: DeviceType) -> Result<Arc<dyn DeviceBackend>> {
    match device_type {
        DeviceType::Host => Ok(Arc::new(host::HostBackend::new())),

        DeviceType::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Ok(Arc::new(cuda::CudaBackend::try_new()?))
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(MetricsError::BackendUnavailable {
                    backend: "cuda",
                    reason: "not compiled in (enable the `cuda` feature)".to_string(),
                })
            }
        }

        DeviceType::Npu => {
            #[cfg(feature = "ascend")]
            {
                Ok(Arc::new(ascend::AscendBackend::try_new()?))
            }
            #[cfg(not(feature = "ascend"))]
            {
                Err(MetricsError::BackendUnavailable {
                    backend: "npu",
                    reason: "not compiled in (enable the `ascend` feature)".to_string(),
                })
            }
        }
    }
}
