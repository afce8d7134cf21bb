//! CUDA driver API, loaded at runtime.
//!
//! Only the entry points the metrics path needs: primary contexts, streams,
//! events, pinned host allocations and async device-to-host copies. The
//! driver library is opened with `libloading`, so building with the `cuda`
//! feature does not require the CUDA toolkit.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};

use libloading::Library;

use crate::error::{MetricsError, Result};

pub type CUresult = c_int;
pub type CUdevice = c_int;
pub type CUcontext = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUevent = *mut c_void;
pub type CUdeviceptr = u64;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_INVALID_CONTEXT: CUresult = 201;
pub const CUDA_ERROR_NOT_READY: CUresult = 600;

pub const CU_STREAM_NON_BLOCKING: c_uint = 0x1;
pub const CU_EVENT_DISABLE_TIMING: c_uint = 0x2;
pub const CU_MEMHOSTALLOC_PORTABLE: c_uint = 0x1;

type CuInitFn = unsafe extern "C" fn(c_uint) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(*mut c_int) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult;
type CuDevicePrimaryCtxRetainFn = unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(CUcontext) -> CUresult;
type CuCtxGetDeviceFn = unsafe extern "C" fn(*mut CUdevice) -> CUresult;

type CuStreamCreateFn = unsafe extern "C" fn(*mut CUstream, c_uint) -> CUresult;
type CuStreamDestroyFn = unsafe extern "C" fn(CUstream) -> CUresult;
type CuStreamWaitEventFn = unsafe extern "C" fn(CUstream, CUevent, c_uint) -> CUresult;

type CuEventCreateFn = unsafe extern "C" fn(*mut CUevent, c_uint) -> CUresult;
type CuEventRecordFn = unsafe extern "C" fn(CUevent, CUstream) -> CUresult;
type CuEventQueryFn = unsafe extern "C" fn(CUevent) -> CUresult;
type CuEventSynchronizeFn = unsafe extern "C" fn(CUevent) -> CUresult;
type CuEventDestroyFn = unsafe extern "C" fn(CUevent) -> CUresult;

type CuMemHostAllocFn = unsafe extern "C" fn(*mut *mut c_void, usize, c_uint) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(*mut c_void) -> CUresult;
type CuMemcpyDtoHAsyncFn =
    unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize, CUstream) -> CUresult;

type CuGetErrorStringFn = unsafe extern "C" fn(CUresult, *mut *const c_char) -> CUresult;

/// CUDA driver function table.
pub struct CudaApi {
    #[allow(dead_code)]
    lib: Library,

    cu_init: CuInitFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_primary_ctx_retain: CuDevicePrimaryCtxRetainFn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_ctx_get_device: CuCtxGetDeviceFn,

    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy: CuStreamDestroyFn,
    cu_stream_wait_event: CuStreamWaitEventFn,

    cu_event_create: CuEventCreateFn,
    cu_event_record: CuEventRecordFn,
    cu_event_query: CuEventQueryFn,
    cu_event_synchronize: CuEventSynchronizeFn,
    cu_event_destroy: CuEventDestroyFn,

    cu_mem_host_alloc: CuMemHostAllocFn,
    cu_mem_free_host: CuMemFreeHostFn,
    cu_memcpy_dtoh_async: CuMemcpyDtoHAsyncFn,

    cu_get_error_string: CuGetErrorStringFn,
}

// SAFETY: CudaApi only holds function pointers into a library that stays
// loaded for as long as the struct lives. The driver API is thread-safe.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

macro_rules! sym {
    ($lib:expr, $ty:ty, $name:literal) => {
        unsafe {
            *$lib
                .get::<$ty>(concat!($name, "\0").as_bytes())
                .map_err(|e| format!("{}: {}", $name, e))?
        }
    };
}

const NAME: &str = "cuda";

impl CudaApi {
    /// Open the driver library, resolve every entry point and call `cuInit`.
    pub fn load() -> std::result::Result<Self, String> {
        let lib_names = ["libcuda.so.1", "libcuda.so", "nvcuda.dll"];

        let lib = lib_names
            .iter()
            .find_map(|name| unsafe { Library::new(*name).ok() })
            .ok_or_else(|| "Failed to load CUDA driver library (libcuda.so)".to_string())?;

        let cu_init: CuInitFn = sym!(lib, CuInitFn, "cuInit");
        let cu_device_get_count: CuDeviceGetCountFn = sym!(lib, CuDeviceGetCountFn, "cuDeviceGetCount");
        let cu_device_get: CuDeviceGetFn = sym!(lib, CuDeviceGetFn, "cuDeviceGet");
        let cu_device_primary_ctx_retain: CuDevicePrimaryCtxRetainFn =
            sym!(lib, CuDevicePrimaryCtxRetainFn, "cuDevicePrimaryCtxRetain");
        let cu_ctx_set_current: CuCtxSetCurrentFn = sym!(lib, CuCtxSetCurrentFn, "cuCtxSetCurrent");
        let cu_ctx_get_device: CuCtxGetDeviceFn = sym!(lib, CuCtxGetDeviceFn, "cuCtxGetDevice");
        let cu_stream_create: CuStreamCreateFn = sym!(lib, CuStreamCreateFn, "cuStreamCreate");
        let cu_stream_destroy: CuStreamDestroyFn = sym!(lib, CuStreamDestroyFn, "cuStreamDestroy_v2");
        let cu_stream_wait_event: CuStreamWaitEventFn = sym!(lib, CuStreamWaitEventFn, "cuStreamWaitEvent");
        let cu_event_create: CuEventCreateFn = sym!(lib, CuEventCreateFn, "cuEventCreate");
        let cu_event_record: CuEventRecordFn = sym!(lib, CuEventRecordFn, "cuEventRecord");
        let cu_event_query: CuEventQueryFn = sym!(lib, CuEventQueryFn, "cuEventQuery");
        let cu_event_synchronize: CuEventSynchronizeFn = sym!(lib, CuEventSynchronizeFn, "cuEventSynchronize");
        let cu_event_destroy: CuEventDestroyFn = sym!(lib, CuEventDestroyFn, "cuEventDestroy_v2");
        let cu_mem_host_alloc: CuMemHostAllocFn = sym!(lib, CuMemHostAllocFn, "cuMemHostAlloc");
        let cu_mem_free_host: CuMemFreeHostFn = sym!(lib, CuMemFreeHostFn, "cuMemFreeHost");
        let cu_memcpy_dtoh_async: CuMemcpyDtoHAsyncFn = sym!(lib, CuMemcpyDtoHAsyncFn, "cuMemcpyDtoHAsync_v2");
        let cu_get_error_string: CuGetErrorStringFn = sym!(lib, CuGetErrorStringFn, "cuGetErrorString");

        let api = Self {
            lib,
            cu_init,
            cu_device_get_count,
            cu_device_get,
            cu_device_primary_ctx_retain,
            cu_ctx_set_current,
            cu_ctx_get_device,
            cu_stream_create,
            cu_stream_destroy,
            cu_stream_wait_event,
            cu_event_create,
            cu_event_record,
            cu_event_query,
            cu_event_synchronize,
            cu_event_destroy,
            cu_mem_host_alloc,
            cu_mem_free_host,
            cu_memcpy_dtoh_async,
            cu_get_error_string,
        };

        let code = unsafe { (api.cu_init)(0) };
        if code != CUDA_SUCCESS {
            return Err(format!("cuInit: {}", api.error_string(code)));
        }
        Ok(api)
    }

    fn error_string(&self, code: CUresult) -> String {
        let mut msg: *const c_char = std::ptr::null();
        let status = unsafe { (self.cu_get_error_string)(code, &mut msg) };
        if status != CUDA_SUCCESS || msg.is_null() {
            return format!("CUresult {}", code);
        }
        let text = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
        format!("{} ({})", text, code)
    }

    fn check(&self, code: CUresult, op: &'static str) -> Result<()> {
        if code == CUDA_SUCCESS {
            Ok(())
        } else {
            Err(MetricsError::device(NAME, op, self.error_string(code)))
        }
    }

    pub fn device_count(&self) -> Result<usize> {
        let mut count: c_int = 0;
        self.check(unsafe { (self.cu_device_get_count)(&mut count) }, "cuDeviceGetCount")?;
        Ok(count.max(0) as usize)
    }

    /// Retain the primary context of `ordinal`.
    pub fn primary_context(&self, ordinal: usize) -> Result<CUcontext> {
        let mut device: CUdevice = 0;
        self.check(
            unsafe { (self.cu_device_get)(&mut device, ordinal as c_int) },
            "cuDeviceGet",
        )?;
        let mut ctx: CUcontext = std::ptr::null_mut();
        self.check(
            unsafe { (self.cu_device_primary_ctx_retain)(&mut ctx, device) },
            "cuDevicePrimaryCtxRetain",
        )?;
        Ok(ctx)
    }

    pub fn set_current(&self, ctx: CUcontext) -> Result<()> {
        self.check(unsafe { (self.cu_ctx_set_current)(ctx) }, "cuCtxSetCurrent")
    }

    /// Device of the calling thread's current context, if any.
    pub fn current_device(&self) -> Result<Option<usize>> {
        let mut device: CUdevice = 0;
        let code = unsafe { (self.cu_ctx_get_device)(&mut device) };
        if code == CUDA_ERROR_INVALID_CONTEXT {
            return Ok(None);
        }
        self.check(code, "cuCtxGetDevice")?;
        Ok(Some(device.max(0) as usize))
    }

    pub fn stream_create(&self) -> Result<CUstream> {
        let mut stream: CUstream = std::ptr::null_mut();
        self.check(
            unsafe { (self.cu_stream_create)(&mut stream, CU_STREAM_NON_BLOCKING) },
            "cuStreamCreate",
        )?;
        Ok(stream)
    }

    pub fn stream_destroy(&self, stream: CUstream) -> Result<()> {
        self.check(unsafe { (self.cu_stream_destroy)(stream) }, "cuStreamDestroy")
    }

    pub fn stream_wait_event(&self, stream: CUstream, event: CUevent) -> Result<()> {
        self.check(
            unsafe { (self.cu_stream_wait_event)(stream, event, 0) },
            "cuStreamWaitEvent",
        )
    }

    pub fn event_create(&self) -> Result<CUevent> {
        let mut event: CUevent = std::ptr::null_mut();
        self.check(
            unsafe { (self.cu_event_create)(&mut event, CU_EVENT_DISABLE_TIMING) },
            "cuEventCreate",
        )?;
        Ok(event)
    }

    pub fn event_record(&self, event: CUevent, stream: CUstream) -> Result<()> {
        self.check(unsafe { (self.cu_event_record)(event, stream) }, "cuEventRecord")
    }

    /// `Ok(true)` once complete, `Ok(false)` while pending.
    pub fn event_query(&self, event: CUevent) -> Result<bool> {
        match unsafe { (self.cu_event_query)(event) } {
            CUDA_SUCCESS => Ok(true),
            CUDA_ERROR_NOT_READY => Ok(false),
            code => Err(MetricsError::device(NAME, "cuEventQuery", self.error_string(code))),
        }
    }

    pub fn event_synchronize(&self, event: CUevent) -> Result<()> {
        self.check(unsafe { (self.cu_event_synchronize)(event) }, "cuEventSynchronize")
    }

    pub fn event_destroy(&self, event: CUevent) -> Result<()> {
        self.check(unsafe { (self.cu_event_destroy)(event) }, "cuEventDestroy")
    }

    pub fn mem_host_alloc(&self, bytesize: usize) -> Result<*mut c_void> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        self.check(
            unsafe { (self.cu_mem_host_alloc)(&mut ptr, bytesize, CU_MEMHOSTALLOC_PORTABLE) },
            "cuMemHostAlloc",
        )?;
        Ok(ptr)
    }

    pub fn mem_free_host(&self, ptr: *mut c_void) -> Result<()> {
        self.check(unsafe { (self.cu_mem_free_host)(ptr) }, "cuMemFreeHost")
    }

    /// # Safety
    ///
    /// `dst` must be valid for `bytesize` bytes until the copy completes and
    /// `src` must be a device allocation of at least `bytesize` bytes.
    pub unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: CUdeviceptr,
        bytesize: usize,
        stream: CUstream,
    ) -> Result<()> {
        self.check(
            (self.cu_memcpy_dtoh_async)(dst, src, bytesize, stream),
            "cuMemcpyDtoHAsync",
        )
    }
}
