//! Ascend CANN runtime (AscendCL), loaded at runtime.
//!
//! Mirrors the CUDA loader: the library is opened with `libloading` and only
//! the stream, event and memory entry points the metrics path needs are
//! resolved.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};

use libloading::Library;

use crate::error::{MetricsError, Result};

pub type AclError = c_int;
pub type AclrtStream = *mut c_void;
pub type AclrtEvent = *mut c_void;

pub const ACL_SUCCESS: AclError = 0;
pub const ACL_ERROR_REPEAT_INITIALIZE: AclError = 100002;

pub const ACL_MEMCPY_DEVICE_TO_HOST: c_int = 2;

pub const ACL_EVENT_RECORDED_STATUS_NOT_READY: c_int = 0;
pub const ACL_EVENT_RECORDED_STATUS_COMPLETE: c_int = 1;

type AclInitFn = unsafe extern "C" fn(*const c_char) -> AclError;
type AclrtGetDeviceCountFn = unsafe extern "C" fn(*mut c_uint) -> AclError;
type AclrtSetDeviceFn = unsafe extern "C" fn(i32) -> AclError;
type AclrtGetDeviceFn = unsafe extern "C" fn(*mut i32) -> AclError;

type AclrtCreateStreamFn = unsafe extern "C" fn(*mut AclrtStream) -> AclError;
type AclrtDestroyStreamFn = unsafe extern "C" fn(AclrtStream) -> AclError;
type AclrtStreamWaitEventFn = unsafe extern "C" fn(AclrtStream, AclrtEvent) -> AclError;

type AclrtCreateEventFn = unsafe extern "C" fn(*mut AclrtEvent) -> AclError;
type AclrtRecordEventFn = unsafe extern "C" fn(AclrtEvent, AclrtStream) -> AclError;
type AclrtQueryEventStatusFn = unsafe extern "C" fn(AclrtEvent, *mut c_int) -> AclError;
type AclrtSynchronizeEventFn = unsafe extern "C" fn(AclrtEvent) -> AclError;
type AclrtDestroyEventFn = unsafe extern "C" fn(AclrtEvent) -> AclError;

type AclrtMallocHostFn = unsafe extern "C" fn(*mut *mut c_void, usize) -> AclError;
type AclrtFreeHostFn = unsafe extern "C" fn(*mut c_void) -> AclError;
type AclrtMemcpyAsyncFn =
    unsafe extern "C" fn(*mut c_void, usize, *const c_void, usize, c_int, AclrtStream) -> AclError;

type AclGetRecentErrMsgFn = unsafe extern "C" fn() -> *const c_char;

/// AscendCL function table.
pub struct AclApi {
    #[allow(dead_code)]
    lib: Library,

    acl_init: AclInitFn,
    get_device_count: AclrtGetDeviceCountFn,
    set_device: AclrtSetDeviceFn,
    get_device: AclrtGetDeviceFn,

    create_stream: AclrtCreateStreamFn,
    destroy_stream: AclrtDestroyStreamFn,
    stream_wait_event: AclrtStreamWaitEventFn,

    create_event: AclrtCreateEventFn,
    record_event: AclrtRecordEventFn,
    query_event_status: AclrtQueryEventStatusFn,
    synchronize_event: AclrtSynchronizeEventFn,
    destroy_event: AclrtDestroyEventFn,

    malloc_host: AclrtMallocHostFn,
    free_host: AclrtFreeHostFn,
    memcpy_async: AclrtMemcpyAsyncFn,

    get_recent_err_msg: AclGetRecentErrMsgFn,
}

// SAFETY: AclApi only holds function pointers into a library that stays
// loaded for as long as the struct lives. AscendCL runtime calls are
// thread-safe.
unsafe impl Send for AclApi {}
unsafe impl Sync for AclApi {}

macro_rules! sym {
    ($lib:expr, $ty:ty, $name:literal) => {
        unsafe {
            *$lib
                .get::<$ty>(concat!($name, "\0").as_bytes())
                .map_err(|e| format!("{}: {}", $name, e))?
        }
    };
}

const NAME: &str = "npu";

impl AclApi {
    /// Open `libascendcl.so`, resolve every entry point and call `aclInit`.
    pub fn load() -> std::result::Result<Self, String> {
        let lib_names = [
            "libascendcl.so",
            "/usr/local/Ascend/ascend-toolkit/latest/lib64/libascendcl.so",
            "/usr/local/Ascend/runtime/lib64/libascendcl.so",
        ];

        let lib = lib_names
            .iter()
            .find_map(|name| unsafe { Library::new(*name).ok() })
            .ok_or_else(|| "Failed to load AscendCL library (libascendcl.so)".to_string())?;

        let acl_init = sym!(lib, AclInitFn, "aclInit");
        let get_device_count = sym!(lib, AclrtGetDeviceCountFn, "aclrtGetDeviceCount");
        let set_device = sym!(lib, AclrtSetDeviceFn, "aclrtSetDevice");
        let get_device = sym!(lib, AclrtGetDeviceFn, "aclrtGetDevice");
        let create_stream = sym!(lib, AclrtCreateStreamFn, "aclrtCreateStream");
        let destroy_stream = sym!(lib, AclrtDestroyStreamFn, "aclrtDestroyStream");
        let stream_wait_event = sym!(lib, AclrtStreamWaitEventFn, "aclrtStreamWaitEvent");
        let create_event = sym!(lib, AclrtCreateEventFn, "aclrtCreateEvent");
        let record_event = sym!(lib, AclrtRecordEventFn, "aclrtRecordEvent");
        let query_event_status = sym!(lib, AclrtQueryEventStatusFn, "aclrtQueryEventStatus");
        let synchronize_event = sym!(lib, AclrtSynchronizeEventFn, "aclrtSynchronizeEvent");
        let destroy_event = sym!(lib, AclrtDestroyEventFn, "aclrtDestroyEvent");
        let malloc_host = sym!(lib, AclrtMallocHostFn, "aclrtMallocHost");
        let free_host = sym!(lib, AclrtFreeHostFn, "aclrtFreeHost");
        let memcpy_async = sym!(lib, AclrtMemcpyAsyncFn, "aclrtMemcpyAsync");
        let get_recent_err_msg = sym!(lib, AclGetRecentErrMsgFn, "aclGetRecentErrMsg");

        let api = Self {
            lib,
            acl_init,
            get_device_count,
            set_device,
            get_device,
            create_stream,
            destroy_stream,
            stream_wait_event,
            create_event,
            record_event,
            query_event_status,
            synchronize_event,
            destroy_event,
            malloc_host,
            free_host,
            memcpy_async,
            get_recent_err_msg,
        };

        let code = unsafe { (api.acl_init)(std::ptr::null()) };
        if code != ACL_SUCCESS && code != ACL_ERROR_REPEAT_INITIALIZE {
            return Err(format!("aclInit: {}", api.error_string(code)));
        }
        Ok(api)
    }

    fn error_string(&self, code: AclError) -> String {
        let msg = unsafe { (self.get_recent_err_msg)() };
        if msg.is_null() {
            return format!("aclError {}", code);
        }
        let text = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
        format!("{} ({})", text.trim(), code)
    }

    fn check(&self, code: AclError, op: &'static str) -> Result<()> {
        if code == ACL_SUCCESS {
            Ok(())
        } else {
            Err(MetricsError::device(NAME, op, self.error_string(code)))
        }
    }

    pub fn device_count(&self) -> Result<usize> {
        let mut count: c_uint = 0;
        self.check(unsafe { (self.get_device_count)(&mut count) }, "aclrtGetDeviceCount")?;
        Ok(count as usize)
    }

    pub fn set_device(&self, rank: usize) -> Result<()> {
        self.check(unsafe { (self.set_device)(rank as i32) }, "aclrtSetDevice")
    }

    /// Device bound to the calling thread, if any.
    pub fn current_device(&self) -> Option<usize> {
        let mut device: i32 = -1;
        let code = unsafe { (self.get_device)(&mut device) };
        if code != ACL_SUCCESS || device < 0 {
            return None;
        }
        Some(device as usize)
    }

    pub fn stream_create(&self) -> Result<AclrtStream> {
        let mut stream: AclrtStream = std::ptr::null_mut();
        self.check(unsafe { (self.create_stream)(&mut stream) }, "aclrtCreateStream")?;
        Ok(stream)
    }

    pub fn stream_destroy(&self, stream: AclrtStream) -> Result<()> {
        self.check(unsafe { (self.destroy_stream)(stream) }, "aclrtDestroyStream")
    }

    pub fn stream_wait_event(&self, stream: AclrtStream, event: AclrtEvent) -> Result<()> {
        self.check(
            unsafe { (self.stream_wait_event)(stream, event) },
            "aclrtStreamWaitEvent",
        )
    }

    pub fn event_create(&self) -> Result<AclrtEvent> {
        let mut event: AclrtEvent = std::ptr::null_mut();
        self.check(unsafe { (self.create_event)(&mut event) }, "aclrtCreateEvent")?;
        Ok(event)
    }

    pub fn event_record(&self, event: AclrtEvent, stream: AclrtStream) -> Result<()> {
        self.check(unsafe { (self.record_event)(event, stream) }, "aclrtRecordEvent")
    }

    /// `Ok(true)` once complete, `Ok(false)` while pending.
    pub fn event_query(&self, event: AclrtEvent) -> Result<bool> {
        let mut status: c_int = ACL_EVENT_RECORDED_STATUS_NOT_READY;
        self.check(
            unsafe { (self.query_event_status)(event, &mut status) },
            "aclrtQueryEventStatus",
        )?;
        Ok(status == ACL_EVENT_RECORDED_STATUS_COMPLETE)
    }

    pub fn event_synchronize(&self, event: AclrtEvent) -> Result<()> {
        self.check(unsafe { (self.synchronize_event)(event) }, "aclrtSynchronizeEvent")
    }

    pub fn event_destroy(&self, event: AclrtEvent) -> Result<()> {
        self.check(unsafe { (self.destroy_event)(event) }, "aclrtDestroyEvent")
    }

    pub fn malloc_host(&self, bytesize: usize) -> Result<*mut c_void> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        self.check(unsafe { (self.malloc_host)(&mut ptr, bytesize) }, "aclrtMallocHost")?;
        Ok(ptr)
    }

    pub fn free_host(&self, ptr: *mut c_void) -> Result<()> {
        self.check(unsafe { (self.free_host)(ptr) }, "aclrtFreeHost")
    }

    /// # Safety
    ///
    /// `dst` must be valid for `bytesize` bytes until the copy completes and
    /// `src` must be a device allocation of at least `bytesize` bytes.
    pub unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        bytesize: usize,
        stream: AclrtStream,
    ) -> Result<()> {
        self.check(
            (self.memcpy_async)(dst, bytesize, src, bytesize, ACL_MEMCPY_DEVICE_TO_HOST, stream),
            "aclrtMemcpyAsync",
        )
    }
}
