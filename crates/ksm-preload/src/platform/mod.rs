#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

use core::ffi::c_void;

/// System page size, falling back to 4096 when `sysconf` gives nothing usable.
pub fn page_size() -> usize {
    sys::page_size()
}

/// Ask the kernel to consider `[start, start + len)` for same-page merging.
/// Returns the `errno` reported by the kernel on failure.
///
/// # Safety
/// `start` must be page-aligned. The range does not need to be mapped; the
/// kernel rejects unmapped ranges with `ENOMEM`.
#[inline]
pub unsafe fn advise_mergeable(start: *mut c_void, len: usize) -> Result<(), i32> {
    sys::advise_mergeable(start, len)
}

/// Kernel thread id of the caller.
#[inline]
pub fn thread_id() -> i32 {
    sys::thread_id()
}

/// Write raw bytes to fd 2, ignoring errors and short writes.
pub fn write_stderr(bytes: &[u8]) {
    sys::write_stderr(bytes)
}

/// Text of the last `dlerror()`, if any.
pub fn dl_error() -> Option<&'static core::ffi::CStr> {
    sys::dl_error()
}

pub fn abort() -> ! {
    sys::abort()
}
