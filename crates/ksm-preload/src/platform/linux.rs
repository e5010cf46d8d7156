use core::ffi::{c_void, CStr};

pub fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 && (ps as usize).is_power_of_two() {
        ps as usize
    } else {
        crate::util::FALLBACK_PAGE_SIZE
    }
}

/// # Safety
/// `start` must be page-aligned.
pub unsafe fn advise_mergeable(start: *mut c_void, len: usize) -> Result<(), i32> {
    if libc::madvise(start, len, libc::MADV_MERGEABLE) == 0 {
        Ok(())
    } else {
        Err(*libc::__errno_location())
    }
}

/// Uncached: only the bootstrap slow path asks for it.
pub fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

pub fn write_stderr(bytes: &[u8]) {
    unsafe {
        libc::write(2, bytes.as_ptr() as *const c_void, bytes.len());
    }
}

pub fn dl_error() -> Option<&'static CStr> {
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            None
        } else {
            Some(CStr::from_ptr(msg))
        }
    }
}

pub fn abort() -> ! {
    unsafe { libc::abort() }
}
