use crate::allocator::{MergingAllocator, RemapTarget};
use crate::init;
use crate::policy::KernelAdvisor;
use core::ffi::{c_int, c_void};

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
compile_error!("mremap's optional target address is only wired up for x86_64, aarch64 and riscv64");

/// Run `$call` on a [`MergingAllocator`] over the current settings.
macro_rules! forward {
    (|$a:ident| $call:expr) => {{
        let settings = init::settings();
        let $a = MergingAllocator::new(&settings.real, settings.policy(), &KernelAdvisor);
        $call
    }};
}

// ============================================================================
// Standard C allocator API
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    forward!(|a| a.calloc(nmemb, size))
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    forward!(|a| a.malloc(size))
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    forward!(|a| a.realloc(ptr, size))
}

// ============================================================================
// Memory mappings
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    forward!(|a| a.mmap(addr, len, prot, flags, fd, offset))
}

/// `mremap(old, old_len, new_len, flags, ... /* new_address */)`.
///
/// The C prototype is variadic. On the Linux targets we support a trailing
/// pointer vararg travels in the same register as a fifth named argument, so
/// it is declared as one and only read when `MREMAP_FIXED` says the caller
/// passed it. Stack-passing ABIs such as i386 are rejected above: there the
/// slot may never have been written.
#[no_mangle]
pub unsafe extern "C" fn mremap(
    old_addr: *mut c_void,
    old_len: usize,
    new_len: usize,
    flags: c_int,
    new_addr: *mut c_void,
) -> *mut c_void {
    let target = RemapTarget::from_raw(flags, new_addr);
    forward!(|a| a.mremap(old_addr, old_len, new_len, flags, target))
}
