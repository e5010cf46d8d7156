//! Passthrough to the allocation primitives the process would use without us.
//!
//! Because this library exports `malloc`, `mmap` and friends, calling
//! `libc::malloc` from inside it would recurse back into the wrappers. The
//! real implementations are found with `dlsym(RTLD_NEXT, ...)`. Until that has
//! happened (and while `dlsym` itself allocates) calls go to glibc's internal
//! entry points, which are always the libc allocator.

use super::{AllocProvider, RemapTarget};
use core::ffi::{c_int, c_void, CStr};
use core::fmt;

type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type MmapFn =
    unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
type MremapFn = unsafe extern "C" fn(*mut c_void, usize, usize, c_int, ...) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;

extern "C" {
    fn __libc_calloc(nmemb: usize, size: usize) -> *mut c_void;
    fn __libc_malloc(size: usize) -> *mut c_void;
    fn __libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
    fn __mmap(
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void;
}

/// A real primitive could not be found in the libraries loaded after us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveError {
    pub symbol: &'static CStr,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbol.to_str() {
            Ok(name) => write!(f, "failed to load {}", name),
            Err(_) => f.write_str("failed to load symbol"),
        }
    }
}

/// Looks up symbols by name.
pub trait SymbolSource {
    /// Address of `name`, or null if it cannot be found.
    fn lookup(&self, name: &CStr) -> *mut c_void;
}

/// `dlsym(RTLD_NEXT, name)`: the definition that follows ours in the
/// dynamic linker's search order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NextInSearchOrder;

impl SymbolSource for NextInSearchOrder {
    fn lookup(&self, name: &CStr) -> *mut c_void {
        unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) }
    }
}

/// Function table for the forwarded primitives.
#[derive(Clone, Copy)]
pub struct RealFunctions {
    calloc: CallocFn,
    malloc: MallocFn,
    mmap: MmapFn,
    /// `None` during bootstrap: the syscall is used directly.
    mremap: Option<MremapFn>,
    realloc: ReallocFn,
}

impl fmt::Debug for RealFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealFunctions")
            .field("calloc", &(self.calloc as usize as *const c_void))
            .field("malloc", &(self.malloc as usize as *const c_void))
            .field("mmap", &(self.mmap as usize as *const c_void))
            .field("mremap", &self.mremap.map(|f| f as usize as *const c_void))
            .field("realloc", &(self.realloc as usize as *const c_void))
            .finish()
    }
}

impl RealFunctions {
    /// glibc's own entry points, usable before anything has been resolved.
    pub const fn bootstrap() -> Self {
        RealFunctions {
            calloc: __libc_calloc,
            malloc: __libc_malloc,
            mmap: __mmap,
            mremap: None,
            realloc: __libc_realloc,
        }
    }

    /// Resolve all five primitives from `source`.
    ///
    /// Either every symbol is found or none of the table is usable; a
    /// half-resolved set could pair one allocator's `malloc` with another's
    /// `realloc`.
    pub fn resolve<S: SymbolSource>(source: &S) -> Result<Self, ResolveError> {
        let calloc = lookup(source, c"calloc")?;
        let malloc = lookup(source, c"malloc")?;
        let mmap = lookup(source, c"mmap")?;
        let mremap = lookup(source, c"mremap")?;
        let realloc = lookup(source, c"realloc")?;

        // SAFETY: each address names the libc function of the same name, so
        // its signature matches the corresponding type.
        unsafe {
            Ok(RealFunctions {
                calloc: core::mem::transmute::<*mut c_void, CallocFn>(calloc),
                malloc: core::mem::transmute::<*mut c_void, MallocFn>(malloc),
                mmap: core::mem::transmute::<*mut c_void, MmapFn>(mmap),
                mremap: Some(core::mem::transmute::<*mut c_void, MremapFn>(mremap)),
                realloc: core::mem::transmute::<*mut c_void, ReallocFn>(realloc),
            })
        }
    }

    /// Whether `resolve` produced this table.
    pub fn is_resolved(&self) -> bool {
        self.mremap.is_some()
    }
}

fn lookup<S: SymbolSource>(source: &S, name: &'static CStr) -> Result<*mut c_void, ResolveError> {
    let addr = source.lookup(name);
    if addr.is_null() {
        Err(ResolveError { symbol: name })
    } else {
        Ok(addr)
    }
}

/// `mremap` straight to the kernel. `syscall` maps failure to -1 with errno
/// set, which is exactly `MAP_FAILED`.
unsafe fn mremap_syscall(
    old_addr: *mut c_void,
    old_len: usize,
    new_len: usize,
    flags: c_int,
    target: RemapTarget,
) -> *mut c_void {
    let new_addr = match target {
        RemapTarget::Fixed(addr) => addr,
        RemapTarget::Anywhere => core::ptr::null_mut(),
    };
    libc::syscall(
        libc::SYS_mremap,
        old_addr,
        old_len,
        new_len,
        flags as libc::c_long,
        new_addr,
    ) as *mut c_void
}

impl AllocProvider for RealFunctions {
    #[inline]
    unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        (self.calloc)(nmemb, size)
    }

    #[inline]
    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        (self.malloc)(size)
    }

    #[inline]
    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        (self.mmap)(addr, len, prot, flags, fd, offset)
    }

    #[inline]
    unsafe fn mremap(
        &self,
        old_addr: *mut c_void,
        old_len: usize,
        new_len: usize,
        flags: c_int,
        target: RemapTarget,
    ) -> *mut c_void {
        match (self.mremap, target) {
            (Some(f), RemapTarget::Fixed(new_addr)) => f(old_addr, old_len, new_len, flags, new_addr),
            (Some(f), RemapTarget::Anywhere) => f(old_addr, old_len, new_len, flags),
            (None, target) => mremap_syscall(old_addr, old_len, new_len, flags, target),
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        (self.realloc)(ptr, size)
    }
}
