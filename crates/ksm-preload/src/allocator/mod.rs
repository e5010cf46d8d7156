pub mod passthrough;

pub use passthrough::{NextInSearchOrder, RealFunctions, ResolveError, SymbolSource};

use crate::policy::{Advisor, MergePolicy};
use core::ffi::{c_int, c_void};

/// Destination of an `mremap`.
///
/// C passes the target as a fifth, variadic argument that only exists when
/// `MREMAP_FIXED` is set; this makes its presence explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapTarget {
    Anywhere,
    Fixed(*mut c_void),
}

impl RemapTarget {
    /// `raw` is only looked at when `flags` carries `MREMAP_FIXED`.
    #[inline]
    pub fn from_raw(flags: c_int, raw: *mut c_void) -> Self {
        if flags & libc::MREMAP_FIXED != 0 {
            RemapTarget::Fixed(raw)
        } else {
            RemapTarget::Anywhere
        }
    }
}

/// The five allocation primitives the shim forwards to.
pub trait AllocProvider {
    unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void;
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void;
    unsafe fn mremap(
        &self,
        old_addr: *mut c_void,
        old_len: usize,
        new_len: usize,
        flags: c_int,
        target: RemapTarget,
    ) -> *mut c_void;
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;
}

/// Forwards each call to a provider, then offers the result to the policy.
///
/// Results (including failures and `errno`) reach the caller untouched; the
/// advisory is the only side effect added.
pub struct MergingAllocator<'a, P, A> {
    provider: &'a P,
    policy: MergePolicy,
    advisor: &'a A,
}

impl<'a, P: AllocProvider, A: Advisor> MergingAllocator<'a, P, A> {
    pub fn new(provider: &'a P, policy: MergePolicy, advisor: &'a A) -> Self {
        MergingAllocator {
            provider,
            policy,
            advisor,
        }
    }

    /// Run the policy without clobbering the `errno` left by the primitive.
    #[inline]
    unsafe fn offer(&self, res: *mut c_void, len: usize, flags: Option<c_int>) {
        let errno = libc::__errno_location();
        let saved = *errno;
        self.policy.consider(self.advisor, res, len, flags);
        *errno = saved;
    }

    #[inline]
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        let res = self.provider.calloc(nmemb, size);
        trace!("calloc ({}, {}) = {:p}", nmemb, size, res);
        self.offer(res, nmemb.saturating_mul(size), None);
        res
    }

    #[inline]
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        let res = self.provider.malloc(size);
        trace!("malloc ({}) = {:p}", size, res);
        self.offer(res, size, None);
        res
    }

    #[inline]
    pub unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        let res = self.provider.mmap(addr, len, prot, flags, fd, offset);
        trace!(
            "mmap ({:p}, {}, {}, {}, {}, {}) = {:p}",
            addr,
            len,
            prot,
            flags,
            fd,
            offset,
            res
        );
        self.offer(res, len, Some(flags));
        res
    }

    #[inline]
    pub unsafe fn mremap(
        &self,
        old_addr: *mut c_void,
        old_len: usize,
        new_len: usize,
        flags: c_int,
        target: RemapTarget,
    ) -> *mut c_void {
        let res = self
            .provider
            .mremap(old_addr, old_len, new_len, flags, target);
        trace!(
            "mremap ({:p}, {}, {}, {}, ...) = {:p}",
            old_addr,
            old_len,
            new_len,
            flags,
            res
        );
        self.offer(res, new_len, None);
        res
    }

    #[inline]
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let res = self.provider.realloc(ptr, size);
        trace!("realloc ({:p}, {}) = {:p}", ptr, size, res);
        self.offer(res, size, None);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AdviseError, Region};
    use std::cell::{Cell, RefCell};

    const PAGE: usize = 4096;
    const ANON: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    /// Hands out a fixed address and remembers what it was asked.
    struct FakeProvider {
        result: *mut c_void,
        last_target: Cell<Option<RemapTarget>>,
        calls: Cell<usize>,
    }

    impl FakeProvider {
        fn returning(addr: usize) -> Self {
            FakeProvider {
                result: addr as *mut c_void,
                last_target: Cell::new(None),
                calls: Cell::new(0),
            }
        }

        fn hit(&self) -> *mut c_void {
            self.calls.set(self.calls.get() + 1);
            self.result
        }
    }

    impl AllocProvider for FakeProvider {
        unsafe fn calloc(&self, _nmemb: usize, _size: usize) -> *mut c_void {
            self.hit()
        }
        unsafe fn malloc(&self, _size: usize) -> *mut c_void {
            self.hit()
        }
        unsafe fn mmap(
            &self,
            _addr: *mut c_void,
            _len: usize,
            _prot: c_int,
            _flags: c_int,
            _fd: c_int,
            _offset: libc::off_t,
        ) -> *mut c_void {
            self.hit()
        }
        unsafe fn mremap(
            &self,
            _old_addr: *mut c_void,
            _old_len: usize,
            _new_len: usize,
            _flags: c_int,
            target: RemapTarget,
        ) -> *mut c_void {
            self.last_target.set(Some(target));
            self.hit()
        }
        unsafe fn realloc(&self, _ptr: *mut c_void, _size: usize) -> *mut c_void {
            self.hit()
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<Region>>,
    }

    impl Advisor for Recorder {
        unsafe fn advise_mergeable(&self, region: Region) -> Result<(), AdviseError> {
            self.calls.borrow_mut().push(region);
            Ok(())
        }
    }

    fn policy() -> MergePolicy {
        MergePolicy::new(PAGE, crate::config::DEFAULT_MERGE_THRESHOLD)
    }

    const BASE: usize = 0x7f12_3400_0000;

    #[test]
    fn results_are_returned_unchanged() {
        let provider = FakeProvider::returning(BASE + 16);
        let rec = Recorder::default();
        let a = MergingAllocator::new(&provider, policy(), &rec);
        unsafe {
            assert_eq!(a.malloc(10) as usize, BASE + 16);
            assert_eq!(a.calloc(2, 5) as usize, BASE + 16);
            assert_eq!(a.realloc(core::ptr::null_mut(), 7) as usize, BASE + 16);
        }
        assert_eq!(provider.calls.get(), 3);
        assert!(rec.calls.borrow().is_empty());
    }

    #[test]
    fn ten_page_mmap_is_advised_two_page_is_not() {
        let provider = FakeProvider::returning(BASE);
        let rec = Recorder::default();
        let a = MergingAllocator::new(&provider, policy(), &rec);
        let rw = libc::PROT_READ | libc::PROT_WRITE;
        unsafe {
            a.mmap(core::ptr::null_mut(), 40960, rw, ANON, -1, 0);
            a.mmap(core::ptr::null_mut(), 8192, rw, ANON, -1, 0);
        }
        assert_eq!(
            *rec.calls.borrow(),
            vec![Region {
                start: BASE,
                len: 40960
            }]
        );
    }

    #[test]
    fn mmap_of_stack_or_shared_memory_is_never_advised() {
        let provider = FakeProvider::returning(BASE);
        let rec = Recorder::default();
        let a = MergingAllocator::new(&provider, MergePolicy::new(PAGE, 0), &rec);
        unsafe {
            a.mmap(core::ptr::null_mut(), 1 << 24, 0, ANON | libc::MAP_STACK, -1, 0);
            a.mmap(core::ptr::null_mut(), 1 << 24, 0, ANON | libc::MAP_GROWSDOWN, -1, 0);
            a.mmap(core::ptr::null_mut(), 1 << 24, 0, libc::MAP_SHARED, 3, 0);
        }
        assert_eq!(provider.calls.get(), 3);
        assert!(rec.calls.borrow().is_empty());
    }

    #[test]
    fn failed_mmap_is_passed_through_without_advice() {
        let provider = FakeProvider::returning(libc::MAP_FAILED as usize);
        let rec = Recorder::default();
        let a = MergingAllocator::new(&provider, MergePolicy::new(PAGE, 0), &rec);
        let res = unsafe { a.mmap(core::ptr::null_mut(), 1 << 20, 0, ANON, -1, 0) };
        assert_eq!(res, libc::MAP_FAILED);
        assert!(rec.calls.borrow().is_empty());
    }

    #[test]
    fn calloc_uses_total_size() {
        let provider = FakeProvider::returning(BASE);
        let rec = Recorder::default();
        let a = MergingAllocator::new(&provider, policy(), &rec);
        unsafe { a.calloc(1024, 64) };
        assert_eq!(
            *rec.calls.borrow(),
            vec![Region {
                start: BASE,
                len: 65536
            }]
        );
    }

    #[test]
    fn mremap_advises_new_length_and_forwards_target() {
        let provider = FakeProvider::returning(BASE);
        let rec = Recorder::default();
        let a = MergingAllocator::new(&provider, policy(), &rec);
        let target = RemapTarget::Fixed(0x6000_0000 as *mut c_void);
        unsafe {
            a.mremap(
                0x5000_0000 as *mut c_void,
                4096,
                1 << 16,
                libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                target,
            );
        }
        assert_eq!(provider.last_target.get(), Some(target));
        assert_eq!(
            *rec.calls.borrow(),
            vec![Region {
                start: BASE,
                len: 1 << 16
            }]
        );
    }

    #[test]
    fn errno_from_the_primitive_survives_the_advisory() {
        struct Failing;
        impl Advisor for Failing {
            unsafe fn advise_mergeable(&self, _region: Region) -> Result<(), AdviseError> {
                *libc::__errno_location() = libc::EINVAL;
                Err(AdviseError {
                    errno: libc::EINVAL,
                })
            }
        }
        let provider = FakeProvider::returning(BASE);
        let a = MergingAllocator::new(&provider, MergePolicy::new(PAGE, 0), &Failing);
        unsafe {
            *libc::__errno_location() = libc::EAGAIN;
            a.malloc(64);
            assert_eq!(*libc::__errno_location(), libc::EAGAIN);
        }
    }

    #[test]
    fn remap_target_reads_address_only_when_fixed() {
        let raw = 0xdead_0000 as *mut c_void;
        assert_eq!(
            RemapTarget::from_raw(libc::MREMAP_MAYMOVE, raw),
            RemapTarget::Anywhere
        );
        assert_eq!(
            RemapTarget::from_raw(libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED, raw),
            RemapTarget::Fixed(raw)
        );
    }
}
