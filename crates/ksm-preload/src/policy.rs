//! Which regions are worth handing to KSM.

use crate::platform;
use crate::util::align_down;
use core::ffi::{c_int, c_void};

/// A page-aligned range to advise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Null or `MAP_FAILED`.
    FailedAllocation,
    /// Aligned length at or below the threshold.
    BelowThreshold,
    /// Shared, file-backed or stack mapping.
    FlagsFiltered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Advise(Region),
    Skip(SkipReason),
}

/// The kernel refused a merge advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdviseError {
    pub errno: c_int,
}

impl core::fmt::Display for AdviseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "madvise(MADV_MERGEABLE) failed with errno {}", self.errno)
    }
}

/// Receiver of "these pages may be merged" advice.
pub trait Advisor {
    /// # Safety
    /// `region.start` is page-aligned; the range may already have been
    /// unmapped by another thread.
    unsafe fn advise_mergeable(&self, region: Region) -> Result<(), AdviseError>;
}

/// Issues `madvise(MADV_MERGEABLE)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelAdvisor;

impl Advisor for KernelAdvisor {
    #[inline]
    unsafe fn advise_mergeable(&self, region: Region) -> Result<(), AdviseError> {
        platform::advise_mergeable(region.start as *mut c_void, region.len)
            .map_err(|errno| AdviseError { errno })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub page_size: usize,
    pub threshold: usize,
}

impl MergePolicy {
    pub const fn new(page_size: usize, threshold: usize) -> Self {
        MergePolicy {
            page_size,
            threshold,
        }
    }

    /// Decide what to do with `[addr, addr + len)`.
    ///
    /// `flags` are the `mmap` flags when known; `None` means the primitive
    /// does not expose them and the region is assumed to be private
    /// anonymous memory.
    pub fn evaluate(&self, addr: *mut c_void, len: usize, flags: Option<c_int>) -> Verdict {
        if addr.is_null() || addr == libc::MAP_FAILED {
            return Verdict::Skip(SkipReason::FailedAllocation);
        }

        let raw = addr as usize;
        let start = align_down(raw, self.page_size);
        let len = len.saturating_add(raw - start);

        if len <= self.threshold {
            return Verdict::Skip(SkipReason::BelowThreshold);
        }
        if let Some(flags) = flags {
            if !mergeable_flags(flags) {
                return Verdict::Skip(SkipReason::FlagsFiltered);
            }
        }
        Verdict::Advise(Region { start, len })
    }

    /// Evaluate and, when eligible, advise. Advisory failures are traced and
    /// otherwise ignored.
    ///
    /// # Safety
    /// See [`Advisor::advise_mergeable`].
    pub unsafe fn consider<A: Advisor>(
        &self,
        advisor: &A,
        addr: *mut c_void,
        len: usize,
        flags: Option<c_int>,
    ) -> Verdict {
        let verdict = self.evaluate(addr, len, flags);
        match verdict {
            Verdict::Advise(region) => match advisor.advise_mergeable(region) {
                Ok(()) => trace!("sharing {} bytes from {:#x}", region.len, region.start),
                Err(err) => trace!("{}", err),
            },
            Verdict::Skip(SkipReason::FlagsFiltered) => trace!("not sharing (flags filtered)"),
            Verdict::Skip(_) => {}
        }
        verdict
    }
}

/// Private anonymous memory that is not a stack.
#[inline]
pub fn mergeable_flags(flags: c_int) -> bool {
    let required = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let forbidden = libc::MAP_GROWSDOWN | libc::MAP_STACK;
    flags & required == required && flags & forbidden == 0
}
