//! The process-wide settings record and its lazy bootstrap.
//!
//! Settings start out pointing at glibc's internal allocator with a 4 KiB page
//! and the default threshold. The first interposed call resolves the real
//! primitives and reads the environment, then publishes the whole record at
//! once through the gate.

use crate::allocator::{NextInSearchOrder, RealFunctions, ResolveError, SymbolSource};
use crate::config::{self, DEFAULT_MERGE_THRESHOLD};
use crate::diag;
use crate::gate::{GateState, InitGate};
use crate::platform;
use crate::policy::MergePolicy;
use crate::util::FALLBACK_PAGE_SIZE;
use core::cell::UnsafeCell;

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub real: RealFunctions,
    /// Always a power of two.
    pub page_size: usize,
    pub merge_threshold: usize,
}

impl Settings {
    pub const fn bootstrap() -> Self {
        Settings {
            real: RealFunctions::bootstrap(),
            page_size: FALLBACK_PAGE_SIZE,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
        }
    }

    pub fn policy(&self) -> MergePolicy {
        MergePolicy::new(self.page_size, self.merge_threshold)
    }
}

/// Build a complete record: real primitives from `symbols`, the page size
/// from `sysconf`, the threshold from the environment.
///
/// # Safety
/// Reads the environment with `getenv`.
pub unsafe fn resolve<S: SymbolSource>(symbols: &S) -> Result<Settings, ResolveError> {
    let real = RealFunctions::resolve(symbols)?;
    let page_size = platform::page_size();
    let merge_threshold = config::read_merge_threshold();
    Ok(Settings {
        real,
        page_size,
        merge_threshold,
    })
}

struct SettingsHolder(UnsafeCell<Settings>);
// Written once, by the thread holding the gate, before `ready` is released.
unsafe impl Sync for SettingsHolder {}

static SETTINGS: SettingsHolder = SettingsHolder(UnsafeCell::new(Settings::bootstrap()));
static GATE: InitGate = InitGate::new();

/// Make sure the settings record has been populated.
///
/// Aborts the process if a real primitive is missing: there is nothing safe
/// to forward to.
#[inline(always)]
pub fn ensure_ready() {
    if GATE.is_ready() {
        return;
    }
    if let Err(err) = try_ensure_ready() {
        match platform::dl_error() {
            Some(detail) => diag::fatal(format_args!(
                "{} : {}",
                err,
                detail.to_str().unwrap_or("dlerror text is not UTF-8")
            )),
            None => diag::fatal(format_args!("{}", err)),
        }
    }
}

/// Fallible form of [`ensure_ready`], for callers that want to decide how to
/// shut down.
#[cold]
pub fn try_ensure_ready() -> Result<GateState, ResolveError> {
    GATE.run_once(|| {
        // Resolved into a local first: a re-entrant call made by `dlsym` or
        // `getenv` must keep seeing the complete bootstrap record.
        let settings = unsafe { resolve(&NextInSearchOrder)? };
        unsafe { *SETTINGS.0.get() = settings };
        trace!("setup done");
        Ok(())
    })
}

pub fn is_ready() -> bool {
    GATE.is_ready()
}

/// Current settings, initialising first if needed.
///
/// During a re-entrant call from inside initialisation this is the bootstrap
/// record.
#[inline(always)]
pub fn settings() -> Settings {
    ensure_ready();
    unsafe { *SETTINGS.0.get() }
}
