//! Preloadable shim that asks the kernel to deduplicate large allocations.
//!
//! Loaded with `LD_PRELOAD=libksm_preload.so`, the library shadows `calloc`,
//! `malloc`, `mmap`, `mremap` and `realloc`. Each call is forwarded to the
//! implementation the process would otherwise have used, and regions larger
//! than `KSMP_MERGE_THRESHOLD` bytes are then marked `MADV_MERGEABLE` so KSM
//! can share identical pages between processes.

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("ksm-preload only supports Linux with glibc");

extern crate libc;

#[macro_use]
pub mod diag;

pub mod allocator;
pub mod api;
pub mod config;
pub mod gate;
pub mod init;
pub mod platform;
pub mod policy;
pub mod sync;
pub mod util;
