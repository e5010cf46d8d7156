use crate::platform;
use core::sync::atomic::{AtomicI32, Ordering};

/// A simple futex-based mutex.
/// We cannot use std::sync::Mutex: it is reachable from inside `malloc`, and
/// the lock must be usable before the real allocator has been resolved.
pub struct RawMutex {
    /// 0 = unlocked, 1 = locked no waiters, 2 = locked with waiters
    state: AtomicI32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        // Fast path: uncontended
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            let old = self.state.swap(2, Ordering::Acquire);
            if old == 0 {
                return;
            }
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    2i32,
                    core::ptr::null::<libc::timespec>(),
                );
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        let old = self.state.fetch_sub(1, Ordering::Release);
        if old != 1 {
            // There were waiters
            self.state.store(0, Ordering::Release);
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned when a thread tries to take an [`ErrorCheckMutex`] it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldDeadlock;

/// A mutex that reports same-thread re-entry instead of deadlocking,
/// like a `PTHREAD_MUTEX_ERRORCHECK` mutex returning `EDEADLK`.
pub struct ErrorCheckMutex {
    raw: RawMutex,
    /// Kernel tid of the holder, 0 when unlocked.
    owner: AtomicI32,
}

impl ErrorCheckMutex {
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::new(),
            owner: AtomicI32::new(0),
        }
    }

    pub fn lock(&self) -> Result<ErrorCheckGuard<'_>, WouldDeadlock> {
        let me = platform::thread_id();
        // Only this thread ever stores `me`, so a relaxed load is enough to
        // recognise our own hold.
        if self.owner.load(Ordering::Relaxed) == me {
            return Err(WouldDeadlock);
        }
        self.raw.lock();
        self.owner.store(me, Ordering::Relaxed);
        Ok(ErrorCheckGuard { mutex: self })
    }
}

impl Default for ErrorCheckMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ErrorCheckGuard<'a> {
    mutex: &'a ErrorCheckMutex,
}

impl Drop for ErrorCheckGuard<'_> {
    fn drop(&mut self) {
        self.mutex.owner.store(0, Ordering::Relaxed);
        self.mutex.raw.unlock();
    }
}
