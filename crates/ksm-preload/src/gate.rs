//! Run-once gate for the lazy bootstrap.
//!
//! Every interposed call passes through [`InitGate::run_once`], so the ready
//! case is a single acquire load. The slow path serialises initialisers behind
//! an [`ErrorCheckMutex`] and tolerates the initialiser re-entering the gate on
//! its own thread (`dlsym` and `getenv` may allocate).

use crate::sync::ErrorCheckMutex;
use core::sync::atomic::{AtomicBool, Ordering};

/// How a call through the gate was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Initialisation had already completed.
    Ready,
    /// This call ran the initialiser.
    Initialized,
    /// Called from inside the initialiser on the same thread. Whatever state
    /// the initialiser has not yet replaced is still the bootstrap state.
    Reentered,
}

pub struct InitGate {
    ready: AtomicBool,
    lock: ErrorCheckMutex,
}

impl InitGate {
    pub const fn new() -> Self {
        InitGate {
            ready: AtomicBool::new(false),
            lock: ErrorCheckMutex::new(),
        }
    }

    #[inline(always)]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Run `init` unless it has already succeeded.
    ///
    /// Everything `init` writes happens-before any caller that later observes
    /// [`GateState::Ready`]. If `init` fails the gate stays closed and the
    /// error is handed back; the next caller will try again.
    #[inline(always)]
    pub fn run_once<E, F>(&self, init: F) -> Result<GateState, E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        if self.is_ready() {
            return Ok(GateState::Ready);
        }
        self.run_slow(init)
    }

    #[cold]
    #[inline(never)]
    fn run_slow<E, F>(&self, init: F) -> Result<GateState, E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(GateState::Reentered),
        };

        // Another thread may have finished while we waited on the lock.
        if self.ready.load(Ordering::Acquire) {
            return Ok(GateState::Ready);
        }

        init()?;
        self.ready.store(true, Ordering::Release);
        Ok(GateState::Initialized)
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_call_initializes_then_ready() {
        let gate = InitGate::new();
        assert!(!gate.is_ready());
        assert_eq!(gate.run_once(|| Ok::<_, ()>(())), Ok(GateState::Initialized));
        assert!(gate.is_ready());
        assert_eq!(
            gate.run_once(|| -> Result<(), ()> { panic!("initialiser ran twice") }),
            Ok(GateState::Ready)
        );
    }

    #[test]
    fn failed_initializer_leaves_gate_closed() {
        let gate = InitGate::new();
        assert_eq!(gate.run_once(|| Err("missing symbol")), Err("missing symbol"));
        assert!(!gate.is_ready());
        assert_eq!(gate.run_once(|| Ok::<_, &str>(())), Ok(GateState::Initialized));
    }

    #[test]
    fn reentry_from_initializer_does_not_deadlock() {
        let gate = InitGate::new();
        let runs = AtomicUsize::new(0);
        let mut nested = None;

        let outer = gate.run_once(|| {
            runs.fetch_add(1, Ordering::Relaxed);
            nested = Some(gate.run_once(|| {
                runs.fetch_add(1, Ordering::Relaxed);
                Ok::<_, ()>(())
            }));
            Ok::<_, ()>(())
        });

        assert_eq!(outer, Ok(GateState::Initialized));
        assert_eq!(nested, Some(Ok(GateState::Reentered)));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert!(gate.is_ready());
    }

    #[test]
    fn concurrent_first_calls_run_initializer_once() {
        const THREADS: usize = 16;

        struct Shared {
            gate: InitGate,
            runs: AtomicUsize,
            // Written by the initialiser with relaxed ordering; the gate's
            // release/acquire pair must make it visible.
            payload: AtomicUsize,
        }

        let shared = Arc::new(Shared {
            gate: InitGate::new(),
            runs: AtomicUsize::new(0),
            payload: AtomicUsize::new(0),
        });
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let state = shared
                        .gate
                        .run_once(|| {
                            shared.runs.fetch_add(1, Ordering::Relaxed);
                            thread::sleep(Duration::from_millis(10));
                            shared.payload.store(0xC0FFEE, Ordering::Relaxed);
                            Ok::<_, ()>(())
                        })
                        .unwrap();
                    assert_ne!(state, GateState::Reentered);
                    assert_eq!(shared.payload.load(Ordering::Relaxed), 0xC0FFEE);
                    state
                })
            })
            .collect();

        let initialized = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked at the gate"))
            .filter(|s| *s == GateState::Initialized)
            .count();

        assert_eq!(initialized, 1);
        assert_eq!(shared.runs.load(Ordering::Relaxed), 1);
    }
}
