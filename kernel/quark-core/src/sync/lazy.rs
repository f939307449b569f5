//! Lazy one-shot initialization for `no_std` statics.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
/// The init closure panicked. Only observable where panics unwind (host
/// tests); the kernel target aborts on the first panic.
const POISONED: u8 = 3;

/// A value initialized on first access via an atomic state machine.
///
/// When several CPUs race to the first access, one runs the initializer and
/// the rest spin until the value is ready.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The state machine guarantees the value is fully written before any
// reader observes READY, and that the init closure runs exactly once.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

/// Marks the lock poisoned if initialization unwinds.
struct InitGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.state.store(POISONED, Ordering::Release);
    }
}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new `LazyLock` with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: UnsafeCell::new(Some(init)),
        }
    }

    fn force(&self) -> &T {
        match self.state.load(Ordering::Acquire) {
            READY => {
                // SAFETY: READY means the value is initialized.
                return unsafe { (*self.value.get()).assume_init_ref() };
            }
            POISONED => panic!("LazyLock poisoned: initializer panicked"),
            UNINIT => {
                if self
                    .state
                    .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    let guard = InitGuard { state: &self.state };
                    // SAFETY: We hold the INITIALIZING state exclusively.
                    let init = unsafe { (*self.init.get()).take().unwrap() };
                    let value = init();
                    // SAFETY: Still the exclusive initializer.
                    unsafe { (*self.value.get()).write(value) };
                    self.state.store(READY, Ordering::Release);
                    core::mem::forget(guard);
                    // SAFETY: We just wrote the value.
                    return unsafe { (*self.value.get()).assume_init_ref() };
                }
            }
            _ => {}
        }

        // Another CPU is initializing; wait for it.
        loop {
            match self.state.load(Ordering::Acquire) {
                READY => break,
                POISONED => panic!("LazyLock poisoned: initializer panicked"),
                _ => core::hint::spin_loop(),
            }
        }
        // SAFETY: State is READY.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn value_on_first_deref() {
        let lazy = LazyLock::new(|| 11);
        assert_eq!(*lazy, 11);
    }

    #[test]
    fn initializer_runs_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let lazy = LazyLock::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            3
        });
        assert_eq!(*lazy, 3);
        assert_eq!(*lazy, 3);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
