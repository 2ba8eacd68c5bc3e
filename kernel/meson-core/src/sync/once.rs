//! Write-once cell for boot-time globals.
//!
//! [`OnceLock`] is the explicit-initialization sibling of
//! [`LazyLock`](super::LazyLock): the value is provided by a `set` call
//! during boot (e.g. the PMM after parsing the memory map) rather than by a
//! closure at the definition site.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A cell that can be written exactly once and read lock-free afterwards.
pub struct OnceLock<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The state machine publishes the value with Release/Acquire
// ordering; after READY all access is shared and immutable.
unsafe impl<T: Send + Sync> Send for OnceLock<T> {}
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> OnceLock<T> {
    /// Creates an empty `OnceLock`.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores `value`, failing if the cell was already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // SAFETY: We won the INITIALIZING transition, so no other writer or
        // reader touches the slot until READY is published.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Returns the value, or `None` if the cell has not been set yet.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY means the value was fully written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Returns the value, panicking if the cell has not been set.
    #[inline]
    #[track_caller]
    pub fn get_unchecked_init(&self) -> &T {
        self.get().expect("OnceLock read before initialization")
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}
