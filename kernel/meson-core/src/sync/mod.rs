//! Spin-based synchronization primitives.

mod lazy;
mod once;
mod spinlock;

pub use lazy::LazyLock;
pub use once::OnceLock;
pub use spinlock::{SpinLock, SpinLockGuard};
