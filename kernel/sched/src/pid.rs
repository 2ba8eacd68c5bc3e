//! Global PID allocation.
//!
//! PIDs come from a fixed bitmap of [`MAX_PROCESSES`] bits claimed with
//! 64-bit CAS, so allocation needs no lock and a released PID is
//! immediately reusable. Thread IDs share the same space (the first thread
//! of a process reuses the process PID).

use core::sync::atomic::{AtomicU64, Ordering};

/// Size of the PID space.
pub const MAX_PROCESSES: usize = 65536;

/// A process or thread identifier.
pub type Pid = u32;

const WORDS: usize = MAX_PROCESSES / 64;

/// CAS-claimed PID bitmap.
pub struct PidBitmap {
    words: [AtomicU64; WORDS],
}

impl PidBitmap {
    /// Creates an empty bitmap.
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            words: [ZERO; WORDS],
        }
    }

    /// Claims the lowest free PID, or `None` when the space is exhausted.
    pub fn allocate(&self) -> Option<Pid> {
        for (index, word) in self.words.iter().enumerate() {
            loop {
                let old = word.load(Ordering::Acquire);
                if old == u64::MAX {
                    break;
                }
                let bit = (!old).trailing_zeros();
                let mask = 1u64 << bit;
                if word
                    .compare_exchange(old, old | mask, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some((index as u32) * 64 + bit);
                }
                // Lost the race for this word; rescan it.
            }
        }
        None
    }

    /// Returns a PID to the pool.
    pub fn release(&self, pid: Pid) {
        let index = (pid / 64) as usize;
        let mask = 1u64 << (pid % 64);
        debug_assert!(index < WORDS, "PID {pid} out of range");
        let old = self.words[index].fetch_and(!mask, Ordering::AcqRel);
        debug_assert!(old & mask != 0, "release of unallocated PID {pid}");
    }

    /// Returns whether `pid` is currently claimed.
    pub fn is_allocated(&self, pid: Pid) -> bool {
        let index = (pid / 64) as usize;
        if index >= WORDS {
            return false;
        }
        self.words[index].load(Ordering::Acquire) & (1u64 << (pid % 64)) != 0
    }
}

impl Default for PidBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_zero_upward() {
        let pids = PidBitmap::new();
        assert_eq!(pids.allocate(), Some(0));
        assert_eq!(pids.allocate(), Some(1));
        assert_eq!(pids.allocate(), Some(2));
    }

    #[test]
    fn released_pid_is_lowest_again() {
        let pids = PidBitmap::new();
        for _ in 0..10 {
            pids.allocate().unwrap();
        }
        pids.release(4);
        assert_eq!(pids.allocate(), Some(4));
    }

    #[test]
    fn tracks_allocation_state() {
        let pids = PidBitmap::new();
        let pid = pids.allocate().unwrap();
        assert!(pids.is_allocated(pid));
        pids.release(pid);
        assert!(!pids.is_allocated(pid));
    }

    #[test]
    fn concurrent_allocations_unique() {
        use std::collections::HashSet;

        let pids = PidBitmap::new();
        let mut all = Vec::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..1000)
                            .map(|_| pids.allocate().unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                all.extend(handle.join().unwrap());
            }
        });
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), 4000);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pids = PidBitmap::new();
        for _ in 0..MAX_PROCESSES {
            assert!(pids.allocate().is_some());
        }
        assert_eq!(pids.allocate(), None);
    }
}
