//! Process and thread model.

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use alloc::vec::Vec;
use meson_core::sync::SpinLock;

use crate::context::MachineContext;
use crate::pid::Pid;

/// Lowest priority class.
pub const PRIORITY_MIN: usize = 0;
/// Highest priority class.
pub const PRIORITY_MAX: usize = 5;
/// Number of priority classes.
pub const PRIORITY_COUNT: usize = PRIORITY_MAX - PRIORITY_MIN + 1;
/// Priority assigned to new processes.
pub const PRIORITY_DEFAULT: usize = PRIORITY_COUNT / 2;

/// POSIX-style credential set, cloned from the parent at process creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Real user id.
    pub uid: u32,
    /// Real group id.
    pub gid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Saved user id.
    pub suid: u32,
    /// Effective group id.
    pub egid: u32,
    /// Saved group id.
    pub sgid: u32,
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Queued on a ready deque.
    Ready = 1,
    /// Currently on a CPU.
    Running = 2,
    /// Parked by a caller; not schedulable.
    Blocked = 3,
    /// Dead; dropped by the scheduler on next sight.
    Terminated = 4,
}

impl ThreadStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Terminated,
            _ => Self::Ready,
        }
    }
}

/// A process: credential and address-space container for threads.
pub struct Process {
    /// Process id. The first thread shares it as its tid.
    pub pid: Pid,
    /// Credentials cloned from the parent.
    pub creds: Credentials,
    /// Priority class (0..=5).
    pub priority: AtomicU8,
    /// Physical address of the page-table root; 0 until the first thread
    /// allocates the address space.
    pub page_tables: AtomicU64,
    /// Parent process, if any.
    pub parent: Option<Pid>,
    /// Child process ids.
    pub children: SpinLock<Vec<Pid>>,
    /// Thread ids belonging to this process.
    pub threads: SpinLock<Vec<Pid>>,
}

impl Process {
    /// Creates a process shell with no threads.
    pub fn new(pid: Pid, creds: Credentials, parent: Option<Pid>) -> Self {
        Self {
            pid,
            creds,
            priority: AtomicU8::new(PRIORITY_DEFAULT as u8),
            page_tables: AtomicU64::new(0),
            parent,
            children: SpinLock::new(Vec::new()),
            threads: SpinLock::new(Vec::new()),
        }
    }

    /// Current priority class.
    pub fn priority(&self) -> usize {
        (self.priority.load(Ordering::Relaxed) as usize).min(PRIORITY_MAX)
    }
}

/// A thread: schedulable register image plus its stacks.
pub struct Thread {
    /// Thread id.
    pub tid: Pid,
    /// Owning process.
    pub process: Pid,
    status: AtomicU8,
    /// Saved register image; written at preemption, read at resume.
    pub context: SpinLock<MachineContext>,
    /// Top of the kernel stack.
    pub kernel_stack: u64,
    /// Top of the user stack (0 for kernel threads).
    pub user_stack: u64,
}

impl Thread {
    /// Creates a thread in the ready state.
    pub fn new(
        tid: Pid,
        process: Pid,
        context: MachineContext,
        kernel_stack: u64,
        user_stack: u64,
    ) -> Self {
        Self {
            tid,
            process,
            status: AtomicU8::new(ThreadStatus::Ready as u8),
            context: SpinLock::new(context),
            kernel_stack,
            user_stack,
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Transitions the lifecycle state.
    pub fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}
