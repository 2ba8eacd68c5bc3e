//! Scheduler policy: per-CPU state, priority scan, work stealing.
//!
//! Every CPU owns a [`SchedulerState`] with one ready deque per priority
//! class. The owning CPU pushes and pops; idle CPUs steal from the head.
//! The tick decision ([`Scheduler::tick`]) is pure policy — it returns a
//! [`SwitchPlan`] and the kernel's interrupt path performs the actual
//! context save/restore and CR3 switch.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::sync::Arc;
use hashbrown::HashMap;
use meson_core::sync::{LazyLock, SpinLock};

use crate::SchedError;
use crate::context::MachineContext;
use crate::deque::WorkDeque;
use crate::pid::{Pid, PidBitmap};
use crate::task::{
    Credentials, PRIORITY_COUNT, PRIORITY_DEFAULT, Process, Thread, ThreadStatus,
};

/// Sentinel for "no pid/tid" in the atomic current-thread slots.
const NONE: u64 = u64::MAX;

/// Per-CPU scheduler state.
pub struct SchedulerState {
    /// One work-stealing deque per priority class, highest index =
    /// highest priority.
    pub ready_queues: [WorkDeque<Pid>; PRIORITY_COUNT],
    current_process: AtomicU64,
    current_thread: AtomicU64,
    idle_thread: AtomicU64,
}

impl SchedulerState {
    /// Creates an empty per-CPU state.
    pub fn new() -> Self {
        Self {
            ready_queues: core::array::from_fn(|_| WorkDeque::new()),
            current_process: AtomicU64::new(NONE),
            current_thread: AtomicU64::new(NONE),
            idle_thread: AtomicU64::new(NONE),
        }
    }

    /// The thread currently running on this CPU, if any.
    pub fn current_thread(&self) -> Option<Pid> {
        match self.current_thread.load(Ordering::Acquire) {
            NONE => None,
            tid => Some(tid as Pid),
        }
    }

    /// The process currently running on this CPU, if any.
    pub fn current_process(&self) -> Option<Pid> {
        match self.current_process.load(Ordering::Acquire) {
            NONE => None,
            pid => Some(pid as Pid),
        }
    }

    /// Records this CPU's idle thread.
    pub fn set_idle_thread(&self, tid: Pid) {
        self.idle_thread.store(u64::from(tid), Ordering::Release);
    }

    /// This CPU's idle thread, if registered.
    pub fn idle_thread(&self) -> Option<Pid> {
        match self.idle_thread.load(Ordering::Acquire) {
            NONE => None,
            tid => Some(tid as Pid),
        }
    }

    fn set_current(&self, pid: Pid, tid: Pid) {
        self.current_process.store(u64::from(pid), Ordering::Release);
        self.current_thread.store(u64::from(tid), Ordering::Release);
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the architecture must produce for a fresh thread.
pub struct NewContext {
    /// Initial register image (entry point, argument, flags, selectors,
    /// stack pointer already set).
    pub context: MachineContext,
    /// Top of the allocated kernel stack.
    pub kernel_stack: u64,
    /// Top of the allocated user stack (0 for kernel threads).
    pub user_stack: u64,
    /// Fresh page-table root when one was requested, else 0.
    pub page_tables: u64,
}

/// Architecture hook used by [`Scheduler::thread_create`].
pub trait ArchContext {
    /// Allocates stacks (and page tables when `new_address_space`) and
    /// builds the initial register image for a thread entering at
    /// `entry` with `arg` in the first argument register.
    fn create_context(
        &mut self,
        user: bool,
        entry: u64,
        arg: u64,
        new_address_space: bool,
    ) -> Option<NewContext>;
}

/// Outcome of a tick: what the interrupt path must switch to.
pub struct SwitchPlan {
    /// Outgoing thread whose context must be saved, if one was running
    /// and survives.
    pub prev: Option<Arc<Thread>>,
    /// Incoming thread whose context must be restored.
    pub next: Arc<Thread>,
    /// Page-table root of the incoming process.
    pub page_tables: u64,
}

/// The global scheduler: PID space, process/thread tables, tick policy.
pub struct Scheduler {
    enabled: AtomicBool,
    pids: PidBitmap,
    processes: SpinLock<HashMap<Pid, Arc<Process>>>,
    threads: SpinLock<HashMap<Pid, Arc<Thread>>>,
    kernel_pid: AtomicU64,
}

/// The global scheduler instance.
pub static SCHEDULER: LazyLock<Scheduler> = LazyLock::new(Scheduler::new);

impl Scheduler {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            pids: PidBitmap::new(),
            processes: SpinLock::new(HashMap::new()),
            threads: SpinLock::new(HashMap::new()),
            kernel_pid: AtomicU64::new(NONE),
        }
    }

    /// Creates the kernel process and enables scheduling. Returns the
    /// kernel PID.
    pub fn init(&self) -> Result<Pid, SchedError> {
        let pid = self.process_create(None)?;
        self.kernel_pid.store(u64::from(pid), Ordering::Release);
        self.start();
        Ok(pid)
    }

    /// The kernel process PID, once [`init`](Self::init) has run.
    pub fn kernel_pid(&self) -> Option<Pid> {
        match self.kernel_pid.load(Ordering::Acquire) {
            NONE => None,
            pid => Some(pid as Pid),
        }
    }

    /// Enables preemption.
    pub fn start(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Disables preemption; ticks become no-ops.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Whether ticks currently schedule.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Creates a process, cloning credentials from `parent` (zeroed for
    /// the kernel-init process).
    pub fn process_create(&self, parent: Option<Pid>) -> Result<Pid, SchedError> {
        let pid = self.pids.allocate().ok_or(SchedError::PidExhausted)?;

        let mut processes = self.processes.lock();
        let creds = parent
            .and_then(|p| processes.get(&p))
            .map(|p| p.creds)
            .unwrap_or(Credentials::default());

        let process = Arc::new(Process::new(pid, creds, parent));
        if let Some(parent_process) = parent.and_then(|p| processes.get(&p)) {
            parent_process.children.lock().push(pid);
        }
        processes.insert(pid, process);
        Ok(pid)
    }

    /// Looks up a process.
    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes.lock().get(&pid).cloned()
    }

    /// Looks up a thread.
    pub fn thread(&self, tid: Pid) -> Option<Arc<Thread>> {
        self.threads.lock().get(&tid).cloned()
    }

    /// Creates a thread in `pid`, entering at `entry` with `arg`.
    ///
    /// The first thread of a process inherits the process PID as its tid
    /// and triggers address-space creation through `arch`. The thread is
    /// queued on the *calling* CPU's deque for the process priority;
    /// other CPUs acquire it by stealing.
    pub fn thread_create(
        &self,
        pid: Pid,
        user: bool,
        entry: u64,
        arg: u64,
        arch: &mut impl ArchContext,
        cpu: &SchedulerState,
    ) -> Result<Pid, SchedError> {
        if entry == 0 {
            return Err(SchedError::InvalidArgument);
        }
        let process = self.process(pid).ok_or(SchedError::NotFound)?;

        let first_thread = process.threads.lock().is_empty();
        let tid = if first_thread {
            pid
        } else {
            self.pids.allocate().ok_or(SchedError::PidExhausted)?
        };

        let new_address_space = process.page_tables.load(Ordering::Acquire) == 0;
        let Some(new_context) = arch.create_context(user, entry, arg, new_address_space) else {
            if !first_thread {
                self.pids.release(tid);
            }
            return Err(SchedError::OutOfMemory);
        };
        if new_address_space && new_context.page_tables != 0 {
            process
                .page_tables
                .store(new_context.page_tables, Ordering::Release);
        }

        let thread = Arc::new(Thread::new(
            tid,
            pid,
            new_context.context,
            new_context.kernel_stack,
            new_context.user_stack,
        ));

        process.threads.lock().push(tid);
        self.threads.lock().insert(tid, Arc::clone(&thread));

        // SAFETY: `cpu` is the calling CPU's own state, so we are its
        // deque owner.
        unsafe {
            cpu.ready_queues[process.priority()].push(tid);
        }
        Ok(tid)
    }

    /// Marks a thread terminated; the scheduler drops it the next time a
    /// tick encounters it.
    pub fn thread_exit(&self, tid: Pid) -> Result<(), SchedError> {
        let thread = self.thread(tid).ok_or(SchedError::NotFound)?;
        thread.set_status(ThreadStatus::Terminated);
        Ok(())
    }

    /// Takes the next runnable thread from `state`'s deques, scanning
    /// priorities high to low. Terminated and blocked threads found in a
    /// queue are discarded on the way.
    pub fn find_next_thread(&self, state: &SchedulerState) -> Option<Arc<Thread>> {
        for priority in (0..PRIORITY_COUNT).rev() {
            while let Some(tid) = state.ready_queues[priority].steal() {
                let Some(thread) = self.thread(tid) else {
                    continue;
                };
                match thread.status() {
                    ThreadStatus::Terminated => {
                        self.reap(&thread);
                    }
                    ThreadStatus::Blocked => {}
                    _ => return Some(thread),
                }
            }
        }
        None
    }

    /// One scheduling decision for the CPU owning `local`.
    ///
    /// Scans the local queues first, then steals from the other CPUs.
    /// Returns `None` when scheduling is disabled or no other work exists
    /// (the CPU stays on its current thread).
    pub fn tick(
        &self,
        local: &SchedulerState,
        all: &[&SchedulerState],
        local_index: usize,
    ) -> Option<SwitchPlan> {
        if !self.is_enabled() {
            return None;
        }

        let next = self.find_next_thread(local).or_else(|| {
            all.iter()
                .enumerate()
                .filter(|(i, _)| *i != local_index)
                .find_map(|(_, other)| self.find_next_thread(other))
        })?;

        let prev = local.current_thread().and_then(|tid| self.thread(tid));
        local.set_current(next.process, next.tid);
        next.set_status(ThreadStatus::Running);

        let prev = match prev {
            Some(prev) if prev.status() == ThreadStatus::Terminated => {
                self.reap(&prev);
                None
            }
            Some(prev) => {
                prev.set_status(ThreadStatus::Ready);
                // SAFETY: `local` belongs to the calling CPU.
                unsafe {
                    local.ready_queues[PRIORITY_DEFAULT].push(prev.tid);
                }
                Some(prev)
            }
            None => None,
        };

        let page_tables = self
            .process(next.process)
            .map(|p| p.page_tables.load(Ordering::Acquire))
            .unwrap_or(0);

        Some(SwitchPlan {
            prev,
            next,
            page_tables,
        })
    }

    /// Drops a terminated thread: forgets it and frees its tid (unless it
    /// is the process's identity tid, which the process keeps).
    fn reap(&self, thread: &Arc<Thread>) {
        self.threads.lock().remove(&thread.tid);
        if let Some(process) = self.process(thread.process) {
            process.threads.lock().retain(|&t| t != thread.tid);
        }
        if thread.tid != thread.process {
            self.pids.release(thread.tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::INITIAL_RFLAGS;

    /// Architecture stand-in: fakes stacks, page tables, and the initial
    /// register image.
    struct FakeArch {
        next_stack: u64,
        next_tables: u64,
    }

    impl FakeArch {
        fn new() -> Self {
            Self {
                next_stack: 0xFFFF_9000_0010_0000,
                next_tables: 0x5000,
            }
        }
    }

    impl ArchContext for FakeArch {
        fn create_context(
            &mut self,
            user: bool,
            entry: u64,
            arg: u64,
            new_address_space: bool,
        ) -> Option<NewContext> {
            self.next_stack += 0x1_0000;
            let kernel_stack = self.next_stack;
            let user_stack = if user { kernel_stack + 0x8000 } else { 0 };
            let page_tables = if new_address_space {
                self.next_tables += 0x1000;
                self.next_tables
            } else {
                0
            };
            Some(NewContext {
                context: MachineContext {
                    rip: entry,
                    rdi: arg,
                    rflags: INITIAL_RFLAGS,
                    rsp: if user { user_stack } else { kernel_stack },
                    ..Default::default()
                },
                kernel_stack,
                user_stack,
                page_tables,
            })
        }
    }

    /// Failing architecture stand-in.
    struct BrokenArch;

    impl ArchContext for BrokenArch {
        fn create_context(&mut self, _: bool, _: u64, _: u64, _: bool) -> Option<NewContext> {
            None
        }
    }

    fn fresh() -> Scheduler {
        let scheduler = Scheduler::new();
        scheduler.start();
        scheduler
    }

    #[test]
    fn kernel_init_creates_process_zero() {
        let scheduler = Scheduler::new();
        let pid = scheduler.init().unwrap();
        assert_eq!(pid, 0);
        assert_eq!(scheduler.kernel_pid(), Some(0));
        assert!(scheduler.is_enabled());
    }

    #[test]
    fn child_inherits_credentials_and_links() {
        let scheduler = fresh();
        let parent = scheduler.process_create(None).unwrap();
        scheduler.process(parent).unwrap();

        let child = scheduler.process_create(Some(parent)).unwrap();
        let child_process = scheduler.process(child).unwrap();
        assert_eq!(child_process.parent, Some(parent));
        assert_eq!(child_process.creds, Credentials::default());
        assert!(
            scheduler
                .process(parent)
                .unwrap()
                .children
                .lock()
                .contains(&child)
        );
    }

    #[test]
    fn first_thread_shares_pid_as_tid() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();

        let pid = scheduler.process_create(None).unwrap();
        let tid0 = scheduler
            .thread_create(pid, false, 0x1000, 7, &mut arch, &cpu)
            .unwrap();
        assert_eq!(tid0, pid);

        let tid1 = scheduler
            .thread_create(pid, false, 0x2000, 8, &mut arch, &cpu)
            .unwrap();
        assert_ne!(tid1, pid);
    }

    #[test]
    fn first_thread_allocates_the_address_space_once() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();

        let pid = scheduler.process_create(None).unwrap();
        scheduler
            .thread_create(pid, true, 0x1000, 0, &mut arch, &cpu)
            .unwrap();
        let tables = scheduler
            .process(pid)
            .unwrap()
            .page_tables
            .load(Ordering::Acquire);
        assert_ne!(tables, 0);

        scheduler
            .thread_create(pid, true, 0x2000, 0, &mut arch, &cpu)
            .unwrap();
        let tables_after = scheduler
            .process(pid)
            .unwrap()
            .page_tables
            .load(Ordering::Acquire);
        assert_eq!(tables, tables_after, "address space must be created once");
    }

    #[test]
    fn thread_context_carries_entry_and_argument() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();

        let pid = scheduler.process_create(None).unwrap();
        let tid = scheduler
            .thread_create(pid, false, 0xCAFE_0000, 42, &mut arch, &cpu)
            .unwrap();
        let thread = scheduler.thread(tid).unwrap();
        let context = thread.context.lock();
        assert_eq!(context.rip, 0xCAFE_0000);
        assert_eq!(context.rdi, 42);
        assert_eq!(context.rflags, INITIAL_RFLAGS);
    }

    #[test]
    fn null_entry_rejected() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();
        let pid = scheduler.process_create(None).unwrap();
        assert_eq!(
            scheduler.thread_create(pid, false, 0, 0, &mut arch, &cpu),
            Err(SchedError::InvalidArgument)
        );
    }

    #[test]
    fn arch_failure_is_out_of_memory() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let pid = scheduler.process_create(None).unwrap();
        assert_eq!(
            scheduler.thread_create(pid, false, 0x1000, 0, &mut BrokenArch, &cpu),
            Err(SchedError::OutOfMemory)
        );
    }

    #[test]
    fn tick_prefers_higher_priority() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();

        let low = scheduler.process_create(None).unwrap();
        scheduler
            .process(low)
            .unwrap()
            .priority
            .store(1, Ordering::Relaxed);
        let high = scheduler.process_create(None).unwrap();
        scheduler
            .process(high)
            .unwrap()
            .priority
            .store(5, Ordering::Relaxed);

        let low_tid = scheduler
            .thread_create(low, false, 0x1000, 0, &mut arch, &cpu)
            .unwrap();
        let high_tid = scheduler
            .thread_create(high, false, 0x1000, 0, &mut arch, &cpu)
            .unwrap();

        let all = [&cpu];
        let plan = scheduler.tick(&cpu, &all, 0).unwrap();
        assert_eq!(plan.next.tid, high_tid);
        let plan = scheduler.tick(&cpu, &all, 0).unwrap();
        assert_eq!(plan.next.tid, low_tid);
    }

    #[test]
    fn tick_requeues_preempted_thread() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();

        let pid = scheduler.process_create(None).unwrap();
        let a = scheduler
            .thread_create(pid, false, 0x1000, 0, &mut arch, &cpu)
            .unwrap();
        let b = scheduler
            .thread_create(pid, false, 0x1000, 0, &mut arch, &cpu)
            .unwrap();

        let all = [&cpu];
        let plan = scheduler.tick(&cpu, &all, 0).unwrap();
        assert_eq!(plan.next.tid, a);
        assert!(plan.prev.is_none());

        // Second tick: b runs, a goes back to the default queue.
        let plan = scheduler.tick(&cpu, &all, 0).unwrap();
        assert_eq!(plan.next.tid, b);
        assert_eq!(plan.prev.as_ref().unwrap().tid, a);
        assert_eq!(
            scheduler.thread(a).unwrap().status(),
            ThreadStatus::Ready
        );

        // Third tick: a comes back around.
        let plan = scheduler.tick(&cpu, &all, 0).unwrap();
        assert_eq!(plan.next.tid, a);
    }

    #[test]
    fn tick_steals_from_other_cpu() {
        let scheduler = fresh();
        let cpu0 = SchedulerState::new();
        let cpu1 = SchedulerState::new();
        let mut arch = FakeArch::new();

        let pid = scheduler.process_create(None).unwrap();
        // Thread queued on CPU 0.
        let tid = scheduler
            .thread_create(pid, false, 0x1000, 0, &mut arch, &cpu0)
            .unwrap();

        // CPU 1 has nothing locally and must steal it.
        let all = [&cpu0, &cpu1];
        let plan = scheduler.tick(&cpu1, &all, 1).unwrap();
        assert_eq!(plan.next.tid, tid);
        assert_eq!(plan.page_tables, 0x6000);
    }

    #[test]
    fn tick_disabled_is_noop() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();
        let pid = scheduler.process_create(None).unwrap();
        scheduler
            .thread_create(pid, false, 0x1000, 0, &mut arch, &cpu)
            .unwrap();

        scheduler.stop();
        let all = [&cpu];
        assert!(scheduler.tick(&cpu, &all, 0).is_none());
    }

    #[test]
    fn terminated_threads_are_reaped_not_run() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let mut arch = FakeArch::new();

        let pid = scheduler.process_create(None).unwrap();
        let a = scheduler
            .thread_create(pid, false, 0x1000, 0, &mut arch, &cpu)
            .unwrap();
        let b = scheduler
            .thread_create(pid, false, 0x1000, 0, &mut arch, &cpu)
            .unwrap();

        scheduler.thread_exit(a).unwrap();

        let all = [&cpu];
        let plan = scheduler.tick(&cpu, &all, 0).unwrap();
        assert_eq!(plan.next.tid, b, "terminated thread must be skipped");
        assert!(scheduler.thread(a).is_none(), "terminated thread reaped");
    }

    #[test]
    fn empty_queues_keep_current_thread() {
        let scheduler = fresh();
        let cpu = SchedulerState::new();
        let all = [&cpu];
        assert!(scheduler.tick(&cpu, &all, 0).is_none());
    }
}
