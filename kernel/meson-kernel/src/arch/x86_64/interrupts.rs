//! Interrupt entry stubs and handlers.
//!
//! The LAPIC-timer entry is the only classified stub: it checks the
//! interrupted privilege level and runs `swapgs` exactly on ring-3
//! transitions, builds a [`MachineContext`] on the stack, and hands it to
//! the tick handler — which may rewrite it in place to effect a context
//! switch before `iretq`. The page-fault stub routes through the VMM;
//! every other exception is fatal.

use meson_core::addr::VirtAddr;
use meson_core::kpanic_msg;
use meson_sched::context::MachineContext;
use meson_sched::scheduler::{SCHEDULER, SchedulerState};

use super::instructions;
use crate::percpu::{self, MAX_CPUS};
use crate::vas;

// ---------------------------------------------------------------------------
// LAPIC timer
// ---------------------------------------------------------------------------

/// Naked LAPIC-timer entry (vector 0xFE).
#[unsafe(naked)]
pub unsafe extern "C" fn lapic_timer_stub() {
    core::arch::naked_asm!(
        // CS sits at [rsp+8]; RPL != 0 means we interrupted ring 3.
        "test qword ptr [rsp + 8], 3",
        "jz 2f",
        "swapgs",
        "2:",
        // Build a MachineContext: rax lands just below the interrupt
        // frame, r15 at the new stack top.
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {tick}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "test qword ptr [rsp + 8], 3",
        "jz 3f",
        "swapgs",
        "3:",
        "iretq",
        tick = sym timer_tick,
    );
}

/// The tick handler: bumps this CPU's tick counter, runs one scheduling
/// decision, performs the context switch by rewriting the saved frame,
/// and acknowledges the interrupt.
extern "C" fn timer_tick(context: *mut MachineContext) {
    crate::log::bump_ticks();
    let cpu = percpu::current_cpu();
    cpu.lapic
        .timer_ticks
        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    let count = (percpu::cpu_count() as usize).min(MAX_CPUS);
    let states: [&SchedulerState; MAX_CPUS] = core::array::from_fn(|i| {
        percpu::cpu_info(i).map(|c| &c.sched).unwrap_or(&cpu.sched)
    });

    if let Some(plan) = SCHEDULER.tick(&cpu.sched, &states[..count], cpu.index as usize) {
        // SAFETY: `context` points at the register image the stub built on
        // this CPU's stack; we own it until iretq.
        unsafe {
            if let Some(prev) = &plan.prev {
                *prev.context.lock() = *context;
            }
            if plan.page_tables != 0 && plan.page_tables != instructions::read_cr3() {
                instructions::write_cr3(plan.page_tables);
            }
            *context = *plan.next.context.lock();
        }
    }

    crate::acpi::lapic().eoi();
}

/// Naked spurious-interrupt entry (vector 0xFF): no EOI, no work.
#[unsafe(naked)]
pub unsafe extern "C" fn spurious_stub() {
    core::arch::naked_asm!("iretq");
}

// ---------------------------------------------------------------------------
// Page fault
// ---------------------------------------------------------------------------

/// Naked page-fault entry (vector 14). The CPU pushes an error code.
#[unsafe(naked)]
pub unsafe extern "C" fn page_fault_stub() {
    core::arch::naked_asm!(
        // With the error code on the stack, CS sits at [rsp+16].
        "test qword ptr [rsp + 16], 3",
        "jz 2f",
        "swapgs",
        "2:",
        // Ten pushes keep the stack 16-byte aligned at the call.
        "push rax",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push rbp",
        "mov rdi, cr2",
        "mov rsi, [rsp + 80]",
        "call {handler}",
        "pop rbp",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "add rsp, 8",
        "test qword ptr [rsp + 8], 3",
        "jz 3f",
        "swapgs",
        "3:",
        "iretq",
        handler = sym page_fault_handler,
    );
}

/// Page-fault error code bits.
mod pf_error {
    /// Protection violation (vs. not-present).
    pub const PRESENT: u64 = 1 << 0;
    /// Write access.
    pub const WRITE: u64 = 1 << 1;
    /// Fault from ring 3.
    pub const USER: u64 = 1 << 2;
    /// Instruction fetch.
    pub const INSTRUCTION: u64 = 1 << 4;
}

extern "C" fn page_fault_handler(cr2: u64, error: u64) {
    let access = meson_mm::vmm::FaultAccess {
        user: error & pf_error::USER != 0,
        write: error & pf_error::WRITE != 0,
        exec: error & pf_error::INSTRUCTION != 0,
    };

    let mut frames = vas::frame_source();
    let mut mapper =
        super::paging::KernelRegionMapper::new(meson_mm::layout::ARCH_HHDM_BASE);
    match vas::kernel_vas().page_fault(
        VirtAddr::new_truncate(cr2),
        access,
        &mut frames,
        &mut mapper,
    ) {
        Ok(()) => {}
        Err(fault) => {
            kpanic_msg!(
                "unhandled page fault at {:#x}: {:?} (error {:#x}, present={})",
                cr2,
                fault,
                error,
                error & pf_error::PRESENT != 0
            );
            instructions::halt_forever();
        }
    }
}

// ---------------------------------------------------------------------------
// Fatal exceptions
// ---------------------------------------------------------------------------

extern "C" fn fatal_exception(vector: u64, error: u64, rip: u64) -> ! {
    kpanic_msg!(
        "fatal exception {} at {:#x} (error {:#x})",
        vector,
        rip,
        error
    );
    instructions::halt_forever();
}

macro_rules! fatal_stub {
    ($name:ident, $vector:literal, err) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            // Never returns; no need to preserve registers.
            core::arch::naked_asm!(
                "mov rdi, {vector}",
                "mov rsi, [rsp]",
                "mov rdx, [rsp + 8]",
                "call {fatal}",
                vector = const $vector,
                fatal = sym fatal_exception,
            );
        }
    };
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "mov rdi, {vector}",
                "xor esi, esi",
                "mov rdx, [rsp]",
                "call {fatal}",
                vector = const $vector,
                fatal = sym fatal_exception,
            );
        }
    };
}

fatal_stub!(exc_divide, 0u64);
fatal_stub!(exc_debug, 1u64);
fatal_stub!(exc_nmi, 2u64);
fatal_stub!(exc_breakpoint, 3u64);
fatal_stub!(exc_overflow, 4u64);
fatal_stub!(exc_bound, 5u64);
fatal_stub!(exc_invalid_opcode, 6u64);
fatal_stub!(exc_no_fpu, 7u64);
fatal_stub!(exc_double_fault, 8u64, err);
fatal_stub!(exc_invalid_tss, 10u64, err);
fatal_stub!(exc_segment_absent, 11u64, err);
fatal_stub!(exc_stack_fault, 12u64, err);
fatal_stub!(exc_general_protection, 13u64, err);
fatal_stub!(exc_fpu_error, 16u64);
fatal_stub!(exc_alignment, 17u64, err);
fatal_stub!(exc_machine_check, 18u64);
fatal_stub!(exc_simd, 19u64);

/// Installs the exception gates, the page-fault handler, and the spurious
/// vector.
///
/// # Safety
///
/// Boot-time, single CPU, before `idt::load` on any AP.
pub unsafe fn install() {
    use super::idt;

    let table: &[(u8, unsafe extern "C" fn())] = &[
        (0, exc_divide),
        (1, exc_debug),
        (2, exc_nmi),
        (3, exc_breakpoint),
        (4, exc_overflow),
        (5, exc_bound),
        (6, exc_invalid_opcode),
        (7, exc_no_fpu),
        (8, exc_double_fault),
        (10, exc_invalid_tss),
        (11, exc_segment_absent),
        (12, exc_stack_fault),
        (13, exc_general_protection),
        (16, exc_fpu_error),
        (17, exc_alignment),
        (18, exc_machine_check),
        (19, exc_simd),
    ];
    // SAFETY: Boot-time installation of valid stubs.
    unsafe {
        for &(vector, stub) in table {
            idt::install_kernel(vector, stub as usize as u64);
        }
        idt::install_kernel(idt::VECTOR_PAGE_FAULT, page_fault_stub as *const () as u64);
        idt::install_kernel(idt::VECTOR_SPURIOUS, spurious_stub as *const () as u64);
        idt::load();
    }
}
