//! Per-CPU state and the local-APIC registry.
//!
//! Every logical CPU owns a heap-allocated, leaked [`CpuInfo`] whose
//! address is written to `IA32_GS_BASE`; the first field is a self-pointer
//! so `current_cpu()` is a single `GS:[0]` load. The BSP registers the
//! MADT's local-APIC entries here; AP bring-up walks the same registry.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use meson_core::kpanic_msg;
use meson_core::sync::SpinLock;
use meson_sched::scheduler::SchedulerState;

use crate::arch::x86_64::cpuid;
use crate::arch::x86_64::gdt::{self, Tss};
use crate::arch::x86_64::instructions::{self, CR4_FSGSBASE};
use crate::arch::x86_64::msr::{
    EFER_FFXSR, EFER_SCE, IA32_EFER, IA32_FS_BASE, IA32_GS_BASE, IA32_KERNEL_GS_BASE,
};

/// Upper bound on logical CPUs.
pub const MAX_CPUS: usize = 64;

/// IRQ stack size per CPU: 64 KiB.
pub const IRQ_STACK_SIZE: usize = 16 * 4096;

/// Scratch user-transition stack size per CPU: 64 KiB.
pub const USER_STACK_SIZE: usize = 16 * 4096;

/// One local APIC known from the MADT.
pub struct LocalApicEntry {
    /// ACPI processor UID.
    pub acpi_id: u8,
    /// The local APIC id.
    pub apic_id: u8,
    /// Whether firmware marked the processor usable.
    pub enabled: bool,
    /// Whether this is the bootstrap processor.
    pub bootstrap: bool,
    /// Set once the CPU has completed per-CPU init.
    pub up: AtomicBool,
    /// Calibrated LAPIC timer tick rate (ticks/second).
    pub timer_frequency: AtomicU64,
    /// Ticks observed by this CPU's timer ISR.
    pub timer_ticks: AtomicU64,
}

impl LocalApicEntry {
    fn new(acpi_id: u8, apic_id: u8, enabled: bool, bootstrap: bool) -> Self {
        Self {
            acpi_id,
            apic_id,
            enabled,
            bootstrap,
            up: AtomicBool::new(false),
            timer_frequency: AtomicU64::new(0),
            timer_ticks: AtomicU64::new(0),
        }
    }
}

static LAPICS: SpinLock<Vec<&'static LocalApicEntry>> = SpinLock::new(Vec::new());

/// Registers a local APIC discovered in the MADT. Returns the leaked
/// entry.
pub fn register_lapic(
    acpi_id: u8,
    apic_id: u8,
    enabled: bool,
    bootstrap: bool,
) -> &'static LocalApicEntry {
    let entry = Box::leak(Box::new(LocalApicEntry::new(
        acpi_id, apic_id, enabled, bootstrap,
    )));
    LAPICS.lock().push(entry);
    entry
}

/// Finds the registry entry for a local APIC id.
pub fn lapic_by_apic_id(apic_id: u8) -> Option<&'static LocalApicEntry> {
    LAPICS.lock().iter().find(|e| e.apic_id == apic_id).copied()
}

/// Snapshot of the registered local APICs. Returned by value so callers
/// (notably AP bring-up, whose targets query the registry themselves)
/// never iterate under the registry lock.
pub fn lapic_entries() -> Vec<&'static LocalApicEntry> {
    LAPICS.lock().clone()
}

/// Number of registered local APICs.
pub fn lapic_count() -> usize {
    LAPICS.lock().len()
}

/// Per-CPU descriptor, reachable through `GS:[0]`.
#[repr(C)]
pub struct CpuInfo {
    /// Self-pointer at offset 0 for GS-relative access.
    pub self_ptr: u64,
    /// Logical CPU index (0 = BSP).
    pub index: u32,
    /// This CPU's local APIC id.
    pub apic_id: u32,
    /// Top of this CPU's IRQ stack.
    pub irq_stack_top: u64,
    /// Top of this CPU's user-transition scratch stack.
    pub user_stack_top: u64,
    /// This CPU's local APIC registry entry.
    pub lapic: &'static LocalApicEntry,
    /// This CPU's scheduler state.
    pub sched: SchedulerState,
}

static CPUS: [AtomicPtr<CpuInfo>; MAX_CPUS] = {
    const NULL: AtomicPtr<CpuInfo> = AtomicPtr::new(core::ptr::null_mut());
    [NULL; MAX_CPUS]
};

static CPU_COUNT: AtomicU32 = AtomicU32::new(0);

/// Number of CPUs that completed per-CPU init.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Returns the descriptor of CPU `index`, if it is up.
pub fn cpu_info(index: usize) -> Option<&'static CpuInfo> {
    if index >= MAX_CPUS {
        return None;
    }
    let ptr = CPUS[index].load(Ordering::Acquire);
    // SAFETY: Entries are leaked allocations published once.
    unsafe { ptr.as_ref() }
}

/// Returns the calling CPU's descriptor through `GS:[0]`.
pub fn current_cpu() -> &'static CpuInfo {
    let ptr: u64;
    // SAFETY: GS base was pointed at this CPU's CpuInfo during cpu_init;
    // offset 0 is the self-pointer.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const CpuInfo)
    }
}

fn alloc_stack(size: usize) -> u64 {
    let stack = vec![0u8; size].leak();
    (stack.as_ptr() as u64 + size as u64) & !0xF
}

/// Brings the calling CPU's per-CPU state up: feature gates, EFER bits,
/// private GDT+TSS, the `CpuInfo` itself, and the GS-base wiring.
///
/// swapgs semantics: in the kernel the active base is `IA32_GS_BASE`;
/// `IA32_KERNEL_GS_BASE` starts 0 and is swapped in on user entry.
///
/// # Safety
///
/// Must be called exactly once per CPU, with interrupts disabled, after
/// the heap is available.
pub unsafe fn cpu_init(lapic: &'static LocalApicEntry) -> &'static CpuInfo {
    // Optional: FSGSBASE.
    if cpuid::has_fsgsbase() {
        // SAFETY: The CPU advertised the feature.
        unsafe { instructions::write_cr4(instructions::read_cr4() | CR4_FSGSBASE) };
    }

    // Required: SYSCALL/SYSRET.
    if !cpuid::has_syscall() {
        kpanic_msg!("CPU {} does not support SYSCALL/SYSRET", lapic.apic_id);
        instructions::halt_forever();
    }
    // SAFETY: EFER exists (long mode); SCE is architecturally valid, and
    // FFXSR only set when advertised.
    unsafe {
        let mut efer = IA32_EFER.read() | EFER_SCE;
        if cpuid::has_ffxsr() {
            efer |= EFER_FFXSR;
        }
        IA32_EFER.write(efer);
    }

    // Private GDT and TSS with the IRQ stack in rsp0/ist0.
    let irq_stack_top = alloc_stack(IRQ_STACK_SIZE);
    let user_stack_top = alloc_stack(USER_STACK_SIZE);
    let tss: &'static Tss = Box::leak(Box::new(Tss::new(irq_stack_top)));
    let gdt = Box::leak(Box::new(gdt::build_gdt(tss)));
    // SAFETY: The GDT is leaked (lives forever) and correctly built.
    unsafe { gdt::load(gdt) };

    let index = CPU_COUNT.fetch_add(1, Ordering::AcqRel) as usize;
    let cpu = Box::leak(Box::new(CpuInfo {
        self_ptr: 0,
        index: index as u32,
        apic_id: u32::from(lapic.apic_id),
        irq_stack_top,
        user_stack_top,
        lapic,
        sched: SchedulerState::new(),
    }));
    let cpu_addr = core::ptr::from_ref(cpu) as u64;
    cpu.self_ptr = cpu_addr;

    // SAFETY: The MSRs exist; GS base points at the leaked CpuInfo.
    unsafe {
        IA32_GS_BASE.write(cpu.self_ptr);
        IA32_KERNEL_GS_BASE.write(0);
        IA32_FS_BASE.write(0);
    }

    CPUS[index].store(cpu as *mut CpuInfo, Ordering::Release);
    lapic.up.store(true, Ordering::Release);
    cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_pointer_is_first_field() {
        // The GS:[0] load in current_cpu() depends on this offset.
        assert_eq!(core::mem::offset_of!(CpuInfo, self_ptr), 0);
    }

    #[test]
    fn lapic_registry_round_trip() {
        let entry = register_lapic(1, 7, true, false);
        assert!(!entry.up.load(Ordering::Relaxed));
        let found = lapic_by_apic_id(7).unwrap();
        assert_eq!(found.acpi_id, 1);
        assert!(found.enabled);
        assert!(lapic_by_apic_id(250).is_none());
    }
}
