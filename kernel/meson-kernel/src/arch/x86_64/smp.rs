//! SMP bring-up: INIT-INIT-SIPI with a low-memory trampoline.
//!
//! Application processors wake in real mode at the trampoline page
//! (0x1000), which flips on PAE + long mode with the CR3, stack pointer,
//! and 64-bit entry point the BSP staged at fixed low addresses, then
//! jumps into [`ap_main`]. The BSP identity-maps the first 32 KiB for the
//! duration of the sequence and spins on the `booted` flag between APs.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec;

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::paging::PhysFrame;
use meson_core::{kinfo, kpanic_msg};
use meson_mm::PAGE_SIZE;
use meson_mm::layout::ARCH_HHDM_BASE;
use meson_mm::pmm;

use super::cpuid;
use super::idt;
use super::instructions;
use super::paging::{PageTableFlags, PageTableMapper};
use crate::acpi;
use crate::percpu;

/// Physical address the trampoline is staged at; SIPI vector 1.
pub const AP_ENTRY_POINT: u64 = 0x1000;
/// Staging slot for the kernel CR3.
pub const CR3_PTR: u64 = 0x2000;
/// Staging slot for the AP's stack pointer.
pub const STACK_PTR: u64 = 0x2008;
/// Staging slot for the 64-bit entry point.
pub const ENTRY_POINT_PTR: u64 = 0x2010;

/// Initial AP stack: 32 KiB.
const AP_STACK_SIZE: usize = 8 * PAGE_SIZE;

/// Pages identity-mapped around the startup sequence (first 32 KiB).
const IDENTITY_PAGES: u64 = 8;

/// Set by each AP once it is fully up.
static BOOTED: AtomicBool = AtomicBool::new(false);

// The real-mode trampoline. Copied to AP_ENTRY_POINT, so every absolute
// reference is written as 0x1000 plus the offset from the start symbol.
// The staged CR3 must fit in 32 bits (the PML4 comes from low memory).
core::arch::global_asm!(
    r#"
.global ap_trampoline_start
.global ap_trampoline_end
.section .text
.code16
.set ap_tramp_gdt_ptr_off, 0x1000 + ap_tramp_gdt_ptr - ap_trampoline_start
ap_trampoline_start:
    cli
    cld
    // PAE on.
    mov eax, cr4
    or eax, 0x20
    mov cr4, eax
    // Kernel page tables.
    mov eax, [0x2000]
    mov cr3, eax
    // Long mode enable.
    mov ecx, 0xC0000080
    rdmsr
    or eax, 0x100
    wrmsr
    // Temporary GDT staged inside this page.
    lgdt [ap_tramp_gdt_ptr_off]
    // Paging + protection in one write: straight to long mode.
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax
    // Far jump into the 64-bit segment (0x66 0xEA imm32 sel16).
    .byte 0x66, 0xEA
    .long 0x1000 + ap_tramp_long - ap_trampoline_start
    .word 0x08
.code64
ap_tramp_long:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov rsp, [0x2008]
    mov rax, [0x2010]
    jmp rax
.balign 8
ap_tramp_gdt:
    .quad 0
    .quad 0x00AF9A000000FFFF
    .quad 0x00CF92000000FFFF
ap_tramp_gdt_ptr:
    .word ap_tramp_gdt_ptr - ap_tramp_gdt - 1
    .long 0x1000 + ap_tramp_gdt - ap_trampoline_start
ap_trampoline_end:
"#
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
}

/// Brings up the BSP's per-CPU state, then every enabled AP from the
/// MADT registry.
///
/// # Safety
///
/// Must run once on the BSP after ACPI init (LAPIC mapped, registry
/// populated) with the heap available.
pub unsafe fn init() {
    // BSP first: per-CPU state and the calibrated timer.
    let bsp_apic_id = cpuid::local_apic_id();
    let Some(bsp) = percpu::lapic_by_apic_id(bsp_apic_id) else {
        kpanic_msg!("BSP APIC id {} missing from the MADT", bsp_apic_id);
        instructions::halt_forever();
    };
    // SAFETY: Once per CPU, heap up, interrupts still disabled.
    unsafe { percpu::cpu_init(bsp) };
    // SAFETY: LAPIC mapped by ACPI init.
    unsafe { acpi::lapic_timer_init() };

    if percpu::lapic_count() < 2 {
        kinfo!("SMP: single-processor system");
        return;
    }

    let kernel_cr3 = instructions::read_cr3();
    let mapper = PageTableMapper::new(ARCH_HHDM_BASE);
    let mut alloc = || {
        pmm::alloc_page()
            .map(PhysFrame::containing_address)
            .expect("PMM exhausted during SMP bring-up")
    };

    // The trampoline runs with paging on from the moment CR0.PG is set,
    // fetching at low addresses: identity-map the first 32 KiB.
    let identity_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    for page in 0..IDENTITY_PAGES {
        // SAFETY: Fresh low-memory mappings on the live kernel root.
        unsafe {
            mapper.map_4k(
                PhysAddr::new(kernel_cr3),
                VirtAddr::new(page * PAGE_SIZE as u64),
                PhysAddr::new(page * PAGE_SIZE as u64),
                identity_flags,
                &mut alloc,
            );
        }
    }

    // Stage the trampoline and the fixed pointer slots through the HHDM.
    // SAFETY: The symbols delimit the trampoline bytes; low memory is
    // reachable through the HHDM.
    unsafe {
        let start = core::ptr::addr_of!(ap_trampoline_start);
        let end = core::ptr::addr_of!(ap_trampoline_end);
        let size = end as usize - start as usize;
        core::ptr::copy_nonoverlapping(
            start,
            (ARCH_HHDM_BASE + AP_ENTRY_POINT) as *mut u8,
            size,
        );
        core::ptr::write_volatile((ARCH_HHDM_BASE + CR3_PTR) as *mut u64, kernel_cr3);
        core::ptr::write_volatile(
            (ARCH_HHDM_BASE + ENTRY_POINT_PTR) as *mut u64,
            ap_main as *const () as u64,
        );
    }

    let lapic = acpi::lapic();
    let mut started = 0u32;
    for entry in percpu::lapic_entries() {
        if !entry.enabled || entry.up.load(Ordering::Acquire) {
            continue;
        }

        kinfo!("SMP: starting CPU with APIC id {}", entry.apic_id);

        // A fresh stack for this AP, staged where the trampoline looks.
        let stack = vec![0u8; AP_STACK_SIZE].leak();
        let stack_top = (stack.as_ptr() as u64 + AP_STACK_SIZE as u64) & !0xF;
        // SAFETY: The staging slot is identity/HHDM-mapped low memory.
        unsafe {
            core::ptr::write_volatile((ARCH_HHDM_BASE + STACK_PTR) as *mut u64, stack_top);
        }

        BOOTED.store(false, Ordering::Release);
        instructions::flush_cache();

        // INIT (assert + level), INIT (deassert), then STARTUP with the
        // trampoline page number as the vector.
        // SAFETY: The target exists per the MADT; the trampoline is staged.
        unsafe {
            lapic.send_init(entry.apic_id, true);
            lapic.wait_for_delivery();
            lapic.send_init(entry.apic_id, false);
            lapic.wait_for_delivery();
            lapic.send_startup(entry.apic_id, (AP_ENTRY_POINT >> 12) as u8);
        }

        while !BOOTED.load(Ordering::Acquire) {
            instructions::spin_backoff();
        }
        started += 1;
    }

    // Tear the identity window back down.
    for page in 0..IDENTITY_PAGES {
        // SAFETY: Unmapping what this function mapped above.
        let _ = unsafe {
            mapper.unmap_4k(
                PhysAddr::new(kernel_cr3),
                VirtAddr::new(page * PAGE_SIZE as u64),
            )
        };
    }

    kinfo!("SMP: {} CPUs online", percpu::cpu_count());
    let _ = started;
}

/// 64-bit AP entry, reached from the trampoline with the staged stack.
extern "C" fn ap_main() -> ! {
    // SAFETY: The shared IDT was built by the BSP.
    unsafe { idt::load() };

    let apic_id = cpuid::local_apic_id();
    let Some(entry) = percpu::lapic_by_apic_id(apic_id) else {
        kpanic_msg!("AP {} missing from the MADT registry", apic_id);
        instructions::halt_forever();
    };

    acpi::lapic().init();
    // SAFETY: Once per CPU; heap is up (BSP initialized it).
    unsafe { percpu::cpu_init(entry) };
    // SAFETY: LAPIC mapped; registry entry exists.
    unsafe { acpi::lapic_timer_init() };

    BOOTED.store(true, Ordering::Release);
    instructions::flush_cache();

    loop {
        instructions::halt();
    }
}
