//! Privileged instruction wrappers and the atomics surface.

use meson_core::addr::VirtAddr;

/// Enables interrupts.
///
/// # Safety
///
/// The IDT and interrupt controllers must be configured.
#[inline]
pub unsafe fn enable_interrupts() {
    // SAFETY: Caller contract.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

/// Disables interrupts.
#[inline]
pub fn disable_interrupts() {
    // SAFETY: Masking interrupts has no memory effects.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
}

/// Halts until the next interrupt.
#[inline]
pub fn halt() {
    // SAFETY: hlt is always safe in ring 0.
    unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
}

/// Parks the CPU forever with interrupts off.
pub fn halt_forever() -> ! {
    loop {
        disable_interrupts();
        halt();
    }
}

/// Pause hint for spin loops.
#[inline]
pub fn spin_backoff() {
    core::hint::spin_loop();
}

/// Invalidates the TLB entry covering `virt`.
#[inline]
pub fn invlpg(virt: VirtAddr) {
    // SAFETY: invlpg only drops a TLB entry.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
}

/// Writes back and invalidates all caches. Used around AP trampoline
/// staging, where the AP starts with caching disabled.
#[inline]
pub fn flush_cache() {
    // SAFETY: wbinvd only affects caches.
    unsafe { core::arch::asm!("wbinvd", options(nostack, preserves_flags)) };
}

/// Reads CR2 (the faulting address during a page fault).
#[inline]
pub fn read_cr2() -> u64 {
    let value: u64;
    // SAFETY: Reading CR2 has no side effects.
    unsafe { core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack)) };
    value
}

/// Reads CR3 (the current page-table root).
#[inline]
pub fn read_cr3() -> u64 {
    let value: u64;
    // SAFETY: Reading CR3 has no side effects.
    unsafe { core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
    value
}

/// Loads CR3, switching page tables and flushing non-global TLB entries.
///
/// # Safety
///
/// `cr3` must point to a valid PML4 that maps the currently-executing
/// code and stack.
#[inline]
pub unsafe fn write_cr3(cr3: u64) {
    // SAFETY: Caller contract.
    unsafe { core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack)) };
}

/// Reads CR4.
#[inline]
pub fn read_cr4() -> u64 {
    let value: u64;
    // SAFETY: Reading CR4 has no side effects.
    unsafe { core::arch::asm!("mov {}, cr4", out(reg) value, options(nomem, nostack)) };
    value
}

/// Writes CR4.
///
/// # Safety
///
/// The new value must only toggle features the CPU supports.
#[inline]
pub unsafe fn write_cr4(value: u64) {
    // SAFETY: Caller contract.
    unsafe { core::arch::asm!("mov cr4, {}", in(reg) value, options(nostack)) };
}

/// CR4 bit enabling the FSGSBASE instructions.
pub const CR4_FSGSBASE: u64 = 1 << 16;
