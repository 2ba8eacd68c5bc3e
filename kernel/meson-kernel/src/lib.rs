//! `meson-kernel` — the kernel proper.
//!
//! Boot order: debug channel → memory map parsing → PMM → kernel page
//! tables + VMM → exception/fault handlers → heap → ACPI + timers → SMP →
//! scheduler. Each stage only depends on the ones before it; any failure
//! on this path is fatal (log, then halt).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod drivers;
pub mod log;

#[cfg(target_arch = "x86_64")]
pub mod acpi;
#[cfg(target_arch = "x86_64")]
pub mod percpu;
#[cfg(target_arch = "x86_64")]
pub mod vas;

#[cfg(target_arch = "x86_64")]
mod init {
    use meson_core::{kinfo, kpanic_msg};
    use meson_mm::layout::{ARCH_HHDM_BASE, page_align_up};
    use meson_mm::{PhysMemoryRegion, pmm};
    use meson_sched::scheduler::SCHEDULER;

    use crate::arch::x86_64::{instructions, interrupts, smp};
    use crate::boot::{BootInfo, BootMemoryRange, MAX_MEMORY_RANGES};

    /// Kernel entry, called by the boot stub with the handoff record.
    ///
    /// # Safety
    ///
    /// `boot_info` must be the bootloader's handoff record, with the HHDM
    /// live at its fixed base and interrupts disabled.
    pub unsafe fn kernel_init(boot_info: &'static BootInfo) -> ! {
        crate::log::init();

        if !boot_info.validate() {
            kpanic_msg!("boot handoff magic/revision mismatch");
            instructions::halt_forever();
        }
        kinfo!("meson kernel booting: \"{}\"", boot_info.command_line());

        // Memory map → PMM. The bitmap lands right after the kernel
        // image, reached through the HHDM.
        let mut regions = [PhysMemoryRegion {
            base: 0,
            length: 0,
            kind: meson_mm::MemoryKind::Reserved,
        }; MAX_MEMORY_RANGES];
        let map_virt = (ARCH_HHDM_BASE + boot_info.memory_map) as *const BootMemoryRange;
        // SAFETY: The handoff record promises a valid map behind the HHDM.
        let count = unsafe { boot_info.copy_memory_map(map_virt, &mut regions) };
        let regions = &regions[..count];
        for region in regions {
            kinfo!(
                " [{:#016x}, {:#016x}]: {}",
                region.base,
                region.base + region.length - 1,
                region.kind.as_str()
            );
        }

        let lowest_free = boot_info.lowest_free_address;
        let bitmap_virt = (ARCH_HHDM_BASE + page_align_up(lowest_free)) as *mut u8;
        // SAFETY: The bitmap region sits in usable RAM past the image and
        // is reached through the live HHDM.
        if let Err(err) = unsafe { pmm::init(regions, lowest_free, bitmap_virt) } {
            kpanic_msg!("PMM init failed: {:?}", err);
            instructions::halt_forever();
        }
        let pmm = pmm::get();
        kinfo!(
            "memory: {} KB usable, {} KB reserved, {} pages of PMM overhead",
            pmm.usable_memory() / 1024,
            pmm.hardware_reserved_memory() / 1024,
            pmm.overhead_pages()
        );

        // Kernel page tables + region tree.
        // SAFETY: PMM is up; boot mappings are still live for the switch.
        unsafe { crate::vas::init(pmm.highest_address(), lowest_free) };
        kinfo!("kernel address space up");

        // Exceptions and the page-fault path, then the demand-paged heap.
        // SAFETY: Single CPU, VMM ready.
        unsafe { interrupts::install() };
        // SAFETY: Fault handler installed; heap pages materialize on touch.
        unsafe { crate::vas::init_heap() };
        kinfo!("kernel heap up");

        // Interrupt controller topology and timers.
        crate::acpi::init(boot_info.acpi_rsdp);

        // Per-CPU state for the BSP, then every AP.
        // SAFETY: ACPI registry populated, heap live, run once.
        unsafe { smp::init() };

        // Scheduler: kernel process + preemption.
        match SCHEDULER.init() {
            Ok(pid) => kinfo!("scheduler up, kernel pid {}", pid),
            Err(err) => {
                kpanic_msg!("scheduler init failed: {:?}", err);
                instructions::halt_forever();
            }
        }

        kinfo!("boot complete, idling");
        loop {
            instructions::halt();
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub use init::kernel_init;

/// Freestanding panic handler: log and halt this CPU.
#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    meson_core::kpanic_msg!("kernel panic: {}", info);
    arch::x86_64::instructions::halt_forever();
}
