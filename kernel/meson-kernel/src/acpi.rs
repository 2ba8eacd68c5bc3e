//! Kernel-side ACPI integration and timer bring-up.
//!
//! Walks the MADT to build the local-APIC registry, maps the LAPIC and
//! HPET through the VMM's MMIO window, and calibrates the per-CPU LAPIC
//! timer against the HPET.

use meson_acpi::{AcpiHandler, AcpiTables, MadtEntry, madt::LAPIC_FLAG_ENABLED};
use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::sync::OnceLock;
use meson_core::{kdebug, kinfo, kpanic_msg, kwarn};
use meson_mm::layout::ARCH_HHDM_BASE;
use meson_mm::vmm::Protection;

use crate::arch::x86_64::cpuid;
use crate::arch::x86_64::idt;
use crate::arch::x86_64::instructions;
use crate::drivers::hpet::Hpet;
use crate::drivers::lapic::{LocalApic, TIMER_VECTOR};
use crate::percpu;
use crate::vas::kernel_vas;

/// Scheduler tick rate: LAPIC timers fire at this frequency on every CPU.
pub const ARCH_GLOBAL_TIMER_FREQUENCY: u64 = 1000;

/// HPET-referenced calibration window for the LAPIC timer.
pub const CALIBRATION_TIME_MS: u64 = 50;

/// HHDM-based handler: physical addresses become virtual by adding the
/// direct-map base.
struct HhdmAcpiHandler;

// SAFETY: The HHDM covers all physical memory once the kernel tables are
// installed, and it lives forever.
unsafe impl AcpiHandler for HhdmAcpiHandler {
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8] {
        // SAFETY: Caller passes firmware table addresses inside the HHDM.
        unsafe { core::slice::from_raw_parts((ARCH_HHDM_BASE + phys) as *const u8, size) }
    }
}

/// Virtual base of the mapped LAPIC register page.
static LAPIC_BASE: OnceLock<VirtAddr> = OnceLock::new();

/// The mapped HPET, if the platform has one.
static HPET: OnceLock<Hpet> = OnceLock::new();

/// Returns a driver over the mapped LAPIC.
///
/// # Panics
///
/// Panics before [`init`] has mapped it.
pub fn lapic() -> LocalApic {
    let base = *LAPIC_BASE.get_unchecked_init();
    // SAFETY: The base was mapped through the MMIO window during init and
    // is permanent.
    unsafe { LocalApic::new(base) }
}

/// Busy-waits `ns` nanoseconds against the HPET main counter.
///
/// # Panics
///
/// Panics if no HPET was found.
pub fn hpet_block(ns: u64) {
    HPET.get_unchecked_init().block_ns(ns);
}

/// Parses the ACPI tables and brings up the interrupt/timer platform:
/// MADT walk, LAPIC registry + MMIO mapping, LAPIC baseline init, HPET
/// bring-up.
///
/// Boot-path failures here are fatal.
pub fn init(rsdp_phys: u64) {
    if rsdp_phys == 0 {
        kpanic_msg!("ACPI: firmware provided no RSDP");
        instructions::halt_forever();
    }

    let tables = match AcpiTables::new(rsdp_phys, HhdmAcpiHandler) {
        Ok(tables) => {
            kinfo!(
                "ACPI: RSDP validated, {} at {:#x}",
                if tables.is_xsdt() { "XSDT" } else { "RSDT" },
                tables.rsdt_addr()
            );
            tables
        }
        Err(err) => {
            kpanic_msg!("ACPI: invalid RSDP: {:?}", err);
            instructions::halt_forever();
        }
    };

    let madt = match tables.madt() {
        Ok(madt) => madt,
        Err(err) => {
            kpanic_msg!("ACPI: no usable MADT: {:?}", err);
            instructions::halt_forever();
        }
    };

    // Register every local APIC; log the rest of the topology.
    let bsp_apic_id = cpuid::local_apic_id();
    let mut cpu_count = 0u32;
    for entry in madt.entries() {
        match entry {
            MadtEntry::LocalApic {
                acpi_processor_id,
                apic_id,
                flags,
            } => {
                let enabled = flags & LAPIC_FLAG_ENABLED != 0;
                if enabled {
                    cpu_count += 1;
                }
                percpu::register_lapic(
                    acpi_processor_id,
                    apic_id,
                    enabled,
                    apic_id == bsp_apic_id,
                );
            }
            MadtEntry::IoApic {
                io_apic_id,
                io_apic_address,
                gsi_base,
            } => {
                kdebug!(
                    "ACPI: I/O APIC {} at {:#x}, GSI base {}",
                    io_apic_id,
                    io_apic_address,
                    gsi_base
                );
            }
            MadtEntry::InterruptSourceOverride {
                source, gsi, flags, ..
            } => {
                kdebug!("ACPI: IRQ {} override -> GSI {} (flags {:#x})", source, gsi, flags);
            }
            MadtEntry::NmiSource { gsi, .. } => {
                kdebug!("ACPI: NMI source at GSI {}", gsi);
            }
            MadtEntry::LocalApicNmi {
                acpi_processor_id,
                lint,
                ..
            } => {
                kdebug!("ACPI: LAPIC NMI for CPU {:#x} on LINT{}", acpi_processor_id, lint);
            }
            MadtEntry::LocalApicAddressOverride { address } => {
                kdebug!("ACPI: LAPIC MMIO override -> {:#x}", address);
            }
            MadtEntry::Unknown { entry_type, .. } => {
                kdebug!("ACPI: unhandled MADT entry type {}", entry_type);
            }
        }
    }
    kinfo!("ACPI: MADT lists {} enabled CPUs", cpu_count);

    // Map the (possibly overridden) LAPIC MMIO page.
    let lapic_phys = madt.effective_lapic_address();
    let lapic_virt = kernel_vas()
        .create_mmio(
            PhysAddr::new(lapic_phys),
            1,
            Protection::READ | Protection::WRITE,
        )
        .expect("failed to reserve the LAPIC MMIO mapping");
    if LAPIC_BASE.set(lapic_virt).is_err() {
        kpanic_msg!("ACPI initialized twice");
        instructions::halt_forever();
    }
    kinfo!("LAPIC at {:#x}, mapped to {:#x}", lapic_phys, lapic_virt);

    lapic().init();

    // HPET bring-up.
    match tables.hpet() {
        Ok(table) => match table.require_memory_space() {
            Ok(hpet_phys) => {
                let hpet_virt = kernel_vas()
                    .create_mmio(
                        PhysAddr::new(hpet_phys),
                        1,
                        Protection::READ | Protection::WRITE,
                    )
                    .expect("failed to reserve the HPET MMIO mapping");
                // SAFETY: Just mapped through the MMIO window.
                let hpet = unsafe { Hpet::new(hpet_virt) };
                hpet.init();
                kinfo!(
                    "HPET at {:#x}: {} Hz, {} comparators",
                    hpet_phys,
                    hpet.frequency_hz(),
                    hpet.timer_count()
                );
                let _ = HPET.set(hpet);
            }
            Err(_) => {
                kpanic_msg!("HPET is not memory-mapped; cannot calibrate timers");
                instructions::halt_forever();
            }
        },
        Err(err) => {
            kwarn!("ACPI: no HPET table ({:?}); timer calibration unavailable", err);
        }
    }
}

/// Calibrates this CPU's LAPIC timer against the HPET and starts it in
/// periodic mode at [`ARCH_GLOBAL_TIMER_FREQUENCY`]. Installs the timer
/// ISR once globally, then enables interrupts.
///
/// # Safety
///
/// The LAPIC must be mapped and this CPU's registry entry must exist.
pub unsafe fn lapic_timer_init() {
    use core::sync::atomic::{AtomicBool, Ordering};

    let apic_id = cpuid::local_apic_id();
    let Some(entry) = percpu::lapic_by_apic_id(apic_id) else {
        kpanic_msg!("LAPIC {} missing from the MADT registry", apic_id);
        instructions::halt_forever();
    };

    let lapic = lapic();
    let start = lapic.begin_calibration();
    hpet_block(CALIBRATION_TIME_MS * 1_000_000);
    let end = lapic.end_calibration();

    let ticks = u64::from(start.wrapping_sub(end));
    let frequency = ticks * 1000 / CALIBRATION_TIME_MS;
    entry.timer_frequency.store(frequency, Ordering::Release);
    entry.timer_ticks.store(0, Ordering::Release);
    kinfo!(
        "LAPIC {} timer at {} MHz",
        apic_id,
        frequency / 1_000_000
    );

    static ISR_INSTALLED: AtomicBool = AtomicBool::new(false);
    if !ISR_INSTALLED.swap(true, Ordering::AcqRel) {
        // SAFETY: Boot-time IDT mutation; the stub is a valid entry.
        unsafe {
            idt::install_kernel(
                TIMER_VECTOR,
                crate::arch::x86_64::interrupts::lapic_timer_stub as *const () as u64,
            );
        }
    }

    let initial = (frequency / ARCH_GLOBAL_TIMER_FREQUENCY) as u32;
    lapic.start_timer_periodic(TIMER_VECTOR, initial.max(1));

    // SAFETY: IDT loaded, LAPIC programmed.
    unsafe { instructions::enable_interrupts() };
}
