//! x86_64 architecture layer: descriptor tables, paging, interrupts,
//! per-CPU wiring, and SMP bring-up.

pub mod context;
pub mod cpuid;
pub mod gdt;
pub mod idt;
pub mod instructions;
pub mod interrupts;
pub mod msr;
pub mod paging;
pub mod smp;
