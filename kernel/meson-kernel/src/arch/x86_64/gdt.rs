//! Per-CPU GDT and TSS.
//!
//! Seven entries: null, kernel code, kernel data, user data, user code
//! (SYSRET ordering), and the two-slot 64-bit TSS descriptor. Every CPU
//! owns its own GDT copy and TSS so the IRQ stack in `rsp0`/`ist[0]` is
//! per-CPU.

use core::mem::size_of;

/// GDT slot indices.
pub const GDT_NULL: usize = 0;
/// Kernel code segment slot.
pub const GDT_KERNEL_CODE: usize = 1;
/// Kernel data segment slot.
pub const GDT_KERNEL_DATA: usize = 2;
/// User data segment slot (SYSRET expects data before code).
pub const GDT_USER_DATA: usize = 3;
/// User code segment slot.
pub const GDT_USER_CODE: usize = 4;
/// TSS descriptor, low half.
pub const GDT_TSS_LOW: usize = 5;
/// TSS descriptor, high half.
pub const GDT_TSS_HIGH: usize = 6;
/// Total GDT entries.
pub const GDT_ENTRIES: usize = 7;

/// Kernel code selector value.
pub const KERNEL_CODE_SELECTOR: u16 = (GDT_KERNEL_CODE as u16) << 3;
/// Kernel data selector value.
pub const KERNEL_DATA_SELECTOR: u16 = (GDT_KERNEL_DATA as u16) << 3;
/// User code selector value (RPL 3).
pub const USER_CODE_SELECTOR: u16 = ((GDT_USER_CODE as u16) << 3) | 3;
/// User data selector value (RPL 3).
pub const USER_DATA_SELECTOR: u16 = ((GDT_USER_DATA as u16) << 3) | 3;
/// TSS selector value.
pub const TSS_SELECTOR: u16 = (GDT_TSS_LOW as u16) << 3;

/// One 8-byte GDT entry.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GdtEntry {
    /// Limit bits 0..15.
    pub limit_low: u16,
    /// Base bits 0..15.
    pub base_low: u16,
    /// Base bits 16..23.
    pub base_middle: u8,
    /// Access byte (present, DPL, type).
    pub access: u8,
    /// Flags (G, L) plus limit bits 16..19.
    pub granularity: u8,
    /// Base bits 24..31.
    pub base_high: u8,
}

impl GdtEntry {
    const fn segment(access: u8, granularity: u8) -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_middle: 0,
            access,
            granularity,
            base_high: 0,
        }
    }
}

/// 64-bit Task State Segment with the full I/O permission bitmap.
///
/// `iomap_offset` is fixed at 0x68 (the byte offset of `iomap`); the map
/// is all-ones (no port access from ring 3) and carries the required
/// trailing 0xFF sentinel.
#[repr(C, packed)]
pub struct Tss {
    reserved0: u32,
    /// Ring 0 stack pointer, loaded on privilege transitions.
    pub rsp0: u64,
    /// Ring 1 stack pointer (unused).
    pub rsp1: u64,
    /// Ring 2 stack pointer (unused).
    pub rsp2: u64,
    reserved1: u64,
    /// Interrupt stack table.
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    /// Offset of the I/O map from the TSS base.
    pub iomap_offset: u16,
    /// I/O permission bitmap, all ones.
    pub iomap: [u8; 8192],
    /// Trailing sentinel byte.
    pub ones: u8,
}

impl Tss {
    /// Byte offset of the I/O map within the TSS.
    pub const IOMAP_OFFSET: u16 = 0x68;

    /// Creates a TSS with the given IRQ stack top in `rsp0` and `ist[0]`.
    pub fn new(irq_stack_top: u64) -> Self {
        let mut tss = Self {
            reserved0: 0,
            rsp0: irq_stack_top,
            rsp1: 0,
            rsp2: 0,
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iomap_offset: Self::IOMAP_OFFSET,
            iomap: [0xFF; 8192],
            ones: 0xFF,
        };
        tss.ist[0] = irq_stack_top;
        tss
    }
}

/// Builds the seven-entry GDT for one CPU, pointing the TSS descriptor at
/// `tss`.
pub fn build_gdt(tss: &Tss) -> [GdtEntry; GDT_ENTRIES] {
    let mut gdt = [GdtEntry::default(); GDT_ENTRIES];

    // Code segments carry the 64-bit (L) flag; base/limit are ignored in
    // long mode but kept canonical.
    gdt[GDT_KERNEL_CODE] = GdtEntry::segment(0x9A, 0xAF);
    gdt[GDT_KERNEL_DATA] = GdtEntry::segment(0x92, 0xCF);
    gdt[GDT_USER_DATA] = GdtEntry::segment(0xF2, 0xCF);
    gdt[GDT_USER_CODE] = GdtEntry::segment(0xFA, 0xAF);

    let base = tss as *const Tss as u64;
    let limit = (size_of::<Tss>() - 1) as u64;
    gdt[GDT_TSS_LOW] = GdtEntry {
        limit_low: limit as u16,
        base_low: base as u16,
        base_middle: (base >> 16) as u8,
        access: 0x89, // present, available 64-bit TSS
        granularity: ((limit >> 16) & 0x0F) as u8,
        base_high: (base >> 24) as u8,
    };
    // The high slot holds bits 32..63 of the TSS base.
    let high = base >> 32;
    gdt[GDT_TSS_HIGH] = GdtEntry {
        limit_low: high as u16,
        base_low: (high >> 16) as u16,
        base_middle: (high >> 32) as u8,
        access: 0,
        granularity: 0,
        base_high: 0,
    };
    gdt
}

/// Pointer operand for `lgdt`.
#[repr(C, packed)]
pub struct GdtPointer {
    /// Table size minus one.
    pub limit: u16,
    /// Table base address.
    pub base: u64,
}

/// Loads `gdt`, reloads the segment registers, and loads the TSS.
///
/// # Safety
///
/// `gdt` must outlive its use as the active descriptor table (the per-CPU
/// GDTs are leaked allocations). Interrupts should be disabled.
pub unsafe fn load(gdt: &'static [GdtEntry; GDT_ENTRIES]) {
    let pointer = GdtPointer {
        limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
        base: gdt.as_ptr() as u64,
    };

    // SAFETY: The pointer references a live, correctly-built GDT; the
    // selector constants match its layout. The far return reloads CS.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            // Reload CS with a far return.
            "lea {tmp}, [rip + 2f]",
            "push {cs}",
            "push {tmp}",
            "retfq",
            "2:",
            // Data segments.
            "mov ds, {data:x}",
            "mov ss, {data:x}",
            "xor eax, eax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            // Task register.
            "ltr {tss:x}",
            ptr = in(reg) &pointer,
            cs = in(reg) u64::from(KERNEL_CODE_SELECTOR),
            data = in(reg) KERNEL_DATA_SELECTOR,
            tss = in(reg) TSS_SELECTOR,
            tmp = out(reg) _,
            out("rax") _,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdt_entry_is_8_bytes() {
        assert_eq!(size_of::<GdtEntry>(), 8);
        assert_eq!(size_of::<[GdtEntry; GDT_ENTRIES]>(), 56);
    }

    #[test]
    fn tss_layout_matches_hardware() {
        // 104-byte architectural TSS + 8192-byte iomap + sentinel.
        assert_eq!(Tss::IOMAP_OFFSET, 104);
        assert_eq!(core::mem::offset_of!(Tss, iomap), 104);
        assert_eq!(size_of::<Tss>(), 104 + 8192 + 1);
    }

    #[test]
    fn tss_iomap_denies_all_ports() {
        let tss = Tss::new(0xFFFF_9000_0001_0000);
        assert!(tss.iomap.iter().all(|&b| b == 0xFF));
        assert_eq!(tss.ones, 0xFF);
        let rsp0 = tss.rsp0;
        assert_eq!(rsp0, 0xFFFF_9000_0001_0000);
        let ist0 = tss.ist[0];
        assert_eq!(ist0, rsp0);
    }

    #[test]
    fn selectors_encode_ring() {
        assert_eq!(KERNEL_CODE_SELECTOR, 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR, 0x10);
        assert_eq!(USER_DATA_SELECTOR & 3, 3);
        assert_eq!(USER_CODE_SELECTOR & 3, 3);
    }

    #[test]
    fn tss_descriptor_splits_base() {
        let tss = Tss::new(0);
        let gdt = build_gdt(&tss);
        let base = &tss as *const Tss as u64;

        let low = gdt[GDT_TSS_LOW];
        let rebuilt = u64::from(low.base_low)
            | (u64::from(low.base_middle) << 16)
            | (u64::from(low.base_high) << 24)
            | ((u64::from(gdt[GDT_TSS_HIGH].limit_low)
                | (u64::from(gdt[GDT_TSS_HIGH].base_low) << 16))
                << 32);
        assert_eq!(rebuilt, base);
        assert_eq!(low.access, 0x89);
    }
}
