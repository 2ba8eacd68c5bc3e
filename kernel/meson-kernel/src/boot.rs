//! Boot handoff record.
//!
//! The bootloader leaves a packed, little-endian record describing the
//! machine: firmware class, framebuffer, the memory map, the lowest free
//! physical address after the kernel image, the ACPI RSDP, an optional
//! initrd, and the command line. The record and its memory map are
//! immutable after handoff.

use meson_mm::{MemoryKind, PhysMemoryRegion};

/// The handoff magic: ASCII "kiwi".
pub const BOOT_MAGIC: u32 = u32::from_le_bytes(*b"kiwi");

/// Current handoff revision.
pub const BOOT_REVISION: u32 = 1;

/// Upper bound on memory map entries the kernel consumes.
pub const MAX_MEMORY_RANGES: usize = 64;

/// Memory range classification codes in the boot map (E820 numbering).
pub mod range_kind {
    /// Usable RAM.
    pub const USABLE: u32 = 1;
    /// Hardware-reserved.
    pub const RESERVED: u32 = 2;
    /// ACPI tables, reclaimable after parsing.
    pub const ACPI_RECLAIMABLE: u32 = 3;
    /// ACPI non-volatile storage.
    pub const ACPI_NVS: u32 = 4;
    /// Known-bad memory.
    pub const BAD: u32 = 5;
}

/// One range of the boot memory map.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BootMemoryRange {
    /// Physical start address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Classification (see [`range_kind`]).
    pub kind: u32,
    /// ACPI 3.0 extended attribute bits.
    pub acpi_flags: u32,
}

impl BootMemoryRange {
    /// Converts the firmware classification into the PMM's memory kind.
    pub fn memory_kind(&self) -> MemoryKind {
        match self.kind {
            range_kind::USABLE => MemoryKind::Usable,
            range_kind::ACPI_RECLAIMABLE => MemoryKind::AcpiReclaimable,
            range_kind::ACPI_NVS => MemoryKind::AcpiNvs,
            range_kind::BAD => MemoryKind::Bad,
            _ => MemoryKind::Reserved,
        }
    }

    /// Converts to the PMM region descriptor.
    pub fn to_region(&self) -> PhysMemoryRegion {
        PhysMemoryRegion {
            base: self.base,
            length: self.length,
            kind: self.memory_kind(),
        }
    }
}

/// A raw MBR partition table entry (BIOS boot path).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MbrPartition {
    /// 0x80 when bootable.
    pub bootable: u8,
    /// CHS address of the first sector.
    pub start_chs: [u8; 3],
    /// Partition type byte.
    pub kind: u8,
    /// CHS address of the last sector.
    pub end_chs: [u8; 3],
    /// LBA of the first sector.
    pub start_lba: u32,
    /// Sector count.
    pub sectors: u32,
}

/// The packed boot handoff record.
#[repr(C, packed)]
pub struct BootInfo {
    /// Must equal [`BOOT_MAGIC`].
    pub magic: u32,
    /// Handoff revision.
    pub revision: u32,
    /// Firmware class (0 = BIOS, 1 = UEFI).
    pub firmware_type: u8,
    /// Physical address of the initrd, or 0.
    pub initrd: u64,
    /// Initrd size in bytes.
    pub initrd_size: u64,
    /// Physical pointer to the memory map array.
    pub memory_map: u64,
    /// Lowest free physical address after the kernel image
    /// (page-aligned).
    pub lowest_free_address: u64,
    /// Number of memory map entries.
    pub memory_map_entries: u32,
    /// Which firmware interface produced the map.
    pub memory_map_source: u8,
    /// Physical address of the ACPI RSDP, or 0.
    pub acpi_rsdp: u64,
    /// Physical address of legacy video memory.
    pub video_memory: u64,
    /// Physical address of the linear framebuffer.
    pub framebuffer: u64,
    /// Framebuffer width in pixels.
    pub framebuffer_width: u32,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u32,
    /// Framebuffer pitch in bytes.
    pub framebuffer_pitch: u32,
    /// Bits per pixel.
    pub framebuffer_bpp: u8,
    /// BIOS boot disk number.
    pub bios_boot_disk: u8,
    /// MBR entry the system booted from.
    pub bios_boot_partition: MbrPartition,
    /// NUL-terminated kernel command line.
    pub command_line: [u8; 512],
}

impl BootInfo {
    /// Checks the magic and revision.
    pub fn validate(&self) -> bool {
        self.magic == BOOT_MAGIC && self.revision == BOOT_REVISION
    }

    /// Returns the command line up to the first NUL.
    pub fn command_line(&self) -> &str {
        let end = self
            .command_line
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.command_line.len());
        core::str::from_utf8(&self.command_line[..end]).unwrap_or("")
    }

    /// Copies the boot memory map into PMM region descriptors.
    ///
    /// `map_virt` must be the virtual mapping of `self.memory_map`.
    ///
    /// # Safety
    ///
    /// `map_virt` must point to `memory_map_entries` valid
    /// [`BootMemoryRange`] records.
    pub unsafe fn copy_memory_map(
        &self,
        map_virt: *const BootMemoryRange,
        out: &mut [PhysMemoryRegion; MAX_MEMORY_RANGES],
    ) -> usize {
        let count = (self.memory_map_entries as usize).min(MAX_MEMORY_RANGES);
        for i in 0..count {
            // SAFETY: Caller guarantees `count` valid entries.
            let range = unsafe { core::ptr::read_unaligned(map_virt.add(i)) };
            out[i] = range.to_region();
        }
        count
    }
}
