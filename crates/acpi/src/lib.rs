//! `meson-acpi` — a standalone, `no_std` ACPI table parser.
//!
//! Parses the tables the kernel needs during early boot: RSDP, RSDT/XSDT,
//! MADT, and HPET. No allocation; all iteration happens over byte slices
//! produced by an [`AcpiHandler`] that maps physical memory on demand (an
//! HHDM offset in the kernel, plain buffers in tests).
//!
//! # Usage
//!
//! ```ignore
//! let tables = AcpiTables::new(rsdp_physical_address, handler)?;
//! for entry in tables.madt()?.entries() {
//!     // ...
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub mod hpet;
pub mod madt;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;

pub use hpet::{GenericAddress, HpetTable};
pub use madt::{Madt, MadtEntry, MadtEntryIter};
pub use sdt::{SdtHeader, ValidatedTable};

/// Errors from ACPI table parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// A table or RSDP checksum did not sum to zero.
    InvalidChecksum,
    /// A table signature did not match the expected value.
    InvalidSignature,
    /// The RSDP structure was invalid.
    InvalidRsdp,
    /// No table with the requested signature exists.
    TableNotFound,
    /// A table was too short for the fields it claims.
    TruncatedData,
    /// The HPET is not in memory-mapped I/O space.
    UnsupportedAddressSpace,
}

/// Maps physical memory regions so tables can be read.
///
/// # Safety
///
/// Implementors must return a slice that is valid and readable for `size`
/// bytes at physical address `phys`, and remains valid for `'static` (the
/// kernel's HHDM satisfies this trivially).
pub unsafe trait AcpiHandler {
    /// Maps `size` bytes of physical memory at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must be an ACPI-related physical address and `size` must not
    /// extend beyond the actual table.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8];
}

/// Collection of ACPI tables discovered from the RSDP.
pub struct AcpiTables<H: AcpiHandler> {
    handler: H,
    rsdt_addr: u64,
    is_xsdt: bool,
}

impl<H: AcpiHandler> AcpiTables<H> {
    /// Validates the RSDP at `rsdp_phys` and records the RSDT/XSDT
    /// location. Individual tables are parsed lazily.
    pub fn new(rsdp_phys: u64, handler: H) -> Result<Self, AcpiError> {
        let (rsdt_addr, is_xsdt) = rsdp::parse_rsdp(&handler, rsdp_phys)?;
        Ok(Self {
            handler,
            rsdt_addr,
            is_xsdt,
        })
    }

    /// Returns the physical address of the `index`-th table whose
    /// signature matches.
    #[must_use]
    pub fn find_table(&self, signature: &[u8; 4], index: usize) -> Option<u64> {
        rsdt::find_table_in_rsdt(&self.handler, self.rsdt_addr, self.is_xsdt, signature, index)
    }

    /// Parses the MADT (Multiple APIC Description Table).
    pub fn madt(&self) -> Result<Madt, AcpiError> {
        let phys = self
            .find_table(madt::MADT_SIGNATURE, 0)
            .ok_or(AcpiError::TableNotFound)?;
        Madt::parse(&self.handler, phys)
    }

    /// Parses the HPET table.
    pub fn hpet(&self) -> Result<HpetTable, AcpiError> {
        let phys = self
            .find_table(hpet::HPET_SIGNATURE, 0)
            .ok_or(AcpiError::TableNotFound)?;
        HpetTable::parse(&self.handler, phys)
    }

    /// The underlying handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Physical address of the root table.
    #[must_use]
    pub fn rsdt_addr(&self) -> u64 {
        self.rsdt_addr
    }

    /// Whether the root table is an XSDT.
    #[must_use]
    pub fn is_xsdt(&self) -> bool {
        self.is_xsdt
    }
}

/// Little-endian field readers used by every table module.
pub(crate) mod read {
    pub fn u8_at(data: &[u8], offset: usize) -> Option<u8> {
        data.get(offset).copied()
    }

    pub fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
        Some(u16::from_le_bytes(
            data.get(offset..offset + 2)?.try_into().ok()?,
        ))
    }

    pub fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
        Some(u32::from_le_bytes(
            data.get(offset..offset + 4)?.try_into().ok()?,
        ))
    }

    pub fn u64_at(data: &[u8], offset: usize) -> Option<u64> {
        Some(u64::from_le_bytes(
            data.get(offset..offset + 8)?.try_into().ok()?,
        ))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::AcpiHandler;

    /// Test handler: "physical" addresses are offsets into one leaked
    /// buffer.
    pub struct BufferHandler(pub &'static [u8]);

    // SAFETY: The leaked buffer is 'static and always readable.
    unsafe impl AcpiHandler for BufferHandler {
        unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8] {
            let start = phys as usize;
            &self.0[start..(start + size).min(self.0.len())]
        }
    }
}
