//! High Precision Event Timer table parsing.

use crate::read;
use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// Generic Address Structure address space: system memory.
pub const ADDRESS_SPACE_MEMORY: u8 = 0;

/// Generic Address Structure describing the HPET register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericAddress {
    /// Address space (0 = system memory, 1 = system I/O).
    pub address_space_id: u8,
    /// Register bit width.
    pub register_bit_width: u8,
    /// Register bit offset.
    pub register_bit_offset: u8,
    /// Access size.
    pub access_size: u8,
    /// Address within the given space.
    pub address: u64,
}

/// Parsed HPET table.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Hardware id of the event timer block.
    pub event_timer_block_id: u32,
    /// Where the register block lives.
    pub base_address: GenericAddress,
    /// HPET sequence number.
    pub hpet_number: u8,
    /// Minimum clock tick in periodic mode.
    pub minimum_tick: u16,
    /// Page protection / OEM attribute.
    pub page_protection: u8,
}

impl HpetTable {
    /// Parses an HPET table at the given physical address.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, HPET_SIGNATURE)?;
        let data = table.data;
        let base = SdtHeader::SIZE;

        Ok(Self {
            event_timer_block_id: read::u32_at(data, base).ok_or(AcpiError::TruncatedData)?,
            base_address: GenericAddress {
                address_space_id: read::u8_at(data, base + 4).ok_or(AcpiError::TruncatedData)?,
                register_bit_width: read::u8_at(data, base + 5).ok_or(AcpiError::TruncatedData)?,
                register_bit_offset: read::u8_at(data, base + 6).ok_or(AcpiError::TruncatedData)?,
                access_size: read::u8_at(data, base + 7).ok_or(AcpiError::TruncatedData)?,
                address: read::u64_at(data, base + 8).ok_or(AcpiError::TruncatedData)?,
            },
            hpet_number: read::u8_at(data, base + 16).ok_or(AcpiError::TruncatedData)?,
            minimum_tick: read::u16_at(data, base + 17).ok_or(AcpiError::TruncatedData)?,
            page_protection: read::u8_at(data, base + 19).ok_or(AcpiError::TruncatedData)?,
        })
    }

    /// Fails unless the register block is memory-mapped — the only
    /// addressing the kernel supports.
    pub fn require_memory_space(&self) -> Result<u64, AcpiError> {
        if self.base_address.address_space_id != ADDRESS_SPACE_MEMORY {
            return Err(AcpiError::UnsupportedAddressSpace);
        }
        Ok(self.base_address.address)
    }
}

#[cfg(test)]
pub(crate) mod test_hpet {
    /// Builds an HPET table with the given base address and space id.
    pub fn build(address: u64, space_id: u8) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x8086_A201u32.to_le_bytes()); // block id
        payload.push(space_id);
        payload.push(64); // bit width
        payload.push(0); // bit offset
        payload.push(0); // access size
        payload.extend_from_slice(&address.to_le_bytes());
        payload.push(0); // hpet number
        payload.extend_from_slice(&0x80u16.to_le_bytes()); // minimum tick
        payload.push(0); // page protection
        crate::sdt::test_tables::build(b"HPET", &payload)
    }
}
