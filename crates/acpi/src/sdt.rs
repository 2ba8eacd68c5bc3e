//! System Description Table header and checksum utilities.

use crate::read;
use crate::{AcpiError, AcpiHandler};

/// Standard 36-byte ACPI table header.
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    /// 4-byte ASCII table signature.
    pub signature: [u8; 4],
    /// Total table length, header included.
    pub length: u32,
    /// Table structure revision.
    pub revision: u8,
    /// Checksum byte; the whole table sums to zero.
    pub checksum: u8,
    /// OEM identification string.
    pub oem_id: [u8; 6],
    /// OEM table identification string.
    pub oem_table_id: [u8; 8],
    /// OEM revision number.
    pub oem_revision: u32,
    /// Creator vendor id.
    pub creator_id: u32,
    /// Creator revision.
    pub creator_revision: u32,
}

impl SdtHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 36;

    /// Decodes a header from the start of `data`.
    #[must_use]
    pub fn read_from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            signature: data[0..4].try_into().ok()?,
            length: read::u32_at(data, 4)?,
            revision: read::u8_at(data, 8)?,
            checksum: read::u8_at(data, 9)?,
            oem_id: data[10..16].try_into().ok()?,
            oem_table_id: data[16..24].try_into().ok()?,
            oem_revision: read::u32_at(data, 24)?,
            creator_id: read::u32_at(data, 28)?,
            creator_revision: read::u32_at(data, 32)?,
        })
    }
}

/// Mapped table data with a validated header.
#[derive(Debug)]
pub struct ValidatedTable {
    /// The decoded header.
    pub header: SdtHeader,
    /// The full table bytes (header included), checksum-validated.
    pub data: &'static [u8],
}

/// Maps and validates a table: header first (for the length), then the
/// signature, then the full body and its checksum.
pub fn load_table(
    handler: &impl AcpiHandler,
    phys: u64,
    expected_signature: &[u8; 4],
) -> Result<ValidatedTable, AcpiError> {
    // SAFETY: The caller provides a valid table physical address.
    let header_data = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
    let header = SdtHeader::read_from_bytes(header_data).ok_or(AcpiError::TruncatedData)?;

    if &header.signature != expected_signature {
        return Err(AcpiError::InvalidSignature);
    }

    // SAFETY: The length comes from the validated header.
    let data = unsafe { handler.map_physical_region(phys, header.length as usize) };
    if data.len() < header.length as usize {
        return Err(AcpiError::TruncatedData);
    }

    if !validate_checksum(&data[..header.length as usize]) {
        return Err(AcpiError::InvalidChecksum);
    }

    Ok(ValidatedTable { header, data })
}

/// ACPI checksum rule: all bytes sum to zero mod 256.
#[must_use]
pub fn validate_checksum(data: &[u8]) -> bool {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)) == 0
}


#[cfg(test)]
mod tests {
    use super::test_tables::build;
    use super::*;
    use crate::testing::BufferHandler;

    #[test]
    fn checksum_of_built_table_validates() {
        let table = build(b"TEST", &[1, 2, 3]);
        assert!(validate_checksum(&table));
    }

    #[test]
    fn corrupt_byte_fails_checksum() {
        let mut table = build(b"TEST", &[1, 2, 3]);
        table[40] ^= 0xFF;
        assert!(!validate_checksum(&table));
    }

    #[test]
    fn load_table_round_trip() {
        let table = build(b"ABCD", &[9; 16]);
        let handler = BufferHandler(table.leak());
        let loaded = load_table(&handler, 0, b"ABCD").unwrap();
        assert_eq!(loaded.header.length as usize, loaded.data.len());
        assert_eq!(&loaded.header.signature, b"ABCD");
    }

    #[test]
    fn load_table_rejects_wrong_signature() {
        let table = build(b"ABCD", &[]);
        let handler = BufferHandler(table.leak());
        assert_eq!(
            load_table(&handler, 0, b"EFGH").unwrap_err(),
            AcpiError::InvalidSignature
        );
    }

    #[test]
    fn load_table_rejects_bad_checksum() {
        let mut table = build(b"ABCD", &[1, 2, 3, 4]);
        table[9] ^= 0x55;
        let handler = BufferHandler(table.leak());
        assert_eq!(
            load_table(&handler, 0, b"ABCD").unwrap_err(),
            AcpiError::InvalidChecksum
        );
    }
}
