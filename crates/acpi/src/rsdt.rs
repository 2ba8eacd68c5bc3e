//! RSDT/XSDT entry enumeration.

use crate::read;
use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// Finds the physical address of the `index`-th table matching
/// `signature` among the root table's entries.
///
/// RSDT entries are 32-bit physical addresses, XSDT entries 64-bit.
pub fn find_table_in_rsdt(
    handler: &impl AcpiHandler,
    root_phys: u64,
    is_xsdt: bool,
    signature: &[u8; 4],
    index: usize,
) -> Option<u64> {
    let expected: &[u8; 4] = if is_xsdt { b"XSDT" } else { b"RSDT" };
    let root = crate::sdt::load_table(handler, root_phys, expected).ok()?;

    let entry_size = if is_xsdt { 8 } else { 4 };
    let entries = (root.header.length as usize - SdtHeader::SIZE) / entry_size;

    let mut matches = 0usize;
    for i in 0..entries {
        let offset = SdtHeader::SIZE + i * entry_size;
        let table_phys = if is_xsdt {
            read::u64_at(root.data, offset)?
        } else {
            u64::from(read::u32_at(root.data, offset)?)
        };

        // SAFETY: The entry came from a checksum-validated root table.
        let header_data = unsafe { handler.map_physical_region(table_phys, SdtHeader::SIZE) };
        let Some(header) = SdtHeader::read_from_bytes(header_data) else {
            continue;
        };
        if &header.signature == signature {
            if matches == index {
                return Some(table_phys);
            }
            matches += 1;
        }
    }
    None
}

/// Convenience wrapper returning [`AcpiError::TableNotFound`].
pub fn require_table(
    handler: &impl AcpiHandler,
    root_phys: u64,
    is_xsdt: bool,
    signature: &[u8; 4],
) -> Result<u64, AcpiError> {
    find_table_in_rsdt(handler, root_phys, is_xsdt, signature, 0).ok_or(AcpiError::TableNotFound)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdt::test_tables;
    use crate::testing::BufferHandler;

    /// Lays out tables in one buffer; returns (buffer, rsdt offset).
    fn layout(is_xsdt: bool, tables: &[Vec<u8>]) -> (Vec<u8>, u64) {
        let mut buffer = Vec::new();
        let mut addrs = Vec::new();
        for table in tables {
            addrs.push(buffer.len() as u64);
            buffer.extend_from_slice(table);
            while buffer.len() % 8 != 0 {
                buffer.push(0);
            }
        }
        let rsdt = test_rsdt::build(is_xsdt, &addrs);
        let rsdt_offset = buffer.len() as u64;
        buffer.extend_from_slice(&rsdt);
        (buffer, rsdt_offset)
    }

    #[test]
    fn finds_table_by_signature() {
        let apic = test_tables::build(b"APIC", &[0; 8]);
        let hpet = test_tables::build(b"HPET", &[0; 20]);
        let (buffer, root) = layout(false, &[apic, hpet]);
        let handler = BufferHandler(buffer.leak());

        let found = find_table_in_rsdt(&handler, root, false, b"HPET", 0);
        assert!(found.is_some());
        assert!(find_table_in_rsdt(&handler, root, false, b"FACP", 0).is_none());
    }

    #[test]
    fn xsdt_entries_are_64_bit() {
        let apic = test_tables::build(b"APIC", &[0; 8]);
        let (buffer, root) = layout(true, &[apic]);
        let handler = BufferHandler(buffer.leak());
        assert!(find_table_in_rsdt(&handler, root, true, b"APIC", 0).is_some());
    }

    #[test]
    fn index_selects_among_duplicates() {
        let ssdt0 = test_tables::build(b"SSDT", &[0xAA; 4]);
        let ssdt1 = test_tables::build(b"SSDT", &[0xBB; 4]);
        let (buffer, root) = layout(false, &[ssdt0, ssdt1]);
        let handler = BufferHandler(buffer.leak());

        let first = find_table_in_rsdt(&handler, root, false, b"SSDT", 0).unwrap();
        let second = find_table_in_rsdt(&handler, root, false, b"SSDT", 1).unwrap();
        assert_ne!(first, second);
        assert!(find_table_in_rsdt(&handler, root, false, b"SSDT", 2).is_none());
    }
}
