//! Multiple APIC Description Table parsing.
//!
//! The MADT describes the interrupt controller topology: local APICs (one
//! per logical CPU), I/O APICs, interrupt source overrides, NMI wiring,
//! and an optional 64-bit override of the local APIC MMIO base.

use crate::read;
use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// MADT table signature.
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// Local-APIC entry flag: processor enabled.
pub const LAPIC_FLAG_ENABLED: u32 = 1;

/// Parsed MADT.
pub struct Madt {
    /// 32-bit physical address of the local APIC MMIO block. A
    /// [`MadtEntry::LocalApicAddressOverride`] entry supersedes it.
    pub local_apic_address: u32,
    /// MADT flags (bit 0: dual 8259 PICs present).
    pub flags: u32,
    entries_data: &'static [u8],
}

impl Madt {
    /// Fixed MADT fields after the SDT header: LAPIC address + flags.
    const FIELDS_SIZE: usize = 8;

    /// Parses a MADT at the given physical address.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, MADT_SIGNATURE)?;

        let local_apic_address =
            read::u32_at(table.data, SdtHeader::SIZE).ok_or(AcpiError::TruncatedData)?;
        let flags =
            read::u32_at(table.data, SdtHeader::SIZE + 4).ok_or(AcpiError::TruncatedData)?;

        let entries_offset = SdtHeader::SIZE + Self::FIELDS_SIZE;
        let entries_data = table.data.get(entries_offset..).unwrap_or(&[]);

        Ok(Self {
            local_apic_address,
            flags,
            entries_data,
        })
    }

    /// Iterates over the interrupt controller entries.
    #[must_use]
    pub fn entries(&self) -> MadtEntryIter {
        MadtEntryIter {
            data: self.entries_data,
        }
    }

    /// The effective LAPIC MMIO base: the 64-bit override when present,
    /// else the 32-bit field.
    #[must_use]
    pub fn effective_lapic_address(&self) -> u64 {
        for entry in self.entries() {
            if let MadtEntry::LocalApicAddressOverride { address } = entry {
                return address;
            }
        }
        u64::from(self.local_apic_address)
    }
}

/// A single MADT interrupt controller structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    /// Type 0: processor local APIC.
    LocalApic {
        /// ACPI processor UID.
        acpi_processor_id: u8,
        /// The processor's local APIC id.
        apic_id: u8,
        /// Bit 0: enabled; bit 1: online capable.
        flags: u32,
    },
    /// Type 1: I/O APIC.
    IoApic {
        /// I/O APIC id.
        io_apic_id: u8,
        /// Physical MMIO address of the I/O APIC.
        io_apic_address: u32,
        /// First global system interrupt handled by this I/O APIC.
        gsi_base: u32,
    },
    /// Type 2: interrupt source override.
    InterruptSourceOverride {
        /// Bus (always 0, ISA).
        bus: u8,
        /// ISA source IRQ.
        source: u8,
        /// Global system interrupt it maps to.
        gsi: u32,
        /// MPS INTI flags (polarity, trigger mode).
        flags: u16,
    },
    /// Type 3: non-maskable interrupt source.
    NmiSource {
        /// MPS INTI flags.
        flags: u16,
        /// Global system interrupt of the NMI.
        gsi: u32,
    },
    /// Type 4: local APIC NMI pin wiring.
    LocalApicNmi {
        /// ACPI processor UID (0xFF: all processors).
        acpi_processor_id: u8,
        /// MPS INTI flags.
        flags: u16,
        /// LINT pin (0 or 1).
        lint: u8,
    },
    /// Type 5: 64-bit local APIC address override.
    LocalApicAddressOverride {
        /// The overriding physical MMIO address.
        address: u64,
    },
    /// Any entry type this parser does not decode.
    Unknown {
        /// The type byte.
        entry_type: u8,
        /// The entry length including the 2-byte header.
        length: u8,
    },
}

/// Iterator over MADT entries.
pub struct MadtEntryIter {
    data: &'static [u8],
}

impl Iterator for MadtEntryIter {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let entry_type = self.data[0];
        let length = self.data[1] as usize;
        if length < 2 || length > self.data.len() {
            // Malformed entry; stop rather than misparse the remainder.
            self.data = &[];
            return None;
        }
        let entry = &self.data[..length];
        self.data = &self.data[length..];

        Some(decode(entry_type, entry))
    }
}

fn decode(entry_type: u8, entry: &[u8]) -> MadtEntry {
    let unknown = MadtEntry::Unknown {
        entry_type,
        length: entry.len() as u8,
    };
    match entry_type {
        0 if entry.len() >= 8 => MadtEntry::LocalApic {
            acpi_processor_id: entry[2],
            apic_id: entry[3],
            flags: read::u32_at(entry, 4).unwrap_or(0),
        },
        1 if entry.len() >= 12 => MadtEntry::IoApic {
            io_apic_id: entry[2],
            io_apic_address: read::u32_at(entry, 4).unwrap_or(0),
            gsi_base: read::u32_at(entry, 8).unwrap_or(0),
        },
        2 if entry.len() >= 10 => MadtEntry::InterruptSourceOverride {
            bus: entry[2],
            source: entry[3],
            gsi: read::u32_at(entry, 4).unwrap_or(0),
            flags: read::u16_at(entry, 8).unwrap_or(0),
        },
        3 if entry.len() >= 8 => MadtEntry::NmiSource {
            flags: read::u16_at(entry, 2).unwrap_or(0),
            gsi: read::u32_at(entry, 4).unwrap_or(0),
        },
        4 if entry.len() >= 6 => MadtEntry::LocalApicNmi {
            acpi_processor_id: entry[2],
            flags: read::u16_at(entry, 3).unwrap_or(0),
            lint: entry[5],
        },
        5 if entry.len() >= 12 => MadtEntry::LocalApicAddressOverride {
            address: read::u64_at(entry, 4).unwrap_or(0),
        },
        _ => unknown,
    }
}

#[cfg(test)]
pub(crate) mod test_madt {
    /// Builds a MADT with the given LAPIC MMIO base and raw entries.
    pub fn build(lapic_address: u32, entries: &[Vec<u8>]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&lapic_address.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes()); // PCAT_COMPAT
        for entry in entries {
            payload.extend_from_slice(entry);
        }
        crate::sdt::test_tables::build(b"APIC", &payload)
    }

    pub fn local_apic(acpi_id: u8, apic_id: u8, flags: u32) -> Vec<u8> {
        let mut entry = vec![0u8, 8, acpi_id, apic_id];
        entry.extend_from_slice(&flags.to_le_bytes());
        entry
    }

    pub fn io_apic(id: u8, address: u32, gsi_base: u32) -> Vec<u8> {
        let mut entry = vec![1u8, 12, id, 0];
        entry.extend_from_slice(&address.to_le_bytes());
        entry.extend_from_slice(&gsi_base.to_le_bytes());
        entry
    }

    pub fn source_override(source: u8, gsi: u32, flags: u16) -> Vec<u8> {
        let mut entry = vec![2u8, 10, 0, source];
        entry.extend_from_slice(&gsi.to_le_bytes());
        entry.extend_from_slice(&flags.to_le_bytes());
        entry
    }

    pub fn lapic_override(address: u64) -> Vec<u8> {
        let mut entry = vec![5u8, 12, 0, 0];
        entry.extend_from_slice(&address.to_le_bytes());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::test_madt;
    use super::*;
    use crate::testing::BufferHandler;

    #[test]
    fn four_cpu_topology_parses() {
        // The SMP bring-up fixture: LAPIC entries with apic ids {0,1,2,3}.
        let entries: Vec<_> = (0u8..4)
            .map(|id| test_madt::local_apic(id, id, LAPIC_FLAG_ENABLED))
            .collect();
        let table = test_madt::build(0xFEE0_0000, &entries);
        let handler = BufferHandler(table.leak());

        let madt = Madt::parse(&handler, 0).unwrap();
        assert_eq!(madt.local_apic_address, 0xFEE0_0000);

        let mut apic_ids = Vec::new();
        for entry in madt.entries() {
            if let MadtEntry::LocalApic { apic_id, flags, .. } = entry {
                assert!(flags & LAPIC_FLAG_ENABLED != 0);
                apic_ids.push(apic_id);
            }
        }
        assert_eq!(apic_ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn mixed_entries_decode() {
        let entries = vec![
            test_madt::local_apic(0, 0, 1),
            test_madt::io_apic(2, 0xFEC0_0000, 0),
            test_madt::source_override(0, 2, 0),
        ];
        let table = test_madt::build(0xFEE0_0000, &entries);
        let handler = BufferHandler(table.leak());
        let madt = Madt::parse(&handler, 0).unwrap();

        let parsed: Vec<_> = madt.entries().collect();
        assert_eq!(parsed.len(), 3);
        assert!(matches!(parsed[1], MadtEntry::IoApic { io_apic_address: 0xFEC0_0000, .. }));
        assert!(matches!(
            parsed[2],
            MadtEntry::InterruptSourceOverride { source: 0, gsi: 2, .. }
        ));
    }

    #[test]
    fn override_supersedes_lapic_base() {
        let entries = vec![
            test_madt::local_apic(0, 0, 1),
            test_madt::lapic_override(0x1_FEE0_0000),
        ];
        let table = test_madt::build(0xFEE0_0000, &entries);
        let handler = BufferHandler(table.leak());
        let madt = Madt::parse(&handler, 0).unwrap();
        assert_eq!(madt.effective_lapic_address(), 0x1_FEE0_0000);
    }

    #[test]
    fn no_override_keeps_32_bit_base() {
        let entries = vec![test_madt::local_apic(0, 0, 1)];
        let table = test_madt::build(0xFEE0_0000, &entries);
        let handler = BufferHandler(table.leak());
        let madt = Madt::parse(&handler, 0).unwrap();
        assert_eq!(madt.effective_lapic_address(), 0xFEE0_0000);
    }

    #[test]
    fn unknown_entries_are_skipped_not_fatal() {
        let exotic = vec![9u8, 6, 0, 0, 0, 0];
        let entries = vec![exotic, test_madt::local_apic(0, 3, 1)];
        let table = test_madt::build(0xFEE0_0000, &entries);
        let handler = BufferHandler(table.leak());
        let madt = Madt::parse(&handler, 0).unwrap();

        let parsed: Vec<_> = madt.entries().collect();
        assert!(matches!(parsed[0], MadtEntry::Unknown { entry_type: 9, .. }));
        assert!(matches!(parsed[1], MadtEntry::LocalApic { apic_id: 3, .. }));
    }

    #[test]
    fn truncated_entry_stops_iteration() {
        // Entry claims 12 bytes but only 4 remain.
        let broken = vec![1u8, 12, 0, 0];
        let entries = vec![test_madt::local_apic(0, 0, 1), broken];
        let table = test_madt::build(0xFEE0_0000, &entries);
        let handler = BufferHandler(table.leak());
        let madt = Madt::parse(&handler, 0).unwrap();
        assert_eq!(madt.entries().count(), 1);
    }
}
