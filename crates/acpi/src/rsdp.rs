//! Root System Description Pointer validation.

use crate::read;
use crate::{AcpiError, AcpiHandler};

/// "RSD PTR " — the 8-byte RSDP signature.
const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// Length of the ACPI 1.0 RSDP structure.
const RSDP_V1_SIZE: usize = 20;

/// Length of the extended (ACPI 2.0+) RSDP structure.
const RSDP_V2_SIZE: usize = 36;

/// Validates the RSDP at `phys` and returns the root table address:
/// revision 0 uses the RSDT (32-bit entries), any later revision the XSDT
/// (64-bit entries). The boolean is `true` for the XSDT.
pub fn parse_rsdp(handler: &impl AcpiHandler, phys: u64) -> Result<(u64, bool), AcpiError> {
    // SAFETY: The caller provides the firmware RSDP address.
    let v1 = unsafe { handler.map_physical_region(phys, RSDP_V1_SIZE) };
    if v1.len() < RSDP_V1_SIZE {
        return Err(AcpiError::TruncatedData);
    }
    if &v1[0..8] != RSDP_SIGNATURE {
        return Err(AcpiError::InvalidRsdp);
    }
    if !crate::sdt::validate_checksum(&v1[..RSDP_V1_SIZE]) {
        return Err(AcpiError::InvalidChecksum);
    }

    let revision = v1[15];
    if revision == 0 {
        let rsdt = u64::from(read::u32_at(v1, 16).ok_or(AcpiError::TruncatedData)?);
        return Ok((rsdt, false));
    }

    // SAFETY: Same firmware structure, extended form.
    let v2 = unsafe { handler.map_physical_region(phys, RSDP_V2_SIZE) };
    if v2.len() < RSDP_V2_SIZE {
        return Err(AcpiError::TruncatedData);
    }
    if !crate::sdt::validate_checksum(&v2[..RSDP_V2_SIZE]) {
        return Err(AcpiError::InvalidChecksum);
    }
    let xsdt = read::u64_at(v2, 24).ok_or(AcpiError::TruncatedData)?;
    Ok((xsdt, true))
}


#[cfg(test)]
mod tests {
    use super::test_rsdp::build;
    use super::*;
    use crate::testing::BufferHandler;

    #[test]
    fn revision_zero_uses_rsdt() {
        let rsdp = build(0, 0x1234, 0);
        let handler = BufferHandler(rsdp.leak());
        assert_eq!(parse_rsdp(&handler, 0).unwrap(), (0x1234, false));
    }

    #[test]
    fn later_revision_uses_xsdt() {
        let rsdp = build(2, 0x1234, 0xDEAD_0000);
        let handler = BufferHandler(rsdp.leak());
        assert_eq!(parse_rsdp(&handler, 0).unwrap(), (0xDEAD_0000, true));
    }

    #[test]
    fn bad_signature_rejected() {
        let mut rsdp = build(0, 0x1234, 0);
        rsdp[0] = b'X';
        let handler = BufferHandler(rsdp.leak());
        assert_eq!(parse_rsdp(&handler, 0).unwrap_err(), AcpiError::InvalidRsdp);
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut rsdp = build(0, 0x1234, 0);
        rsdp[8] ^= 1;
        let handler = BufferHandler(rsdp.leak());
        assert_eq!(
            parse_rsdp(&handler, 0).unwrap_err(),
            AcpiError::InvalidChecksum
        );
    }
}
