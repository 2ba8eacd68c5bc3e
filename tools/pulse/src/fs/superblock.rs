//! The on-disk superblock.
//!
//! Fixed at block index 64. 384 bytes, little-endian, checksummed with
//! xxHash64 computed over `superblock_size` bytes with the checksum field
//! zeroed. The `tuning` word packs every format-time knob: block size,
//! fanout, journal mode, endianness, and the bitmap leaf-size limit.

use crate::fs::FsError;
use crate::hash::xxhash64;

/// Magic bytes at offset 0: "pulseio" plus the format version byte.
pub const MAGIC: [u8; 8] = *b"pulseio\x01";

/// Format revision 1.0.0.
pub const MAJOR_REVISION: u16 = 1;
/// Minor revision.
pub const MINOR_REVISION: u16 = 0;
/// Patch revision.
pub const PATCH_REVISION: u16 = 0;

/// The superblock always lives at this block index.
pub const SUPERBLOCK_BLOCK_NUMBER: u64 = 64;

/// Encoded superblock size in bytes.
pub const SUPERBLOCK_SIZE: usize = 384;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 4096;
/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 512 * 1024;

/// Default block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
/// Default bitmap fanout.
pub const DEFAULT_FANOUT: u64 = 16;
/// Default bitmap leaf-size limit in bits.
pub const DEFAULT_BITMAP_LIMIT: u64 = 16384;

// Tuning field bit assignments.
const TUNING_BLOCK_SIZE_MASK: u16 = 0x0007;
const TUNING_FANOUT_MASK: u16 = 0x0018;
const TUNING_FANOUT_SHIFT: u16 = 3;
const TUNING_JOURNAL_MASK: u16 = 0x0060;
const TUNING_ENDIAN_BIG: u16 = 0x0080;
const TUNING_BITMAP_LIMIT_MASK: u16 = 0x0300;
const TUNING_BITMAP_LIMIT_SHIFT: u16 = 8;

/// Journal mode recorded in the tuning word. Only `None` is written
/// today; the codes are part of the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum JournalMode {
    /// No journal.
    None = 0,
    /// Metadata journaling.
    Metadata = 1,
    /// Ordered-data journaling.
    Ordered = 2,
}

/// Packs the tuning word from the format-time knobs.
pub fn pack_tuning(
    block_size: u32,
    fanout: u64,
    bitmap_limit: u64,
    journal: JournalMode,
) -> Result<u16, FsError> {
    let block_code = match block_size {
        4096 => 0u16,
        8192 => 1,
        16384 => 2,
        32768 => 3,
        65536 => 4,
        131072 => 5,
        262144 => 6,
        524288 => 7,
        _ => return Err(FsError::InvalidArgument("block size")),
    };
    let fanout_code = match fanout {
        8 => 0u16,
        16 => 1,
        32 => 2,
        64 => 3,
        _ => return Err(FsError::InvalidArgument("fanout")),
    };
    let limit_code = match bitmap_limit {
        4096 => 0u16,
        8192 => 1,
        16384 => 2,
        32768 => 3,
        _ => return Err(FsError::InvalidArgument("bitmap limit")),
    };

    // Little-endian is the only endianness this tool writes.
    Ok(block_code
        | (fanout_code << TUNING_FANOUT_SHIFT)
        | ((journal as u16) << 5)
        | (limit_code << TUNING_BITMAP_LIMIT_SHIFT))
}

/// Unpacked tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    /// Block size in bytes.
    pub block_size: u32,
    /// Hierarchical bitmap fanout.
    pub fanout: u64,
    /// Bitmap leaf-size limit in bits.
    pub bitmap_limit: u64,
    /// Journal mode.
    pub journal: JournalMode,
    /// Whether the volume is big-endian (never written by this tool).
    pub big_endian: bool,
}

/// Decodes the tuning word.
pub fn unpack_tuning(tuning: u16) -> Result<Tuning, FsError> {
    let block_size = match tuning & TUNING_BLOCK_SIZE_MASK {
        0 => 4096,
        1 => 8192,
        2 => 16384,
        3 => 32768,
        4 => 65536,
        5 => 131072,
        6 => 262144,
        7 => 524288,
        _ => unreachable!(),
    };
    let fanout = match (tuning & TUNING_FANOUT_MASK) >> TUNING_FANOUT_SHIFT {
        0 => 8,
        1 => 16,
        2 => 32,
        _ => 64,
    };
    let bitmap_limit = match (tuning & TUNING_BITMAP_LIMIT_MASK) >> TUNING_BITMAP_LIMIT_SHIFT {
        0 => 4096,
        1 => 8192,
        2 => 16384,
        _ => 32768,
    };
    let journal = match (tuning & TUNING_JOURNAL_MASK) >> 5 {
        0 => JournalMode::None,
        1 => JournalMode::Metadata,
        2 => JournalMode::Ordered,
        _ => return Err(FsError::Corruption("journal mode")),
    };
    Ok(Tuning {
        block_size,
        fanout,
        bitmap_limit,
        journal,
        big_endian: tuning & TUNING_ENDIAN_BIG != 0,
    })
}

/// The decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    /// Format magic, [`MAGIC`].
    pub magic: [u8; 8],
    /// Major revision.
    pub major_revision: u16,
    /// Minor revision.
    pub minor_revision: u16,
    /// Patch revision.
    pub patch: u16,
    /// xxHash64 over `superblock_size` bytes with this field zeroed.
    pub checksum: u64,
    /// Encoded structure size.
    pub superblock_size: u16,
    /// Packed tuning knobs.
    pub tuning: u16,
    /// Volume status byte (clean/dirty).
    pub status: u8,
    /// 128-bit volume UUID.
    pub uuid: [u64; 2],
    /// Volume size in blocks.
    pub volume_size: u64,
    /// Block of the root directory inode.
    pub root_inode: u64,
    /// First block of the hierarchical bitmap.
    pub bitmap_block: u64,
    /// Identifier of the formatting utility.
    pub formatting_utility: u64,
    /// Format time, Unix nanoseconds.
    pub formatting_time: u64,
    /// Last mount time, Unix nanoseconds.
    pub last_mount_time: u64,
    /// Last write time, Unix nanoseconds.
    pub last_write_time: u64,
    /// Last check time, Unix nanoseconds.
    pub last_check_time: u64,
    /// Count of writable mounts.
    pub total_mounts: u64,
    /// Auto-check interval in seconds, 0 to disable.
    pub check_interval: u32,
    /// Volume label, UTF-8, NUL-terminated.
    pub label: [u8; 256],
}

impl SuperBlock {
    /// Encodes into `buf` (which must hold [`SUPERBLOCK_SIZE`] bytes).
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..SUPERBLOCK_SIZE].fill(0);
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..10].copy_from_slice(&self.major_revision.to_le_bytes());
        buf[10..12].copy_from_slice(&self.minor_revision.to_le_bytes());
        buf[12..14].copy_from_slice(&self.patch.to_le_bytes());
        buf[16..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24..26].copy_from_slice(&self.superblock_size.to_le_bytes());
        buf[26..28].copy_from_slice(&self.tuning.to_le_bytes());
        buf[28] = self.status;
        buf[32..40].copy_from_slice(&self.uuid[0].to_le_bytes());
        buf[40..48].copy_from_slice(&self.uuid[1].to_le_bytes());
        buf[48..56].copy_from_slice(&self.volume_size.to_le_bytes());
        buf[56..64].copy_from_slice(&self.root_inode.to_le_bytes());
        buf[64..72].copy_from_slice(&self.bitmap_block.to_le_bytes());
        buf[72..80].copy_from_slice(&self.formatting_utility.to_le_bytes());
        buf[80..88].copy_from_slice(&self.formatting_time.to_le_bytes());
        buf[88..96].copy_from_slice(&self.last_mount_time.to_le_bytes());
        buf[96..104].copy_from_slice(&self.last_write_time.to_le_bytes());
        buf[104..112].copy_from_slice(&self.last_check_time.to_le_bytes());
        buf[112..120].copy_from_slice(&self.total_mounts.to_le_bytes());
        buf[120..124].copy_from_slice(&self.check_interval.to_le_bytes());
        buf[128..384].copy_from_slice(&self.label);
    }

    /// Decodes from `buf` without validating anything.
    pub fn decode(buf: &[u8]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes(buf[at..at + 2].try_into().expect("u16"));
        let u32_at = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().expect("u32"));
        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().expect("u64"));

        let mut label = [0u8; 256];
        label.copy_from_slice(&buf[128..384]);

        Self {
            magic: buf[0..8].try_into().expect("magic"),
            major_revision: u16_at(8),
            minor_revision: u16_at(10),
            patch: u16_at(12),
            checksum: u64_at(16),
            superblock_size: u16_at(24),
            tuning: u16_at(26),
            status: buf[28],
            uuid: [u64_at(32), u64_at(40)],
            volume_size: u64_at(48),
            root_inode: u64_at(56),
            bitmap_block: u64_at(64),
            formatting_utility: u64_at(72),
            formatting_time: u64_at(80),
            last_mount_time: u64_at(88),
            last_write_time: u64_at(96),
            last_check_time: u64_at(104),
            total_mounts: u64_at(112),
            check_interval: u32_at(120),
            label,
        }
    }

    /// Whether magic and revision match this tool's format.
    pub fn matches_format(&self) -> bool {
        self.magic == MAGIC
            && self.major_revision == MAJOR_REVISION
            && self.minor_revision == MINOR_REVISION
            && self.patch == PATCH_REVISION
    }

    /// Computes the checksum: xxHash64 over `superblock_size` bytes with
    /// the checksum field zeroed.
    pub fn compute_checksum(&self) -> u64 {
        let mut scratch = [0u8; SUPERBLOCK_SIZE];
        let mut copy = self.clone();
        copy.checksum = 0;
        copy.encode(&mut scratch);
        xxhash64(&scratch[..usize::from(self.superblock_size).min(SUPERBLOCK_SIZE)])
    }

    /// Stamps a freshly-built superblock's checksum.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Verifies the stored checksum.
    pub fn verify_checksum(&self) -> Result<(), FsError> {
        if self.compute_checksum() != self.checksum {
            return Err(FsError::Corruption("superblock checksum"));
        }
        Ok(())
    }

    /// The label up to its NUL terminator.
    pub fn label_str(&self) -> &str {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(256);
        core::str::from_utf8(&self.label[..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperBlock {
        let mut label = [0u8; 256];
        label[..4].copy_from_slice(b"test");
        let mut sb = SuperBlock {
            magic: MAGIC,
            major_revision: MAJOR_REVISION,
            minor_revision: MINOR_REVISION,
            patch: PATCH_REVISION,
            checksum: 0,
            superblock_size: SUPERBLOCK_SIZE as u16,
            tuning: pack_tuning(4096, 16, 16384, JournalMode::None).unwrap(),
            status: 0,
            uuid: [0x1111, 0x2222],
            volume_size: 524288,
            root_inode: 70,
            bitmap_block: 65,
            formatting_utility: 1,
            formatting_time: 1_700_000_000_000_000_000,
            last_mount_time: 0,
            last_write_time: 0,
            last_check_time: 0,
            total_mounts: 0,
            check_interval: 0,
            label,
        };
        sb.seal();
        sb
    }

    #[test]
    fn magic_bytes_are_pulseio_v1() {
        assert_eq!(MAGIC, [0x70, 0x75, 0x6C, 0x73, 0x65, 0x69, 0x6F, 0x01]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let sb = sample();
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        sb.encode(&mut buf);
        let decoded = SuperBlock::decode(&buf);
        assert_eq!(decoded, sb);
    }

    #[test]
    fn checksum_validates_and_detects_corruption() {
        let mut sb = sample();
        sb.verify_checksum().unwrap();
        sb.volume_size += 1;
        assert!(sb.verify_checksum().is_err());
    }

    #[test]
    fn checksum_field_itself_is_excluded() {
        let sb = sample();
        let mut tampered = sb.clone();
        tampered.checksum ^= 0xFFFF;
        // Recomputation ignores the stored checksum value.
        assert_eq!(sb.compute_checksum(), tampered.compute_checksum());
    }

    #[test]
    fn tuning_round_trips_every_combination() {
        for &block_size in &[4096u32, 8192, 16384, 32768, 65536, 131072, 262144, 524288] {
            for &fanout in &[8u64, 16, 32, 64] {
                for &limit in &[4096u64, 8192, 16384, 32768] {
                    let packed =
                        pack_tuning(block_size, fanout, limit, JournalMode::None).unwrap();
                    let tuning = unpack_tuning(packed).unwrap();
                    assert_eq!(tuning.block_size, block_size);
                    assert_eq!(tuning.fanout, fanout);
                    assert_eq!(tuning.bitmap_limit, limit);
                    assert_eq!(tuning.journal, JournalMode::None);
                    assert!(!tuning.big_endian);
                }
            }
        }
    }

    #[test]
    fn tuning_rejects_invalid_knobs() {
        assert!(pack_tuning(1000, 16, 16384, JournalMode::None).is_err());
        assert!(pack_tuning(4096, 12, 16384, JournalMode::None).is_err());
        assert!(pack_tuning(4096, 16, 1000, JournalMode::None).is_err());
    }

    #[test]
    fn format_mismatch_detected() {
        let mut sb = sample();
        assert!(sb.matches_format());
        sb.magic[7] = 0x02;
        assert!(!sb.matches_format());
    }

    #[test]
    fn label_reads_to_nul() {
        let sb = sample();
        assert_eq!(sb.label_str(), "test");
    }
}
