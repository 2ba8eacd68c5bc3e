//! xxHash64 with the filesystem's fixed seed.
//!
//! Used for the superblock checksum and directory name hashing. The seed
//! is part of the on-disk format: changing it invalidates every checksum.

const PRIME1: u64 = 11400714785074694791;
const PRIME2: u64 = 14029467366897019727;
const PRIME3: u64 = 1609587929392839161;
const PRIME4: u64 = 9650029242287828579;
const PRIME5: u64 = 2870177450012600261;

/// The fixed seed baked into the format.
pub const SEED: u64 = 0x9E37_79B1_85EB_CA87;

#[inline]
fn rotl(x: u64, r: u32) -> u64 {
    x.rotate_left(r)
}

#[inline]
fn round(acc: u64, lane: u64) -> u64 {
    rotl(acc.wrapping_add(lane.wrapping_mul(PRIME2)), 31).wrapping_mul(PRIME1)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().expect("8-byte window"))
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("4-byte window"))
}

/// Hashes `data` with the format seed.
pub fn xxhash64(data: &[u8]) -> u64 {
    let len = data.len();
    let mut offset = 0usize;

    let mut hash = if len >= 32 {
        let mut v1 = SEED.wrapping_add(PRIME1).wrapping_add(PRIME2);
        let mut v2 = SEED.wrapping_add(PRIME2);
        let mut v3 = SEED;
        let mut v4 = SEED.wrapping_sub(PRIME1);

        while offset + 32 <= len {
            v1 = round(v1, read_u64(data, offset));
            v2 = round(v2, read_u64(data, offset + 8));
            v3 = round(v3, read_u64(data, offset + 16));
            v4 = round(v4, read_u64(data, offset + 24));
            offset += 32;
        }

        rotl(v1, 1)
            .wrapping_add(rotl(v2, 7))
            .wrapping_add(rotl(v3, 12))
            .wrapping_add(rotl(v4, 18))
    } else {
        SEED.wrapping_add(PRIME5)
    };

    hash = hash.wrapping_add(len as u64);

    while offset + 8 <= len {
        let mut lane = read_u64(data, offset);
        lane = rotl(lane.wrapping_mul(PRIME2), 31).wrapping_mul(PRIME1);
        hash ^= lane;
        hash = rotl(hash, 27).wrapping_mul(PRIME1).wrapping_add(PRIME4);
        offset += 8;
    }

    if offset + 4 <= len {
        hash ^= u64::from(read_u32(data, offset)).wrapping_mul(PRIME1);
        hash = rotl(hash, 23).wrapping_mul(PRIME2).wrapping_add(PRIME3);
        offset += 4;
    }

    while offset < len {
        hash ^= u64::from(data[offset]).wrapping_mul(PRIME5);
        hash = rotl(hash, 11).wrapping_mul(PRIME1);
        offset += 1;
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(PRIME2);
    hash ^= hash >> 29;
    hash = hash.wrapping_mul(PRIME3);
    hash ^= hash >> 32;
    hash
}

/// Hashes a directory entry name.
pub fn hash_name(name: &str) -> u64 {
    xxhash64(name.as_bytes())
}
