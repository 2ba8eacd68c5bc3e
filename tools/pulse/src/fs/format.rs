//! Volume formatting.
//!
//! Lays down a fresh volume: zeroed image, superblock at block 64, the
//! hierarchical bitmap right after it with every block up to and
//! including the root inode marked allocated (parents per the AND rule),
//! and the root directory inode.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use meson_hierbitmap::LayerGeometry;

use crate::fs::FsError;
use crate::fs::block::{read_bit, write_bit, write_block};
use crate::fs::inode::{
    Inode, MODE_G_R, MODE_G_X, MODE_O_R, MODE_O_X, MODE_TYPE_DIR, MODE_U_R, MODE_U_W, MODE_U_X,
    now_ns,
};
use crate::fs::superblock::{
    DEFAULT_BITMAP_LIMIT, MAJOR_REVISION, MAGIC, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, MINOR_REVISION,
    PATCH_REVISION, SUPERBLOCK_BLOCK_NUMBER, SUPERBLOCK_SIZE, SuperBlock, JournalMode,
    pack_tuning,
};
use crate::hash::xxhash64;

/// Identifier this tool writes into `formatting_utility`.
const FORMATTING_UTILITY_ID: u64 = 1;

/// Summary of a fresh format, echoed by the CLI.
pub struct FormatReport {
    /// Volume size in blocks.
    pub block_count: u64,
    /// Bitmap depth.
    pub layer_count: usize,
    /// Blocks occupied by the bitmap.
    pub bitmap_blocks: u64,
    /// Block of the root directory inode.
    pub root_inode: u64,
    /// Total overhead bytes (everything up to and including the root
    /// inode).
    pub overhead_bytes: u64,
}

/// Formats `path` as a pulse volume.
pub fn format(
    path: &Path,
    size: u64,
    block_size: u32,
    fanout: u64,
) -> anyhow::Result<FormatReport> {
    if size == 0 {
        return Err(FsError::InvalidArgument("volume size").into());
    }
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        || !block_size.is_power_of_two()
    {
        return Err(FsError::InvalidArgument("block size").into());
    }
    if !(8..=64).contains(&fanout) || !fanout.is_power_of_two() {
        return Err(FsError::InvalidArgument("fanout").into());
    }

    let block_count = size / u64::from(block_size);
    if block_count <= SUPERBLOCK_BLOCK_NUMBER + 2 {
        return Err(FsError::InvalidArgument("volume size").into());
    }

    let layers = LayerGeometry::top_down(block_count, fanout, DEFAULT_BITMAP_LIMIT)
        .map_err(|_| FsError::InvalidArgument("bitmap geometry"))?;
    let bitmap_blocks = layers.total_bytes().div_ceil(u64::from(block_size));
    let bitmap_block = SUPERBLOCK_BLOCK_NUMBER + 1;
    let root_inode = bitmap_block + bitmap_blocks;
    if root_inode >= block_count {
        return Err(FsError::InvalidArgument("volume too small for metadata").into());
    }

    // Zeroed image. The filesystem defines unwritten blocks as zero, so a
    // sparse file is equivalent to writing zeros block by block.
    let mut disk = File::create(path)?;
    disk.set_len(block_count * u64::from(block_size))?;

    let time_ns = now_ns();

    // Superblock.
    let mut superblock = SuperBlock {
        magic: MAGIC,
        major_revision: MAJOR_REVISION,
        minor_revision: MINOR_REVISION,
        patch: PATCH_REVISION,
        checksum: 0,
        superblock_size: SUPERBLOCK_SIZE as u16,
        tuning: pack_tuning(block_size, fanout, DEFAULT_BITMAP_LIMIT, JournalMode::None)?,
        status: 0,
        uuid: volume_uuid(path, time_ns),
        volume_size: block_count,
        root_inode,
        bitmap_block,
        formatting_utility: FORMATTING_UTILITY_ID,
        formatting_time: time_ns,
        last_mount_time: 0,
        last_write_time: time_ns,
        last_check_time: 0,
        total_mounts: 0,
        check_interval: 0,
        label: [0u8; 256],
    };
    superblock.seal();

    let mut block_buf = vec![0u8; block_size as usize];
    superblock.encode(&mut block_buf);
    write_block(&mut disk, SUPERBLOCK_BLOCK_NUMBER, block_size, &block_buf)?;

    // Hierarchical bitmap: every block up to and including the root inode
    // is allocated; each parent bit is the AND of its children. Bits past
    // each layer's live range are fanout padding, permanently marked used
    // so the allocator can never hand them out.
    let allocated_blocks = root_inode + 1;
    let mut bitmap = vec![0u8; (bitmap_blocks * u64::from(block_size)) as usize];
    for block in 0..allocated_blocks {
        write_bit(&mut bitmap, layers.layer(0).start_bit + block, true);
    }

    let mut live = block_count;
    for layer in 0..layers.count() {
        for bit in live..layers.layer(layer).size_bits {
            write_bit(&mut bitmap, layers.layer(layer).start_bit + bit, true);
        }
        live = live.div_ceil(fanout);
    }

    let mut live = block_count.div_ceil(fanout);
    for layer in 1..layers.count() {
        for parent in 0..live {
            let child_base = layers.layer(layer - 1).start_bit + parent * fanout;
            let full = (0..fanout).all(|j| read_bit(&bitmap, child_base + j));
            if full {
                write_bit(&mut bitmap, layers.layer(layer).start_bit + parent, true);
            }
        }
        live = live.div_ceil(fanout);
    }
    write_block(&mut disk, bitmap_block, block_size, &bitmap)?;

    // Root directory inode: rwxr-xr-x, empty, no extent tree yet.
    let mode = MODE_TYPE_DIR
        | MODE_U_R
        | MODE_U_W
        | MODE_U_X
        | MODE_G_R
        | MODE_G_X
        | MODE_O_R
        | MODE_O_X;
    let root = Inode::new(root_inode, mode, time_ns);
    block_buf.fill(0);
    root.encode(&mut block_buf);
    write_block(&mut disk, root_inode, block_size, &block_buf)?;

    disk.flush()?;

    Ok(FormatReport {
        block_count,
        layer_count: layers.count(),
        bitmap_blocks,
        root_inode,
        overhead_bytes: allocated_blocks * u64::from(block_size),
    })
}

/// Derives a stable-enough volume UUID from the image path and format
/// time.
fn volume_uuid(path: &Path, time_ns: u64) -> [u64; 2] {
    let path_hash = xxhash64(path.to_string_lossy().as_bytes());
    [path_hash, xxhash64(&time_ns.to_le_bytes()) ^ path_hash.rotate_left(17)]
}
