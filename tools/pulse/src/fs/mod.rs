//! The pulse filesystem engine.
//!
//! On-disk structures (superblock, hierarchical bitmap, inodes,
//! directories) and the mounted-volume state driving them.

pub mod block;
pub mod dir;
pub mod format;
pub mod inode;
pub mod superblock;

use std::fmt;
use std::fs::File;
use std::path::Path;

use meson_hierbitmap::LayerGeometry;

use crate::fs::block::{read_block, write_block};
use crate::fs::superblock::{
    MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, SUPERBLOCK_BLOCK_NUMBER, SUPERBLOCK_SIZE, SuperBlock,
    unpack_tuning,
};

/// Filesystem-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// An on-disk structure failed validation.
    Corruption(&'static str),
    /// A parameter is out of its valid range.
    InvalidArgument(&'static str),
    /// No free block (or other resource) remains.
    Exhausted,
    /// No volume is mounted.
    NotMounted,
    /// The operation is defined by the format but not implemented here.
    Unsupported(&'static str),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corruption(what) => write!(f, "corrupt {what}"),
            Self::InvalidArgument(what) => write!(f, "invalid {what}"),
            Self::Exhausted => write!(f, "volume exhausted"),
            Self::NotMounted => write!(f, "no mounted volume"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
        }
    }
}

impl std::error::Error for FsError {}

/// A mounted pulse volume.
pub struct Mountpoint {
    /// Display name (final path component).
    pub name: String,
    /// The backing image.
    pub disk: File,
    /// Validated superblock.
    pub superblock: SuperBlock,
    /// Block size derived from the tuning word.
    pub block_size: u32,
    /// Bitmap fanout.
    pub fanout: u64,
    /// Bitmap leaf-size limit in bits.
    pub bitmap_limit: u64,
    /// Bitmap layer placement (index 0 = leaf).
    pub layers: LayerGeometry,
    /// Cached copy of the topmost bitmap layer (first bitmap block).
    pub top_layer: Vec<u8>,
    /// Scratch buffer for data blocks.
    pub data_block: Vec<u8>,
    /// Scratch buffer for metadata blocks (inodes, directories).
    pub metadata_block: Vec<u8>,
    /// Scratch buffer for bitmap blocks.
    pub bitmap_scratch: Vec<u8>,
}

impl Mountpoint {
    /// Mounts a disk image.
    ///
    /// Probes block sizes from 4 KiB upward for a superblock at block 64,
    /// verifies magic, revision, and checksum, derives the bitmap
    /// geometry from the tuning word, and caches the topmost layer.
    pub fn mount(path: &Path) -> anyhow::Result<Self> {
        let mut disk = File::options().read(true).write(true).open(path)?;

        // Probe: the superblock's byte offset depends on the block size
        // it was formatted with.
        let mut probe = vec![0u8; SUPERBLOCK_SIZE];
        let mut found: Option<(u32, SuperBlock)> = None;
        let mut block_size = MIN_BLOCK_SIZE;
        while block_size <= MAX_BLOCK_SIZE {
            if read_block(
                &mut disk,
                SUPERBLOCK_BLOCK_NUMBER,
                block_size,
                &mut probe,
            )
            .is_ok()
            {
                let candidate = SuperBlock::decode(&probe);
                if candidate.matches_format() {
                    found = Some((block_size, candidate));
                    break;
                }
            }
            block_size *= 2;
        }
        let Some((probed_size, superblock)) = found else {
            return Err(FsError::Corruption("superblock magic").into());
        };

        // The checksum guards the whole superblock; a mismatch refuses
        // the mount outright.
        superblock.verify_checksum()?;

        let tuning = unpack_tuning(superblock.tuning)?;
        if tuning.block_size != probed_size {
            return Err(FsError::Corruption("tuning block size").into());
        }

        let layers = LayerGeometry::top_down(
            superblock.volume_size,
            tuning.fanout,
            tuning.bitmap_limit,
        )
        .map_err(|_| FsError::Corruption("bitmap geometry"))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let block_size = tuning.block_size;
        let mut mountpoint = Self {
            name,
            disk,
            superblock,
            block_size,
            fanout: tuning.fanout,
            bitmap_limit: tuning.bitmap_limit,
            layers,
            top_layer: vec![0u8; block_size as usize],
            data_block: vec![0u8; block_size as usize],
            metadata_block: vec![0u8; block_size as usize],
            bitmap_scratch: vec![0u8; block_size as usize],
        };
        mountpoint.refresh_top_layer()?;
        Ok(mountpoint)
    }

    /// Re-reads the cached topmost bitmap layer from disk.
    pub fn refresh_top_layer(&mut self) -> anyhow::Result<()> {
        let bitmap_block = self.superblock.bitmap_block;
        read_block(
            &mut self.disk,
            bitmap_block,
            self.block_size,
            &mut self.top_layer,
        )?;
        Ok(())
    }

    /// Writes the superblock back (after re-sealing the checksum).
    pub fn write_superblock(&mut self) -> anyhow::Result<()> {
        self.superblock.seal();
        self.data_block.fill(0);
        self.superblock.encode(&mut self.data_block);
        write_block(
            &mut self.disk,
            SUPERBLOCK_BLOCK_NUMBER,
            self.block_size,
            &self.data_block,
        )?;
        Ok(())
    }

    /// Flushes the image file.
    pub fn sync(&mut self) -> anyhow::Result<()> {
        self.disk.sync_all()?;
        Ok(())
    }
}
