//! Inodes: fixed header plus an inline-or-extents payload.
//!
//! Every inode occupies one block. The 368-byte header is followed by a
//! variable payload: inline file data when bit 31 of `inline_size` is
//! clear, packed extent nodes when it is set. Inline capacity is
//! `block_size − header size`; writes that fit stay inline, larger files
//! promote to the extent tree (interface only here).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs::block::{read_block, write_block};
use crate::fs::{FsError, Mountpoint};

/// Encoded inode header size.
pub const INODE_HEADER_SIZE: usize = 368;

/// `inline_size` bit 31: the payload holds extent nodes, not file bytes.
pub const INLINE_IS_EXTENTS: u32 = 1 << 31;

/// Number of access-history cache slots per inode.
pub const HISTORY_SLOTS: usize = 8;

// Mode bits.
/// Directory.
pub const MODE_TYPE_DIR: u32 = 0x4000;
/// Symbolic link.
pub const MODE_TYPE_LINK: u32 = 0xA000;
/// Owner read.
pub const MODE_U_R: u32 = 0o400;
/// Owner write.
pub const MODE_U_W: u32 = 0o200;
/// Owner execute.
pub const MODE_U_X: u32 = 0o100;
/// Group read.
pub const MODE_G_R: u32 = 0o040;
/// Group execute.
pub const MODE_G_X: u32 = 0o010;
/// Others read.
pub const MODE_O_R: u32 = 0o004;
/// Others execute.
pub const MODE_O_X: u32 = 0o001;

/// One B+-tree extent record: `count` contiguous blocks starting at
/// `block`, holding file bytes from `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentNode {
    /// File byte offset this extent starts at.
    pub offset: u64,
    /// First data block (leaf) or child node block (internal).
    pub block: u64,
    /// Contiguous block count (leaf) or total block count (internal).
    pub count: u64,
    /// Modification time, Unix nanoseconds.
    pub modified_time: u64,
}

impl ExtentNode {
    /// Encoded size.
    pub const SIZE: usize = 32;

    /// Encodes at `buf[at..]`.
    pub fn encode(&self, buf: &mut [u8], at: usize) {
        buf[at..at + 8].copy_from_slice(&self.offset.to_le_bytes());
        buf[at + 8..at + 16].copy_from_slice(&self.block.to_le_bytes());
        buf[at + 16..at + 24].copy_from_slice(&self.count.to_le_bytes());
        buf[at + 24..at + 32].copy_from_slice(&self.modified_time.to_le_bytes());
    }

    /// Decodes from `buf[at..]`.
    pub fn decode(buf: &[u8], at: usize) -> Self {
        let u64_at =
            |o: usize| u64::from_le_bytes(buf[at + o..at + o + 8].try_into().expect("u64"));
        Self {
            offset: u64_at(0),
            block: u64_at(8),
            count: u64_at(16),
            modified_time: u64_at(24),
        }
    }
}

/// Header of every extent B+-tree node block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentHeader {
    /// Valid extents / branches in this node.
    pub size: u64,
    /// Previous leaf block, 0 in internal nodes and the first leaf.
    pub prev_leaf: u64,
    /// Next leaf block, 0 in internal nodes and the last leaf.
    pub next_leaf: u64,
    /// Largest file offset present in this node.
    pub largest_offset: u64,
}

/// One access-history cache slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeHistory {
    /// Hash of the full path to the child inode.
    pub hash: u64,
    /// Child inode number.
    pub inode: u64,
    /// Accesses recorded for the child.
    pub access_count: u64,
    /// Last access time, Unix nanoseconds.
    pub accessed_time: u64,
}

/// A decoded inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Inode number (== its block index).
    pub number: u64,
    /// Type and permission bits.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Hard link count.
    pub link_count: u32,
    /// Creation time, Unix nanoseconds.
    pub created_time: u64,
    /// Modification time.
    pub modified_time: u64,
    /// Access time.
    pub accessed_time: u64,
    /// Attribute-change time.
    pub changed_time: u64,
    /// File size in bytes.
    pub size: u64,
    /// Total extent count (fragmentation telemetry).
    pub extent_count: u64,
    /// Root block of the extent B+ tree, 0 when inline.
    pub extent_tree_root: u64,
    /// Inline payload length; bit 31 marks an extents payload.
    pub inline_size: u32,
    /// Timestamped child-access history.
    pub history: [InodeHistory; HISTORY_SLOTS],
    /// Payload bytes (`inline_size & !INLINE_IS_EXTENTS` of them).
    pub payload: Vec<u8>,
}

impl Inode {
    /// A fresh inode with every counter zeroed and all timestamps set to
    /// `time_ns`.
    pub fn new(number: u64, mode: u32, time_ns: u64) -> Self {
        Self {
            number,
            mode,
            uid: 0,
            gid: 0,
            link_count: 1,
            created_time: time_ns,
            modified_time: time_ns,
            accessed_time: time_ns,
            changed_time: time_ns,
            size: 0,
            extent_count: 0,
            extent_tree_root: 0,
            inline_size: 0,
            history: [InodeHistory::default(); HISTORY_SLOTS],
            payload: Vec::new(),
        }
    }

    /// Bytes of valid inline payload.
    pub fn inline_len(&self) -> usize {
        (self.inline_size & !INLINE_IS_EXTENTS) as usize
    }

    /// Whether the payload is extent nodes rather than file bytes.
    pub fn payload_is_extents(&self) -> bool {
        self.inline_size & INLINE_IS_EXTENTS != 0
    }

    /// Encodes header + payload at the start of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.number.to_le_bytes());
        buf[8..12].copy_from_slice(&self.mode.to_le_bytes());
        buf[12..16].copy_from_slice(&self.uid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.gid.to_le_bytes());
        buf[20..24].copy_from_slice(&self.link_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.created_time.to_le_bytes());
        buf[32..40].copy_from_slice(&self.modified_time.to_le_bytes());
        buf[40..48].copy_from_slice(&self.accessed_time.to_le_bytes());
        buf[48..56].copy_from_slice(&self.changed_time.to_le_bytes());
        buf[56..64].copy_from_slice(&self.size.to_le_bytes());
        buf[64..72].copy_from_slice(&self.extent_count.to_le_bytes());
        buf[72..80].copy_from_slice(&self.extent_tree_root.to_le_bytes());
        buf[80..84].copy_from_slice(&self.inline_size.to_le_bytes());
        // 84..112: reserved.
        for (i, slot) in self.history.iter().enumerate() {
            let at = 112 + i * 32;
            buf[at..at + 8].copy_from_slice(&slot.hash.to_le_bytes());
            buf[at + 8..at + 16].copy_from_slice(&slot.inode.to_le_bytes());
            buf[at + 16..at + 24].copy_from_slice(&slot.access_count.to_le_bytes());
            buf[at + 24..at + 32].copy_from_slice(&slot.accessed_time.to_le_bytes());
        }
        let len = self.inline_len().min(self.payload.len());
        buf[INODE_HEADER_SIZE..INODE_HEADER_SIZE + len].copy_from_slice(&self.payload[..len]);
    }

    /// Decodes header + payload from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().expect("u32"));
        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().expect("u64"));

        let inline_size = u32_at(80);
        let inline_len = (inline_size & !INLINE_IS_EXTENTS) as usize;
        let payload_end = (INODE_HEADER_SIZE + inline_len).min(buf.len());

        let mut history = [InodeHistory::default(); HISTORY_SLOTS];
        for (i, slot) in history.iter_mut().enumerate() {
            let at = 112 + i * 32;
            *slot = InodeHistory {
                hash: u64_at(at),
                inode: u64_at(at + 8),
                access_count: u64_at(at + 16),
                accessed_time: u64_at(at + 24),
            };
        }

        Self {
            number: u64_at(0),
            mode: u32_at(8),
            uid: u32_at(12),
            gid: u32_at(16),
            link_count: u32_at(20),
            created_time: u64_at(24),
            modified_time: u64_at(32),
            accessed_time: u64_at(40),
            changed_time: u64_at(48),
            size: u64_at(56),
            extent_count: u64_at(64),
            extent_tree_root: u64_at(72),
            inline_size,
            history,
            payload: buf[INODE_HEADER_SIZE..payload_end].to_vec(),
        }
    }
}

/// Current time as Unix nanoseconds.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Mountpoint {
    /// Inline capacity of one inode block.
    pub fn inline_capacity(&self) -> usize {
        self.block_size as usize - INODE_HEADER_SIZE
    }

    /// Loads the inode stored in block `number`.
    pub fn read_inode(&mut self, number: u64) -> anyhow::Result<Inode> {
        if number == 0 || number >= self.superblock.volume_size {
            return Err(FsError::InvalidArgument("inode number").into());
        }
        let block_size = self.block_size;
        let mut scratch = std::mem::take(&mut self.metadata_block);
        let result = read_block(&mut self.disk, number, block_size, &mut scratch);
        let inode = result.map(|()| Inode::decode(&scratch));
        self.metadata_block = scratch;
        Ok(inode?)
    }

    /// Stores an inode into its block. Bytes past `header + inline_size`
    /// keep whatever the block already held (padding preserved).
    pub fn write_inode(&mut self, inode: &Inode) -> anyhow::Result<()> {
        if inode.number == 0 || inode.number >= self.superblock.volume_size {
            return Err(FsError::InvalidArgument("inode number").into());
        }
        let block_size = self.block_size;
        let number = inode.number;
        let mut scratch = std::mem::take(&mut self.metadata_block);
        let result = read_block(&mut self.disk, number, block_size, &mut scratch)
            .and_then(|()| {
                inode.encode(&mut scratch);
                write_block(&mut self.disk, number, block_size, &scratch)
            });
        self.metadata_block = scratch;
        result?;
        Ok(())
    }

    /// Writes `data` into the file at `offset`.
    ///
    /// Files without an extent tree store bytes inline while they fit in
    /// `block_size − header`; anything larger requires extent promotion,
    /// which this tool does not implement.
    pub fn write_to_inode(&mut self, number: u64, data: &[u8], offset: u64) -> anyhow::Result<()> {
        if data.is_empty() {
            return Err(FsError::InvalidArgument("empty write").into());
        }
        let mut inode = self.read_inode(number)?;
        let end = offset as usize + data.len();

        if inode.extent_tree_root == 0 && end <= self.inline_capacity() {
            if inode.payload.len() < end {
                inode.payload.resize(end, 0);
            }
            inode.payload[offset as usize..end].copy_from_slice(data);
            if end as u32 > inode.inline_size {
                inode.inline_size = end as u32;
            }
            inode.size = u64::from(inode.inline_size);
            let now = now_ns();
            inode.modified_time = now;
            inode.changed_time = now;
            self.write_inode(&inode)
        } else {
            Err(FsError::Unsupported("extent-tree write").into())
        }
    }
}
