//! Directories: a hashmap of nest blocks.
//!
//! A directory inode's file content is a fixed header followed by a dense
//! table of block pointers; each pointer addresses a "nest" block holding
//! entries of `{inode, name}`. Entry placement hashes the name with
//! xxHash64 modulo the table size. The table grows at ≥75% load or ≥25%
//! collision rate and shrinks below 25% load with <10% collisions, with
//! entries rehashed into fresh nests.

use crate::fs::block::{read_block, write_block};
use crate::fs::inode::now_ns;
use crate::fs::{FsError, Mountpoint};
use crate::hash::hash_name;

/// Nest-table slots a directory starts with.
pub const DIR_DEFAULT_NESTS: u64 = 4;

/// Maximum name length including the NUL terminator.
pub const DIR_MAX_NAME: usize = 1006;

/// Grow when load reaches this percentage of nests in use.
pub const GROW_LOAD_PERCENT: u64 = 75;
/// Grow when this percentage of insertions collided.
pub const GROW_COLLISION_PERCENT: u64 = 25;
/// Shrink below this load percentage...
pub const SHRINK_LOAD_PERCENT: u64 = 25;
/// ...when collisions are also below this percentage.
pub const SHRINK_COLLISION_PERCENT: u64 = 10;

/// Encoded directory header size.
pub const DIR_HEADER_SIZE: usize = 72;

/// Encoded directory entry size: inode + reserved + name.
pub const DIR_ENTRY_SIZE: usize = 16 + DIR_MAX_NAME;

/// The fixed directory header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryHeader {
    /// Nest-table size in slots.
    pub hashmap_size: u64,
    /// Live entries across all nests.
    pub file_count: u64,
    /// Insertions that landed in an occupied nest.
    pub collision_count: u64,
    /// Last resize of either direction, Unix nanoseconds.
    pub last_resize_time: u64,
    /// Last grow time.
    pub last_expand_time: u64,
    /// Last shrink time.
    pub last_shrink_time: u64,
    /// Total resizes.
    pub total_resizes: u64,
    /// Total grows.
    pub total_expands: u64,
    /// Total shrinks.
    pub total_shrinks: u64,
}

impl DirectoryHeader {
    fn encode(&self, buf: &mut [u8]) {
        let fields = [
            self.hashmap_size,
            self.file_count,
            self.collision_count,
            self.last_resize_time,
            self.last_expand_time,
            self.last_shrink_time,
            self.total_resizes,
            self.total_expands,
            self.total_shrinks,
        ];
        for (i, field) in fields.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&field.to_le_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Self {
        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().expect("u64"));
        Self {
            hashmap_size: u64_at(0),
            file_count: u64_at(8),
            collision_count: u64_at(16),
            last_resize_time: u64_at(24),
            last_expand_time: u64_at(32),
            last_shrink_time: u64_at(40),
            total_resizes: u64_at(48),
            total_expands: u64_at(56),
            total_shrinks: u64_at(64),
        }
    }
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode block of the entry.
    pub inode: u64,
    /// Entry name.
    pub name: String,
}

/// In-memory image of a directory: header plus the nest pointer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    /// The fixed header.
    pub header: DirectoryHeader,
    /// Nest blocks, 0 = not yet allocated.
    pub nests: Vec<u64>,
}

impl Directory {
    /// A fresh directory with the default nest table.
    pub fn new() -> Self {
        Self {
            header: DirectoryHeader {
                hashmap_size: DIR_DEFAULT_NESTS,
                ..Default::default()
            },
            nests: vec![0; DIR_DEFAULT_NESTS as usize],
        }
    }

    /// Encoded size: header + one pointer per nest.
    pub fn encoded_len(&self) -> usize {
        DIR_HEADER_SIZE + self.nests.len() * 8
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.header.encode(&mut buf);
        for (i, nest) in self.nests.iter().enumerate() {
            let at = DIR_HEADER_SIZE + i * 8;
            buf[at..at + 8].copy_from_slice(&nest.to_le_bytes());
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < DIR_HEADER_SIZE {
            return Err(FsError::Corruption("directory header"));
        }
        let header = DirectoryHeader::decode(buf);
        let slots = header.hashmap_size as usize;
        if buf.len() < DIR_HEADER_SIZE + slots * 8 {
            return Err(FsError::Corruption("directory nest table"));
        }
        let mut nests = Vec::with_capacity(slots);
        for i in 0..slots {
            let at = DIR_HEADER_SIZE + i * 8;
            nests.push(u64::from_le_bytes(
                buf[at..at + 8].try_into().expect("u64"),
            ));
        }
        Ok(Self { header, nests })
    }

    /// Percentage of nests in use.
    fn load_percent(&self) -> u64 {
        let used = self.nests.iter().filter(|&&n| n != 0).count() as u64;
        used * 100 / self.header.hashmap_size.max(1)
    }

    /// Percentage of insertions that collided.
    fn collision_percent(&self) -> u64 {
        if self.header.file_count == 0 {
            return 0;
        }
        self.header.collision_count * 100 / self.header.file_count
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Mountpoint {
    /// Entries per nest block for this volume's block size.
    pub fn entries_per_nest(&self) -> usize {
        (self.block_size as usize - 8) / DIR_ENTRY_SIZE
    }

    /// Initializes a directory inode with an empty nest table.
    pub fn dir_create(&mut self, inode_number: u64) -> anyhow::Result<()> {
        let directory = Directory::new();
        self.dir_store(inode_number, &directory)
    }

    /// Loads a directory from its inode's inline payload.
    pub fn dir_load(&mut self, inode_number: u64) -> anyhow::Result<Directory> {
        let inode = self.read_inode(inode_number)?;
        if inode.inline_len() == 0 {
            // Never written: an empty directory.
            return Ok(Directory::new());
        }
        Ok(Directory::decode(&inode.payload)?)
    }

    fn dir_store(&mut self, inode_number: u64, directory: &Directory) -> anyhow::Result<()> {
        if directory.encoded_len() > self.inline_capacity() {
            return Err(FsError::Unsupported("extent-backed directory table").into());
        }
        let encoded = directory.encode();
        self.write_to_inode(inode_number, &encoded, 0)
    }

    /// Looks a name up in a directory.
    pub fn dir_lookup(&mut self, inode_number: u64, name: &str) -> anyhow::Result<Option<u64>> {
        let directory = self.dir_load(inode_number)?;
        let slot = (hash_name(name) % directory.header.hashmap_size) as usize;
        let nest = directory.nests[slot];
        if nest == 0 {
            return Ok(None);
        }
        let entries = self.nest_entries(nest)?;
        Ok(entries.into_iter().find(|e| e.name == name).map(|e| e.inode))
    }

    /// Inserts an entry, allocating a nest block on first use of a slot
    /// and resizing the table when the thresholds say so.
    pub fn dir_insert(
        &mut self,
        inode_number: u64,
        name: &str,
        target_inode: u64,
    ) -> anyhow::Result<()> {
        if name.is_empty() || name.len() + 1 > DIR_MAX_NAME {
            return Err(FsError::InvalidArgument("entry name").into());
        }
        let mut directory = self.dir_load(inode_number)?;

        let slot = (hash_name(name) % directory.header.hashmap_size) as usize;
        let mut nest = directory.nests[slot];
        if nest == 0 {
            nest = self.allocate_block()?;
            self.zero_block(nest)?;
            directory.nests[slot] = nest;
        } else {
            directory.header.collision_count += 1;
        }

        self.nest_append(nest, name, target_inode)?;
        directory.header.file_count += 1;

        if directory.load_percent() >= GROW_LOAD_PERCENT
            || directory.collision_percent() >= GROW_COLLISION_PERCENT
        {
            let target = directory.header.hashmap_size * 2;
            self.dir_resize(&mut directory, target)?;
        }

        self.dir_store(inode_number, &directory)
    }

    /// Removes an entry. Shrinks the table when it gets sparse and quiet.
    pub fn dir_remove(&mut self, inode_number: u64, name: &str) -> anyhow::Result<bool> {
        let mut directory = self.dir_load(inode_number)?;
        let slot = (hash_name(name) % directory.header.hashmap_size) as usize;
        let nest = directory.nests[slot];
        if nest == 0 {
            return Ok(false);
        }

        let mut entries = self.nest_entries(nest)?;
        let before = entries.len();
        entries.retain(|e| e.name != name);
        if entries.len() == before {
            return Ok(false);
        }
        directory.header.file_count -= 1;

        if entries.is_empty() {
            self.free_nest_chain(nest)?;
            directory.nests[slot] = 0;
        } else {
            self.nest_rewrite(nest, &entries)?;
        }

        if directory.header.hashmap_size > DIR_DEFAULT_NESTS
            && directory.load_percent() < SHRINK_LOAD_PERCENT
            && directory.collision_percent() < SHRINK_COLLISION_PERCENT
        {
            let target = (directory.header.hashmap_size / 2).max(DIR_DEFAULT_NESTS);
            self.dir_resize(&mut directory, target)?;
        }

        self.dir_store(inode_number, &directory)?;
        Ok(true)
    }

    /// Rehashes every entry into a fresh nest table of `new_size` slots.
    fn dir_resize(&mut self, directory: &mut Directory, new_size: u64) -> anyhow::Result<()> {
        let mut all = Vec::new();
        let nests: Vec<u64> = directory.nests.iter().copied().filter(|&n| n != 0).collect();
        for nest in nests {
            all.extend(self.nest_entries(nest)?);
            self.free_nest_chain(nest)?;
        }

        let grew = new_size > directory.header.hashmap_size;
        directory.header.hashmap_size = new_size;
        directory.nests = vec![0; new_size as usize];
        directory.header.collision_count = 0;

        for entry in &all {
            let slot = (hash_name(&entry.name) % new_size) as usize;
            let mut nest = directory.nests[slot];
            if nest == 0 {
                nest = self.allocate_block()?;
                self.zero_block(nest)?;
                directory.nests[slot] = nest;
            } else {
                directory.header.collision_count += 1;
            }
            self.nest_append(nest, &entry.name, entry.inode)?;
        }

        let now = now_ns();
        directory.header.last_resize_time = now;
        directory.header.total_resizes += 1;
        if grew {
            directory.header.last_expand_time = now;
            directory.header.total_expands += 1;
        } else {
            directory.header.last_shrink_time = now;
            directory.header.total_shrinks += 1;
        }
        Ok(())
    }

    // -- nest blocks ---------------------------------------------------------
    //
    // A nest block starts with a `next` pointer (0 = end of chain)
    // followed by entry slots. Overflowing nests chain additional blocks.

    /// Upper bound on chain walks; a longer chain means a corrupt link.
    const MAX_NEST_CHAIN: usize = 4096;

    fn zero_block(&mut self, block: u64) -> anyhow::Result<()> {
        let block_size = self.block_size;
        self.data_block.fill(0);
        write_block(&mut self.disk, block, block_size, &self.data_block)?;
        Ok(())
    }

    fn read_nest(&mut self, nest: u64) -> anyhow::Result<Vec<u8>> {
        let block_size = self.block_size;
        let mut buf = vec![0u8; block_size as usize];
        read_block(&mut self.disk, nest, block_size, &mut buf)?;
        Ok(buf)
    }

    fn nest_next(buf: &[u8]) -> u64 {
        u64::from_le_bytes(buf[0..8].try_into().expect("u64"))
    }

    /// The blocks of a nest chain, in order.
    fn nest_chain(&mut self, first: u64) -> anyhow::Result<Vec<u64>> {
        let mut chain = Vec::new();
        let mut nest = first;
        while nest != 0 {
            chain.push(nest);
            if chain.len() > Self::MAX_NEST_CHAIN {
                return Err(FsError::Corruption("nest chain").into());
            }
            let buf = self.read_nest(nest)?;
            nest = Self::nest_next(&buf);
        }
        Ok(chain)
    }

    /// Reads every live entry across a nest chain.
    fn nest_entries(&mut self, first: u64) -> anyhow::Result<Vec<DirEntry>> {
        let per_nest = self.entries_per_nest();
        let mut entries = Vec::new();
        for nest in self.nest_chain(first)? {
            let buf = self.read_nest(nest)?;
            for i in 0..per_nest {
                let at = 8 + i * DIR_ENTRY_SIZE;
                let inode = u64::from_le_bytes(buf[at..at + 8].try_into().expect("u64"));
                if inode == 0 {
                    continue;
                }
                let name_bytes = &buf[at + 16..at + 16 + DIR_MAX_NAME];
                let end = name_bytes
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(DIR_MAX_NAME);
                let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
                entries.push(DirEntry { inode, name });
            }
        }
        Ok(entries)
    }

    fn write_entry_slot(buf: &mut [u8], slot: usize, name: &str, inode: u64) {
        let at = 8 + slot * DIR_ENTRY_SIZE;
        buf[at..at + 8].copy_from_slice(&inode.to_le_bytes());
        buf[at + 8..at + 16].fill(0);
        let name_area = &mut buf[at + 16..at + 16 + DIR_MAX_NAME];
        name_area.fill(0);
        name_area[..name.len()].copy_from_slice(name.as_bytes());
    }

    /// Appends an entry into the first free slot of a nest chain, growing
    /// the chain by one block when every nest is full.
    fn nest_append(&mut self, first: u64, name: &str, inode: u64) -> anyhow::Result<()> {
        let block_size = self.block_size;
        let per_nest = self.entries_per_nest();

        let mut nest = first;
        for _ in 0..Self::MAX_NEST_CHAIN {
            let mut buf = self.read_nest(nest)?;
            for i in 0..per_nest {
                let at = 8 + i * DIR_ENTRY_SIZE;
                let slot_inode = u64::from_le_bytes(buf[at..at + 8].try_into().expect("u64"));
                if slot_inode == 0 {
                    Self::write_entry_slot(&mut buf, i, name, inode);
                    write_block(&mut self.disk, nest, block_size, &buf)?;
                    return Ok(());
                }
            }

            let next = Self::nest_next(&buf);
            if next != 0 {
                nest = next;
                continue;
            }

            // Chain full: grow by one block and put the entry there.
            let grown = self.allocate_block()?;
            self.zero_block(grown)?;
            buf[0..8].copy_from_slice(&grown.to_le_bytes());
            write_block(&mut self.disk, nest, block_size, &buf)?;

            let mut fresh = vec![0u8; block_size as usize];
            Self::write_entry_slot(&mut fresh, 0, name, inode);
            write_block(&mut self.disk, grown, block_size, &fresh)?;
            return Ok(());
        }
        Err(FsError::Corruption("nest chain").into())
    }

    /// Rewrites a nest chain to hold exactly `entries`, freeing surplus
    /// chain blocks.
    fn nest_rewrite(&mut self, first: u64, entries: &[DirEntry]) -> anyhow::Result<()> {
        let block_size = self.block_size;
        let per_nest = self.entries_per_nest();
        let chain = self.nest_chain(first)?;
        let needed = entries.len().div_ceil(per_nest).max(1);

        for (block_index, nest) in chain.iter().take(needed).enumerate() {
            let mut buf = vec![0u8; block_size as usize];
            let keep_link = block_index + 1 < needed;
            if keep_link {
                buf[0..8].copy_from_slice(&chain[block_index + 1].to_le_bytes());
            }
            for (slot, entry) in entries
                .iter()
                .skip(block_index * per_nest)
                .take(per_nest)
                .enumerate()
            {
                Self::write_entry_slot(&mut buf, slot, &entry.name, entry.inode);
            }
            write_block(&mut self.disk, *nest, block_size, &buf)?;
        }

        // Entries always shrink on this path, so the chain never grows.
        for nest in chain.iter().skip(needed) {
            self.free_block(*nest)?;
        }
        Ok(())
    }

    /// Frees every block of a nest chain.
    fn free_nest_chain(&mut self, first: u64) -> anyhow::Result<()> {
        for nest in self.nest_chain(first)? {
            self.free_block(nest)?;
        }
        Ok(())
    }

    /// Resolves an absolute path to an inode, starting at the root
    /// directory.
    pub fn resolve(&mut self, path: &str) -> anyhow::Result<u64> {
        let mut current = self.superblock.root_inode;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match self.dir_lookup(current, component)? {
                Some(inode) => current = inode,
                None => return Err(FsError::InvalidArgument("path component").into()),
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encode_decode() {
        let header = DirectoryHeader {
            hashmap_size: 8,
            file_count: 3,
            collision_count: 1,
            total_resizes: 2,
            ..Default::default()
        };
        let mut buf = vec![0u8; DIR_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(DirectoryHeader::decode(&buf), header);
    }

    #[test]
    fn directory_encode_decode() {
        let mut directory = Directory::new();
        directory.nests = vec![0, 100, 0, 200];
        directory.header.file_count = 2;
        let buf = directory.encode();
        assert_eq!(Directory::decode(&buf).unwrap(), directory);
    }

    #[test]
    fn entry_size_matches_format() {
        // inode + reserved + 1006-byte name.
        assert_eq!(DIR_ENTRY_SIZE, 1022);
    }

    #[test]
    fn load_and_collision_percentages() {
        let mut directory = Directory::new();
        directory.nests = vec![1, 2, 3, 0];
        directory.header.file_count = 8;
        directory.header.collision_count = 2;
        assert_eq!(directory.load_percent(), 75);
        assert_eq!(directory.collision_percent(), 25);
    }
}
