use std::io::{Read, Seek, SeekFrom, Write};

pub mod blockmap;
pub mod config;
pub mod decode;
pub mod error;
pub mod extent;
pub mod groupdescriptor;
pub mod inode;
pub mod journal;
pub mod nojournal;
pub mod recovery;
pub mod replay;
pub mod resolver;
pub mod superblock;

use blockmap::BlockTypeMap;
use groupdescriptor::GroupDescriptor;
use inode::{Inode, InodeSource};
use log::debug;
use resolver::Entry;
use superblock::{Superblock, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};

pub use config::RecoveryConfig;
pub use error::{RecoveryError, Result};

/// Read-only session over an ext filesystem image or block device.
///
/// The body is acquired once and kept for every read of the session; call
/// `into_inner` to get it back.
pub struct ExtFS<T: Read + Seek> {
    pub superblock: Superblock,
    pub config: RecoveryConfig,
    body: T,
}

impl<T: Read + Seek> ExtFS<T> {
    /// Create a new ExtFS instance given any type that implements `Read` and `Seek`.
    pub fn new(body: T) -> Result<Self> {
        Self::with_config(body, RecoveryConfig::default())
    }

    pub fn with_config(mut body: T, config: RecoveryConfig) -> Result<Self> {
        body.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        let mut sb_buf = Vec::with_capacity(SUPERBLOCK_SIZE);
        Read::by_ref(&mut body)
            .take(SUPERBLOCK_SIZE as u64)
            .read_to_end(&mut sb_buf)?;
        let superblock = Superblock::from_bytes(&sb_buf)?;
        debug!(
            "Superblock: {} blocks of {} bytes, {} groups",
            superblock.blocks_count(),
            superblock.block_size(),
            superblock.group_count()
        );

        Ok(ExtFS {
            superblock,
            config,
            body,
        })
    }

    /// Release the underlying body.
    pub fn into_inner(self) -> T {
        self.body
    }

    /// Read exactly `len` bytes at `offset`; a short read is reported as a
    /// truncated `structure`.
    pub fn read_at(&mut self, offset: u64, len: usize, structure: &'static str) -> Result<Vec<u8>> {
        self.body.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        Read::by_ref(&mut self.body)
            .take(len as u64)
            .read_to_end(&mut buf)?;
        RecoveryError::ensure_len(structure, &buf, len)?;
        Ok(buf)
    }

    /// Helper to read one filesystem block into a Vec.
    pub fn read_block(&mut self, block_num: u64) -> Result<Vec<u8>> {
        let blocks_count = self.superblock.blocks_count();
        if block_num >= blocks_count {
            return Err(RecoveryError::BlockOutOfRange {
                block: block_num,
                blocks_count,
            });
        }
        let block_size = self.superblock.block_size();
        self.read_at(block_num * block_size, block_size as usize, "block")
    }

    pub fn group_count(&self) -> u64 {
        self.superblock.group_count()
    }

    /// Byte offset of the group descriptor table that is read. Multi-group
    /// filesystems use the copy stored in group 1; a single group only has
    /// the primary table right after the superblock.
    fn bg_desc_offset(&self) -> u64 {
        let sb = &self.superblock;
        if sb.group_count() > 1 {
            sb.block_size() * (sb.blocks_per_group() + sb.first_data_block() + 1)
        } else {
            sb.block_size() * (sb.first_data_block() + 1)
        }
    }

    /// Read a Group Descriptor by index.
    pub fn group_descriptor(&mut self, group_index: u64) -> Result<GroupDescriptor> {
        if group_index >= self.group_count() {
            return Err(RecoveryError::InvalidFilesystem(format!(
                "group {} does not exist",
                group_index
            )));
        }
        let desc_size = self.superblock.descriptor_size();
        let offset = self.bg_desc_offset() + group_index * desc_size as u64;
        let buf = self.read_at(offset, desc_size, "group descriptor")?;
        GroupDescriptor::from_bytes(&buf, desc_size >= 64)
    }

    /// Read an inode, either from its table on disk or from a table block
    /// already in memory.
    pub fn inode(&mut self, source: InodeSource) -> Result<Inode> {
        let inode_size = self.superblock.inode_size();
        match source {
            InodeSource::ByNumber(inode_num) => {
                if inode_num < 1 || inode_num > self.superblock.s_inodes_count {
                    return Err(RecoveryError::InvalidFilesystem(format!(
                        "Inode {} out of valid range",
                        inode_num
                    )));
                }
                let inodes_per_group = self.superblock.inodes_per_group();
                let group_index = (inode_num - 1) / inodes_per_group;
                let index_within_group = (inode_num - 1) % inodes_per_group;

                let gd = self.group_descriptor(group_index)?;
                let offset = gd.bg_inode_table() * self.superblock.block_size()
                    + index_within_group * inode_size as u64;
                let buf = self.read_at(offset, inode_size, "inode")?;
                Inode::from_bytes(inode_num, &buf, inode_size)
            }
            InodeSource::FromBuffer(block, slot) => Inode::from_table_block(block, slot, inode_size),
        }
    }

    /// Whether `inode` still carries an extent tree or block pointers, as
    /// understood by this filesystem.
    pub fn has_block_pointers(&self, inode: &Inode) -> bool {
        inode.has_block_pointers(self.superblock.has_extents())
    }

    pub fn resolve_entries(&mut self, inode: &Inode) -> Result<Vec<Entry>> {
        resolver::resolve_entries(self, inode)
    }

    /// Index every inode-table, bitmap and descriptor block.
    pub fn block_type_map(&mut self) -> BlockTypeMap {
        let sb = self.superblock.clone();
        BlockTypeMap::build(&sb, |group| self.group_descriptor(group))
    }

    /// Copy the blocks of `entries`, in order, to `out`. Returns the number
    /// of bytes written.
    pub fn stream_entries<W: Write>(&mut self, entries: &[Entry], out: &mut W) -> Result<u64> {
        let mut written = 0u64;
        for entry in entries {
            for i in 0..entry.num_blocks {
                let block = self.read_block(entry.disk_block + i)?;
                out.write_all(&block)?;
                written += block.len() as u64;
            }
        }
        out.flush()?;
        Ok(written)
    }
}
