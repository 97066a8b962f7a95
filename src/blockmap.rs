//! Index of every metadata block in the filesystem, keyed by block number.
//!
//! Journal descriptor blocks only name the filesystem blocks they carry, so
//! this map is what lets replay tell an inode-table update apart from a
//! bitmap update or a plain data block.
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::decode::div_ceil;
use crate::groupdescriptor::GroupDescriptor;
use crate::superblock::Superblock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BlockType {
    InodeTable,
    BlockBitmap,
    InodeBitmap,
    GroupDescriptor,
    Unknown,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::InodeTable => "inode table",
            BlockType::BlockBitmap => "block bitmap",
            BlockType::InodeBitmap => "inode bitmap",
            BlockType::GroupDescriptor => "group descriptor",
            BlockType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Block number to role. Blocks that are not stored are `Unknown`.
#[derive(Debug, Default, Clone)]
pub struct BlockTypeMap {
    types: HashMap<u64, BlockType>,
}

impl BlockTypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, block: u64) -> BlockType {
        self.types.get(&block).copied().unwrap_or(BlockType::Unknown)
    }

    pub fn contains(&self, block: u64) -> bool {
        self.types.contains_key(&block)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Later registrations overwrite earlier ones.
    pub fn register(&mut self, blocks: std::ops::Range<u64>, kind: BlockType) {
        for block in blocks {
            self.types.insert(block, kind);
        }
    }

    /// Register one group's inode table and bitmaps. Nothing is registered
    /// and `false` is returned when a location overflows the block space.
    pub fn register_group(&mut self, sb: &Superblock, gd: &GroupDescriptor) -> bool {
        let spans = (
            gd.inode_table_span(sb),
            gd.block_bitmap_span(sb),
            gd.inode_bitmap_span(sb),
        );
        let (Some(table), Some(block_bitmap), Some(inode_bitmap)) = spans else {
            return false;
        };
        self.register(table, BlockType::InodeTable);
        self.register(block_bitmap, BlockType::BlockBitmap);
        self.register(inode_bitmap, BlockType::InodeBitmap);
        true
    }

    /// Register the primary group descriptor table, which follows the
    /// superblock's block.
    pub fn register_descriptor_table(&mut self, sb: &Superblock) {
        let per_block = (sb.block_size() / sb.descriptor_size() as u64).max(1);
        let table_blocks = div_ceil(sb.group_count(), per_block);
        let first = sb.first_data_block() + 1;
        self.register(first..first + table_blocks, BlockType::GroupDescriptor);
    }

    /// Build the map from every group descriptor. `read_group` failures are
    /// logged and the group skipped.
    pub fn build<F, E>(sb: &Superblock, mut read_group: F) -> Self
    where
        F: FnMut(u64) -> Result<GroupDescriptor, E>,
        E: fmt::Display,
    {
        let mut map = Self::new();
        for group in 0..sb.group_count() {
            match read_group(group) {
                Ok(gd) => {
                    if !map.register_group(sb, &gd) {
                        warn!(
                            "Skipping group {} while indexing metadata: locations overflow",
                            group
                        );
                    }
                }
                Err(e) => warn!("Skipping group {} while indexing metadata: {}", group, e),
            }
        }
        map.register_descriptor_table(sb);
        debug!("Indexed {} metadata blocks", map.len());
        map
    }
}
