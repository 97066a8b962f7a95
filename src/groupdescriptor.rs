use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::ops::Range;

use crate::decode::{div_ceil, le_u16, le_u32, lo_hi};
use crate::error::{RecoveryError, Result};
use crate::superblock::Superblock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDescriptor {
    // Full 64-bit block number for the block bitmap.
    pub bg_block_bitmap: u64,
    // Full 64-bit block number for the inode bitmap.
    pub bg_inode_bitmap: u64,
    // Full 64-bit block number for the inode table.
    pub bg_inode_table: u64,
    // Free blocks count (high half only on wide descriptors).
    pub bg_free_blocks_count: u32,
    // Free inodes count (high half only on wide descriptors).
    pub bg_free_inodes_count: u32,
    pub bg_flags: u16,
}

impl GroupDescriptor {
    /// Parses a group descriptor from a raw byte slice.
    ///
    /// `data` must contain at least 32 bytes. If `wide` is `true` (64-bit
    /// filesystem with 64-byte descriptors) it must contain 64 bytes, and
    /// every location field is merged with its high half.
    pub fn from_bytes(data: &[u8], wide: bool) -> Result<Self> {
        let needed = if wide { 64 } else { 32 };
        RecoveryError::ensure_len("group descriptor", data, needed)?;

        let (bb_hi, ib_hi, it_hi) = if wide {
            (le_u32(data, 0x20), le_u32(data, 0x24), le_u32(data, 0x28))
        } else {
            (0, 0, 0)
        };
        let (fbc_hi, fic_hi) = if wide {
            (le_u16(data, 0x2C), le_u16(data, 0x2E))
        } else {
            (0, 0)
        };

        Ok(GroupDescriptor {
            bg_block_bitmap: lo_hi(le_u32(data, 0x00), bb_hi),
            bg_inode_bitmap: lo_hi(le_u32(data, 0x04), ib_hi),
            bg_inode_table: lo_hi(le_u32(data, 0x08), it_hi),
            bg_free_blocks_count: ((fbc_hi as u32) << 16) | le_u16(data, 0x0C) as u32,
            bg_free_inodes_count: ((fic_hi as u32) << 16) | le_u16(data, 0x0E) as u32,
            bg_flags: le_u16(data, 0x12),
        })
    }

    /// Returns the 64-bit block number for the inode table.
    pub fn bg_inode_table(&self) -> u64 {
        self.bg_inode_table
    }

    /// Blocks occupied by this group's inode table, as a half-open range.
    /// `None` when the range would run past `u64::MAX`.
    pub fn inode_table_span(&self, sb: &Superblock) -> Option<Range<u64>> {
        let blocks = div_ceil(
            sb.inodes_per_group() * sb.inode_size() as u64,
            sb.block_size(),
        );
        span(self.bg_inode_table, blocks)
    }

    /// Blocks occupied by the block bitmap.
    pub fn block_bitmap_span(&self, sb: &Superblock) -> Option<Range<u64>> {
        span(
            self.bg_block_bitmap,
            div_ceil(sb.blocks_per_group(), sb.block_size() * 8),
        )
    }

    /// Blocks occupied by the inode bitmap.
    pub fn inode_bitmap_span(&self, sb: &Superblock) -> Option<Range<u64>> {
        span(
            self.bg_inode_bitmap,
            div_ceil(sb.inodes_per_group(), sb.block_size() * 8),
        )
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

fn span(start: u64, blocks: u64) -> Option<Range<u64>> {
    start.checked_add(blocks).map(|end| start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_descriptor() -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[0x00..0x04].copy_from_slice(&3u32.to_le_bytes());
        data[0x04..0x08].copy_from_slice(&4u32.to_le_bytes());
        data[0x08..0x0C].copy_from_slice(&5u32.to_le_bytes());
        data[0x0C..0x0E].copy_from_slice(&7u16.to_le_bytes());
        data[0x20..0x24].copy_from_slice(&1u32.to_le_bytes());
        data[0x24..0x28].copy_from_slice(&2u32.to_le_bytes());
        data[0x28..0x2C].copy_from_slice(&3u32.to_le_bytes());
        data
    }

    #[test]
    fn narrow_layout_ignores_high_halves() {
        let gd = GroupDescriptor::from_bytes(&raw_descriptor()[..32], false).unwrap();
        assert_eq!(gd.bg_block_bitmap, 3);
        assert_eq!(gd.bg_inode_bitmap, 4);
        assert_eq!(gd.bg_inode_table, 5);
        assert_eq!(gd.bg_free_blocks_count, 7);
    }

    #[test]
    fn wide_layout_merges_high_halves() {
        let gd = GroupDescriptor::from_bytes(&raw_descriptor(), true).unwrap();
        assert_eq!(gd.bg_block_bitmap, (1 << 32) | 3);
        assert_eq!(gd.bg_inode_bitmap, (2 << 32) | 4);
        assert_eq!(gd.bg_inode_table, (3 << 32) | 5);
    }

    #[test]
    fn short_wide_descriptor_is_truncated() {
        assert!(matches!(
            GroupDescriptor::from_bytes(&raw_descriptor()[..32], true),
            Err(RecoveryError::TruncatedMetadata { needed: 64, got: 32, .. })
        ));
    }
}
