/// Reference: https://www.kernel.org/doc/html/v4.19/filesystems/ext4/ondisk/index.html#super-block
use log::debug;
use serde::Serialize;
use serde_json::{json, Value};

use crate::decode::{le_u16, le_u32, lo_hi};
use crate::error::{RecoveryError, Result};

pub const SUPERBLOCK_OFFSET: u64 = 0x400;
pub const SUPERBLOCK_SIZE: usize = 0x400;

const EXT_MAGIC: u16 = 0xEF53;
pub const EXT4_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x4;
pub const EXT4_FEATURE_INCOMPAT_EXTENTS: u32 = 0x40;
pub const EXT4_FEATURE_INCOMPAT_64BIT: u32 = 0x80;

#[derive(Debug, Clone, Serialize)]
pub struct Journaling {
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: u32,
    pub s_journal_dev: u32,
    pub s_last_orphan: u32,
    pub s_desc_size: u16,
}

impl Journaling {
    pub fn from_bytes(data: &[u8]) -> Self {
        debug!("Parsing Journal metadata from the superblock.");
        let mut s_journal_uuid = [0u8; 16];
        s_journal_uuid.copy_from_slice(&data[0xD0..0xE0]);
        Self {
            s_journal_uuid,
            s_journal_inum: le_u32(data, 0xE0),
            s_journal_dev: le_u32(data, 0xE4),
            s_last_orphan: le_u32(data, 0xE8),
            s_desc_size: le_u16(data, 0xFE),
        }
    }
}

/// The addressing constants of an ext2/3/4 filesystem.
#[derive(Debug, Clone, Serialize)]
pub struct Superblock {
    pub s_inodes_count: u64,
    pub s_blocks_count: u64,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_magic: u16,
    pub s_rev_level: u32,
    pub s_inode_size: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_volume_name: String,
    pub s_journal: Journaling,
}

impl Superblock {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        RecoveryError::ensure_len("superblock", data, SUPERBLOCK_SIZE)?;

        let s_magic = le_u16(data, 0x38);
        if s_magic != EXT_MAGIC {
            return Err(RecoveryError::InvalidFilesystem(format!(
                "bad superblock magic 0x{:04x}",
                s_magic
            )));
        }

        let s_log_block_size = le_u32(data, 0x18);
        // 64 KiB is the largest block size ext4 supports.
        if s_log_block_size > 6 {
            return Err(RecoveryError::InvalidFilesystem(format!(
                "unsupported log block size {}",
                s_log_block_size
            )));
        }
        let s_blocks_per_group = le_u32(data, 0x20);
        let s_inodes_per_group = le_u32(data, 0x28);
        if s_blocks_per_group == 0 || s_inodes_per_group == 0 {
            return Err(RecoveryError::InvalidFilesystem(
                "zero blocks or inodes per group".to_string(),
            ));
        }

        let s_feature_incompat = le_u32(data, 0x60);
        let has_64bit = (s_feature_incompat & EXT4_FEATURE_INCOMPAT_64BIT) != 0;
        let s_blocks_count_hi = if has_64bit { le_u32(data, 0x150) } else { 0 };

        let s_volume_name = String::from_utf8_lossy(&data[0x78..0x88])
            .trim_end_matches('\0')
            .to_string();

        Ok(Self {
            s_inodes_count: le_u32(data, 0x00) as u64,
            s_blocks_count: lo_hi(le_u32(data, 0x04), s_blocks_count_hi),
            s_first_data_block: le_u32(data, 0x14),
            s_log_block_size,
            s_blocks_per_group,
            s_inodes_per_group,
            s_magic,
            s_rev_level: le_u32(data, 0x4C),
            s_inode_size: le_u16(data, 0x58),
            s_feature_compat: le_u32(data, 0x5C),
            s_feature_incompat,
            s_feature_ro_compat: le_u32(data, 0x64),
            s_volume_name,
            s_journal: Journaling::from_bytes(data),
        })
    }

    pub fn is_64bit(&self) -> bool {
        (self.s_feature_incompat & EXT4_FEATURE_INCOMPAT_64BIT) != 0
    }

    pub fn has_extents(&self) -> bool {
        (self.s_feature_incompat & EXT4_FEATURE_INCOMPAT_EXTENTS) != 0
    }

    pub fn has_journal(&self) -> bool {
        (self.s_feature_compat & EXT4_FEATURE_COMPAT_HAS_JOURNAL) != 0
    }

    pub fn journal_inode(&self) -> u64 {
        self.s_journal.s_journal_inum as u64
    }

    pub fn block_size(&self) -> u64 {
        1024 << self.s_log_block_size
    }

    pub fn blocks_per_group(&self) -> u64 {
        self.s_blocks_per_group as u64
    }

    pub fn blocks_count(&self) -> u64 {
        self.s_blocks_count
    }

    pub fn first_data_block(&self) -> u64 {
        self.s_first_data_block as u64
    }

    pub fn inodes_per_group(&self) -> u64 {
        self.s_inodes_per_group as u64
    }

    /// 256-byte inodes are honoured, anything else is read as the classic
    /// 128-byte record.
    pub fn inode_size(&self) -> usize {
        if self.s_inode_size == 256 {
            256
        } else {
            128
        }
    }

    /// Group descriptors are 32 bytes unless the 64bit feature is on and
    /// the superblock advertises a wider record.
    pub fn descriptor_size(&self) -> usize {
        let desc_size = self.s_journal.s_desc_size as usize;
        if self.is_64bit() && desc_size >= 64 {
            desc_size
        } else {
            32
        }
    }

    /// Number of block groups, counting a partial trailing group.
    pub fn group_count(&self) -> u64 {
        crate::decode::div_ceil(self.s_blocks_count, self.blocks_per_group())
    }

    pub fn print_sp_info(&self) {
        println!("{:#?}", self);
    }

    pub fn to_json(&self) -> Value {
        json!({
            "inodes_count": self.s_inodes_count,
            "blocks_count": self.s_blocks_count,
            "first_data_block": self.s_first_data_block,
            "block_size": self.block_size(),
            "blocks_per_group": self.s_blocks_per_group,
            "inodes_per_group": self.s_inodes_per_group,
            "inode_size": self.inode_size(),
            "descriptor_size": self.descriptor_size(),
            "group_count": self.group_count(),
            "volume_name": self.s_volume_name,
            "magic": format!("0x{:04x}", self.s_magic),
            "feature_incompat": format!("0x{:08x}", self.s_feature_incompat),
            "feature_compat": format!("0x{:08x}", self.s_feature_compat),
            "feature_ro_compat": format!("0x{:08x}", self.s_feature_ro_compat),
            "journal_inode": self.s_journal.s_journal_inum,
            "has_journal": self.has_journal(),
            "has_extents": self.has_extents(),
            "is_64bit": self.is_64bit(),
        })
    }
}
