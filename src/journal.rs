//! JBD2 on-disk structures. Everything in the journal is big-endian.
//!
//! Reference: https://www.kernel.org/doc/html/latest/filesystems/ext4/journal.html
use log::debug;
use serde::Serialize;
use std::fmt;

use crate::blockmap::{BlockType, BlockTypeMap};
use crate::decode::{be_u32, be_u64};
use crate::error::{RecoveryError, Result};

pub const JBD2_MAGIC: u32 = 0xC03B3998;
const JOURNAL_HEADER_SIZE: usize = 12;

pub const JBD2_FEATURE_INCOMPAT_64BIT: u32 = 0x2;
pub const JBD2_FEATURE_INCOMPAT_CSUM_V3: u32 = 0x10;

const JBD2_FLAG_SAME_UUID: u8 = 0x2;
const JBD2_FLAG_LAST_TAG: u8 = 0x8;
const UUID_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JournalBlockType {
    Descriptor,
    Commit,
    SuperblockV1,
    SuperblockV2,
    Revoke,
    Other(u32),
}

impl From<u32> for JournalBlockType {
    fn from(value: u32) -> Self {
        match value {
            1 => JournalBlockType::Descriptor,
            2 => JournalBlockType::Commit,
            3 => JournalBlockType::SuperblockV1,
            4 => JournalBlockType::SuperblockV2,
            5 => JournalBlockType::Revoke,
            other => JournalBlockType::Other(other),
        }
    }
}

/// The 12-byte header shared by every journal metadata block.
#[derive(Debug, Clone, Copy)]
pub struct JournalBlockHeader {
    pub h_magic: u32,
    pub h_blocktype: JournalBlockType,
    pub h_sequence: u32,
}

impl JournalBlockHeader {
    /// Fails with `UnrecognizedMagic` for anything that is not a journal
    /// metadata block, which is the common case for logged data blocks.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        RecoveryError::ensure_len("journal block header", data, JOURNAL_HEADER_SIZE)?;
        let h_magic = be_u32(data, 0x0);
        if h_magic != JBD2_MAGIC {
            return Err(RecoveryError::UnrecognizedMagic(h_magic));
        }
        Ok(Self {
            h_magic,
            h_blocktype: JournalBlockType::from(be_u32(data, 0x4)),
            h_sequence: be_u32(data, 0x8),
        })
    }
}

#[derive(Debug, Clone)]
pub struct JournalSuperblock {
    pub header: JournalBlockHeader,
    pub s_blocksize: u32,
    pub s_maxlen: u32,
    pub s_first: u32,
    pub s_sequence: u32,
    pub s_start: u32,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
}

impl JournalSuperblock {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        RecoveryError::ensure_len("journal superblock", data, 0x30)?;
        let header = JournalBlockHeader::from_bytes(data)?;
        if !matches!(
            header.h_blocktype,
            JournalBlockType::SuperblockV1 | JournalBlockType::SuperblockV2
        ) {
            return Err(RecoveryError::JournalUnavailable(format!(
                "journal block 0 is a {:?} block, not a superblock",
                header.h_blocktype
            )));
        }
        Ok(Self {
            header,
            s_blocksize: be_u32(data, 0x0C),
            s_maxlen: be_u32(data, 0x10),
            s_first: be_u32(data, 0x14),
            s_sequence: be_u32(data, 0x18),
            s_start: be_u32(data, 0x1C),
            s_feature_compat: be_u32(data, 0x24),
            s_feature_incompat: be_u32(data, 0x28),
            s_feature_ro_compat: be_u32(data, 0x2C),
        })
    }

    pub fn has_64bit(&self) -> bool {
        self.s_feature_incompat & JBD2_FEATURE_INCOMPAT_64BIT != 0
    }

    pub fn has_csum_v3(&self) -> bool {
        self.s_feature_incompat & JBD2_FEATURE_INCOMPAT_CSUM_V3 != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JournalCommitBlock {
    pub header: JournalBlockHeader,
    pub commit_sec: u64,
    pub commit_nsec: u32,
}

impl JournalCommitBlock {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        RecoveryError::ensure_len("commit block", data, 0x3C)?;
        Ok(Self {
            header: JournalBlockHeader::from_bytes(data)?,
            commit_sec: be_u64(data, 0x30),
            commit_nsec: be_u32(data, 0x38),
        })
    }
}

/// How descriptor tags are laid out for this journal and filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagFormat {
    pub csum_v3: bool,
    pub fs_64bit: bool,
}

impl TagFormat {
    /// Distance to the next tag when the UUID follows this one.
    fn stride(&self) -> usize {
        if self.csum_v3 {
            32
        } else if self.fs_64bit {
            28
        } else {
            24
        }
    }

    /// Bytes of a tag that are read: block number, flags and the high word.
    fn fixed_size(&self) -> usize {
        if self.fs_64bit {
            12
        } else {
            8
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalBlockTag {
    pub blocknr: u64,
    pub flags: u8,
}

impl JournalBlockTag {
    pub fn from_bytes(data: &[u8], offset: usize, format: TagFormat) -> Result<Self> {
        if offset + format.fixed_size() > data.len() {
            return Err(RecoveryError::UnrecognizedBlockTag { offset });
        }
        let mut blocknr = be_u32(data, offset) as u64;
        if format.fs_64bit {
            blocknr |= (be_u32(data, offset + 8) as u64) << 32;
        }
        Ok(Self {
            blocknr,
            flags: data[offset + 7],
        })
    }

    pub fn is_last(&self) -> bool {
        self.flags & JBD2_FLAG_LAST_TAG != 0
    }

    fn next_offset(&self, offset: usize, format: TagFormat) -> usize {
        if self.flags & JBD2_FLAG_SAME_UUID != 0 {
            offset + format.stride() - UUID_SIZE
        } else {
            offset + format.stride()
        }
    }
}

/// Decode the tags of a descriptor block. A tag running past the end of the
/// block ends the list.
pub fn decode_tags(data: &[u8], format: TagFormat) -> Vec<JournalBlockTag> {
    let mut tags = Vec::new();
    let mut offset = JOURNAL_HEADER_SIZE;
    loop {
        let tag = match JournalBlockTag::from_bytes(data, offset, format) {
            Ok(tag) => tag,
            Err(e) => {
                debug!("Descriptor tag list ends early: {}", e);
                break;
            }
        };
        tags.push(tag);
        if tag.is_last() {
            break;
        }
        offset = tag.next_offset(offset, format);
    }
    tags
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionKind {
    /// Looks like the metadata update of a file deletion.
    Deletion,
    /// Touches the inode table.
    Useful,
    NotUseful,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Deletion => "deletion",
            TransactionKind::Useful => "useful",
            TransactionKind::NotUseful => "not useful",
        };
        f.write_str(name)
    }
}

/// Classify a transaction from the roles of the blocks it logged, in
/// descriptor order.
pub fn classify(types: &[BlockType]) -> TransactionKind {
    use BlockType::*;

    if types.len() >= 3 && types[..3] == [Unknown, InodeTable, Unknown] {
        return TransactionKind::Deletion;
    }

    let inode_tables = types.iter().filter(|&&t| t == InodeTable).count();
    if inode_tables > 1
        && matches!(types.first(), Some(Unknown) | Some(InodeTable))
        && types.contains(&BlockBitmap)
    {
        return TransactionKind::Deletion;
    }

    if inode_tables >= 1 {
        TransactionKind::Useful
    } else {
        TransactionKind::NotUseful
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub sequence: u32,
    /// Journal-relative block number of the descriptor block. Logged block
    /// `i` is stored at `descriptor_block + 1 + i`.
    pub descriptor_block: u64,
    /// Seconds since the epoch from the matching commit block, 0 until one
    /// is seen.
    pub commit_time: u64,
    pub kind: TransactionKind,
    /// Filesystem block numbers logged by this transaction with their role.
    pub blocks: Vec<(u64, BlockType)>,
}

impl Transaction {
    pub fn from_descriptor(
        header: &JournalBlockHeader,
        descriptor_block: u64,
        data: &[u8],
        format: TagFormat,
        map: &BlockTypeMap,
    ) -> Self {
        let blocks: Vec<(u64, BlockType)> = decode_tags(data, format)
            .into_iter()
            .map(|tag| (tag.blocknr, map.get(tag.blocknr)))
            .collect();
        let types: Vec<BlockType> = blocks.iter().map(|&(_, t)| t).collect();
        Self {
            sequence: header.h_sequence,
            descriptor_block,
            commit_time: 0,
            kind: classify(&types),
            blocks,
        }
    }

    /// Journal-relative positions of the logged copies of `block`.
    pub fn copies_of(&self, block: u64) -> impl Iterator<Item = u64> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(move |&(_, &(b, _))| b == block)
            .map(move |(i, _)| self.descriptor_block + 1 + i as u64)
    }

    /// Journal-relative positions of every logged inode-table block, with
    /// the filesystem block each one is a copy of.
    pub fn inode_table_copies(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|&(_, &(_, t))| t == BlockType::InodeTable)
            .map(move |(i, &(b, _))| (b, self.descriptor_block + 1 + i as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BlockType::*;

    fn header(blocktype: u32, sequence: u32) -> Vec<u8> {
        let mut data = vec![0u8; 1024];
        data[0..4].copy_from_slice(&JBD2_MAGIC.to_be_bytes());
        data[4..8].copy_from_slice(&blocktype.to_be_bytes());
        data[8..12].copy_from_slice(&sequence.to_be_bytes());
        data
    }

    fn put_tag(data: &mut [u8], offset: usize, block: u32, flags: u8) {
        data[offset..offset + 4].copy_from_slice(&block.to_be_bytes());
        data[offset + 7] = flags;
    }

    #[test]
    fn header_requires_magic() {
        let data = header(1, 9);
        let h = JournalBlockHeader::from_bytes(&data).unwrap();
        assert_eq!(h.h_blocktype, JournalBlockType::Descriptor);
        assert_eq!(h.h_sequence, 9);

        assert!(matches!(
            JournalBlockHeader::from_bytes(&[0u8; 1024]),
            Err(RecoveryError::UnrecognizedMagic(0))
        ));
    }

    #[test]
    fn commit_time_is_big_endian() {
        let mut data = header(2, 4);
        data[0x30..0x38].copy_from_slice(&1_700_000_005u64.to_be_bytes());
        let commit = JournalCommitBlock::from_bytes(&data).unwrap();
        assert_eq!(commit.commit_sec, 1_700_000_005);
        assert_eq!(commit.header.h_sequence, 4);
    }

    #[test]
    fn tags_with_and_without_uuid() {
        let format = TagFormat {
            csum_v3: false,
            fs_64bit: false,
        };
        let mut data = header(1, 1);
        // First tag carries a UUID, the second shares it.
        put_tag(&mut data, 12, 100, 0);
        put_tag(&mut data, 36, 6, JBD2_FLAG_SAME_UUID);
        put_tag(&mut data, 44, 101, JBD2_FLAG_SAME_UUID | JBD2_FLAG_LAST_TAG);
        put_tag(&mut data, 52, 999, 0);

        let blocks: Vec<u64> = decode_tags(&data, format).iter().map(|t| t.blocknr).collect();
        assert_eq!(blocks, vec![100, 6, 101]);
    }

    #[test]
    fn csum_v3_tags_and_high_word() {
        let format = TagFormat {
            csum_v3: true,
            fs_64bit: true,
        };
        let mut data = header(1, 1);
        put_tag(&mut data, 12, 5, 0);
        data[20..24].copy_from_slice(&1u32.to_be_bytes());
        put_tag(&mut data, 44, 7, JBD2_FLAG_SAME_UUID | JBD2_FLAG_LAST_TAG);

        let blocks: Vec<u64> = decode_tags(&data, format).iter().map(|t| t.blocknr).collect();
        assert_eq!(blocks, vec![(1 << 32) | 5, 7]);
    }

    #[test]
    fn unterminated_tag_list_stops_at_block_end() {
        let format = TagFormat {
            csum_v3: false,
            fs_64bit: false,
        };
        let mut data = header(1, 1);
        data.truncate(64);
        put_tag(&mut data, 12, 1, 0);
        put_tag(&mut data, 36, 2, 0);
        // Next tag would start at 60 and needs 8 bytes.
        assert_eq!(decode_tags(&data, format).len(), 2);
        assert!(matches!(
            JournalBlockTag::from_bytes(&data, 60, format),
            Err(RecoveryError::UnrecognizedBlockTag { offset: 60 })
        ));
    }

    #[test]
    fn classification_rules() {
        assert_eq!(classify(&[Unknown, InodeTable, Unknown]), TransactionKind::Deletion);
        assert_eq!(
            classify(&[InodeTable, BlockBitmap, InodeTable]),
            TransactionKind::Deletion
        );
        assert_eq!(classify(&[InodeBitmap, InodeTable]), TransactionKind::Useful);
        assert_eq!(
            classify(&[GroupDescriptor, InodeTable, InodeTable, BlockBitmap]),
            TransactionKind::Useful
        );
        assert_eq!(classify(&[BlockBitmap, Unknown]), TransactionKind::NotUseful);
        assert_eq!(classify(&[]), TransactionKind::NotUseful);
    }

    #[test]
    fn exact_prefix_wins_over_bitmap_rule() {
        // Only the first three blocks matter to the prefix rule.
        let types = [Unknown, InodeTable, Unknown, InodeTable, BlockBitmap];
        assert_eq!(classify(&types), TransactionKind::Deletion);
        assert_eq!(classify(&[Unknown, InodeTable, Unknown, GroupDescriptor]), TransactionKind::Deletion);
    }

    #[test]
    fn transaction_positions() {
        let mut map = BlockTypeMap::new();
        map.register(6..7, InodeTable);
        let format = TagFormat {
            csum_v3: false,
            fs_64bit: false,
        };
        let mut data = header(1, 5);
        put_tag(&mut data, 12, 100, 0);
        put_tag(&mut data, 36, 6, JBD2_FLAG_SAME_UUID);
        put_tag(&mut data, 44, 101, JBD2_FLAG_SAME_UUID | JBD2_FLAG_LAST_TAG);
        let h = JournalBlockHeader::from_bytes(&data).unwrap();

        let tx = Transaction::from_descriptor(&h, 4, &data, format, &map);
        assert_eq!(tx.sequence, 5);
        assert_eq!(tx.kind, TransactionKind::Deletion);
        assert_eq!(tx.copies_of(6).collect::<Vec<_>>(), vec![6]);
        assert_eq!(tx.inode_table_copies().collect::<Vec<_>>(), vec![(6, 6)]);
    }
}
