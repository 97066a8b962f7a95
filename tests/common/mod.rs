//! Synthetic ext images for the integration tests.
//!
//! Layout (1 KiB blocks, one group, 256 blocks, 32 inodes of 128 bytes)
//! unless noted:
//! block 1 superblock, 2 group descriptors, 3 block bitmap, 4 inode bitmap,
//! 5..=8 inode table. The journaled image stores inode 8 (block 5 slot 7)
//! as the journal, 16 blocks at disk blocks 20..=35.
#![allow(dead_code)]

use std::io::Cursor;

pub const BLOCK_SIZE: usize = 1024;
pub const BLOCKS: usize = 256;
pub const INODE_SIZE: usize = 128;
pub const INODE_TABLE: u64 = 5;
pub const JOURNAL_START: u64 = 20;
pub const JOURNAL_BLOCKS: u64 = 16;

/// Deletion time of the victim file.
pub const DELETED_AT: u32 = 1_700_000_000;
/// Inode 12 lives in slot 3 of inode-table block 6.
pub const VICTIM_TABLE_BLOCK: u64 = 6;
pub const VICTIM_SLOT: usize = 3;
pub const VICTIM_DATA: u64 = 200;

const EXTENTS_FL: u32 = 0x80000;
const S_IFREG: u16 = 0o100644;
const JBD2_MAGIC: u32 = 0xC03B3998;

/// Content of the victim file: two blocks of a recognisable pattern.
pub fn victim_content() -> Vec<u8> {
    (0..2 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect()
}

pub struct ImageBuilder {
    data: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(journaled: bool) -> Self {
        let mut image = Self {
            data: vec![0u8; BLOCK_SIZE * BLOCKS],
        };

        let sb = image.block_mut(1);
        put_u32(sb, 0x00, 32);
        put_u32(sb, 0x04, BLOCKS as u32);
        put_u32(sb, 0x14, 1);
        put_u32(sb, 0x18, 0);
        put_u32(sb, 0x20, 8192);
        put_u32(sb, 0x28, 32);
        put_u16(sb, 0x38, 0xEF53);
        put_u32(sb, 0x4C, 1);
        put_u16(sb, 0x58, INODE_SIZE as u16);
        if journaled {
            put_u32(sb, 0x5C, 0x4);
            put_u32(sb, 0x60, 0x40);
            put_u32(sb, 0xE0, 8);
        }

        let gd = image.block_mut(2);
        put_u32(gd, 0x00, 3);
        put_u32(gd, 0x04, 4);
        put_u32(gd, 0x08, INODE_TABLE as u32);

        image
    }

    pub fn block_mut(&mut self, block: u64) -> &mut [u8] {
        let start = block as usize * BLOCK_SIZE;
        &mut self.data[start..start + BLOCK_SIZE]
    }

    /// Write the record of inode `inode_num` into the inode table.
    pub fn put_inode(&mut self, inode_num: u64, record: &[u8; INODE_SIZE]) {
        let index = (inode_num - 1) as usize;
        let block = INODE_TABLE + (index * INODE_SIZE / BLOCK_SIZE) as u64;
        let slot = index % (BLOCK_SIZE / INODE_SIZE);
        put_slot(self.block_mut(block), slot, record);
    }

    pub fn mark_inode_used(&mut self, inode_num: u64) {
        let index = (inode_num - 1) as usize;
        self.block_mut(4)[index / 8] |= 1 << (index % 8);
    }

    pub fn into_cursor(self) -> Cursor<Vec<u8>> {
        Cursor::new(self.data)
    }
}

pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_be32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn put_slot(block: &mut [u8], slot: usize, record: &[u8; INODE_SIZE]) {
    block[slot * INODE_SIZE..(slot + 1) * INODE_SIZE].copy_from_slice(record);
}

/// An extent tree node holding `leaves` as (file block, length, disk block),
/// sized for the 60-byte `i_block` area when `len` is 60.
pub fn extent_leaf_node(len: usize, leaves: &[(u32, u16, u64)]) -> Vec<u8> {
    let mut node = vec![0u8; len];
    put_u16(&mut node, 0, 0xF30A);
    put_u16(&mut node, 2, leaves.len() as u16);
    put_u16(&mut node, 4, (len / 12 - 1) as u16);
    put_u16(&mut node, 6, 0);
    for (i, &(file_block, count, start)) in leaves.iter().enumerate() {
        let at = 12 + i * 12;
        put_u32(&mut node, at, file_block);
        put_u16(&mut node, at + 4, count);
        put_u16(&mut node, at + 6, (start >> 32) as u16);
        put_u32(&mut node, at + 8, start as u32);
    }
    node
}

/// An index node at `depth` whose children are (first file block, disk block).
pub fn extent_index_node(len: usize, depth: u16, children: &[(u32, u64)]) -> Vec<u8> {
    let mut node = vec![0u8; len];
    put_u16(&mut node, 0, 0xF30A);
    put_u16(&mut node, 2, children.len() as u16);
    put_u16(&mut node, 4, (len / 12 - 1) as u16);
    put_u16(&mut node, 6, depth);
    for (i, &(file_block, block)) in children.iter().enumerate() {
        let at = 12 + i * 12;
        put_u32(&mut node, at, file_block);
        put_u32(&mut node, at + 4, block as u32);
        put_u16(&mut node, at + 8, (block >> 32) as u16);
    }
    node
}

/// A regular-file inode record with the given `i_block` contents.
pub fn inode_record(size: u32, dtime: u32, flags: u32, i_block: &[u8]) -> [u8; INODE_SIZE] {
    let mut record = [0u8; INODE_SIZE];
    put_u16(&mut record, 0x00, S_IFREG);
    put_u32(&mut record, 0x04, size);
    put_u32(&mut record, 0x14, dtime);
    put_u16(&mut record, 0x1A, if dtime == 0 { 1 } else { 0 });
    put_u32(&mut record, 0x20, flags);
    record[0x28..0x28 + i_block.len()].copy_from_slice(i_block);
    record
}

pub fn extent_inode(size: u32, dtime: u32, leaves: &[(u32, u16, u64)]) -> [u8; INODE_SIZE] {
    inode_record(size, dtime, EXTENTS_FL, &extent_leaf_node(60, leaves))
}

pub fn pointer_inode(size: u32, dtime: u32, pointers: &[u32]) -> [u8; INODE_SIZE] {
    let mut i_block = [0u8; 60];
    for (i, &p) in pointers.iter().enumerate() {
        put_u32(&mut i_block, i * 4, p);
    }
    inode_record(size, dtime, 0, &i_block)
}

fn jbd2_header(block: &mut [u8], blocktype: u32, sequence: u32) {
    put_be32(block, 0, JBD2_MAGIC);
    put_be32(block, 4, blocktype);
    put_be32(block, 8, sequence);
}

/// Descriptor tags for a 32-bit filesystem without checksums: the first tag
/// carries the UUID, later ones share it.
fn descriptor(block: &mut [u8], sequence: u32, tags: &[u32]) {
    jbd2_header(block, 1, sequence);
    let mut offset = 12;
    for (i, &fs_block) in tags.iter().enumerate() {
        put_be32(block, offset, fs_block);
        let mut flags = if i > 0 { 0x2 } else { 0 };
        if i + 1 == tags.len() {
            flags |= 0x8;
        }
        block[offset + 7] = flags;
        offset += if i > 0 { 8 } else { 24 };
    }
}

fn commit(block: &mut [u8], sequence: u32, time: u64) {
    jbd2_header(block, 2, sequence);
    block[0x30..0x38].copy_from_slice(&time.to_be_bytes());
}

/// ext4 image where inode 12 was deleted by transaction 5, committed
/// `commit_delay` seconds after the deletion time. Transaction 4 logged the
/// inode-table block while the file was still intact.
pub fn journaled_image(commit_delay: u64) -> Cursor<Vec<u8>> {
    journaled_image_with(commit_delay, &[(0, 2, VICTIM_DATA)])
}

/// `journaled_image` whose intact copy of inode 12 maps `leaves`.
pub fn journaled_image_with(commit_delay: u64, leaves: &[(u32, u16, u64)]) -> Cursor<Vec<u8>> {
    let mut image = ImageBuilder::new(true);

    let journal_inode = extent_inode(
        (JOURNAL_BLOCKS as usize * BLOCK_SIZE) as u32,
        0,
        &[(0, JOURNAL_BLOCKS as u16, JOURNAL_START)],
    );
    image.put_inode(8, &journal_inode);
    for inode in 1..=12 {
        image.mark_inode_used(inode);
    }

    let live = extent_inode(2 * BLOCK_SIZE as u32, 0, leaves);
    let deleted = extent_inode(2 * BLOCK_SIZE as u32, DELETED_AT, &[]);
    image.put_inode(12, &deleted);

    let content = victim_content();
    image.block_mut(VICTIM_DATA).copy_from_slice(&content[..BLOCK_SIZE]);
    image.block_mut(VICTIM_DATA + 1).copy_from_slice(&content[BLOCK_SIZE..]);

    let j = |n: u64| JOURNAL_START + n;

    let jsb = image.block_mut(j(0));
    jbd2_header(jsb, 4, 1);
    put_be32(jsb, 0x0C, BLOCK_SIZE as u32);
    put_be32(jsb, 0x10, JOURNAL_BLOCKS as u32);
    put_be32(jsb, 0x14, 1);
    put_be32(jsb, 0x18, 4);

    descriptor(image.block_mut(j(1)), 4, &[VICTIM_TABLE_BLOCK as u32]);
    put_slot(image.block_mut(j(2)), VICTIM_SLOT, &live);
    commit(image.block_mut(j(3)), 4, (DELETED_AT - 100) as u64);

    descriptor(image.block_mut(j(4)), 5, &[100, VICTIM_TABLE_BLOCK as u32, 101]);
    put_slot(image.block_mut(j(6)), VICTIM_SLOT, &deleted);
    commit(image.block_mut(j(8)), 5, DELETED_AT as u64 + commit_delay);

    image.into_cursor()
}

/// ext2 image with a bitmap hole at inode 12 and a deleted tail inode 14.
/// Inode 15 has no deletion time, which ends the tail scan before the
/// deleted inode 16.
pub fn ext2_image() -> Cursor<Vec<u8>> {
    let mut image = ImageBuilder::new(false);
    for inode in (1..=11).chain([13]) {
        image.mark_inode_used(inode);
    }
    image.put_inode(12, &pointer_inode(2 * BLOCK_SIZE as u32, DELETED_AT, &[200, 201]));
    image.put_inode(14, &pointer_inode(BLOCK_SIZE as u32, DELETED_AT + 1, &[202]));
    image.put_inode(16, &pointer_inode(BLOCK_SIZE as u32, DELETED_AT + 2, &[203]));

    let content = victim_content();
    image.block_mut(200).copy_from_slice(&content[..BLOCK_SIZE]);
    image.block_mut(201).copy_from_slice(&content[BLOCK_SIZE..]);
    image.into_cursor()
}

/// Two groups of 128 blocks, 16 inodes each. Group 0 keeps its bitmaps at
/// 3 and 4 and its table at 5..=6; group 1 starts at block 129 with the
/// superblock backup, the descriptor backup at 130, bitmaps at 131 and 132
/// and its table at 133..=134. Only the backup descriptor table is filled
/// in since that is the copy the reader uses. With `wide` the filesystem is
/// 64-bit with 64-byte descriptors, and group 1 records 65541 free blocks
/// through the high half of the count.
pub fn two_group_image(wide: bool) -> Cursor<Vec<u8>> {
    let mut image = ImageBuilder {
        data: vec![0u8; BLOCK_SIZE * BLOCKS],
    };

    let sb = image.block_mut(1);
    put_u32(sb, 0x00, 32);
    put_u32(sb, 0x04, BLOCKS as u32);
    put_u32(sb, 0x14, 1);
    put_u32(sb, 0x18, 0);
    put_u32(sb, 0x20, TWO_GROUP_BLOCKS_PER_GROUP as u32);
    put_u32(sb, 0x28, 16);
    put_u16(sb, 0x38, 0xEF53);
    put_u32(sb, 0x4C, 1);
    put_u16(sb, 0x58, INODE_SIZE as u16);
    if wide {
        put_u32(sb, 0x60, 0x80);
        put_u16(sb, 0xFE, 64);
    }

    let desc_size = if wide { 64 } else { 32 };
    let table = image.block_mut(TWO_GROUP_BACKUP_DESCRIPTORS);
    for (group, (block_bitmap, inode_bitmap, inode_table)) in
        [(3u32, 4u32, 5u32), (131, 132, 133)].into_iter().enumerate()
    {
        let gd = &mut table[group * desc_size..(group + 1) * desc_size];
        put_u32(gd, 0x00, block_bitmap);
        put_u32(gd, 0x04, inode_bitmap);
        put_u32(gd, 0x08, inode_table);
        put_u16(gd, 0x0C, 5);
        if wide && group == 1 {
            put_u16(gd, 0x2C, 1);
        }
    }

    // Inode 17 is the first inode of group 1.
    put_slot(image.block_mut(133), 0, &pointer_inode(BLOCK_SIZE as u32, 0, &[150]));
    image.into_cursor()
}

pub const TWO_GROUP_BLOCKS_PER_GROUP: u64 = 128;
pub const TWO_GROUP_BACKUP_DESCRIPTORS: u64 = 130;
