//! Turn an inode into the list of disk runs holding its data.
use log::{debug, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{Read, Seek};

use crate::decode::le_u32;
use crate::error::{RecoveryError, Result};
use crate::extent::ExtentNode;
use crate::inode::Inode;
use crate::ExtFS;

/// One contiguous run of a file: `num_blocks` blocks starting at file block
/// `file_block`, stored from `disk_block` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub file_block: u64,
    pub num_blocks: u64,
    pub disk_block: u64,
}

impl Entry {
    pub fn new(file_block: u64, num_blocks: u64, disk_block: u64) -> Self {
        Self {
            file_block,
            num_blocks,
            disk_block,
        }
    }

    /// First file block past this run.
    pub fn end(&self) -> u64 {
        self.file_block + self.num_blocks
    }

    pub fn contains(&self, file_block: u64) -> bool {
        file_block >= self.file_block && file_block < self.end()
    }
}

/// Resolve the data runs of `inode`, sorted by file block.
pub fn resolve_entries<T: Read + Seek>(fs: &mut ExtFS<T>, inode: &Inode) -> Result<Vec<Entry>> {
    if fs.superblock.has_extents() {
        read_extent_tree(fs, inode)
    } else {
        read_block_pointers(fs, inode)
    }
}

/// Breadth-first walk of an ext4 extent tree. Index entries are plain block
/// pointers, so the walk is bounded by `max_extent_nodes` and every child
/// must sit exactly one level below its parent.
pub fn read_extent_tree<T: Read + Seek>(fs: &mut ExtFS<T>, inode: &Inode) -> Result<Vec<Entry>> {
    let max_nodes = fs.config.max_extent_nodes;
    let root = ExtentNode::from_bytes(&inode.block_bytes())?;

    let mut queue = VecDeque::new();
    queue.push_back(root);
    let mut visited = 1usize;
    let mut entries = Vec::new();

    while let Some(node) = queue.pop_front() {
        if node.header.is_leaf() {
            entries.extend(
                node.leaves
                    .iter()
                    .filter(|leaf| !leaf.is_empty())
                    .map(|leaf| Entry::new(leaf.ee_block as u64, leaf.len(), leaf.ee_start)),
            );
            continue;
        }

        for index in &node.indices {
            visited += 1;
            if visited > max_nodes {
                return Err(RecoveryError::CorruptExtentTree(format!(
                    "more than {} nodes",
                    max_nodes
                )));
            }
            let block = fs.read_block(index.leaf())?;
            let child = ExtentNode::from_bytes(&block)?;
            if child.header.eh_depth != node.header.eh_depth - 1 {
                return Err(RecoveryError::CorruptExtentTree(format!(
                    "node at block {} has depth {} under a depth {} parent",
                    index.leaf(),
                    child.header.eh_depth,
                    node.header.eh_depth
                )));
            }
            queue.push_back(child);
        }
    }

    debug!("Extent tree: {} nodes, {} extents", visited, entries.len());
    entries.sort_by_key(|e| e.file_block);
    Ok(entries)
}

/// ext2/ext3 layout: 12 direct pointers, then single, double and triple
/// indirect blocks.
pub fn read_block_pointers<T: Read + Seek>(
    fs: &mut ExtFS<T>,
    inode: &Inode,
) -> Result<Vec<Entry>> {
    let blocks_count = fs.superblock.blocks_count();
    let pointers = inode.block_pointers();
    let mut blocks: Vec<u64> = Vec::new();
    for &pointer in pointers[..12].iter().filter(|&&b| b != 0) {
        let pointer = pointer as u64;
        if pointer >= blocks_count {
            warn!("Ignoring direct pointer to block {} outside the filesystem", pointer);
            continue;
        }
        blocks.push(pointer);
    }

    for (slot, depth) in [(12, 1), (13, 2), (14, 3)] {
        blocks.extend(read_indirect_pointers(fs, pointers[slot] as u64, depth)?);
    }

    Ok(blocks_to_entries(&blocks))
}

/// Follow `root` through `depth` levels of pointer blocks and return the
/// data block numbers in file order. Pointers past the end of the
/// filesystem are dropped at every level.
fn read_indirect_pointers<T: Read + Seek>(
    fs: &mut ExtFS<T>,
    root: u64,
    depth: u32,
) -> Result<Vec<u64>> {
    let mut pointers = if root != 0 { vec![root] } else { Vec::new() };

    let blocks_count = fs.superblock.blocks_count();
    for _ in 0..depth {
        let mut next = Vec::new();
        for pointer in pointers {
            if pointer >= blocks_count {
                warn!("Ignoring indirect pointer to block {} outside the filesystem", pointer);
                continue;
            }
            let block = fs.read_block(pointer)?;
            next.extend(
                block
                    .chunks_exact(4)
                    .map(|chunk| le_u32(chunk, 0) as u64)
                    .filter(|&b| b != 0),
            );
        }
        pointers = next;
    }

    pointers.retain(|&b| {
        let inside = b < blocks_count;
        if !inside {
            warn!("Ignoring data pointer to block {} outside the filesystem", b);
        }
        inside
    });
    Ok(pointers)
}

/// Compress an ordered list of block numbers into runs of consecutive
/// blocks.
pub fn blocks_to_entries(blocks: &[u64]) -> Vec<Entry> {
    let mut entries: Vec<Entry> = Vec::new();
    for (file_block, &block) in blocks.iter().enumerate() {
        match entries.last_mut() {
            Some(last) if last.disk_block + last.num_blocks == block => last.num_blocks += 1,
            _ => entries.push(Entry::new(file_block as u64, 1, block)),
        }
    }
    entries
}
