//! Deleted-file candidates for filesystems without a journal (ext2).
//!
//! ext2 leaves the block pointers of a deleted inode in place and only
//! clears its bit in the inode bitmap, so free slots surrounded by used ones
//! are the likely remains of deleted files.
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::io::{Read, Seek};
use std::path::Path;

use crate::decode::{bytes_to_bits, div_ceil};
use crate::error::{RecoveryError, Result};
use crate::inode::InodeSource;
use crate::recovery::{timestamp, write_inode_file, RecoveryOutcome};
use crate::ExtFS;

/// Free positions found in one inode bitmap, as group-relative indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapScan {
    /// Clear bits that lie before the last set bit.
    pub holes: Vec<u64>,
    /// First index after the last set bit.
    pub tail_start: u64,
}

/// Scan the first `inodes_per_group` bits of an inode bitmap.
pub fn find_holes(bitmap: &[u8], inodes_per_group: u64) -> BitmapScan {
    let bits = bytes_to_bits(bitmap);
    let bits = &bits[..bits.len().min(inodes_per_group as usize)];
    match bits.iter().rposition(|&used| used) {
        Some(last) => BitmapScan {
            holes: (0..last).filter(|&i| !bits[i]).map(|i| i as u64).collect(),
            tail_start: last as u64 + 1,
        },
        None => BitmapScan {
            holes: Vec::new(),
            tail_start: 0,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnjournaledInode {
    pub inode: u64,
    pub deletion_time: u32,
}

impl UnjournaledInode {
    pub fn file_name(&self) -> String {
        format!("recovered_{}_inode{}", timestamp(self.deletion_time), self.inode)
    }
}

impl fmt::Display for UnjournaledInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inode {}", self.inode)
    }
}

/// Deleted inodes found through the inode bitmaps, most recent deletion
/// first.
pub fn deleted_inodes_no_journal<T: Read + Seek>(fs: &mut ExtFS<T>) -> Vec<UnjournaledInode> {
    let inodes_per_group = fs.superblock.inodes_per_group();
    let bitmap_len = div_ceil(inodes_per_group, 8) as usize;
    let block_size = fs.superblock.block_size();
    let mut deleted = Vec::new();

    for group in 0..fs.group_count() {
        let bitmap = match fs.group_descriptor(group).and_then(|gd| {
            fs.read_at(gd.bg_inode_bitmap * block_size, bitmap_len, "inode bitmap")
        }) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                warn!("Skipping group {}: {}", group, e);
                continue;
            }
        };

        let scan = find_holes(&bitmap, inodes_per_group);
        let first_inode = group * inodes_per_group + 1;

        for index in scan.holes {
            let inode_num = first_inode + index;
            match fs.inode(InodeSource::ByNumber(inode_num)) {
                Ok(inode) if inode.is_deleted() => deleted.push(UnjournaledInode {
                    inode: inode_num,
                    deletion_time: inode.deletion_time(),
                }),
                Ok(_) => {}
                Err(e) => warn!("Inode {}: {}", inode_num, e),
            }
        }

        for index in scan.tail_start..inodes_per_group {
            let inode_num = first_inode + index;
            match fs.inode(InodeSource::ByNumber(inode_num)) {
                Ok(inode) if inode.is_deleted() => deleted.push(UnjournaledInode {
                    inode: inode_num,
                    deletion_time: inode.deletion_time(),
                }),
                Ok(_) => break,
                Err(e) => {
                    warn!("Inode {}: {}", inode_num, e);
                    break;
                }
            }
        }
    }

    deleted.sort_by(|a, b| b.deletion_time.cmp(&a.deletion_time));
    info!("Found {} deleted inodes through the inode bitmaps", deleted.len());
    deleted
}

/// Recover one bitmap candidate into `dir`.
pub fn recover_inode<T: Read + Seek>(
    fs: &mut ExtFS<T>,
    candidate: &UnjournaledInode,
    dir: &Path,
) -> Result<RecoveryOutcome> {
    let inode = fs.inode(InodeSource::ByNumber(candidate.inode))?;
    let path = dir.join(candidate.file_name());
    let unavailable = RecoveryError::RecoveryCandidateUnavailable(candidate.to_string());
    let bytes = write_inode_file(fs, &inode, &path, unavailable)?;
    Ok(RecoveryOutcome::Recovered { path, bytes })
}

/// Batch form of `recover_inode`; failures are reported per candidate.
pub fn recover_files_no_journal<T: Read + Seek>(
    fs: &mut ExtFS<T>,
    candidates: &[UnjournaledInode],
    dir: &Path,
) -> Vec<RecoveryOutcome> {
    candidates
        .iter()
        .map(|candidate| match recover_inode(fs, candidate, dir) {
            Ok(outcome) => {
                info!("Recovered {}", candidate);
                outcome
            }
            Err(e) => {
                warn!("Skipping {}: {}", candidate, e);
                RecoveryOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        })
        .collect()
}
