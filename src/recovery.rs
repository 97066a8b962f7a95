//! Find inodes deleted in journaled transactions and rebuild their content
//! from older copies of the same inode-table block.
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::error::{RecoveryError, Result};
use crate::inode::{Inode, InodeSource};
use crate::journal::{Transaction, TransactionKind};
use crate::replay::Journal;
use crate::ExtFS;

/// An inode slot that was zeroed by a deletion the journal still records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeletedInode {
    /// Filesystem block of the inode table holding the slot.
    pub table_block: u64,
    pub slot: usize,
    pub deletion_time: u32,
    pub commit_time: u64,
    pub sequence: u32,
}

impl DeletedInode {
    pub fn file_name(&self) -> String {
        format!(
            "recovered_{}_inode{}_{}",
            timestamp(self.deletion_time),
            self.table_block,
            self.slot
        )
    }
}

impl fmt::Display for DeletedInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inode table block {} slot {}", self.table_block, self.slot)
    }
}

/// Outcome of one candidate in a batch recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecoveryOutcome {
    Recovered { path: PathBuf, bytes: u64 },
    Skipped { reason: String },
}

/// UTC deletion time in a form usable inside a file name.
pub(crate) fn timestamp(seconds: u32) -> String {
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .map(|dt| dt.format("%Y%m%dT%H%M%SZ").to_string())
        .unwrap_or_else(|| seconds.to_string())
}

/// Create `path` and stream `inode`'s data into it. Nothing is left on disk
/// when the inode resolves to no blocks, a run ends past the filesystem or
/// the copy fails.
pub(crate) fn write_inode_file<T: Read + Seek>(
    fs: &mut ExtFS<T>,
    inode: &Inode,
    path: &Path,
    unavailable: RecoveryError,
) -> Result<u64> {
    let entries = fs.resolve_entries(inode)?;
    if entries.is_empty() {
        return Err(unavailable);
    }
    let blocks_count = fs.superblock.blocks_count();
    if let Some(entry) = entries
        .iter()
        .find(|e| e.disk_block.checked_add(e.num_blocks).map_or(true, |end| end > blocks_count))
    {
        return Err(RecoveryError::BlockOutOfRange {
            block: entry.disk_block.max(blocks_count),
            blocks_count,
        });
    }

    let mut out = BufWriter::new(File::create(path)?);
    let written = fs.stream_entries(&entries, &mut out);
    if written.is_err() {
        drop(out);
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Cannot remove partial file {}: {}", path.display(), e);
        }
    }
    written
}

/// A replayed journal, ready to list and recover deleted files.
pub struct JournalRecovery {
    pub journal: Journal,
    pub transactions: Vec<Transaction>,
}

impl JournalRecovery {
    /// Open the journal of `fs` and replay it.
    pub fn open<T: Read + Seek>(fs: &mut ExtFS<T>) -> Result<Self> {
        let journal = Journal::open(fs)?;
        let map = fs.block_type_map();
        let transactions = journal.replay(fs, &map)?;
        Ok(Self {
            journal,
            transactions,
        })
    }

    /// Inodes whose deletion was committed by a Deletion transaction, most
    /// recent deletion first.
    pub fn deleted_inodes<T: Read + Seek>(&self, fs: &mut ExtFS<T>) -> Vec<DeletedInode> {
        let window = fs.config.deletion_window_secs;
        let inode_size = fs.superblock.inode_size();
        let slots = fs.superblock.block_size() as usize / inode_size;
        let mut deleted: Vec<DeletedInode> = Vec::new();
        let mut seen: HashSet<(u64, usize, u32)> = HashSet::new();

        for tx in self
            .transactions
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Deletion)
        {
            for (table_block, journal_block) in tx.inode_table_copies() {
                let data = match self.journal.read_block(fs, journal_block) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(
                            "Transaction {}: cannot read journal block {}: {}",
                            tx.sequence, journal_block, e
                        );
                        continue;
                    }
                };

                for slot in 0..slots {
                    let inode = match fs.inode(InodeSource::FromBuffer(&data, slot)) {
                        Ok(inode) => inode,
                        Err(e) => {
                            debug!("Table block {} slot {}: {}", table_block, slot, e);
                            continue;
                        }
                    };
                    if !inode.is_deleted() || fs.has_block_pointers(&inode) {
                        continue;
                    }
                    if tx.commit_time as i64 - inode.deletion_time() as i64 >= window {
                        continue;
                    }
                    let candidate = DeletedInode {
                        table_block,
                        slot,
                        deletion_time: inode.deletion_time(),
                        commit_time: tx.commit_time,
                        sequence: tx.sequence,
                    };
                    if seen.insert((table_block, slot, candidate.deletion_time)) {
                        deleted.push(candidate);
                    }
                }
            }
        }

        deleted.sort_by(|a, b| b.deletion_time.cmp(&a.deletion_time));
        info!("Found {} deleted inodes in the journal", deleted.len());
        deleted
    }

    /// Newest journaled copy of the candidate's slot that still describes
    /// its data.
    pub fn find_intact_inode<T: Read + Seek>(
        &self,
        fs: &mut ExtFS<T>,
        candidate: &DeletedInode,
    ) -> Result<Inode> {
        let mut ordered: Vec<&Transaction> = self
            .transactions
            .iter()
            .filter(|tx| tx.kind != TransactionKind::NotUseful)
            .collect();
        ordered.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        for tx in ordered {
            for journal_block in tx.copies_of(candidate.table_block) {
                let data = match self.journal.read_block(fs, journal_block) {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("Transaction {}: {}", tx.sequence, e);
                        continue;
                    }
                };
                let inode = match fs.inode(InodeSource::FromBuffer(&data, candidate.slot)) {
                    Ok(inode) => inode,
                    Err(e) => {
                        debug!("Transaction {}: {}", tx.sequence, e);
                        continue;
                    }
                };
                if fs.has_block_pointers(&inode) {
                    debug!(
                        "Intact copy of table block {} slot {} in transaction {}",
                        candidate.table_block, candidate.slot, tx.sequence
                    );
                    return Ok(inode);
                }
            }
        }

        Err(RecoveryError::RecoveryCandidateUnavailable(candidate.to_string()))
    }

    /// Stream the candidate's recovered content into `out`. Returns the
    /// number of bytes written.
    pub fn recover_candidate<T: Read + Seek, W: Write>(
        &self,
        fs: &mut ExtFS<T>,
        candidate: &DeletedInode,
        out: &mut W,
    ) -> Result<u64> {
        let inode = self.find_intact_inode(fs, candidate)?;
        let entries = fs.resolve_entries(&inode)?;
        fs.stream_entries(&entries, out)
    }

    /// Recover each candidate into its own file under `dir`. A failure is
    /// recorded for that candidate and the batch goes on.
    pub fn recover_files<T: Read + Seek>(
        &self,
        fs: &mut ExtFS<T>,
        candidates: &[DeletedInode],
        dir: &Path,
    ) -> Vec<RecoveryOutcome> {
        candidates
            .iter()
            .map(|candidate| {
                let path = dir.join(candidate.file_name());
                let unavailable = RecoveryError::RecoveryCandidateUnavailable(candidate.to_string());
                let result = self
                    .find_intact_inode(fs, candidate)
                    .and_then(|inode| write_inode_file(fs, &inode, &path, unavailable));
                match result {
                    Ok(bytes) => {
                        info!("Recovered {} bytes into {}", bytes, path.display());
                        RecoveryOutcome::Recovered { path, bytes }
                    }
                    Err(e) => {
                        warn!("Skipping {}: {}", candidate, e);
                        RecoveryOutcome::Skipped {
                            reason: e.to_string(),
                        }
                    }
                }
            })
            .collect()
    }
}
