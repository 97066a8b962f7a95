//! Replay of the journal into the list of transactions it still holds.
use log::{debug, info, trace, warn};
use std::io::{Read, Seek};

use crate::blockmap::BlockTypeMap;
use crate::error::{RecoveryError, Result};
use crate::inode::InodeSource;
use crate::journal::{
    JournalBlockHeader, JournalBlockType, JournalCommitBlock, JournalSuperblock, TagFormat,
    Transaction, TransactionKind,
};
use crate::resolver::Entry;
use crate::ExtFS;

/// Rollback state of a replay. Blocks must be fed in journal order.
#[derive(Debug)]
pub struct ReplayState {
    transactions: Vec<Transaction>,
    has_valid_commit: bool,
    delete_pending: bool,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            transactions: Vec::new(),
            has_valid_commit: true,
            delete_pending: false,
        }
    }
}

impl ReplayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed journal block `journal_block`. Blocks that are not descriptor or
    /// commit blocks are ignored.
    pub fn feed(&mut self, journal_block: u64, data: &[u8], format: TagFormat, map: &BlockTypeMap) {
        let header = match JournalBlockHeader::from_bytes(data) {
            Ok(header) => header,
            Err(e) => {
                trace!("Journal block {}: {}", journal_block, e);
                return;
            }
        };

        match header.h_blocktype {
            JournalBlockType::Descriptor => {
                if self.delete_pending || !self.has_valid_commit {
                    if let Some(dropped) = self.transactions.pop() {
                        debug!("Dropping transaction {}", dropped.sequence);
                    }
                }
                let tx = Transaction::from_descriptor(&header, journal_block, data, format, map);
                debug!(
                    "Journal block {}: descriptor of transaction {} ({}, {} blocks)",
                    journal_block,
                    tx.sequence,
                    tx.kind,
                    tx.blocks.len()
                );
                self.delete_pending = tx.kind == TransactionKind::NotUseful;
                self.has_valid_commit = false;
                self.transactions.push(tx);
            }
            JournalBlockType::Commit => match self.transactions.last_mut() {
                Some(last) if last.sequence == header.h_sequence => {
                    match JournalCommitBlock::from_bytes(data) {
                        Ok(commit) => {
                            last.commit_time = commit.commit_sec;
                            self.has_valid_commit = true;
                        }
                        Err(e) => warn!("Journal block {}: {}", journal_block, e),
                    }
                }
                Some(_) => {
                    if !self.has_valid_commit {
                        self.delete_pending = true;
                    }
                }
                None => {}
            },
            _ => {}
        }
    }

    /// Transactions in journal order. A trailing transaction without a
    /// commit is kept.
    pub fn finish(self) -> Vec<Transaction> {
        self.transactions
    }
}

/// The journal inode's data viewed as a flat, journal-relative block space.
#[derive(Debug, Clone)]
pub struct Journal {
    pub superblock: JournalSuperblock,
    entries: Vec<Entry>,
}

impl Journal {
    /// Locate and validate the internal journal of `fs`.
    pub fn open<T: Read + Seek>(fs: &mut ExtFS<T>) -> Result<Self> {
        if !fs.superblock.has_journal() || fs.superblock.journal_inode() == 0 {
            return Err(RecoveryError::JournalUnavailable(
                "filesystem has no journal".to_string(),
            ));
        }
        if fs.superblock.s_journal.s_journal_dev != 0 {
            return Err(RecoveryError::JournalUnavailable(format!(
                "journal lives on external device 0x{:x}",
                fs.superblock.s_journal.s_journal_dev
            )));
        }

        info!("Reading journal inode {}", fs.superblock.journal_inode());
        let inode = fs.inode(InodeSource::ByNumber(fs.superblock.journal_inode()))?;
        let entries = fs.resolve_entries(&inode)?;
        let first = entries
            .iter()
            .find(|e| e.contains(0))
            .ok_or_else(|| RecoveryError::JournalUnavailable("journal has no block 0".to_string()))?;
        let data = fs.read_block(first.disk_block)?;
        let superblock = JournalSuperblock::from_bytes(&data)?;

        if superblock.s_blocksize as u64 != fs.superblock.block_size() {
            warn!(
                "Journal block size {} differs from filesystem block size {}",
                superblock.s_blocksize,
                fs.superblock.block_size()
            );
        }

        Ok(Self::from_entries(superblock, entries))
    }

    pub fn from_entries(superblock: JournalSuperblock, entries: Vec<Entry>) -> Self {
        Self {
            superblock,
            entries,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of journal-relative blocks, superblock included.
    pub fn total_blocks(&self) -> u64 {
        self.entries.last().map(|e| e.end()).unwrap_or(0)
    }

    pub fn tag_format<T: Read + Seek>(&self, fs: &ExtFS<T>) -> TagFormat {
        TagFormat {
            csum_v3: self.superblock.has_csum_v3(),
            fs_64bit: fs.superblock.is_64bit(),
        }
    }

    /// Disk block holding journal block `n` after wraparound: with `m` the
    /// last journal block, `n` is taken modulo `m` and 0 stands for `m`.
    pub fn disk_block(&self, n: u64) -> Result<u64> {
        let last = self.total_blocks().saturating_sub(1);
        if last == 0 {
            return Err(RecoveryError::JournalUnavailable(
                "journal has no log blocks".to_string(),
            ));
        }
        let n = match n % last {
            0 => last,
            n => n,
        };
        self.entries
            .iter()
            .find(|e| e.contains(n))
            .map(|e| e.disk_block + (n - e.file_block))
            .ok_or_else(|| {
                RecoveryError::JournalUnavailable(format!("journal block {} is not allocated", n))
            })
    }

    pub fn read_block<T: Read + Seek>(&self, fs: &mut ExtFS<T>, n: u64) -> Result<Vec<u8>> {
        let disk_block = self.disk_block(n)?;
        fs.read_block(disk_block)
    }

    /// Walk every journal block in order and return the surviving
    /// transactions.
    pub fn replay<T: Read + Seek>(
        &self,
        fs: &mut ExtFS<T>,
        map: &BlockTypeMap,
    ) -> Result<Vec<Transaction>> {
        let format = self.tag_format(fs);
        let mut state = ReplayState::new();
        let mut journal_block = 0u64;

        for entry in &self.entries {
            for i in 0..entry.num_blocks {
                let data = fs.read_block(entry.disk_block + i)?;
                state.feed(journal_block, &data, format, map);
                journal_block += 1;
            }
        }

        let transactions = state.finish();
        info!(
            "Replayed {} journal blocks into {} transactions",
            journal_block,
            transactions.len()
        );
        Ok(transactions)
    }
}
