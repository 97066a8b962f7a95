use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecoveryError>;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid filesystem: {0}")]
    InvalidFilesystem(String),
    #[error("Truncated {structure}: needed {needed} bytes, got {got}")]
    TruncatedMetadata {
        structure: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("Block {block} is outside the filesystem ({blocks_count} blocks)")]
    BlockOutOfRange { block: u64, blocks_count: u64 },
    #[error("Corrupt extent tree: {0}")]
    CorruptExtentTree(String),
    #[error("Unrecognized journal block magic 0x{0:08x}")]
    UnrecognizedMagic(u32),
    #[error("Block tag at offset {offset} runs past the descriptor block")]
    UnrecognizedBlockTag { offset: usize },
    #[error("Journal unavailable: {0}")]
    JournalUnavailable(String),
    #[error("Nothing left to recover for {0}")]
    RecoveryCandidateUnavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RecoveryError {
    /// Fail with `TruncatedMetadata` when `data` is shorter than `needed`.
    pub fn ensure_len(structure: &'static str, data: &[u8], needed: usize) -> Result<()> {
        if data.len() < needed {
            return Err(RecoveryError::TruncatedMetadata {
                structure,
                needed,
                got: data.len(),
            });
        }
        Ok(())
    }
}
