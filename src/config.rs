use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{RecoveryError, Result};

/// Seconds between an inode's deletion time and the commit of the
/// transaction that recorded it for the inode to count as deleted there.
pub const DEFAULT_DELETION_WINDOW_SECS: i64 = 12;

/// Upper bound on extent tree nodes visited for a single inode.
pub const DEFAULT_MAX_EXTENT_NODES: usize = 4096;

/// Tunables of a recovery session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub deletion_window_secs: i64,
    pub max_extent_nodes: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            deletion_window_secs: DEFAULT_DELETION_WINDOW_SECS,
            max_extent_nodes: DEFAULT_MAX_EXTENT_NODES,
        }
    }
}

impl RecoveryConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: RecoveryConfig =
            serde_json::from_str(text).map_err(|e| RecoveryError::Config(e.to_string()))?;
        if config.max_extent_nodes == 0 {
            return Err(RecoveryError::Config(
                "max_extent_nodes must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
