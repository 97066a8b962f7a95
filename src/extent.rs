use crate::decode::{le_u16, le_u32, lo_hi};
use crate::error::{RecoveryError, Result};

/// Typical ext4 extent magic.
pub const EXTENT_MAGIC: u16 = 0xF30A;
const EXTENT_ENTRY_SIZE: usize = 12;
/// Extents longer than this are uninitialized; the excess is the length.
const EXT_INIT_MAX_LEN: u16 = 32768;

#[derive(Debug)]
/// A structure representing an Extent Header block in an ext4 filesystem.
pub struct ExtentHeader {
    /// The magic number for the extent header, should be 0xF30A for ext4.
    pub eh_magic: u16,
    /// The number of valid entries.
    pub eh_entries: u16,
    /// The maximum number of entries that can be stored in the extent.
    pub eh_max: u16,
    /// The depth of the extent tree.
    pub eh_depth: u16,
}

impl ExtentHeader {
    pub fn from_bytes(data: &[u8]) -> Result<ExtentHeader> {
        RecoveryError::ensure_len("extent header", data, EXTENT_ENTRY_SIZE)?;
        Ok(ExtentHeader {
            eh_magic: le_u16(data, 0x0),
            eh_entries: le_u16(data, 0x2),
            eh_max: le_u16(data, 0x4),
            eh_depth: le_u16(data, 0x6),
        })
    }

    /// Checks if the extent is a leaf node.
    pub fn is_leaf(&self) -> bool {
        self.eh_depth == 0
    }

    /// Checks if the extent header has a valid magic number for ext4.
    pub fn is_valid(&self) -> bool {
        self.eh_magic == EXTENT_MAGIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A structure representing an Extent Leaf in an ext4 filesystem.
pub struct ExtentLeaf {
    /// The block number that this extent begins at.
    pub ee_block: u32,
    /// The length of the extent in blocks, as stored.
    pub ee_len: u16,
    /// The physical block number where this extent begins.
    pub ee_start: u64,
}

impl ExtentLeaf {
    pub fn from_bytes(data: &[u8]) -> ExtentLeaf {
        let ee_start_hi = le_u16(data, 0x6) as u32;
        let ee_start_lo = le_u32(data, 0x8);
        ExtentLeaf {
            ee_block: le_u32(data, 0x0),
            ee_len: le_u16(data, 0x4),
            ee_start: lo_hi(ee_start_lo, ee_start_hi),
        }
    }

    /// Number of blocks covered, whether or not the extent is initialized.
    pub fn len(&self) -> u64 {
        if self.ee_len > EXT_INIT_MAX_LEN {
            (self.ee_len - EXT_INIT_MAX_LEN) as u64
        } else {
            self.ee_len as u64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
/// A structure representing an Extent Index in an ext4 filesystem.
pub struct ExtentIndex {
    /// First logical block covered by the child node.
    pub ei_block: u32,
    /// Lower 32 bits of the physical block number of the child node.
    pub ei_leaf_lo: u32,
    /// Upper 16 bits of the physical block number of the child node.
    pub ei_leaf_hi: u16,
}

impl ExtentIndex {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            ei_block: le_u32(data, 0),
            ei_leaf_lo: le_u32(data, 4),
            ei_leaf_hi: le_u16(data, 8),
        }
    }

    /// The full physical block number that the index points to.
    pub fn leaf(&self) -> u64 {
        lo_hi(self.ei_leaf_lo, self.ei_leaf_hi as u32)
    }
}

/// One node of an extent tree: either index entries or leaf extents.
#[derive(Debug)]
pub struct ExtentNode {
    pub header: ExtentHeader,
    pub indices: Vec<ExtentIndex>,
    pub leaves: Vec<ExtentLeaf>,
}

impl ExtentNode {
    /// Parse a node from the inode's 60 `i_block` bytes or a whole tree
    /// block. The entry count is clamped to what the buffer can hold.
    pub fn from_bytes(data: &[u8]) -> Result<ExtentNode> {
        let header = ExtentHeader::from_bytes(data)?;
        if !header.is_valid() {
            return Err(RecoveryError::CorruptExtentTree(format!(
                "bad node magic 0x{:04x}",
                header.eh_magic
            )));
        }

        let capacity = data.len() / EXTENT_ENTRY_SIZE - 1;
        let entries = (header.eh_entries as usize).min(capacity);
        let slots = (1..=entries).map(|i| &data[i * EXTENT_ENTRY_SIZE..(i + 1) * EXTENT_ENTRY_SIZE]);

        let (indices, leaves) = if header.is_leaf() {
            (Vec::new(), slots.map(ExtentLeaf::from_bytes).collect())
        } else {
            (slots.map(ExtentIndex::from_bytes).collect(), Vec::new())
        };

        Ok(ExtentNode {
            header,
            indices,
            leaves,
        })
    }
}
