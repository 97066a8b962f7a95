/// Reference: https://www.kernel.org/doc/html/latest/filesystems/ext4/index.html
use chrono::{TimeZone, Utc};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::decode::{le_u16, le_u32};
use crate::error::{RecoveryError, Result};
use crate::extent::EXTENT_MAGIC;

const EXT4_NSEC_MASK: u32 = 0xFFFFFFFC;

/// Where the raw bytes of an inode come from.
#[derive(Debug, Clone, Copy)]
pub enum InodeSource<'a> {
    /// Read the inode from its inode table on disk.
    ByNumber(u64),
    /// Slot `n` (from 0) of an inode-table block that was already read,
    /// typically a historical copy out of the journal.
    FromBuffer(&'a [u8], usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    /// Inode number, 0 when the inode was parsed out of a detached buffer.
    pub i_num: u64,
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size_lo: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks_lo: u32,
    pub i_flags: u32,
    pub i_block: [u32; 15],
    pub i_generation: u32,
    pub i_size_high: u32,
    pub i_extra_isize: u16,
    pub i_ctime_extra: u32,
    pub i_mtime_extra: u32,
    pub i_atime_extra: u32,
    pub i_crtime: u32,
    pub i_crtime_extra: u32,
}

/// Render an ext timestamp (seconds plus the optional `_extra` word) as
/// RFC 3339.
pub fn format_time(seconds: u32, extra: u32) -> String {
    let nsec = (extra & EXT4_NSEC_MASK) >> 2;
    Utc.timestamp_opt(seconds as i64, nsec)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// RFC 3339 rendering of a full 64-bit count of seconds, such as a journal
/// commit time.
pub fn format_seconds(seconds: u64) -> String {
    i64::try_from(seconds)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| seconds.to_string())
}

/// Convert an ext-mode (includes file-type bits) into the familiar
/// 10-character string used by `ls -l`, e.g. "-rw-r--r--".
pub fn mode_to_string(mode: u16) -> String {
    let file_ch = match mode & 0o170000 {
        0o140000 => 's',
        0o120000 => 'l',
        0o100000 => '-',
        0o060000 => 'b',
        0o040000 => 'd',
        0o020000 => 'c',
        0o010000 => 'p',
        _ => '?',
    };

    let mut s = String::with_capacity(10);
    s.push(file_ch);
    for (shift, exec_special, special_ch) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')]
    {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        s.push(match (mode & exec_special != 0, exec) {
            (true, true) => special_ch,
            (true, false) => special_ch.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    s
}

impl Inode {
    /// Parse an inode record. `data` must hold at least 128 bytes, and
    /// `inode_size` bytes when the larger ext4 record is in use.
    pub fn from_bytes(i_num: u64, data: &[u8], inode_size: usize) -> Result<Self> {
        RecoveryError::ensure_len("inode", data, inode_size.max(128))?;

        let mut i_block = [0u32; 15];
        for (i, ptr) in i_block.iter_mut().enumerate() {
            *ptr = le_u32(data, 0x28 + i * 4);
        }

        // Fields after offset 128 only exist on 256-byte inodes.
        let large = inode_size >= 256;
        let extra_u32 = |offset: usize| if large { le_u32(data, offset) } else { 0 };

        Ok(Inode {
            i_num,
            i_mode: le_u16(data, 0x00),
            i_uid: le_u16(data, 0x02),
            i_size_lo: le_u32(data, 0x04),
            i_atime: le_u32(data, 0x08),
            i_ctime: le_u32(data, 0x0C),
            i_mtime: le_u32(data, 0x10),
            i_dtime: le_u32(data, 0x14),
            i_gid: le_u16(data, 0x18),
            i_links_count: le_u16(data, 0x1A),
            i_blocks_lo: le_u32(data, 0x1C),
            i_flags: le_u32(data, 0x20),
            i_block,
            i_generation: le_u32(data, 0x64),
            i_size_high: le_u32(data, 0x6C),
            i_extra_isize: if large { le_u16(data, 0x80) } else { 0 },
            i_ctime_extra: extra_u32(0x84),
            i_mtime_extra: extra_u32(0x88),
            i_atime_extra: extra_u32(0x8C),
            i_crtime: extra_u32(0x90),
            i_crtime_extra: extra_u32(0x94),
        })
    }

    /// Parse slot `slot` out of an inode-table block.
    pub fn from_table_block(block: &[u8], slot: usize, inode_size: usize) -> Result<Self> {
        let start = slot * inode_size;
        let end = (start + inode_size).min(block.len());
        let data = block.get(start..end).unwrap_or(&[]);
        Self::from_bytes(0, data, inode_size)
    }

    /// Returns the full 64-bit size of the file.
    pub fn size(&self) -> u64 {
        ((self.i_size_high as u64) << 32) | (self.i_size_lo as u64)
    }

    pub fn deletion_time(&self) -> u32 {
        self.i_dtime
    }

    pub fn is_deleted(&self) -> bool {
        self.i_dtime != 0
    }

    /// The 60 bytes of `i_block`, where an extent tree root lives.
    pub fn block_bytes(&self) -> [u8; 60] {
        let mut raw = [0u8; 60];
        for (i, &word) in self.i_block.iter().enumerate() {
            raw[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        raw
    }

    /// Whether the inode still describes its data. ext4 clears the extent
    /// root on deletion and ext3 clears the direct pointers, so a deleted
    /// inode without this structure is a zeroed-out record.
    pub fn has_block_pointers(&self, extents: bool) -> bool {
        if extents {
            let raw = self.block_bytes();
            le_u16(&raw, 0) == EXTENT_MAGIC && le_u16(&raw, 2) > 0
        } else {
            self.i_block[0] > 0
        }
    }

    pub fn block_pointers(&self) -> &[u32; 15] {
        &self.i_block
    }

    pub fn to_json(&self) -> Value {
        json!({
            "inode": self.i_num,
            "mode": mode_to_string(self.i_mode),
            "size": self.size(),
            "links_count": self.i_links_count,
            "flags": format!("0x{:x}", self.i_flags),
            "atime": format_time(self.i_atime, self.i_atime_extra),
            "ctime": format_time(self.i_ctime, self.i_ctime_extra),
            "mtime": format_time(self.i_mtime, self.i_mtime_extra),
            "crtime": format_time(self.i_crtime, self.i_crtime_extra),
            "dtime": format_time(self.i_dtime, 0),
            "block_pointers": self.block_pointers(),
        })
    }

    /// String representation of an Inode using prettytable
    pub fn to_string(&self) -> String {
        let mut inode_table = Table::new();
        let rows = [
            ("Identifier", format!("0x{:x}", self.i_num)),
            ("Mode", mode_to_string(self.i_mode)),
            ("Size", format!("{}", self.size())),
            ("Links Count", format!("{}", self.i_links_count)),
            ("Flags", format!("0x{:x}", self.i_flags)),
            ("mtime (Modification Time)", format_time(self.i_mtime, self.i_mtime_extra)),
            ("dtime (Deletion Time)", format_time(self.i_dtime, 0)),
            ("Block Pointers", format!("{:?}", self.block_pointers())),
        ];
        for (name, value) in rows.iter() {
            inode_table.add_row(Row::new(vec![Cell::new(name), Cell::new(value)]));
        }
        inode_table.to_string()
    }
}
