//! `btrfs_root_item`, as stored under `(root_id, ROOT_ITEM, transid)` in
//! the root tree.

use bref_types::{ParseError, read_le_u32, read_le_u64, read_u8};
use serde::{Deserialize, Serialize};

/// Offset of the `level` byte; the item must reach at least this far.
const ROOT_ITEM_LEVEL_OFFSET: usize = 238;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub flags: u64,
    pub refs: u32,
    pub level: u8,
}

pub fn parse_root_item(data: &[u8]) -> Result<RootItem, ParseError> {
    if data.len() <= ROOT_ITEM_LEVEL_OFFSET {
        return Err(ParseError::InsufficientData {
            needed: ROOT_ITEM_LEVEL_OFFSET + 1,
            offset: 0,
            actual: data.len(),
        });
    }
    // the embedded inode item occupies the first 160 bytes
    Ok(RootItem {
        generation: read_le_u64(data, 160)?,
        root_dirid: read_le_u64(data, 168)?,
        bytenr: read_le_u64(data, 176)?,
        flags: read_le_u64(data, 208)?,
        refs: read_le_u32(data, 216)?,
        level: read_u8(data, ROOT_ITEM_LEVEL_OFFSET)?,
    })
}
