//! `btrfs_file_extent_item`: the leaf item mapping a file range onto a
//! data extent.

use bref_types::{
    BTRFS_FILE_EXTENT_INLINE, BTRFS_FILE_EXTENT_PREALLOC, BTRFS_FILE_EXTENT_REG, ParseError,
    read_le_u16, read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};

/// Bytes before the inline payload / disk fields.
const FILE_EXTENT_INLINE_HEADER: usize = 21;
pub const FILE_EXTENT_ITEM_SIZE: usize = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExtentType {
    Inline,
    Regular,
    Prealloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentItem {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: u16,
    pub extent_type: FileExtentType,
    /// Zero for inline extents and holes.
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    /// Offset into the extent where this file range starts.
    pub offset: u64,
    pub num_bytes: u64,
}

impl FileExtentItem {
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.extent_type == FileExtentType::Inline
    }

    /// Whether a byte position inside the extent can be mapped back to a
    /// file offset. Compressed or otherwise encoded extents cannot.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.compression == 0 && self.encryption == 0 && self.other_encoding == 0
    }
}

pub fn parse_file_extent_item(data: &[u8]) -> Result<FileExtentItem, ParseError> {
    if data.len() < FILE_EXTENT_INLINE_HEADER {
        return Err(ParseError::InsufficientData {
            needed: FILE_EXTENT_INLINE_HEADER,
            offset: 0,
            actual: data.len(),
        });
    }
    let generation = read_le_u64(data, 0)?;
    let ram_bytes = read_le_u64(data, 8)?;
    let compression = read_u8(data, 16)?;
    let encryption = read_u8(data, 17)?;
    let other_encoding = read_le_u16(data, 18)?;
    let extent_type = match read_u8(data, 20)? {
        BTRFS_FILE_EXTENT_INLINE => FileExtentType::Inline,
        BTRFS_FILE_EXTENT_REG => FileExtentType::Regular,
        BTRFS_FILE_EXTENT_PREALLOC => FileExtentType::Prealloc,
        _ => {
            return Err(ParseError::InvalidField {
                field: "file_extent_type",
                reason: "unknown file extent type",
            });
        }
    };

    let mut item = FileExtentItem {
        generation,
        ram_bytes,
        compression,
        encryption,
        other_encoding,
        extent_type,
        disk_bytenr: 0,
        disk_num_bytes: 0,
        offset: 0,
        num_bytes: 0,
    };
    if extent_type != FileExtentType::Inline {
        item.disk_bytenr = read_le_u64(data, 21)?;
        item.disk_num_bytes = read_le_u64(data, 29)?;
        item.offset = read_le_u64(data, 37)?;
        item.num_bytes = read_le_u64(data, 45)?;
    }
    Ok(item)
}
