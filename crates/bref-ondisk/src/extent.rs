//! Extent items and the four backref encodings that point at an extent.
//!
//! An `EXTENT_ITEM`/`METADATA_ITEM` starts with `refs`, `generation` and
//! `flags`. Non-skinny tree block extents follow that with a
//! `btrfs_tree_block_info` (first key + level). Inline refs fill the rest of
//! the item; further refs live in separate keyed items sorting right after
//! the extent item.

use bref_types::{
    BTRFS_EXTENT_DATA_KEY, BTRFS_EXTENT_DATA_REF_KEY, BTRFS_EXTENT_FLAG_DATA,
    BTRFS_EXTENT_FLAG_TREE_BLOCK, BTRFS_EXTENT_ITEM_KEY, BTRFS_METADATA_ITEM_KEY,
    BTRFS_SHARED_BLOCK_REF_KEY, BTRFS_SHARED_DATA_REF_KEY, BTRFS_TREE_BLOCK_REF_KEY, ParseError,
    read_le_u32, read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};

use crate::node::{BTRFS_DISK_KEY_SIZE, BtrfsKey, parse_disk_key};

const EXTENT_ITEM_HEADER_SIZE: usize = 24;
const TREE_BLOCK_INFO_SIZE: usize = BTRFS_DISK_KEY_SIZE + 1;
const EXTENT_DATA_REF_SIZE: usize = 28;

/// `btrfs_tree_block_info`, present only in non-skinny tree block extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBlockInfo {
    pub key: BtrfsKey,
    pub level: u8,
}

/// `btrfs_extent_data_ref`: a data extent referenced from file `objectid`
/// at logical file offset `offset` in tree `root`, `count` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentDataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

impl ExtentDataRef {
    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            root: read_le_u64(data, offset)?,
            objectid: read_le_u64(data, offset + 8)?,
            offset: read_le_u64(data, offset + 16)?,
            count: read_le_u32(data, offset + 24)?,
        })
    }

    /// The file extent key this ref was recorded for.
    #[must_use]
    pub fn search_key(&self) -> BtrfsKey {
        BtrfsKey::new(self.objectid, BTRFS_EXTENT_DATA_KEY, self.offset)
    }
}

/// One backref, whether it was stored inline or as a keyed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentRef {
    /// Tree block owned by `root`; the parent must be found by searching.
    TreeBlock { root: u64 },
    /// Tree block referenced directly from the node at `parent`.
    SharedBlock { parent: u64 },
    /// Data extent referenced from a file extent item in `root`.
    ExtentData(ExtentDataRef),
    /// Data extent referenced `count` times from the leaf at `parent`.
    SharedData { parent: u64, count: u32 },
}

impl ExtentRef {
    #[must_use]
    pub fn count(&self) -> u64 {
        match self {
            Self::TreeBlock { .. } | Self::SharedBlock { .. } => 1,
            Self::ExtentData(dref) => u64::from(dref.count),
            Self::SharedData { count, .. } => u64::from(*count),
        }
    }

    #[must_use]
    pub fn key_type(&self) -> u8 {
        match self {
            Self::TreeBlock { .. } => BTRFS_TREE_BLOCK_REF_KEY,
            Self::SharedBlock { .. } => BTRFS_SHARED_BLOCK_REF_KEY,
            Self::ExtentData(_) => BTRFS_EXTENT_DATA_REF_KEY,
            Self::SharedData { .. } => BTRFS_SHARED_DATA_REF_KEY,
        }
    }

    /// Size of this ref when stored inline.
    #[must_use]
    pub fn inline_size(&self) -> usize {
        inline_ref_size(self.key_type()).unwrap_or(0)
    }
}

/// Inline size for a backref type, or `None` for an unknown type.
#[must_use]
pub fn inline_ref_size(ref_type: u8) -> Option<usize> {
    match ref_type {
        BTRFS_TREE_BLOCK_REF_KEY | BTRFS_SHARED_BLOCK_REF_KEY => Some(9),
        BTRFS_SHARED_DATA_REF_KEY => Some(13),
        BTRFS_EXTENT_DATA_REF_KEY => Some(1 + EXTENT_DATA_REF_SIZE),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
    pub tree_block: Option<TreeBlockInfo>,
    /// Tree level of a metadata extent (0 for data).
    pub level: u8,
    pub inline_refs: Vec<ExtentRef>,
}

impl ExtentItem {
    #[must_use]
    pub fn is_tree_block(&self) -> bool {
        self.flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.flags & BTRFS_EXTENT_FLAG_DATA != 0
    }
}

/// Parse an extent item (`EXTENT_ITEM` or skinny `METADATA_ITEM`) with its
/// inline refs. An unknown inline ref type is an `InvalidField` error.
pub fn parse_extent_item(key: &BtrfsKey, data: &[u8]) -> Result<ExtentItem, ParseError> {
    if data.len() < EXTENT_ITEM_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: EXTENT_ITEM_HEADER_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }
    let refs = read_le_u64(data, 0)?;
    let generation = read_le_u64(data, 8)?;
    let flags = read_le_u64(data, 16)?;
    let mut cur = EXTENT_ITEM_HEADER_SIZE;

    let mut tree_block = None;
    let level = match key.item_type {
        BTRFS_EXTENT_ITEM_KEY if flags & BTRFS_EXTENT_FLAG_TREE_BLOCK != 0 => {
            let info = TreeBlockInfo {
                key: parse_disk_key(data, cur)?,
                level: read_u8(data, cur + BTRFS_DISK_KEY_SIZE)?,
            };
            cur += TREE_BLOCK_INFO_SIZE;
            tree_block = Some(info);
            info.level
        }
        BTRFS_METADATA_ITEM_KEY => u8::try_from(key.offset).map_err(|_| {
            ParseError::InvalidField {
                field: "metadata_level",
                reason: "skinny metadata key offset is not a tree level",
            }
        })?,
        BTRFS_EXTENT_ITEM_KEY => {
            if flags & BTRFS_EXTENT_FLAG_DATA == 0 {
                return Err(ParseError::InvalidField {
                    field: "extent_flags",
                    reason: "extent is neither data nor tree block",
                });
            }
            0
        }
        _ => {
            return Err(ParseError::InvalidField {
                field: "item_type",
                reason: "not an extent item",
            });
        }
    };

    let mut inline_refs = Vec::new();
    while cur < data.len() {
        let ref_type = read_u8(data, cur)?;
        let size = inline_ref_size(ref_type).ok_or(ParseError::InvalidField {
            field: "inline_ref_type",
            reason: "unknown inline backref type",
        })?;
        if cur + size > data.len() {
            return Err(ParseError::InsufficientData {
                needed: size,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let parsed = match ref_type {
            BTRFS_TREE_BLOCK_REF_KEY => ExtentRef::TreeBlock {
                root: read_le_u64(data, cur + 1)?,
            },
            BTRFS_SHARED_BLOCK_REF_KEY => ExtentRef::SharedBlock {
                parent: read_le_u64(data, cur + 1)?,
            },
            BTRFS_SHARED_DATA_REF_KEY => ExtentRef::SharedData {
                parent: read_le_u64(data, cur + 1)?,
                count: read_le_u32(data, cur + 9)?,
            },
            // the data ref overlays the inline ref's offset field
            _ => ExtentRef::ExtentData(ExtentDataRef::parse(data, cur + 1)?),
        };
        inline_refs.push(parsed);
        cur += size;
    }

    Ok(ExtentItem {
        refs,
        generation,
        flags,
        tree_block,
        level,
        inline_refs,
    })
}

/// Decode a keyed backref item. Returns `Ok(None)` for item types outside
/// the backref range.
pub fn parse_keyed_ref(key: &BtrfsKey, data: &[u8]) -> Result<Option<ExtentRef>, ParseError> {
    let parsed = match key.item_type {
        BTRFS_TREE_BLOCK_REF_KEY => ExtentRef::TreeBlock { root: key.offset },
        BTRFS_SHARED_BLOCK_REF_KEY => ExtentRef::SharedBlock { parent: key.offset },
        BTRFS_EXTENT_DATA_REF_KEY => ExtentRef::ExtentData(ExtentDataRef::parse(data, 0)?),
        BTRFS_SHARED_DATA_REF_KEY => ExtentRef::SharedData {
            parent: key.offset,
            count: read_le_u32(data, 0)?,
        },
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}
