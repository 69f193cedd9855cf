//! Byte encoders for the item payloads the fixtures place in leaves.

use bref_ondisk::{BtrfsKey, ExtentRef, TreeBlockInfo};
use bref_types::{
    BTRFS_EXTENT_DATA_REF_KEY, BTRFS_EXTENT_FLAG_DATA, BTRFS_EXTENT_FLAG_TREE_BLOCK,
    BTRFS_FILE_EXTENT_INLINE, BTRFS_FILE_EXTENT_PREALLOC, BTRFS_FILE_EXTENT_REG,
    BTRFS_INODE_EXTREF_KEY, BTRFS_SHARED_BLOCK_REF_KEY, BTRFS_SHARED_DATA_REF_KEY,
    BTRFS_TREE_BLOCK_REF_KEY, usize_to_u64,
};

use crate::GENERATION;

const ROOT_ITEM_SIZE: usize = 439;
const INODE_ITEM_SIZE: usize = 160;

fn extent_header(refs: u64, flags: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&refs.to_le_bytes());
    out.extend_from_slice(&GENERATION.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out
}

fn push_inline_refs(out: &mut Vec<u8>, refs: &[ExtentRef]) {
    for r in refs {
        out.push(r.key_type());
        match r {
            ExtentRef::TreeBlock { root } => out.extend_from_slice(&root.to_le_bytes()),
            ExtentRef::SharedBlock { parent } => out.extend_from_slice(&parent.to_le_bytes()),
            ExtentRef::SharedData { parent, count } => {
                out.extend_from_slice(&parent.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            ExtentRef::ExtentData(dref) => {
                out.extend_from_slice(&dref.root.to_le_bytes());
                out.extend_from_slice(&dref.objectid.to_le_bytes());
                out.extend_from_slice(&dref.offset.to_le_bytes());
                out.extend_from_slice(&dref.count.to_le_bytes());
            }
        }
    }
}

/// A data `EXTENT_ITEM` payload carrying `refs` in total and the given
/// inline backrefs.
#[must_use]
pub fn data_extent_item(refs: u64, inline: &[ExtentRef]) -> Vec<u8> {
    let mut out = extent_header(refs, BTRFS_EXTENT_FLAG_DATA);
    push_inline_refs(&mut out, inline);
    out
}

/// A skinny `METADATA_ITEM` payload (the level lives in the key offset).
#[must_use]
pub fn metadata_item(refs: u64, inline: &[ExtentRef]) -> Vec<u8> {
    let mut out = extent_header(refs, BTRFS_EXTENT_FLAG_TREE_BLOCK);
    push_inline_refs(&mut out, inline);
    out
}

/// A non-skinny tree block `EXTENT_ITEM` payload with its block info.
#[must_use]
pub fn tree_block_extent_item(refs: u64, info: TreeBlockInfo, inline: &[ExtentRef]) -> Vec<u8> {
    let mut out = extent_header(refs, BTRFS_EXTENT_FLAG_TREE_BLOCK);
    info.key.write_to(&mut out);
    out.push(info.level);
    push_inline_refs(&mut out, inline);
    out
}

/// Key offset of a keyed extent data ref, shaped like the on-disk hash of
/// `(root, objectid, offset)`.
#[must_use]
pub fn extent_data_ref_hash(root: u64, objectid: u64, offset: u64) -> u64 {
    let high = crc32c::crc32c(&root.to_le_bytes());
    let low = crc32c::crc32c_append(crc32c::crc32c(&objectid.to_le_bytes()), &offset.to_le_bytes());
    (u64::from(high) << 31) ^ u64::from(low)
}

/// A standalone (keyed) backref item for the extent at `bytenr`.
#[must_use]
pub fn keyed_ref(bytenr: u64, r: &ExtentRef) -> (BtrfsKey, Vec<u8>) {
    match r {
        ExtentRef::TreeBlock { root } => (
            BtrfsKey::new(bytenr, BTRFS_TREE_BLOCK_REF_KEY, *root),
            Vec::new(),
        ),
        ExtentRef::SharedBlock { parent } => (
            BtrfsKey::new(bytenr, BTRFS_SHARED_BLOCK_REF_KEY, *parent),
            Vec::new(),
        ),
        ExtentRef::SharedData { parent, count } => (
            BtrfsKey::new(bytenr, BTRFS_SHARED_DATA_REF_KEY, *parent),
            count.to_le_bytes().to_vec(),
        ),
        ExtentRef::ExtentData(dref) => {
            let mut data = Vec::with_capacity(28);
            data.extend_from_slice(&dref.root.to_le_bytes());
            data.extend_from_slice(&dref.objectid.to_le_bytes());
            data.extend_from_slice(&dref.offset.to_le_bytes());
            data.extend_from_slice(&dref.count.to_le_bytes());
            let hash = extent_data_ref_hash(dref.root, dref.objectid, dref.offset);
            (BtrfsKey::new(bytenr, BTRFS_EXTENT_DATA_REF_KEY, hash), data)
        }
    }
}

/// Fields of a non-inline file extent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub offset: u64,
    pub num_bytes: u64,
    pub compression: u8,
    pub prealloc: bool,
}

impl FileExtent {
    /// An uncompressed regular extent covering `[offset, offset + num_bytes)`
    /// of the on-disk extent at `disk_bytenr`.
    #[must_use]
    pub fn regular(disk_bytenr: u64, disk_num_bytes: u64, offset: u64, num_bytes: u64) -> Self {
        Self {
            disk_bytenr,
            disk_num_bytes,
            offset,
            num_bytes,
            compression: 0,
            prealloc: false,
        }
    }

    #[must_use]
    pub fn compressed(mut self, compression: u8) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn prealloc(mut self) -> Self {
        self.prealloc = true;
        self
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let extent_type = if self.prealloc {
            BTRFS_FILE_EXTENT_PREALLOC
        } else {
            BTRFS_FILE_EXTENT_REG
        };
        let mut out = Vec::with_capacity(53);
        out.extend_from_slice(&GENERATION.to_le_bytes());
        out.extend_from_slice(&self.disk_num_bytes.to_le_bytes());
        out.push(self.compression);
        out.push(0);
        out.extend_from_slice(&0_u16.to_le_bytes());
        out.push(extent_type);
        out.extend_from_slice(&self.disk_bytenr.to_le_bytes());
        out.extend_from_slice(&self.disk_num_bytes.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.num_bytes.to_le_bytes());
        out
    }
}

/// An inline file extent holding `data`.
#[must_use]
pub fn inline_file_extent(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(21 + data.len());
    out.extend_from_slice(&GENERATION.to_le_bytes());
    out.extend_from_slice(&usize_to_u64(data.len()).to_le_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, BTRFS_FILE_EXTENT_INLINE]);
    out.extend_from_slice(data);
    out
}

/// A `ROOT_ITEM` payload pointing at a tree root block.
#[must_use]
pub fn root_item(bytenr: u64, level: u8, root_dirid: u64) -> Vec<u8> {
    let mut out = vec![0_u8; ROOT_ITEM_SIZE];
    out[160..168].copy_from_slice(&GENERATION.to_le_bytes());
    out[168..176].copy_from_slice(&root_dirid.to_le_bytes());
    out[176..184].copy_from_slice(&bytenr.to_le_bytes());
    out[216..220].copy_from_slice(&1_u32.to_le_bytes());
    out[238] = level;
    out
}

#[must_use]
pub fn inode_item() -> Vec<u8> {
    vec![0_u8; INODE_ITEM_SIZE]
}

/// An `INODE_REF` payload packing one `(dir_index, name)` entry per link
/// from the same parent directory.
#[must_use]
pub fn inode_ref(entries: &[(u64, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, name) in entries {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&name_len(name).to_le_bytes());
        out.extend_from_slice(name);
    }
    out
}

/// An `INODE_EXTREF` payload; each entry is `(parent, dir_index, name)`.
#[must_use]
pub fn inode_extref(entries: &[(u64, u64, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (parent, index, name) in entries {
        out.extend_from_slice(&parent.to_le_bytes());
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&name_len(name).to_le_bytes());
        out.extend_from_slice(name);
    }
    out
}

/// Key of the extended ref naming `inum` as `name` inside `parent`.
#[must_use]
pub fn extref_key(inum: u64, parent: u64, name: &[u8]) -> BtrfsKey {
    let hash = crc32c::crc32c_append(crc32c::crc32c(&parent.to_le_bytes()), name);
    BtrfsKey::new(inum, BTRFS_INODE_EXTREF_KEY, u64::from(hash))
}

fn name_len(name: &[u8]) -> u16 {
    u16::try_from(name.len()).unwrap_or(u16::MAX)
}
