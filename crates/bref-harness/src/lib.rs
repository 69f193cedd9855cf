#![forbid(unsafe_code)]
//! Fixture builders for tests: in-memory btrfs trees and whole images.
//!
//! [`FsBuilder`] lays out leaves and internal nodes at allocated addresses,
//! registers tree roots, and produces either an [`FsInfo`] over a
//! [`MemoryBlockSource`] or a single-device image that `FsInfo::open_image`
//! can bootstrap from.

pub mod encode;

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use bref_ondisk::{BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BTRFS_KEY_PTR_SIZE, BtrfsKey};
use bref_tree::{FsGeometry, FsInfo, MemoryBlockSource, TreeRoot};
use bref_types::{
    BTRFS_CHUNK_ITEM_KEY, BTRFS_CHUNK_TREE_OBJECTID, BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA,
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_MAGIC, BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_TREE_OBJECTID,
    BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, NodeSize, usize_to_u64,
};

pub use encode::*;

/// Node size of every fixture.
pub const NODESIZE: u32 = 4096;
/// First address handed out by [`FsBuilder::alloc`].
pub const FIRST_BLOCK: u64 = 0x10_0000;
/// Generation stamped into headers and items.
pub const GENERATION: u64 = 7;

const NODESIZE_BYTES: usize = NODESIZE as usize;
const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;

/// Encode a leaf block. Items are sorted by key; payloads are packed from
/// the end of the block.
///
/// # Panics
///
/// Panics if the items do not fit in one node.
#[must_use]
pub fn encode_leaf(bytenr: u64, owner: u64, items: &[(BtrfsKey, Vec<u8>)]) -> Vec<u8> {
    let mut sorted: Vec<&(BtrfsKey, Vec<u8>)> = items.iter().collect();
    sorted.sort_by_key(|(key, _)| *key);

    let used = BTRFS_HEADER_SIZE
        + sorted
            .iter()
            .map(|(_, data)| BTRFS_ITEM_SIZE + data.len())
            .sum::<usize>();
    assert!(used <= NODESIZE_BYTES, "leaf overflow: {used} bytes");

    let mut block = header(bytenr, owner, sorted.len(), 0);
    let mut data_end = NODESIZE_BYTES - BTRFS_HEADER_SIZE;
    for (idx, (key, data)) in sorted.iter().enumerate() {
        data_end -= data.len();
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        let mut raw_key = Vec::with_capacity(17);
        key.write_to(&mut raw_key);
        block[base..base + 17].copy_from_slice(&raw_key);
        block[base + 17..base + 21].copy_from_slice(&u32_of(data_end).to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&u32_of(data.len()).to_le_bytes());
        let abs = BTRFS_HEADER_SIZE + data_end;
        block[abs..abs + data.len()].copy_from_slice(data);
    }
    block
}

/// Encode an internal node at `level` pointing at `children`.
///
/// # Panics
///
/// Panics if the pointers do not fit in one node.
#[must_use]
pub fn encode_node(bytenr: u64, owner: u64, level: u8, children: &[(BtrfsKey, u64)]) -> Vec<u8> {
    assert!(level > 0, "internal nodes live above level 0");
    let used = BTRFS_HEADER_SIZE + children.len() * BTRFS_KEY_PTR_SIZE;
    assert!(used <= NODESIZE_BYTES, "node overflow: {used} bytes");

    let mut block = header(bytenr, owner, children.len(), level);
    for (idx, (key, blockptr)) in children.iter().enumerate() {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        let mut raw = Vec::with_capacity(BTRFS_KEY_PTR_SIZE);
        key.write_to(&mut raw);
        raw.extend_from_slice(&blockptr.to_le_bytes());
        raw.extend_from_slice(&GENERATION.to_le_bytes());
        block[base..base + BTRFS_KEY_PTR_SIZE].copy_from_slice(&raw);
    }
    block
}

fn header(bytenr: u64, owner: u64, nritems: usize, level: u8) -> Vec<u8> {
    let mut block = vec![0_u8; NODESIZE_BYTES];
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x50..0x58].copy_from_slice(&GENERATION.to_le_bytes());
    block[0x58..0x60].copy_from_slice(&owner.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&u32_of(nritems).to_le_bytes());
    block[0x64] = level;
    block
}

fn u32_of(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Builds a set of trees block by block.
#[derive(Debug, Clone)]
pub struct FsBuilder {
    blocks: BTreeMap<u64, Vec<u8>>,
    next_bytenr: u64,
    roots: BTreeMap<u64, TreeRoot>,
    skinny_metadata: bool,
}

impl Default for FsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next_bytenr: FIRST_BLOCK,
            roots: BTreeMap::new(),
            skinny_metadata: true,
        }
    }

    #[must_use]
    pub fn with_skinny_metadata(mut self, skinny: bool) -> Self {
        self.skinny_metadata = skinny;
        self
    }

    /// Reserve the next free block address.
    pub fn alloc(&mut self) -> u64 {
        let bytenr = self.next_bytenr;
        self.next_bytenr += u64::from(NODESIZE);
        bytenr
    }

    /// Allocate and write a leaf; returns its address.
    pub fn leaf(&mut self, owner: u64, items: &[(BtrfsKey, Vec<u8>)]) -> u64 {
        let bytenr = self.alloc();
        self.leaf_at(bytenr, owner, items);
        bytenr
    }

    /// Write a leaf at an address obtained from [`FsBuilder::alloc`].
    pub fn leaf_at(&mut self, bytenr: u64, owner: u64, items: &[(BtrfsKey, Vec<u8>)]) {
        self.blocks.insert(bytenr, encode_leaf(bytenr, owner, items));
    }

    /// Allocate and write an internal node; returns its address.
    pub fn node(&mut self, owner: u64, level: u8, children: &[(BtrfsKey, u64)]) -> u64 {
        let bytenr = self.alloc();
        self.node_at(bytenr, owner, level, children);
        bytenr
    }

    pub fn node_at(&mut self, bytenr: u64, owner: u64, level: u8, children: &[(BtrfsKey, u64)]) {
        self.blocks
            .insert(bytenr, encode_node(bytenr, owner, level, children));
    }

    /// Store raw bytes as a block, bypassing layout.
    pub fn raw_block(&mut self, bytenr: u64, block: Vec<u8>) {
        self.blocks.insert(bytenr, block);
    }

    /// Mutable access to an already written block.
    pub fn block_mut(&mut self, bytenr: u64) -> Option<&mut Vec<u8>> {
        self.blocks.get_mut(&bytenr)
    }

    /// Lay out `items` as a tree of leaves holding at most `per_leaf` items
    /// each, under a single level-1 node when more than one leaf is needed.
    pub fn tree(&mut self, owner: u64, items: &[(BtrfsKey, Vec<u8>)], per_leaf: usize) -> TreeRoot {
        let mut sorted = items.to_vec();
        sorted.sort_by_key(|(key, _)| *key);
        if sorted.len() <= per_leaf.max(1) {
            return TreeRoot {
                bytenr: self.leaf(owner, &sorted),
                level: 0,
            };
        }
        let children: Vec<(BtrfsKey, u64)> = sorted
            .chunks(per_leaf.max(1))
            .map(|chunk| (chunk[0].0, self.leaf(owner, chunk)))
            .collect();
        TreeRoot {
            bytenr: self.node(owner, 1, &children),
            level: 1,
        }
    }

    /// Register the root block of tree `root_id`. The extent tree (id 2) must
    /// be registered before building.
    pub fn set_root(&mut self, root_id: u64, root: TreeRoot) {
        self.roots.insert(root_id, root);
    }

    fn write_root_tree(&mut self) -> TreeRoot {
        let items: Vec<(BtrfsKey, Vec<u8>)> = self
            .roots
            .iter()
            .map(|(&id, root)| {
                (
                    BtrfsKey::new(id, BTRFS_ROOT_ITEM_KEY, 0),
                    root_item(root.bytenr, root.level, BTRFS_FIRST_FREE_OBJECTID),
                )
            })
            .collect();
        TreeRoot {
            bytenr: self.leaf(BTRFS_ROOT_TREE_OBJECTID, &items),
            level: 0,
        }
    }

    /// Finish the root tree and open the result over a memory block source.
    pub fn build(mut self) -> Result<FsInfo> {
        let root_tree = self.write_root_tree();
        let mut source = MemoryBlockSource::new();
        for (bytenr, block) in std::mem::take(&mut self.blocks) {
            source.insert(bytenr, block);
        }
        let geometry = FsGeometry {
            nodesize: NodeSize::new(NODESIZE).context("fixture node size")?,
            root_tree,
            skinny_metadata: self.skinny_metadata,
        };
        FsInfo::new(Box::new(source), geometry).context("open fixture trees")
    }

    /// Finish the root and chunk trees and lay everything out as a
    /// single-device image mapped one-to-one.
    pub fn build_image(mut self) -> Result<Vec<u8>> {
        let root_tree = self.write_root_tree();
        let chunk_leaf = self.alloc();
        let total = self.next_bytenr;
        let chunk_key = BtrfsKey::new(BTRFS_FIRST_FREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, 0);
        self.leaf_at(
            chunk_leaf,
            BTRFS_CHUNK_TREE_OBJECTID,
            &[(chunk_key, identity_chunk(total))],
        );

        let len = usize::try_from(total).context("image size")?;
        let mut image = vec![0_u8; len];
        for (bytenr, block) in &self.blocks {
            let start = usize::try_from(*bytenr).context("block address")?;
            let Some(dst) = image.get_mut(start..start + block.len()) else {
                bail!("block {bytenr:#x} lies outside the image");
            };
            dst.copy_from_slice(block);
        }

        let mut sys_array = Vec::new();
        chunk_key.write_to(&mut sys_array);
        sys_array.extend_from_slice(&identity_chunk(total));

        let sb = &mut image[BTRFS_SUPER_INFO_OFFSET..BTRFS_SUPER_INFO_OFFSET + BTRFS_SUPER_INFO_SIZE];
        sb[0x30..0x38].copy_from_slice(&usize_to_u64(BTRFS_SUPER_INFO_OFFSET).to_le_bytes());
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x48..0x50].copy_from_slice(&GENERATION.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&root_tree.bytenr.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&chunk_leaf.to_le_bytes());
        sb[0x70..0x78].copy_from_slice(&total.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&NODESIZE.to_le_bytes());
        sb[0xA0..0xA4].copy_from_slice(&u32_of(sys_array.len()).to_le_bytes());
        if self.skinny_metadata {
            sb[0xBC..0xC4].copy_from_slice(&BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA.to_le_bytes());
        }
        sb[0xC6] = root_tree.level;
        sb[SYS_CHUNK_ARRAY_OFFSET..SYS_CHUNK_ARRAY_OFFSET + sys_array.len()]
            .copy_from_slice(&sys_array);
        Ok(image)
    }
}

/// A single-stripe chunk mapping `[0, length)` onto the same physical range.
fn identity_chunk(length: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&BTRFS_CHUNK_TREE_OBJECTID.to_le_bytes());
    out.extend_from_slice(&0x1_0000_u64.to_le_bytes());
    out.extend_from_slice(&2_u64.to_le_bytes());
    out.extend_from_slice(&4096_u32.to_le_bytes());
    out.extend_from_slice(&4096_u32.to_le_bytes());
    out.extend_from_slice(&4096_u32.to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.extend_from_slice(&1_u64.to_le_bytes());
    out.extend_from_slice(&0_u64.to_le_bytes());
    out.extend_from_slice(&[0_u8; 16]);
    out
}
