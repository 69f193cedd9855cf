//! Filesystem handle and the ordered-iteration primitives over its trees.

use std::path::Path;
use std::sync::Arc;

use bref_error::{BrefError, Result};
use bref_ondisk::{
    BtrfsKey, BtrfsSuperblock, parse_chunk_item, parse_root_item, parse_sys_chunk_array,
};
use bref_types::{
    BTRFS_CHUNK_ITEM_KEY, BTRFS_EXTENT_TREE_OBJECTID, BTRFS_MAX_LEVEL, BTRFS_ROOT_ITEM_KEY,
    BTRFS_ROOT_TREE_OBJECTID, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, NodeSize,
    usize_to_u64,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::convert::parse_error_at;
use crate::node::TreeNode;
use crate::path::TreePath;
use crate::source::{BlockSource, ChunkMapped, FileBlockSource, ImageBlockSource};
use crate::walk::walk_tree;

/// Options for opening an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Skip superblock geometry validation (sector size, node size,
    /// non-zero tree roots). The node size must still be usable.
    pub skip_validation: bool,
}

/// Location of a tree's root block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeRoot {
    pub bytenr: u64,
    pub level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub nodesize: NodeSize,
    pub root_tree: TreeRoot,
    pub skinny_metadata: bool,
}

/// A read-only filesystem: a block source plus the geometry needed to
/// search its trees.
pub struct FsInfo {
    source: Box<dyn BlockSource>,
    geometry: FsGeometry,
    extent_root: TreeRoot,
}

impl std::fmt::Debug for FsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsInfo")
            .field("geometry", &self.geometry)
            .field("extent_root", &self.extent_root)
            .finish_non_exhaustive()
    }
}

impl FsInfo {
    /// Build a handle over `source`, locating the extent tree through the
    /// root tree.
    pub fn new(source: Box<dyn BlockSource>, geometry: FsGeometry) -> Result<Self> {
        let mut fs = Self {
            source,
            geometry,
            extent_root: geometry.root_tree,
        };
        fs.extent_root = fs.lookup_root_item(BTRFS_EXTENT_TREE_OBJECTID)?;
        debug!(
            root_tree = geometry.root_tree.bytenr,
            extent_tree = fs.extent_root.bytenr,
            extent_level = fs.extent_root.level,
            skinny = geometry.skinny_metadata,
            "fs_info_ready"
        );
        Ok(fs)
    }

    /// Open a single-device image held in memory.
    pub fn open_image(image: Vec<u8>, options: OpenOptions) -> Result<Self> {
        let sb = BtrfsSuperblock::parse_from_image(&image)
            .map_err(|e| parse_error_at(usize_to_u64(BTRFS_SUPER_INFO_OFFSET), &e))?;
        Self::bootstrap(ImageBlockSource::new(image, Vec::new()), &sb, options)
    }

    /// Open a single-device image file or block device.
    pub fn open_file(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let source = FileBlockSource::open(path)?;
        let region =
            source.read_physical(usize_to_u64(BTRFS_SUPER_INFO_OFFSET), BTRFS_SUPER_INFO_SIZE)?;
        let sb = BtrfsSuperblock::parse_superblock_region(&region)
            .map_err(|e| parse_error_at(usize_to_u64(BTRFS_SUPER_INFO_OFFSET), &e))?;
        Self::bootstrap(source, &sb, options)
    }

    fn bootstrap<S>(mut source: S, sb: &BtrfsSuperblock, options: OpenOptions) -> Result<Self>
    where
        S: BlockSource + ChunkMapped + 'static,
    {
        if !options.skip_validation {
            sb.validate()
                .map_err(|e| BrefError::Format(format!("superblock: {e}")))?;
        }
        let nodesize =
            NodeSize::new(sb.nodesize).map_err(|e| BrefError::Format(format!("superblock: {e}")))?;

        let mut chunks = parse_sys_chunk_array(&sb.sys_chunk_array)
            .map_err(|e| BrefError::Format(format!("sys_chunk_array: {e}")))?;
        source.set_chunks(chunks.clone());

        for entry in walk_tree(&source, sb.chunk_root, nodesize)? {
            if entry.key.item_type != BTRFS_CHUNK_ITEM_KEY {
                continue;
            }
            let (chunk, _) =
                parse_chunk_item(entry.key, &entry.data).map_err(|e| parse_error_at(sb.chunk_root, &e))?;
            if !chunks.iter().any(|known| known.key.offset == chunk.key.offset) {
                chunks.push(chunk);
            }
        }
        info!(
            generation = sb.generation,
            nodesize = sb.nodesize,
            chunks = chunks.len(),
            "image_opened"
        );
        source.set_chunks(chunks);

        Self::new(
            Box::new(source),
            FsGeometry {
                nodesize,
                root_tree: TreeRoot {
                    bytenr: sb.root,
                    level: sb.root_level,
                },
                skinny_metadata: sb.skinny_metadata(),
            },
        )
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn nodesize(&self) -> u64 {
        self.geometry.nodesize.as_u64()
    }

    #[must_use]
    pub fn skinny_metadata(&self) -> bool {
        self.geometry.skinny_metadata
    }

    #[must_use]
    pub fn root_tree(&self) -> TreeRoot {
        self.geometry.root_tree
    }

    #[must_use]
    pub fn extent_root(&self) -> TreeRoot {
        self.extent_root
    }

    /// Read and parse the tree block at `bytenr`. When `expected_level` is
    /// given, a block at any other level is corruption.
    pub fn read_node(&self, bytenr: u64, expected_level: Option<u8>) -> Result<Arc<TreeNode>> {
        let raw = self
            .source
            .read_block(bytenr, self.geometry.nodesize.as_usize())?;
        let node = TreeNode::parse(bytenr, raw).map_err(|e| parse_error_at(bytenr, &e))?;
        if let Some(level) = expected_level {
            if node.level() != level {
                return Err(BrefError::corrupt(
                    bytenr,
                    format!("expected level {level}, found {}", node.level()),
                ));
            }
        }
        trace!(bytenr, level = node.level(), nritems = node.nritems(), "tree_node_read");
        Ok(Arc::new(node))
    }

    /// Descend from `root` towards `key`, stopping at `lowest_level`.
    ///
    /// At the leaf the slot is the exact match or the insertion point
    /// (possibly one past the last item). At internal levels the slot is the
    /// last pointer whose key is `<= key`. Returns the path and whether the
    /// key was found exactly.
    pub fn search_slot(
        &self,
        root: TreeRoot,
        key: &BtrfsKey,
        lowest_level: u8,
    ) -> Result<(TreePath, bool)> {
        let mut path = TreePath::new();
        let mut node = self.read_node(root.bytenr, Some(root.level))?;
        loop {
            let level = node.level();
            let found = node.bin_search(key);
            if level == 0 {
                let exact = found.is_ok();
                let slot = found.unwrap_or_else(|slot| slot);
                path.set(0, node, slot);
                return Ok((path, exact));
            }

            let slot = match found {
                Ok(slot) => slot,
                Err(slot) => slot.saturating_sub(1),
            };
            let child = node.blockptr_at(slot).ok_or_else(|| {
                BrefError::corrupt(node.bytenr, "internal node has no key pointers")
            })?;
            path.set(level, Arc::clone(&node), slot);
            if level <= lowest_level {
                return Ok((path, found.is_ok()));
            }
            node = self.read_node(child, Some(level - 1))?;
        }
    }

    /// Move the path to the first item of the next non-empty leaf.
    /// Returns `false` when the path is already in the last leaf.
    pub fn next_leaf(&self, path: &mut TreePath) -> Result<bool> {
        loop {
            let Some(mut level) = (1..BTRFS_MAX_LEVEL).find(|&level| {
                path.level(level)
                    .is_some_and(|pl| pl.slot + 1 < pl.node.nritems())
            }) else {
                return Ok(false);
            };
            let next_slot = path.slot(level).map_or(0, |slot| slot + 1);
            path.set_slot(level, next_slot);

            while level > 0 {
                let parent = path
                    .level(level)
                    .ok_or_else(|| BrefError::corrupt(0, "search path lost a level"))?;
                let child = parent.node.blockptr_at(parent.slot).ok_or_else(|| {
                    BrefError::corrupt(parent.node.bytenr, "key pointer slot out of range")
                })?;
                level -= 1;
                let node = self.read_node(child, Some(level))?;
                path.set(level, node, 0);
            }
            if !path.at_leaf_end() {
                return Ok(true);
            }
        }
    }

    /// Advance to the next leaf item, crossing leaf boundaries.
    /// Returns `false` at the end of the tree.
    pub fn next_item(&self, path: &mut TreePath) -> Result<bool> {
        let Some(slot) = path.slot(0) else {
            return Ok(false);
        };
        path.set_slot(0, slot + 1);
        if path.at_leaf_end() {
            return self.next_leaf(path);
        }
        Ok(true)
    }

    /// Step back to the previous leaf item, crossing leaf boundaries.
    /// Returns `false` at the start of the tree.
    pub fn prev_item(&self, path: &mut TreePath) -> Result<bool> {
        let Some(slot) = path.slot(0) else {
            return Ok(false);
        };
        let last = path.leaf().map_or(0, |pl| pl.node.nritems());
        if slot.min(last) > 0 {
            path.set_slot(0, slot.min(last) - 1);
            return Ok(true);
        }
        loop {
            let Some(mut level) = (1..BTRFS_MAX_LEVEL)
                .find(|&level| path.level(level).is_some_and(|pl| pl.slot > 0))
            else {
                return Ok(false);
            };
            let prev_slot = path.slot(level).map_or(0, |slot| slot - 1);
            path.set_slot(level, prev_slot);

            while level > 0 {
                let parent = path
                    .level(level)
                    .ok_or_else(|| BrefError::corrupt(0, "search path lost a level"))?;
                let child = parent.node.blockptr_at(parent.slot).ok_or_else(|| {
                    BrefError::corrupt(parent.node.bytenr, "key pointer slot out of range")
                })?;
                level -= 1;
                let node = self.read_node(child, Some(level))?;
                let last = node.nritems().saturating_sub(1);
                path.set(level, node, last);
            }
            if path.leaf().is_some_and(|pl| pl.node.nritems() > 0) {
                return Ok(true);
            }
        }
    }

    /// Find the first item in `root` with the given objectid and type at or
    /// after `offset`. Returns the positioned path, or `None` if there is no
    /// such item.
    pub fn find_item(
        &self,
        root: TreeRoot,
        objectid: u64,
        item_type: u8,
        offset: u64,
    ) -> Result<Option<TreePath>> {
        let key = BtrfsKey::new(objectid, item_type, offset);
        let (mut path, _) = self.search_slot(root, &key, 0)?;
        if path.at_leaf_end() && !self.next_leaf(&mut path)? {
            return Ok(None);
        }
        Ok(path
            .item_key()
            .filter(|found| found.objectid == objectid && found.item_type == item_type)
            .map(|_| path))
    }

    fn lookup_root_item(&self, root_id: u64) -> Result<TreeRoot> {
        let key = BtrfsKey::new(root_id, BTRFS_ROOT_ITEM_KEY, u64::MAX);
        let (mut path, exact) = self.search_slot(self.geometry.root_tree, &key, 0)?;
        if !exact && !self.prev_item(&mut path)? {
            return Err(BrefError::NotFound(format!("root {root_id}")));
        }
        let found = path
            .item_key()
            .filter(|found| found.objectid == root_id && found.item_type == BTRFS_ROOT_ITEM_KEY)
            .ok_or_else(|| BrefError::NotFound(format!("root {root_id}")))?;
        let leaf = path.leaf().map_or(0, |pl| pl.node.bytenr);
        let data = path
            .item_data()
            .ok_or_else(|| BrefError::corrupt(leaf, "root item payload out of range"))?;
        let item = parse_root_item(data).map_err(|e| parse_error_at(leaf, &e))?;
        trace!(root_id, transid = found.offset, bytenr = item.bytenr, level = item.level, "root_item_found");
        Ok(TreeRoot {
            bytenr: item.bytenr,
            level: item.level,
        })
    }

    /// Locate the root block of tree `root_id`. The newest `ROOT_ITEM` wins.
    pub fn read_fs_root(&self, root_id: u64) -> Result<TreeRoot> {
        match root_id {
            BTRFS_ROOT_TREE_OBJECTID => Ok(self.geometry.root_tree),
            BTRFS_EXTENT_TREE_OBJECTID => Ok(self.extent_root),
            _ => self.lookup_root_item(root_id),
        }
    }
}
