//! Transitive walks built on [`find_parent_nodes`].

use std::ops::ControlFlow;

use bref_error::{BrefError, Result};
use bref_ondisk::{BtrfsKey, ExtentItem, ExtentRef, parse_extent_item};
use bref_tree::{FsInfo, parse_error_at};
use bref_types::{BTRFS_EXTENT_ITEM_KEY, BTRFS_METADATA_ITEM_KEY};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::resolve::{ParentRef, WalkOptions, find_parent_nodes};
use crate::ulist::UList;

/// One file position referencing an extent, seen from one root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeHit {
    pub inum: u64,
    pub offset: u64,
    pub root: u64,
}

/// Whether an extent holds file data or a tree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentKind {
    Data,
    TreeBlock,
}

/// The extent owning a logical address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentLocation {
    pub key: BtrfsKey,
    pub kind: ExtentKind,
    /// Byte offset of the address inside the extent.
    pub offset: u64,
    pub item: ExtentItem,
}

impl ExtentLocation {
    #[must_use]
    pub fn bytenr(&self) -> u64 {
        self.key.objectid
    }
}

/// A tree block backref stored inline in an extent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBackref {
    /// Owning root for keyed-by-root refs, parent block for shared refs.
    pub owner: u64,
    pub shared: bool,
    pub level: u8,
}

/// Every leaf (or other block) directly referencing `bytenr`. An absent
/// extent yields an empty set.
pub fn find_all_leafs(
    fs: &FsInfo,
    bytenr: u64,
    opts: &WalkOptions,
    extent_item_pos: Option<u64>,
) -> Result<UList<ParentRef>> {
    match find_parent_nodes(fs, bytenr, opts, extent_item_pos) {
        Ok(found) => Ok(found.parents),
        Err(e) if e.is_not_found() => {
            debug!(bytenr, "backref_leafs_extent_absent");
            Ok(UList::new())
        }
        Err(e) => Err(e),
    }
}

/// Every root that transitively references `bytenr`.
///
/// Each discovered parent is itself resolved; a block is visited at most
/// once, so shared or cyclic ancestry terminates. Blocks whose extent item
/// has disappeared contribute nothing.
pub fn find_all_roots(fs: &FsInfo, bytenr: u64, opts: &WalkOptions) -> Result<UList<()>> {
    let mut queue: UList<()> = UList::new();
    queue.add(bytenr, ());
    let mut roots = UList::new();
    let mut idx = 0;
    while let Some((block, ())) = queue.entry_at(idx) {
        idx += 1;
        match find_parent_nodes(fs, block, opts, None) {
            Ok(found) => {
                for parent in found.parents.keys() {
                    queue.add(parent, ());
                }
                for root in found.roots.keys() {
                    roots.add(root, ());
                }
            }
            Err(e) if e.is_not_found() => {
                trace!(bytenr = block, "backref_roots_block_absent");
            }
            Err(e) => return Err(e),
        }
    }
    debug!(bytenr, visited = queue.len(), roots = roots.len(), "backref_roots_found");
    Ok(roots)
}

/// Call `iterate` for every `(inode, file offset, root)` referencing byte
/// `extent_item_pos` of the extent at `bytenr`. Returns `Break` when the
/// callback stopped the walk.
pub fn iterate_extent_inodes<F>(
    fs: &FsInfo,
    bytenr: u64,
    extent_item_pos: u64,
    opts: &WalkOptions,
    mut iterate: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(&InodeHit) -> ControlFlow<()>,
{
    let leafs = find_all_leafs(fs, bytenr, opts, Some(extent_item_pos))?;
    for (leaf, parent) in leafs.iter() {
        let roots = find_all_roots(fs, leaf, opts)?;
        for root in roots.keys() {
            for elem in &parent.inodes {
                let hit = InodeHit {
                    inum: elem.inum,
                    offset: elem.offset,
                    root,
                };
                trace!(bytenr, leaf, inum = hit.inum, offset = hit.offset, root, "backref_inode");
                if iterate(&hit).is_break() {
                    debug!(bytenr, "backref_inode_walk_stopped");
                    return Ok(ControlFlow::Break(()));
                }
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Find the extent item covering `logical`.
pub fn extent_from_logical(fs: &FsInfo, logical: u64) -> Result<ExtentLocation> {
    let item_type = if fs.skinny_metadata() {
        BTRFS_METADATA_ITEM_KEY
    } else {
        BTRFS_EXTENT_ITEM_KEY
    };
    let search = BtrfsKey::new(logical, item_type, u64::MAX);
    let (mut path, exact) = fs.search_slot(fs.extent_root(), &search, 0)?;
    let not_found = || BrefError::NotFound(format!("no extent covers logical {logical}"));
    if !exact && !fs.prev_item(&mut path)? {
        return Err(not_found());
    }
    let key = loop {
        let key = path.item_key().ok_or_else(not_found)?;
        if matches!(key.item_type, BTRFS_EXTENT_ITEM_KEY | BTRFS_METADATA_ITEM_KEY) {
            break key;
        }
        if !fs.prev_item(&mut path)? {
            return Err(not_found());
        }
    };

    let size = if key.item_type == BTRFS_METADATA_ITEM_KEY {
        fs.nodesize()
    } else {
        key.offset
    };
    if key.objectid > logical || key.objectid.saturating_add(size) <= logical {
        debug!(logical, extent = key.objectid, size, "backref_logical_outside_extent");
        return Err(not_found());
    }

    let leaf = path.leaf().map_or(0, |pl| pl.node.bytenr);
    let data = path
        .item_data()
        .ok_or_else(|| BrefError::corrupt(leaf, "extent item out of range"))?;
    let item = parse_extent_item(&key, data).map_err(|e| parse_error_at(leaf, &e))?;
    let kind = if item.is_tree_block() {
        ExtentKind::TreeBlock
    } else if item.is_data() {
        ExtentKind::Data
    } else {
        return Err(BrefError::corrupt(leaf, "extent is neither data nor tree block"));
    };
    trace!(logical, extent = key.objectid, ?kind, "backref_logical_resolved");
    Ok(ExtentLocation {
        key,
        kind,
        offset: logical - key.objectid,
        item,
    })
}

/// [`iterate_extent_inodes`] for the data extent covering `logical`.
/// Tree block addresses are rejected.
pub fn iterate_inodes_from_logical<F>(
    fs: &FsInfo,
    logical: u64,
    opts: &WalkOptions,
    iterate: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(&InodeHit) -> ControlFlow<()>,
{
    let loc = extent_from_logical(fs, logical)?;
    if loc.kind == ExtentKind::TreeBlock {
        return Err(BrefError::InvalidArgument(format!(
            "logical {logical} lies in a tree block"
        )));
    }
    iterate_extent_inodes(fs, loc.bytenr(), loc.offset, opts, iterate)
}

/// The inline tree block backrefs of an extent item, in on-disk order.
pub fn tree_backref_for_extent(item: &ExtentItem) -> impl Iterator<Item = TreeBackref> + '_ {
    item.inline_refs.iter().filter_map(|r| match *r {
        ExtentRef::TreeBlock { root } => Some(TreeBackref {
            owner: root,
            shared: false,
            level: item.level,
        }),
        ExtentRef::SharedBlock { parent } => Some(TreeBackref {
            owner: parent,
            shared: true,
            level: item.level,
        }),
        ExtentRef::ExtentData(_) | ExtentRef::SharedData { .. } => None,
    })
}
