//! Immediate parents (and owning roots) of one extent.

use bref_error::{BrefError, Result};
use bref_ondisk::{BtrfsKey, ExtentItem, parse_extent_item};
use bref_tree::{FsInfo, TreePath, parse_error_at};
use bref_types::{BTRFS_EXTENT_ITEM_KEY, BTRFS_METADATA_ITEM_KEY};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::extract::{add_inline_refs, add_keyed_refs};
use crate::indirect::{add_missing_keys, find_extent_in_eb, resolve_indirect_refs};
use crate::prelim::{InodeElement, PrelimRefs};
use crate::ulist::UList;

/// Options shared by every walker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkOptions {
    /// Point-in-time hint for callers walking a live filesystem. Reads
    /// through [`FsInfo`] always see a single committed state.
    pub time_seq: Option<u64>,
}

/// What a parent block contributes to an extent's references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    /// Number of references this parent accounts for.
    pub count: u64,
    /// File positions resolved inside this parent (leaf parents only, and
    /// only when a position was requested).
    pub inodes: Vec<InodeElement>,
}

impl ParentRef {
    pub(crate) fn merge(&mut self, other: Self) {
        self.count += other.count;
        self.inodes.extend(other.inodes);
    }
}

/// Result of [`find_parent_nodes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentNodes {
    pub parents: UList<ParentRef>,
    /// Trees whose root block is the extent itself.
    pub roots: UList<()>,
}

/// Position `path` on the extent item for `bytenr`.
pub(crate) fn lookup_extent_item(fs: &FsInfo, bytenr: u64) -> Result<(TreePath, BtrfsKey, ExtentItem)> {
    let item_type = if fs.skinny_metadata() {
        BTRFS_METADATA_ITEM_KEY
    } else {
        BTRFS_EXTENT_ITEM_KEY
    };
    let search = BtrfsKey::new(bytenr, item_type, u64::MAX);
    let (mut path, exact) = fs.search_slot(fs.extent_root(), &search, 0)?;
    if !exact && !fs.prev_item(&mut path)? {
        return Err(BrefError::NotFound(format!("extent {bytenr}")));
    }
    let key = path
        .item_key()
        .filter(|key| {
            key.objectid == bytenr
                && matches!(key.item_type, BTRFS_EXTENT_ITEM_KEY | BTRFS_METADATA_ITEM_KEY)
        })
        .ok_or_else(|| BrefError::NotFound(format!("extent {bytenr}")))?;
    let leaf = path.leaf().map_or(0, |pl| pl.node.bytenr);
    let data = path
        .item_data()
        .ok_or_else(|| BrefError::corrupt(leaf, "extent item out of range"))?;
    let item = parse_extent_item(&key, data).map_err(|e| parse_error_at(leaf, &e))?;
    Ok((path, key, item))
}

/// Find the blocks that directly reference the extent at `bytenr`, and the
/// trees whose root block it is.
///
/// With `extent_item_pos`, leaf parents carry the inode elements whose file
/// extents cover that byte of the extent; leaves with no covering extent
/// are not reported through indirect refs.
pub fn find_parent_nodes(
    fs: &FsInfo,
    bytenr: u64,
    opts: &WalkOptions,
    extent_item_pos: Option<u64>,
) -> Result<ParentNodes> {
    let (mut path, _, item) = lookup_extent_item(fs, bytenr)?;
    let total_refs = item.refs;
    let mut refs = PrelimRefs::default();
    add_inline_refs(&item, bytenr, &mut refs);
    add_keyed_refs(fs, &mut path, bytenr, item.level, &mut refs)?;
    drop(path);

    add_missing_keys(fs, &mut refs)?;
    refs.merge_same_block();
    resolve_indirect_refs(fs, &mut refs, extent_item_pos, total_refs)?;
    refs.merge_same_parent();

    let mut out = ParentNodes::default();
    for r in refs.pending {
        if r.count == 0 {
            continue;
        }
        if r.parent == 0 {
            if r.tree_root && r.root_id != 0 {
                out.roots.add(r.root_id, ());
            }
            continue;
        }
        let mut inodes = r.inode_list;
        if let Some(pos) = extent_item_pos {
            if inodes.is_empty() && r.level == 0 {
                let leaf = fs.read_node(r.parent, Some(0))?;
                inodes = find_extent_in_eb(&leaf, bytenr, pos)?;
            }
        }
        out.parents.add_merge(
            r.parent,
            ParentRef {
                count: r.count,
                inodes,
            },
            ParentRef::merge,
        );
    }

    debug!(
        bytenr,
        time_seq = opts.time_seq,
        total_refs,
        parents = out.parents.len(),
        roots = out.roots.len(),
        "backref_parents_found"
    );
    Ok(out)
}
