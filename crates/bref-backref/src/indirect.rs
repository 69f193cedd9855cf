//! Resolving references that name a root and key instead of a parent.

use bref_error::{BrefError, Result};
use bref_ondisk::{BtrfsKey, FileExtentItem, parse_file_extent_item};
use bref_tree::{FsInfo, TreeNode, TreePath, TreeRoot, parse_error_at};
use bref_types::BTRFS_EXTENT_DATA_KEY;
use tracing::{debug, trace, warn};

use crate::prelim::{InodeElement, PrelimRef, PrelimRefs};
use crate::resolve::ParentRef;
use crate::ulist::UList;

enum Resolution {
    /// The owning root no longer exists.
    RootMissing,
    /// The extent is the root block of the owning tree.
    TreeRoot,
    Parents(UList<ParentRef>),
}

/// Fill in search keys for tree block refs that only name a root, using the
/// first key of the referenced block itself.
pub(crate) fn add_missing_keys(fs: &FsInfo, refs: &mut PrelimRefs) -> Result<()> {
    for mut r in std::mem::take(&mut refs.missing_keys) {
        let child_level = r.level.checked_sub(1).ok_or_else(|| {
            BrefError::corrupt(r.wanted_disk_byte, "tree block backref at level 0")
        })?;
        let block = fs.read_node(r.wanted_disk_byte, Some(child_level))?;
        let key = block
            .first_key()
            .ok_or_else(|| BrefError::corrupt(block.bytenr, "referenced tree block is empty"))?;
        trace!(bytenr = r.wanted_disk_byte, root = r.root_id, ?key, "backref_missing_key");
        r.key_for_search = Some(key);
        if r.parent == 0 {
            refs.indirect.push(r);
        } else {
            refs.pending.push(r);
        }
    }
    Ok(())
}

/// Search every indirect ref's tree for the blocks that point at the
/// extent. Each parent found becomes one pending ref; refs whose root is
/// gone or that lead nowhere are dropped.
pub(crate) fn resolve_indirect_refs(
    fs: &FsInfo,
    refs: &mut PrelimRefs,
    extent_item_pos: Option<u64>,
    total_refs: u64,
) -> Result<()> {
    for mut r in std::mem::take(&mut refs.indirect) {
        match resolve_indirect_ref(fs, &r, extent_item_pos, total_refs)? {
            Resolution::RootMissing => {
                warn!(root = r.root_id, bytenr = r.wanted_disk_byte, "backref_root_missing");
            }
            Resolution::TreeRoot => {
                r.tree_root = true;
                refs.pending.push(r);
            }
            Resolution::Parents(parents) => {
                if parents.is_empty() {
                    debug!(root = r.root_id, bytenr = r.wanted_disk_byte, "backref_indirect_unresolved");
                }
                for (parent, hit) in parents.into_vec() {
                    let mut resolved = r.clone();
                    resolved.parent = parent;
                    resolved.count = hit.count;
                    resolved.inode_list = hit.inodes;
                    refs.pending.push(resolved);
                }
            }
        }
    }
    Ok(())
}

fn resolve_indirect_ref(
    fs: &FsInfo,
    r: &PrelimRef,
    extent_item_pos: Option<u64>,
    total_refs: u64,
) -> Result<Resolution> {
    let root = match fs.read_fs_root(r.root_id) {
        Ok(root) => root,
        Err(e) if e.is_not_found() => return Ok(Resolution::RootMissing),
        Err(e) => return Err(e),
    };
    if u16::from(root.level) + 1 == u16::from(r.level) {
        debug!(root = r.root_id, bytenr = r.wanted_disk_byte, "backref_tree_root");
        return Ok(Resolution::TreeRoot);
    }

    let key = r.key_for_search.ok_or_else(|| {
        BrefError::corrupt(r.wanted_disk_byte, "indirect backref without a search key")
    })?;
    let (mut path, _) = fs.search_slot(root, &key, r.level)?;

    // A ref above the tree's current height resolves at the highest level
    // the search reached.
    let mut level = r.level;
    while path.node(level).is_none() {
        level = level.checked_sub(1).ok_or_else(|| {
            BrefError::corrupt(root.bytenr, "search path holds no nodes")
        })?;
    }
    let parents = add_all_parents(fs, root, &mut path, r, &key, level, extent_item_pos, total_refs)?;
    debug!(
        root = r.root_id,
        bytenr = r.wanted_disk_byte,
        level,
        parents = parents.len(),
        "backref_indirect_resolved"
    );
    Ok(Resolution::Parents(parents))
}

#[allow(clippy::too_many_arguments)]
fn add_all_parents(
    fs: &FsInfo,
    root: TreeRoot,
    path: &mut TreePath,
    r: &PrelimRef,
    key: &BtrfsKey,
    level: u8,
    extent_item_pos: Option<u64>,
    total_refs: u64,
) -> Result<UList<ParentRef>> {
    let mut parents = UList::new();
    if level != 0 {
        if let Some(node) = path.node(level) {
            parents.add(
                node.bytenr,
                ParentRef {
                    count: r.count,
                    inodes: Vec::new(),
                },
            );
        }
        return Ok(parents);
    }

    if path.at_leaf_end() && !fs.next_leaf(path)? {
        return Ok(parents);
    }
    let mut found = 0_u64;
    while found < total_refs {
        let leaf = path.leaf().map_or(root.bytenr, |pl| pl.node.bytenr);
        let (Some(item_key), Some(data)) = (path.item_key(), path.item_data()) else {
            return Err(BrefError::corrupt(leaf, "leaf item out of range"));
        };
        if item_key.objectid != key.objectid || item_key.item_type != BTRFS_EXTENT_DATA_KEY {
            break;
        }
        let fi = parse_file_extent_item(data).map_err(|e| parse_error_at(leaf, &e))?;
        if !fi.is_inline() && fi.disk_bytenr == r.wanted_disk_byte {
            found += 1;
            let hit = match extent_item_pos {
                None => Some(Vec::new()),
                Some(pos) => check_extent_in_eb(&item_key, &fi, pos).map(|elem| vec![elem]),
            };
            if let Some(inodes) = hit {
                parents.add_merge(leaf, ParentRef { count: 1, inodes }, ParentRef::merge);
            }
        }
        if !fs.next_item(path)? {
            break;
        }
    }
    Ok(parents)
}

/// Map `extent_item_pos` through one file extent item. Uncompressed,
/// unencrypted extents match only when the position lies inside the bytes
/// the item uses; encoded extents always match at the item's file offset.
pub(crate) fn check_extent_in_eb(
    key: &BtrfsKey,
    fi: &FileExtentItem,
    extent_item_pos: u64,
) -> Option<InodeElement> {
    let mut offset = 0;
    if fi.is_plain() {
        let end = fi.offset.saturating_add(fi.num_bytes);
        if extent_item_pos < fi.offset || extent_item_pos >= end {
            return None;
        }
        offset = extent_item_pos - fi.offset;
    }
    Some(InodeElement {
        inum: key.objectid,
        offset: key.offset.saturating_add(offset),
    })
}

/// Scan a whole leaf for file extents pointing at `wanted_disk_byte` that
/// cover `extent_item_pos`. Used when a shared data ref names the leaf but
/// not the key.
pub(crate) fn find_extent_in_eb(
    leaf: &TreeNode,
    wanted_disk_byte: u64,
    extent_item_pos: u64,
) -> Result<Vec<InodeElement>> {
    let mut found = Vec::new();
    for (key, data) in leaf.items() {
        if key.item_type != BTRFS_EXTENT_DATA_KEY {
            continue;
        }
        let fi = parse_file_extent_item(data).map_err(|e| parse_error_at(leaf.bytenr, &e))?;
        if fi.is_inline() || fi.disk_bytenr != wanted_disk_byte {
            continue;
        }
        found.extend(check_extent_in_eb(&key, &fi, extent_item_pos));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bref_ondisk::FileExtentType;

    fn regular(offset: u64, num_bytes: u64, compression: u8) -> FileExtentItem {
        FileExtentItem {
            generation: 1,
            ram_bytes: 8192,
            compression,
            encryption: 0,
            other_encoding: 0,
            extent_type: FileExtentType::Regular,
            disk_bytenr: 0x100_0000,
            disk_num_bytes: 8192,
            offset,
            num_bytes,
        }
    }

    #[test]
    fn plain_extent_maps_position_into_file() {
        let key = BtrfsKey::new(257, BTRFS_EXTENT_DATA_KEY, 65536);
        let fi = regular(4096, 4096, 0);
        assert_eq!(check_extent_in_eb(&key, &fi, 4095), None);
        assert_eq!(
            check_extent_in_eb(&key, &fi, 5000),
            Some(InodeElement {
                inum: 257,
                offset: 65536 + 904,
            })
        );
        assert_eq!(check_extent_in_eb(&key, &fi, 8192), None);
    }

    #[test]
    fn compressed_extent_always_matches() {
        let key = BtrfsKey::new(257, BTRFS_EXTENT_DATA_KEY, 65536);
        let fi = regular(4096, 4096, 1);
        assert_eq!(
            check_extent_in_eb(&key, &fi, 0),
            Some(InodeElement {
                inum: 257,
                offset: 65536,
            })
        );
    }
}
