//! Turn inline and keyed backrefs of an extent into preliminary refs.

use bref_error::{BrefError, Result};
use bref_ondisk::{ExtentItem, ExtentRef, parse_keyed_ref};
use bref_tree::{FsInfo, TreePath, parse_error_at};
use bref_types::{BTRFS_SHARED_DATA_REF_KEY, BTRFS_TREE_BLOCK_REF_KEY};
use tracing::{trace, warn};

use crate::prelim::{PrelimRef, PrelimRefs};

/// Map one backref of the extent at `bytenr` to a preliminary ref.
/// `info_level` is the extent's own tree level (0 for data).
pub(crate) fn prelim_from_ref(r: &ExtentRef, bytenr: u64, info_level: u8) -> PrelimRef {
    let above = info_level.saturating_add(1);
    match *r {
        ExtentRef::SharedBlock { parent } => PrelimRef::new(0, None, above, parent, bytenr, 1),
        ExtentRef::SharedData { parent, count } => {
            PrelimRef::new(0, None, 0, parent, bytenr, u64::from(count))
        }
        ExtentRef::TreeBlock { root } => PrelimRef::new(root, None, above, 0, bytenr, 1),
        ExtentRef::ExtentData(dref) => PrelimRef::new(
            dref.root,
            Some(dref.search_key()),
            0,
            0,
            bytenr,
            u64::from(dref.count),
        ),
    }
}

/// Queue every backref stored inside the extent item itself.
pub(crate) fn add_inline_refs(item: &ExtentItem, bytenr: u64, refs: &mut PrelimRefs) {
    for r in &item.inline_refs {
        trace!(bytenr, ?r, "backref_inline");
        refs.add(prelim_from_ref(r, bytenr, item.level));
    }
}

/// Queue the keyed backrefs following the extent item. `path` points at
/// the extent item on entry.
pub(crate) fn add_keyed_refs(
    fs: &FsInfo,
    path: &mut TreePath,
    bytenr: u64,
    info_level: u8,
    refs: &mut PrelimRefs,
) -> Result<()> {
    while fs.next_item(path)? {
        let leaf = path.leaf().map_or(0, |pl| pl.node.bytenr);
        let (Some(key), Some(data)) = (path.item_key(), path.item_data()) else {
            return Err(BrefError::corrupt(leaf, "extent tree item out of range"));
        };
        if key.objectid != bytenr {
            break;
        }
        if key.item_type < BTRFS_TREE_BLOCK_REF_KEY {
            continue;
        }
        if key.item_type > BTRFS_SHARED_DATA_REF_KEY {
            break;
        }
        match parse_keyed_ref(&key, data).map_err(|e| parse_error_at(leaf, &e))? {
            Some(r) => {
                trace!(bytenr, ?r, "backref_keyed");
                refs.add(prelim_from_ref(&r, bytenr, info_level));
            }
            None => warn!(bytenr, item_type = key.item_type, "backref_keyed_unknown_type"),
        }
    }
    Ok(())
}
