//! Preliminary references and the three work queues they move through.

use bref_ondisk::BtrfsKey;
use bref_types::BTRFS_DATA_RELOC_TREE_OBJECTID;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A concrete file position mapping onto the extent being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeElement {
    pub inum: u64,
    /// File offset of the resolved byte.
    pub offset: u64,
}

/// A candidate backref that may still need a key or a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PrelimRef {
    /// Owning tree, 0 for shared refs.
    pub root_id: u64,
    pub key_for_search: Option<BtrfsKey>,
    /// Tree level of the referencing block.
    pub level: u8,
    pub count: u64,
    /// Referencing block, 0 while unknown.
    pub parent: u64,
    /// The extent this reference points at.
    pub wanted_disk_byte: u64,
    pub inode_list: Vec<InodeElement>,
    /// Set when the search proved the extent is the root block of `root_id`.
    pub tree_root: bool,
}

impl PrelimRef {
    pub fn new(
        root_id: u64,
        key_for_search: Option<BtrfsKey>,
        level: u8,
        parent: u64,
        wanted_disk_byte: u64,
        count: u64,
    ) -> Self {
        Self {
            root_id,
            key_for_search,
            level,
            count,
            parent,
            wanted_disk_byte,
            inode_list: Vec::new(),
            tree_root: false,
        }
    }

    /// Same root, level, search key and parent.
    fn same_block(&self, other: &Self) -> bool {
        self.level == other.level
            && self.root_id == other.root_id
            && self.key_for_search == other.key_for_search
            && self.parent == other.parent
    }

    fn absorb(&mut self, other: Self) {
        self.count += other.count;
        self.inode_list.extend(other.inode_list);
        self.tree_root |= other.tree_root;
    }
}

/// References grouped by what they still need.
///
/// * `pending`: parent known, or nothing left to resolve.
/// * `indirect`: root and key known, parent must be searched for.
/// * `missing_keys`: only the root is known; the key comes from the
///   extent's own first key.
#[derive(Debug, Default)]
pub(crate) struct PrelimRefs {
    pub pending: Vec<PrelimRef>,
    pub indirect: Vec<PrelimRef>,
    pub missing_keys: Vec<PrelimRef>,
}

impl PrelimRefs {
    /// Queue a reference. Refs owned by the data relocation tree are
    /// ignored.
    pub fn add(&mut self, r: PrelimRef) {
        if r.root_id == BTRFS_DATA_RELOC_TREE_OBJECTID {
            trace!(bytenr = r.wanted_disk_byte, "backref_skip_data_reloc");
            return;
        }
        let queue = match (r.key_for_search.is_some(), r.parent != 0) {
            (true, false) => &mut self.indirect,
            (false, false) => &mut self.missing_keys,
            (_, true) => &mut self.pending,
        };
        queue.push(r);
    }

    /// Collapse duplicate discoveries of the same backref in the pending
    /// and indirect queues.
    pub fn merge_same_block(&mut self) {
        merge_where(&mut self.pending, PrelimRef::same_block);
        merge_where(&mut self.indirect, PrelimRef::same_block);
    }

    /// Collapse pending refs that resolved to the same non-zero parent.
    pub fn merge_same_parent(&mut self) {
        merge_where(&mut self.pending, |a, b| a.parent != 0 && a.parent == b.parent);
    }
}

fn merge_where(list: &mut Vec<PrelimRef>, same: impl Fn(&PrelimRef, &PrelimRef) -> bool) {
    let mut merged: Vec<PrelimRef> = Vec::with_capacity(list.len());
    for r in list.drain(..) {
        match merged.iter_mut().find(|m| same(m, &r)) {
            Some(existing) => existing.absorb(r),
            None => merged.push(r),
        }
    }
    *list = merged;
}
