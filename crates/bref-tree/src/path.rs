//! A root-to-leaf search path.

use std::sync::Arc;

use bref_ondisk::BtrfsKey;
use bref_types::BTRFS_MAX_LEVEL;

use crate::node::TreeNode;

/// One node on a search path and the slot taken through it.
#[derive(Debug, Clone)]
pub struct PathLevel {
    pub node: Arc<TreeNode>,
    pub slot: usize,
}

/// Nodes visited by a search, indexed by tree level. Levels below the
/// search's lowest level and above the root are empty.
#[derive(Debug, Clone, Default)]
pub struct TreePath {
    levels: [Option<PathLevel>; BTRFS_MAX_LEVEL as usize],
}

impl TreePath {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn level(&self, level: u8) -> Option<&PathLevel> {
        self.levels.get(usize::from(level)).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn node(&self, level: u8) -> Option<&Arc<TreeNode>> {
        self.level(level).map(|pl| &pl.node)
    }

    #[must_use]
    pub fn slot(&self, level: u8) -> Option<usize> {
        self.level(level).map(|pl| pl.slot)
    }

    pub fn set(&mut self, level: u8, node: Arc<TreeNode>, slot: usize) {
        if let Some(entry) = self.levels.get_mut(usize::from(level)) {
            *entry = Some(PathLevel { node, slot });
        }
    }

    pub fn set_slot(&mut self, level: u8, slot: usize) {
        if let Some(Some(pl)) = self.levels.get_mut(usize::from(level)) {
            pl.slot = slot;
        }
    }

    /// The leaf and slot, when the path reaches level 0.
    #[must_use]
    pub fn leaf(&self) -> Option<&PathLevel> {
        self.level(0)
    }

    /// Key of the leaf item the path points at, if the slot is in range.
    #[must_use]
    pub fn item_key(&self) -> Option<BtrfsKey> {
        self.leaf().and_then(|pl| pl.node.key_at(pl.slot))
    }

    /// Payload of the leaf item the path points at.
    #[must_use]
    pub fn item_data(&self) -> Option<&[u8]> {
        self.leaf().and_then(|pl| pl.node.item_data(pl.slot))
    }

    /// Whether the leaf slot is past the last item.
    #[must_use]
    pub fn at_leaf_end(&self) -> bool {
        self.leaf().is_none_or(|pl| pl.slot >= pl.node.nritems())
    }

    /// Highest populated level.
    #[must_use]
    pub fn top_level(&self) -> Option<u8> {
        (0..BTRFS_MAX_LEVEL).rev().find(|&level| self.level(level).is_some())
    }
}
