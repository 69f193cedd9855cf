//! A parsed tree block.

use bref_ondisk::{
    BtrfsHeader, BtrfsItem, BtrfsKey, BtrfsKeyPtr, parse_internal_items, parse_leaf_items,
};
use bref_types::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    Leaf(Vec<BtrfsItem>),
    Internal(Vec<BtrfsKeyPtr>),
}

/// A tree block with its header and item table decoded. The raw bytes are
/// kept so leaf payloads can be borrowed without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub bytenr: u64,
    pub header: BtrfsHeader,
    pub body: NodeBody,
    raw: Vec<u8>,
}

impl TreeNode {
    /// Parse `raw` as the block stored at `bytenr`. The header is validated
    /// against the block size and address.
    pub fn parse(bytenr: u64, raw: Vec<u8>) -> Result<Self, ParseError> {
        let header = BtrfsHeader::parse_from_block(&raw)?;
        header.validate(raw.len(), Some(bytenr))?;
        let body = if header.level == 0 {
            NodeBody::Leaf(parse_leaf_items(&raw)?.1)
        } else {
            NodeBody::Internal(parse_internal_items(&raw)?.1)
        };
        Ok(Self {
            bytenr,
            header,
            body,
            raw,
        })
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.header.level
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    #[must_use]
    pub fn nritems(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(items) => items.len(),
            NodeBody::Internal(ptrs) => ptrs.len(),
        }
    }

    #[must_use]
    pub fn key_at(&self, slot: usize) -> Option<BtrfsKey> {
        match &self.body {
            NodeBody::Leaf(items) => items.get(slot).map(|item| item.key),
            NodeBody::Internal(ptrs) => ptrs.get(slot).map(|ptr| ptr.key),
        }
    }

    #[must_use]
    pub fn first_key(&self) -> Option<BtrfsKey> {
        self.key_at(0)
    }

    #[must_use]
    pub fn item(&self, slot: usize) -> Option<&BtrfsItem> {
        match &self.body {
            NodeBody::Leaf(items) => items.get(slot),
            NodeBody::Internal(_) => None,
        }
    }

    /// Payload of the leaf item at `slot`.
    #[must_use]
    pub fn item_data(&self, slot: usize) -> Option<&[u8]> {
        self.item(slot).and_then(|item| self.raw.get(item.data_range()))
    }

    /// Leaf items paired with their payloads.
    pub fn items(&self) -> impl Iterator<Item = (BtrfsKey, &[u8])> + '_ {
        (0..self.nritems()).filter_map(|slot| Some((self.key_at(slot)?, self.item_data(slot)?)))
    }

    #[must_use]
    pub fn blockptr_at(&self, slot: usize) -> Option<u64> {
        match &self.body {
            NodeBody::Internal(ptrs) => ptrs.get(slot).map(|ptr| ptr.blockptr),
            NodeBody::Leaf(_) => None,
        }
    }

    /// Binary search for `key`: `Ok(slot)` on an exact match, otherwise
    /// `Err(slot)` with the insertion point.
    pub fn bin_search(&self, key: &BtrfsKey) -> Result<usize, usize> {
        match &self.body {
            NodeBody::Leaf(items) => items.binary_search_by(|item| item.key.cmp(key)),
            NodeBody::Internal(ptrs) => ptrs.binary_search_by(|ptr| ptr.key.cmp(key)),
        }
    }
}
