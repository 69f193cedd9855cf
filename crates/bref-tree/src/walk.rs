//! Full depth-first traversal of a tree, used to load the chunk tree.

use std::collections::HashSet;

use bref_error::{BrefError, Result};
use bref_ondisk::BtrfsKey;
use bref_types::NodeSize;
use tracing::trace;

use crate::convert::parse_error_at;
use crate::node::{NodeBody, TreeNode};
use crate::source::BlockSource;

/// A single leaf item yielded by tree traversal: key + raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: BtrfsKey,
    pub data: Vec<u8>,
}

/// Walk a tree from `root` down to all leaves, collecting items in key
/// order (left-to-right DFS).
///
/// Pointer cycles and nodes referenced twice are rejected as corruption.
pub fn walk_tree(
    source: &dyn BlockSource,
    root: u64,
    nodesize: NodeSize,
) -> Result<Vec<LeafEntry>> {
    let mut results = Vec::new();
    let mut active_path = HashSet::new();
    let mut visited_nodes = HashSet::new();
    walk_node(
        source,
        root,
        nodesize,
        &mut results,
        &mut active_path,
        &mut visited_nodes,
    )?;
    Ok(results)
}

fn walk_node(
    source: &dyn BlockSource,
    logical: u64,
    nodesize: NodeSize,
    out: &mut Vec<LeafEntry>,
    active_path: &mut HashSet<u64>,
    visited_nodes: &mut HashSet<u64>,
) -> Result<()> {
    if !active_path.insert(logical) {
        return Err(BrefError::corrupt(
            logical,
            "cycle detected in tree pointers",
        ));
    }
    if !visited_nodes.insert(logical) {
        return Err(BrefError::corrupt(
            logical,
            "duplicate node reference in tree pointers",
        ));
    }

    let raw = source.read_block(logical, nodesize.as_usize())?;
    let node = TreeNode::parse(logical, raw).map_err(|e| parse_error_at(logical, &e))?;
    trace!(bytenr = logical, level = node.level(), nritems = node.nritems(), "walk_node");

    match &node.body {
        NodeBody::Leaf(_) => {
            out.extend(node.items().map(|(key, data)| LeafEntry {
                key,
                data: data.to_vec(),
            }));
        }
        NodeBody::Internal(ptrs) => {
            for kp in ptrs {
                walk_node(source, kp.blockptr, nodesize, out, active_path, visited_nodes)?;
            }
        }
    }

    active_path.remove(&logical);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryBlockSource;
    use bref_ondisk::{BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BTRFS_KEY_PTR_SIZE};

    const NODESIZE: usize = 4096;

    fn nodesize() -> NodeSize {
        NodeSize::new(4096).expect("nodesize")
    }

    fn write_header(block: &mut [u8], bytenr: u64, nritems: u32, level: u8) {
        block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
        block[0x58..0x60].copy_from_slice(&3_u64.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
    }

    /// `data_off` is relative to the end of the header.
    fn write_leaf_item(block: &mut [u8], idx: usize, objectid: u64, data_off: u32, data: &[u8]) {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        block[base..base + 8].copy_from_slice(&objectid.to_le_bytes());
        block[base + 8] = 228;
        block[base + 17..base + 21].copy_from_slice(&data_off.to_le_bytes());
        let len = u32::try_from(data.len()).expect("len");
        block[base + 21..base + 25].copy_from_slice(&len.to_le_bytes());
        let abs = BTRFS_HEADER_SIZE + data_off as usize;
        block[abs..abs + data.len()].copy_from_slice(data);
    }

    fn write_key_ptr(block: &mut [u8], idx: usize, objectid: u64, blockptr: u64) {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        block[base..base + 8].copy_from_slice(&objectid.to_le_bytes());
        block[base + 8] = 228;
        block[base + 17..base + 25].copy_from_slice(&blockptr.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&10_u64.to_le_bytes());
    }

    #[test]
    fn walk_internal_plus_leaves() {
        let (root_at, left_at, right_at) = (0x1_0000_u64, 0x2_0000_u64, 0x3_0000_u64);

        let mut root = vec![0_u8; NODESIZE];
        write_header(&mut root, root_at, 2, 1);
        write_key_ptr(&mut root, 0, 256, left_at);
        write_key_ptr(&mut root, 1, 512, right_at);

        let mut left = vec![0_u8; NODESIZE];
        write_header(&mut left, left_at, 1, 0);
        write_leaf_item(&mut left, 0, 256, 2000, &[1, 2, 3, 4]);

        let mut right = vec![0_u8; NODESIZE];
        write_header(&mut right, right_at, 1, 0);
        write_leaf_item(&mut right, 0, 512, 2000, &[5, 6, 7, 8]);

        let mut source = MemoryBlockSource::new();
        source.insert(root_at, root);
        source.insert(left_at, left);
        source.insert(right_at, right);

        let entries = walk_tree(&source, root_at, nodesize()).expect("walk");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key.objectid, 256);
        assert_eq!(entries[0].data, vec![1, 2, 3, 4]);
        assert_eq!(entries[1].key.objectid, 512);
        assert_eq!(entries[1].data, vec![5, 6, 7, 8]);
    }

    #[test]
    fn walk_empty_leaf() {
        let mut leaf = vec![0_u8; NODESIZE];
        write_header(&mut leaf, 0x4000, 0, 0);
        let mut source = MemoryBlockSource::new();
        source.insert(0x4000, leaf);

        let entries = walk_tree(&source, 0x4000, nodesize()).expect("walk");
        assert!(entries.is_empty());
    }

    #[test]
    fn walk_two_node_cycle_fails_fast() {
        let (a_at, b_at) = (0x1_0000_u64, 0x2_0000_u64);
        let mut a = vec![0_u8; NODESIZE];
        write_header(&mut a, a_at, 1, 2);
        write_key_ptr(&mut a, 0, 256, b_at);
        let mut b = vec![0_u8; NODESIZE];
        write_header(&mut b, b_at, 1, 1);
        write_key_ptr(&mut b, 0, 256, a_at);

        let mut source = MemoryBlockSource::new();
        source.insert(a_at, a);
        source.insert(b_at, b);

        let err = walk_tree(&source, a_at, nodesize()).expect_err("cycle");
        assert!(
            matches!(&err, BrefError::Corruption { block, detail } if *block == a_at && detail.contains("cycle")),
            "expected cycle corruption, got: {err:?}"
        );
    }

    #[test]
    fn walk_duplicate_child_reference_fails_fast() {
        let (root_at, leaf_at) = (0x1_0000_u64, 0x2_0000_u64);
        let mut root = vec![0_u8; NODESIZE];
        write_header(&mut root, root_at, 2, 1);
        write_key_ptr(&mut root, 0, 256, leaf_at);
        write_key_ptr(&mut root, 1, 512, leaf_at);
        let mut leaf = vec![0_u8; NODESIZE];
        write_header(&mut leaf, leaf_at, 0, 0);

        let mut source = MemoryBlockSource::new();
        source.insert(root_at, root);
        source.insert(leaf_at, leaf);

        let err = walk_tree(&source, root_at, nodesize()).expect_err("duplicate");
        assert!(
            matches!(&err, BrefError::Corruption { detail, .. } if detail.contains("duplicate")),
            "expected duplicate corruption, got: {err:?}"
        );
    }
}
