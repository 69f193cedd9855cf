//! Shared fixture layouts for the backref integration tests.
#![allow(dead_code)]

use bref_harness::{
    FileExtent, FsBuilder, data_extent_item, inode_item, inode_ref, metadata_item,
    tree_block_extent_item,
};
use bref_ondisk::{BtrfsKey, ExtentDataRef, ExtentRef, TreeBlockInfo};
use bref_tree::{FsInfo, TreeRoot};
use bref_types::{
    BTRFS_EXTENT_DATA_KEY, BTRFS_EXTENT_ITEM_KEY, BTRFS_EXTENT_TREE_OBJECTID,
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_INODE_ITEM_KEY, BTRFS_INODE_REF_KEY, BTRFS_METADATA_ITEM_KEY,
};

pub type Item = (BtrfsKey, Vec<u8>);

pub const FS_TREE: u64 = 5;
pub const SNAPSHOT: u64 = 256;
pub const ROOT_DIR: u64 = BTRFS_FIRST_FREE_OBJECTID;
/// Data extents live well above every metadata block the builder hands out.
pub const DATA: u64 = 0x4000_0000;
pub const DATA_LEN: u64 = 16384;

pub fn key(objectid: u64, item_type: u8, offset: u64) -> BtrfsKey {
    BtrfsKey::new(objectid, item_type, offset)
}

/// Inode item and `..` backref of a tree's root directory.
pub fn root_dir() -> Vec<Item> {
    vec![
        (key(ROOT_DIR, BTRFS_INODE_ITEM_KEY, 0), inode_item()),
        (key(ROOT_DIR, BTRFS_INODE_REF_KEY, ROOT_DIR), inode_ref(&[(0, b"..")])),
    ]
}

/// An inode named `name` in directory `parent`.
pub fn inode(ino: u64, parent: u64, name: &[u8]) -> Vec<Item> {
    vec![
        (key(ino, BTRFS_INODE_ITEM_KEY, 0), inode_item()),
        (key(ino, BTRFS_INODE_REF_KEY, parent), inode_ref(&[(2, name)])),
    ]
}

/// A file extent item of `ino` at file offset `file_offset`.
pub fn file_extent(ino: u64, file_offset: u64, fe: FileExtent) -> Item {
    (key(ino, BTRFS_EXTENT_DATA_KEY, file_offset), fe.encode())
}

pub fn data_ref(root: u64, objectid: u64, offset: u64, count: u32) -> ExtentRef {
    ExtentRef::ExtentData(ExtentDataRef {
        root,
        objectid,
        offset,
        count,
    })
}

/// Data extent item with inline refs.
pub fn data_extent(bytenr: u64, len: u64, refs: u64, inline: &[ExtentRef]) -> Item {
    (key(bytenr, BTRFS_EXTENT_ITEM_KEY, len), data_extent_item(refs, inline))
}

/// Skinny metadata item for a tree block.
pub fn tree_block(bytenr: u64, level: u8, refs: u64, inline: &[ExtentRef]) -> Item {
    (
        key(bytenr, BTRFS_METADATA_ITEM_KEY, u64::from(level)),
        metadata_item(refs, inline),
    )
}

/// Non-skinny extent item for a tree block whose first key is `first_key`.
pub fn fat_tree_block(
    bytenr: u64,
    level: u8,
    first_key: BtrfsKey,
    refs: u64,
    inline: &[ExtentRef],
) -> Item {
    let info = TreeBlockInfo {
        key: first_key,
        level,
    };
    (
        key(bytenr, BTRFS_EXTENT_ITEM_KEY, u64::from(bref_harness::NODESIZE)),
        tree_block_extent_item(refs, info, inline),
    )
}

/// Write the extent tree, register it and the given roots, and open.
pub fn finish(mut b: FsBuilder, extent_items: &[Item], roots: &[(u64, TreeRoot)]) -> FsInfo {
    let extent_root = b.tree(BTRFS_EXTENT_TREE_OBJECTID, extent_items, 64);
    b.set_root(BTRFS_EXTENT_TREE_OBJECTID, extent_root);
    for &(id, root) in roots {
        b.set_root(id, root);
    }
    b.build().expect("build fixture")
}

pub fn leaf_root(bytenr: u64) -> TreeRoot {
    TreeRoot { bytenr, level: 0 }
}

/// `file.txt` (inode 257) in a single-leaf tree 5, backed by one data
/// extent referenced inline by tree 5.
pub struct SingleFile {
    pub fs: FsInfo,
    pub leaf: u64,
}

pub fn single_file(skinny: bool) -> SingleFile {
    let mut b = FsBuilder::new().with_skinny_metadata(skinny);
    let mut items = root_dir();
    items.extend(inode(257, ROOT_DIR, b"file.txt"));
    items.push(file_extent(
        257,
        0,
        FileExtent::regular(DATA, DATA_LEN, 0, DATA_LEN),
    ));
    let leaf = b.leaf(FS_TREE, &items);

    let first_key = key(ROOT_DIR, BTRFS_INODE_ITEM_KEY, 0);
    let leaf_item = if skinny {
        tree_block(leaf, 0, 1, &[ExtentRef::TreeBlock { root: FS_TREE }])
    } else {
        fat_tree_block(leaf, 0, first_key, 1, &[ExtentRef::TreeBlock { root: FS_TREE }])
    };
    let extents = vec![
        data_extent(DATA, DATA_LEN, 1, &[data_ref(FS_TREE, 257, 0, 1)]),
        leaf_item,
    ];
    let fs = finish(b, &extents, &[(FS_TREE, leaf_root(leaf))]);
    SingleFile { fs, leaf }
}

/// Tree 5 and snapshot 256 share leaf `leaf` under their own level-1 root
/// nodes. The data extent carries a single ref from tree 5.
pub struct Snapshots {
    pub fs: FsInfo,
    pub leaf: u64,
    pub fs_node: u64,
    pub snap_node: u64,
}

pub fn snapshots(keyed: bool) -> Snapshots {
    let mut b = FsBuilder::new();
    let mut items = root_dir();
    items.extend(inode(257, ROOT_DIR, b"shared.bin"));
    items.push(file_extent(
        257,
        0,
        FileExtent::regular(DATA, DATA_LEN, 0, DATA_LEN),
    ));
    let leaf = b.leaf(FS_TREE, &items);
    let first_key = key(ROOT_DIR, BTRFS_INODE_ITEM_KEY, 0);
    let fs_node = b.node(FS_TREE, 1, &[(first_key, leaf)]);
    let snap_node = b.node(SNAPSHOT, 1, &[(first_key, leaf)]);

    let owners = [
        ExtentRef::TreeBlock { root: FS_TREE },
        ExtentRef::TreeBlock { root: SNAPSHOT },
    ];
    let mut extents = vec![
        data_extent(DATA, DATA_LEN, 1, &[]),
        tree_block(fs_node, 1, 1, &[ExtentRef::TreeBlock { root: FS_TREE }]),
        tree_block(snap_node, 1, 1, &[ExtentRef::TreeBlock { root: SNAPSHOT }]),
    ];
    extents.push(bref_harness::keyed_ref(DATA, &data_ref(FS_TREE, 257, 0, 1)));
    if keyed {
        extents.push(tree_block(leaf, 0, 2, &[]));
        for owner in &owners {
            extents.push(bref_harness::keyed_ref(leaf, owner));
        }
    } else {
        extents.push(tree_block(leaf, 0, 2, &owners));
    }

    let fs = finish(
        b,
        &extents,
        &[
            (FS_TREE, TreeRoot { bytenr: fs_node, level: 1 }),
            (SNAPSHOT, TreeRoot { bytenr: snap_node, level: 1 }),
        ],
    );
    Snapshots {
        fs,
        leaf,
        fs_node,
        snap_node,
    }
}
