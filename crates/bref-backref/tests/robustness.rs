//! Damaged, dangling and cyclic backref graphs.

mod common;

use bref_backref::{WalkOptions, find_all_leafs, find_all_roots, find_parent_nodes};
use bref_error::BrefError;
use bref_harness::{FileExtent, FsBuilder, data_extent_item, keyed_ref};
use bref_ondisk::ExtentRef;
use bref_types::{BTRFS_DATA_RELOC_TREE_OBJECTID, BTRFS_EXTENT_ITEM_KEY};
use common::{
    DATA, DATA_LEN, FS_TREE, ROOT_DIR, data_extent, data_ref, file_extent, finish, inode, key,
    leaf_root, root_dir, single_file, tree_block,
};

/// Tree 5 with a single leaf holding inode 257's extent of `DATA`.
fn fs_leaf(b: &mut FsBuilder) -> u64 {
    let mut items = root_dir();
    items.extend(inode(257, ROOT_DIR, b"f"));
    items.push(file_extent(257, 0, FileExtent::regular(DATA, DATA_LEN, 0, DATA_LEN)));
    b.leaf(FS_TREE, &items)
}

#[test]
fn unknown_inline_ref_type_is_corruption() {
    let mut b = FsBuilder::new();
    let leaf = fs_leaf(&mut b);
    let mut payload = data_extent_item(1, &[]);
    payload.push(0x55);
    payload.extend_from_slice(&[0_u8; 8]);
    let extents = vec![
        (key(DATA, BTRFS_EXTENT_ITEM_KEY, DATA_LEN), payload),
        tree_block(leaf, 0, 1, &[ExtentRef::TreeBlock { root: FS_TREE }]),
    ];
    let fs = finish(b, &extents, &[(FS_TREE, leaf_root(leaf))]);

    let err = find_parent_nodes(&fs, DATA, &WalkOptions::default(), None).expect_err("corrupt");
    assert!(
        matches!(err, BrefError::Corruption { .. }),
        "expected Corruption, got: {err:?}"
    );
    let err = find_all_roots(&fs, DATA, &WalkOptions::default()).expect_err("corrupt");
    assert!(
        matches!(err, BrefError::Corruption { .. }),
        "expected Corruption, got: {err:?}"
    );
}

#[test]
fn absent_extent_is_not_found_for_direct_lookup_only() {
    let f = single_file(true);
    let missing = DATA + 0x10_0000;
    let err = find_parent_nodes(&f.fs, missing, &WalkOptions::default(), None)
        .expect_err("no extent item");
    assert!(err.is_not_found(), "expected NotFound, got: {err:?}");

    let leafs = find_all_leafs(&f.fs, missing, &WalkOptions::default(), None).expect("leafs");
    assert!(leafs.is_empty());
    let roots = find_all_roots(&f.fs, missing, &WalkOptions::default()).expect("roots");
    assert!(roots.is_empty());
}

#[test]
fn ref_to_deleted_root_is_skipped() {
    let mut b = FsBuilder::new();
    let leaf = fs_leaf(&mut b);
    let extents = vec![
        data_extent(
            DATA,
            DATA_LEN,
            2,
            &[data_ref(FS_TREE, 257, 0, 1), data_ref(999, 257, 0, 1)],
        ),
        tree_block(leaf, 0, 1, &[ExtentRef::TreeBlock { root: FS_TREE }]),
    ];
    let fs = finish(b, &extents, &[(FS_TREE, leaf_root(leaf))]);

    let roots = find_all_roots(&fs, DATA, &WalkOptions::default()).expect("roots");
    assert_eq!(roots.keys().collect::<Vec<_>>(), vec![FS_TREE]);
}

#[test]
fn relocation_refs_are_ignored() {
    let mut b = FsBuilder::new();
    let leaf = fs_leaf(&mut b);
    let extents = vec![
        data_extent(
            DATA,
            DATA_LEN,
            1,
            &[data_ref(BTRFS_DATA_RELOC_TREE_OBJECTID, 257, 0, 1)],
        ),
        tree_block(leaf, 0, 1, &[ExtentRef::TreeBlock { root: FS_TREE }]),
    ];
    let fs = finish(b, &extents, &[(FS_TREE, leaf_root(leaf))]);

    let found = find_parent_nodes(&fs, DATA, &WalkOptions::default(), None).expect("parents");
    assert!(found.parents.is_empty());
    assert!(found.roots.is_empty());
}

#[test]
fn vanished_parent_block_is_a_soft_miss() {
    let mut b = FsBuilder::new();
    let leaf = fs_leaf(&mut b);
    let gone = b.alloc();
    let extents = vec![
        data_extent(DATA, DATA_LEN, 2, &[data_ref(FS_TREE, 257, 0, 1)]),
        keyed_ref(
            DATA,
            &ExtentRef::SharedData {
                parent: gone,
                count: 1,
            },
        ),
        tree_block(leaf, 0, 1, &[ExtentRef::TreeBlock { root: FS_TREE }]),
    ];
    let fs = finish(b, &extents, &[(FS_TREE, leaf_root(leaf))]);

    let leafs = find_all_leafs(&fs, DATA, &WalkOptions::default(), None).expect("leafs");
    assert!(leafs.contains(gone));
    assert!(leafs.contains(leaf));
    let roots = find_all_roots(&fs, DATA, &WalkOptions::default()).expect("roots");
    assert_eq!(roots.keys().collect::<Vec<_>>(), vec![FS_TREE]);
}

#[test]
fn shared_block_cycle_terminates() {
    let mut b = FsBuilder::new();
    let x = b.alloc();
    let y = b.alloc();
    let extents = vec![
        tree_block(x, 0, 1, &[ExtentRef::SharedBlock { parent: y }]),
        tree_block(y, 1, 1, &[ExtentRef::SharedBlock { parent: x }]),
    ];
    let fs = finish(b, &extents, &[]);

    let found = find_parent_nodes(&fs, x, &WalkOptions::default(), None).expect("parents");
    assert_eq!(found.parents.keys().collect::<Vec<_>>(), vec![y]);
    let roots = find_all_roots(&fs, x, &WalkOptions::default()).expect("roots");
    assert!(roots.is_empty());
}

#[test]
fn duplicate_shared_refs_merge_into_one_parent() {
    let mut b = FsBuilder::new();
    let leaf = fs_leaf(&mut b);
    let shared = ExtentRef::SharedData {
        parent: leaf,
        count: 1,
    };
    let extents = vec![
        data_extent(DATA, DATA_LEN, 2, &[shared]),
        keyed_ref(DATA, &shared),
        tree_block(leaf, 0, 1, &[ExtentRef::TreeBlock { root: FS_TREE }]),
    ];
    let fs = finish(b, &extents, &[(FS_TREE, leaf_root(leaf))]);

    let found = find_parent_nodes(&fs, DATA, &WalkOptions::default(), Some(0)).expect("parents");
    assert_eq!(found.parents.len(), 1);
    let parent = found.parents.get(leaf).expect("leaf parent");
    assert_eq!(parent.count, 2);
    assert_eq!(parent.inodes.len(), 1);
    assert_eq!(parent.inodes[0].inum, 257);
}
