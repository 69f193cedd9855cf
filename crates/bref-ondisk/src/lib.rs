#![forbid(unsafe_code)]
//! On-disk format parsing for the btrfs structures bref walks.
//!
//! Pure parsing crate: no I/O, no side effects. Parses byte slices into
//! typed structures for superblocks and chunk items, tree node headers,
//! leaf item tables and key pointers, extent items with their inline and
//! keyed backrefs, file extent items, root items and inode back-references.

pub mod chunk;
pub mod extent;
pub mod file_extent;
pub mod inode_ref;
pub mod node;
pub mod root;
pub mod superblock;

pub use chunk::{
    BtrfsChunkEntry, BtrfsPhysicalMapping, BtrfsStripe, map_logical_to_physical,
    parse_chunk_item, parse_sys_chunk_array,
};
pub use extent::{
    ExtentDataRef, ExtentItem, ExtentRef, TreeBlockInfo, inline_ref_size, parse_extent_item,
    parse_keyed_ref,
};
pub use file_extent::{
    FILE_EXTENT_ITEM_SIZE, FileExtentItem, FileExtentType, parse_file_extent_item,
};
pub use inode_ref::{InodeExtref, InodeRef, parse_inode_extrefs, parse_inode_refs};
pub use node::{
    BTRFS_DISK_KEY_SIZE, BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BTRFS_KEY_PTR_SIZE, BtrfsHeader,
    BtrfsItem, BtrfsKey, BtrfsKeyPtr, parse_disk_key, parse_internal_items, parse_leaf_items,
};
pub use root::{RootItem, parse_root_item};
pub use superblock::BtrfsSuperblock;
