#![forbid(unsafe_code)]
//! Backref resolution for btrfs extents.
//!
//! Given an extent address, [`find_parent_nodes`] reads its inline and
//! keyed backrefs, resolves the ones that only name a root and key by
//! searching that root's tree, and reports the blocks referencing the
//! extent. The walkers in [`walk`] repeat this up to the owning roots and
//! down to the file positions; [`path`] turns an inode into its paths.
//!
//! Every walk is read-only and single-threaded over an
//! [`FsInfo`](bref_tree::FsInfo). A block or root that has vanished is a
//! soft miss during transitive walks; any other error aborts the walk.

mod extract;
mod indirect;
pub mod path;
mod prelim;
pub mod resolve;
pub mod ulist;
pub mod walk;

pub use path::{
    InodePaths, PathLookup, iterate_inode_extrefs, iterate_inode_refs, iterate_irefs,
    path_for_inode, paths_from_inode, ref_to_path,
};
pub use prelim::InodeElement;
pub use resolve::{ParentNodes, ParentRef, WalkOptions, find_parent_nodes};
pub use ulist::UList;
pub use walk::{
    ExtentKind, ExtentLocation, InodeHit, TreeBackref, extent_from_logical, find_all_leafs,
    find_all_roots, iterate_extent_inodes, iterate_inodes_from_logical, tree_backref_for_extent,
};
