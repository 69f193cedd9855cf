#![forbid(unsafe_code)]
//! bref public API facade.
//!
//! Opens btrfs images read-only, walks extent backrefs up to their owning
//! roots and down to inode paths, and decodes or produces send streams.
//! Downstream consumers depend on this crate rather than on the individual
//! `bref-*` crates.

pub use bref_backref::{
    ExtentKind, ExtentLocation, InodeElement, InodeHit, InodePaths, ParentNodes, ParentRef,
    PathLookup, TreeBackref, UList, WalkOptions, extent_from_logical, find_all_leafs,
    find_all_roots, find_parent_nodes, iterate_extent_inodes, iterate_inode_extrefs,
    iterate_inode_refs, iterate_inodes_from_logical, iterate_irefs, path_for_inode,
    paths_from_inode, ref_to_path, tree_backref_for_extent,
};
pub use bref_error::{BrefError, Result};
pub use bref_send::{
    CloneRange, Command, CommandBuilder, EnableVerity, EncodedWrite, RawCommand, SendAttr,
    SendCommand, SendOps, SendStream, StreamOptions, StreamSummary, StreamWriter, Timespec,
    process_send_stream, read_commands, replay_send_stream,
};
pub use bref_tree::{
    BlockSource, BtrfsKey, FileBlockSource, FsGeometry, FsInfo, ImageBlockSource,
    MemoryBlockSource, OpenOptions, TreeRoot,
};

/// Lower-level crates, for callers that need node parsing or raw tree
/// iteration.
pub mod raw {
    pub use bref_ondisk as ondisk;
    pub use bref_send::proto;
    pub use bref_tree as tree;
    pub use bref_types as types;
}
