#![forbid(unsafe_code)]
//! Read-only access to btrfs trees.
//!
//! Builds on `bref_ondisk` parsing primitives. Blocks come from a
//! [`BlockSource`]; [`FsInfo`] holds the filesystem geometry and offers the
//! ordered-iteration primitives the backref walker consumes: `search_slot`,
//! `next_item`, `next_leaf`, `prev_item`, `find_item` and root lookup.

mod convert;
pub mod fs;
pub mod node;
pub mod path;
pub mod source;
pub mod walk;

pub use bref_ondisk::BtrfsKey;
pub use convert::parse_error_at;
pub use fs::{FsGeometry, FsInfo, OpenOptions, TreeRoot};
pub use node::{NodeBody, TreeNode};
pub use path::{PathLevel, TreePath};
pub use source::{BlockSource, FileBlockSource, ImageBlockSource, MemoryBlockSource};
pub use walk::{LeafEntry, walk_tree};
