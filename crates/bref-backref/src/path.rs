//! Inode to path reconstruction through `INODE_REF` / `INODE_EXTREF` items.

use std::collections::HashSet;
use std::ops::ControlFlow;

use bref_error::{BrefError, Result};
use bref_ondisk::{parse_inode_extrefs, parse_inode_refs};
use bref_tree::{FsInfo, TreePath, TreeRoot, parse_error_at};
use bref_types::{BTRFS_INODE_EXTREF_KEY, BTRFS_INODE_REF_KEY};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Outcome of [`path_for_inode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathLookup {
    Complete { path: Vec<u8> },
    /// The path needs `required` bytes, `missing` more than the capacity.
    Truncated { required: usize, missing: usize },
}

/// Every path of an inode that fit in a byte budget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodePaths {
    pub paths: Vec<Vec<u8>>,
    pub bytes_left: usize,
    /// Paths that did not fit.
    pub elem_missed: u64,
    /// Extra bytes needed to return every path.
    pub bytes_missing: usize,
}

impl InodePaths {
    #[must_use]
    pub fn with_capacity(total_bytes: usize) -> Self {
        Self {
            bytes_left: total_bytes,
            ..Self::default()
        }
    }

    fn push(&mut self, path: Vec<u8>) {
        if path.len() <= self.bytes_left {
            self.bytes_left -= path.len();
            self.paths.push(path);
        } else {
            self.elem_missed += 1;
            self.bytes_missing += path.len() - self.bytes_left;
            self.bytes_left = 0;
        }
    }
}

fn item_location(path: &TreePath) -> u64 {
    path.leaf().map_or(0, |pl| pl.node.bytenr)
}

/// Build the `/`-joined path of an entry called `name` inside directory
/// `parent`, walking directory backrefs up to the tree's root directory.
///
/// A directory with no backref ends the walk early; the partial path is
/// returned.
pub fn ref_to_path(fs: &FsInfo, root: TreeRoot, name: &[u8], parent: u64) -> Result<Vec<u8>> {
    let mut components = vec![name.to_vec()];
    let mut dir = parent;
    let mut visited = HashSet::new();
    loop {
        let Some(path) = fs.find_item(root, dir, BTRFS_INODE_REF_KEY, 0)? else {
            warn!(dir, "backref_path_chain_broken");
            break;
        };
        let Some(key) = path.item_key() else { break };
        let next = key.offset;
        if next == dir {
            break;
        }
        if !visited.insert(dir) {
            return Err(BrefError::corrupt(
                item_location(&path),
                format!("directory backrefs loop at inode {dir}"),
            ));
        }
        let data = path
            .item_data()
            .ok_or_else(|| BrefError::corrupt(item_location(&path), "inode ref out of range"))?;
        let refs = parse_inode_refs(data).map_err(|e| parse_error_at(item_location(&path), &e))?;
        let first = refs
            .into_iter()
            .next()
            .ok_or_else(|| BrefError::corrupt(item_location(&path), "empty inode ref item"))?;
        trace!(dir, parent = next, "backref_path_hop");
        components.push(first.name);
        dir = next;
    }
    components.reverse();
    Ok(components.join(&b'/'))
}

/// Visit every `(parent directory, name)` recorded in `INODE_REF` items of
/// `inum`. Fails with `NotFound` when there are none.
pub fn iterate_inode_refs<F>(
    fs: &FsInfo,
    root: TreeRoot,
    inum: u64,
    mut iterate: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(u64, &[u8]) -> Result<ControlFlow<()>>,
{
    let mut found = 0_usize;
    let mut offset = 0;
    while let Some(path) = fs.find_item(root, inum, BTRFS_INODE_REF_KEY, offset)? {
        found += 1;
        let Some(key) = path.item_key() else { break };
        let parent = key.offset;
        let data = path
            .item_data()
            .ok_or_else(|| BrefError::corrupt(item_location(&path), "inode ref out of range"))?;
        for r in parse_inode_refs(data).map_err(|e| parse_error_at(item_location(&path), &e))? {
            if iterate(parent, &r.name)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        let Some(next) = parent.checked_add(1) else { break };
        offset = next;
    }
    if found == 0 {
        return Err(BrefError::NotFound(format!("inode refs of {inum}")));
    }
    Ok(ControlFlow::Continue(()))
}

/// Visit every `(parent directory, name)` recorded in `INODE_EXTREF` items
/// of `inum`. Fails with `NotFound` when there are none.
pub fn iterate_inode_extrefs<F>(
    fs: &FsInfo,
    root: TreeRoot,
    inum: u64,
    mut iterate: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(u64, &[u8]) -> Result<ControlFlow<()>>,
{
    let mut found = 0_usize;
    let mut offset = 0;
    while let Some(path) = fs.find_item(root, inum, BTRFS_INODE_EXTREF_KEY, offset)? {
        found += 1;
        let Some(key) = path.item_key() else { break };
        let data = path
            .item_data()
            .ok_or_else(|| BrefError::corrupt(item_location(&path), "inode extref out of range"))?;
        for r in parse_inode_extrefs(data).map_err(|e| parse_error_at(item_location(&path), &e))? {
            if iterate(r.parent, &r.name)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        let Some(next) = key.offset.checked_add(1) else { break };
        offset = next;
    }
    if found == 0 {
        return Err(BrefError::NotFound(format!("inode extrefs of {inum}")));
    }
    Ok(ControlFlow::Continue(()))
}

/// Visit every name of `inum` from both ref kinds. `NotFound` only when
/// neither kind has an entry.
pub fn iterate_irefs<F>(
    fs: &FsInfo,
    root: TreeRoot,
    inum: u64,
    mut iterate: F,
) -> Result<ControlFlow<()>>
where
    F: FnMut(u64, &[u8]) -> Result<ControlFlow<()>>,
{
    let found_refs = match iterate_inode_refs(fs, root, inum, &mut iterate) {
        Ok(ControlFlow::Break(())) => return Ok(ControlFlow::Break(())),
        Ok(ControlFlow::Continue(())) => true,
        Err(e) if e.is_not_found() => false,
        Err(e) => return Err(e),
    };
    match iterate_inode_extrefs(fs, root, inum, &mut iterate) {
        Err(e) if e.is_not_found() && found_refs => Ok(ControlFlow::Continue(())),
        other => other,
    }
}

/// The first path of `inum` in tree `root_id`, or the size it would need
/// when longer than `capacity` bytes.
pub fn path_for_inode(
    fs: &FsInfo,
    root_id: u64,
    inum: u64,
    capacity: usize,
) -> Result<PathLookup> {
    let root = fs.read_fs_root(root_id)?;
    let mut first = None;
    iterate_irefs(fs, root, inum, |parent, name| {
        first = Some((parent, name.to_vec()));
        Ok(ControlFlow::Break(()))
    })?;
    let (parent, name) =
        first.ok_or_else(|| BrefError::NotFound(format!("names of inode {inum}")))?;
    let path = ref_to_path(fs, root, &name, parent)?;
    if path.len() > capacity {
        debug!(inum, required = path.len(), capacity, "backref_path_truncated");
        return Ok(PathLookup::Truncated {
            required: path.len(),
            missing: path.len() - capacity,
        });
    }
    Ok(PathLookup::Complete { path })
}

/// Every path (hard link) of `inum` in tree `root_id`, within a budget of
/// `total_bytes` path bytes.
pub fn paths_from_inode(
    fs: &FsInfo,
    root_id: u64,
    inum: u64,
    total_bytes: usize,
) -> Result<InodePaths> {
    let root = fs.read_fs_root(root_id)?;
    let mut out = InodePaths::with_capacity(total_bytes);
    iterate_irefs(fs, root, inum, |parent, name| {
        out.push(ref_to_path(fs, root, name, parent)?);
        Ok(ControlFlow::Continue(()))
    })?;
    debug!(
        inum,
        paths = out.paths.len(),
        missed = out.elem_missed,
        "backref_inode_paths"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn budget_accounting() {
        let mut paths = InodePaths::with_capacity(10);
        paths.push(b"a/b".to_vec());
        paths.push(b"long/path/x".to_vec());
        paths.push(b"c".to_vec());
        assert_eq!(paths.paths, vec![b"a/b".to_vec()]);
        assert_eq!(paths.elem_missed, 2);
        assert_eq!(paths.bytes_missing, 4 + 1);
        assert_eq!(paths.bytes_left, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn fitted_and_missed_paths_partition_the_input(
            budget in 0_usize..64,
            lens in proptest::collection::vec(1_usize..24, 0..8),
        ) {
            let mut paths = InodePaths::with_capacity(budget);
            for &len in &lens {
                paths.push(vec![b'x'; len]);
            }
            let fitted: usize = paths.paths.iter().map(Vec::len).sum();
            prop_assert!(fitted <= budget);
            prop_assert_eq!(paths.paths.len() as u64 + paths.elem_missed, lens.len() as u64);
            if paths.elem_missed == 0 {
                prop_assert_eq!(fitted + paths.bytes_left, budget);
            } else {
                prop_assert_eq!(paths.bytes_left, 0);
                prop_assert!(paths.bytes_missing > 0);
            }
        }
    }
}
