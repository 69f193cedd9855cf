//! Directory-entry back-references stored under an inode.
//!
//! `INODE_REF` items are keyed `(inum, INODE_REF, parent_dir)` and may pack
//! several `(index, name_len, name)` entries for the same parent.
//! `INODE_EXTREF` items are keyed by a name hash and carry the parent in
//! each entry.

use bref_types::{ParseError, read_le_u16, read_le_u64};
use serde::{Deserialize, Serialize};

const INODE_REF_HEADER: usize = 10;
const INODE_EXTREF_HEADER: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRef {
    pub index: u64,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeExtref {
    pub parent: u64,
    pub index: u64,
    pub name: Vec<u8>,
}

fn take_name(data: &[u8], start: usize, len: u16) -> Result<Vec<u8>, ParseError> {
    let len = usize::from(len);
    if start + len > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset: start,
            actual: data.len().saturating_sub(start),
        });
    }
    Ok(data[start..start + len].to_vec())
}

pub fn parse_inode_refs(data: &[u8]) -> Result<Vec<InodeRef>, ParseError> {
    let mut refs = Vec::new();
    let mut cur = 0;
    while cur < data.len() {
        let index = read_le_u64(data, cur)?;
        let name_len = read_le_u16(data, cur + 8)?;
        let name = take_name(data, cur + INODE_REF_HEADER, name_len)?;
        cur += INODE_REF_HEADER + name.len();
        refs.push(InodeRef { index, name });
    }
    Ok(refs)
}

pub fn parse_inode_extrefs(data: &[u8]) -> Result<Vec<InodeExtref>, ParseError> {
    let mut refs = Vec::new();
    let mut cur = 0;
    while cur < data.len() {
        let parent = read_le_u64(data, cur)?;
        let index = read_le_u64(data, cur + 8)?;
        let name_len = read_le_u16(data, cur + 16)?;
        let name = take_name(data, cur + INODE_EXTREF_HEADER, name_len)?;
        cur += INODE_EXTREF_HEADER + name.len();
        refs.push(InodeExtref {
            parent,
            index,
            name,
        });
    }
    Ok(refs)
}
