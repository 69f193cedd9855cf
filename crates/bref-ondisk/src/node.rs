//! Tree node layout: header, leaf item table and internal key pointers.

use bref_types::{BTRFS_MAX_LEVEL, ParseError, read_fixed, read_le_u32, read_le_u64, read_u8};
use serde::{Deserialize, Serialize};

pub const BTRFS_HEADER_SIZE: usize = 101;
pub const BTRFS_ITEM_SIZE: usize = 25;
/// Key, child bytenr, child generation.
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
pub const BTRFS_DISK_KEY_SIZE: usize = 17;

/// A btrfs item key. Derived ordering is the on-disk tree order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl BtrfsKey {
    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Append the 17-byte disk encoding to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.objectid.to_le_bytes());
        out.push(self.item_type);
        out.extend_from_slice(&self.offset.to_le_bytes());
    }
}

/// Decode a 17-byte `btrfs_disk_key` at `offset`.
pub fn parse_disk_key(data: &[u8], offset: usize) -> Result<BtrfsKey, ParseError> {
    Ok(BtrfsKey {
        objectid: read_le_u64(data, offset)?,
        item_type: read_u8(data, offset + 8)?,
        offset: read_le_u64(data, offset + 9)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl BtrfsHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTRFS_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(block, 0x40)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    /// Check the header against the address it was read from and the
    /// number of items a `block_size` block can hold.
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if let Some(expected) = expected_bytenr {
            if self.bytenr != expected {
                return Err(ParseError::InvalidField {
                    field: "bytenr",
                    reason: "header bytenr does not match expected",
                });
            }
        }

        if self.level >= BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let payload_space = block_size.saturating_sub(BTRFS_HEADER_SIZE);
        let item_size = if self.level == 0 {
            BTRFS_ITEM_SIZE
        } else {
            BTRFS_KEY_PTR_SIZE
        };
        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

        if nritems > payload_space / item_size {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }
}

/// Item table entry. Payload offsets count from the end of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsItem {
    pub key: BtrfsKey,
    pub data_offset: u32,
    pub data_size: u32,
}

impl BtrfsItem {
    /// Payload bytes within the whole block.
    #[must_use]
    pub fn data_range(&self) -> std::ops::Range<usize> {
        let start = BTRFS_HEADER_SIZE + self.data_offset as usize;
        start..start + self.data_size as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsKey,
    pub blockptr: u64,
    pub generation: u64,
}

fn table_end(nritems: usize, entry_size: usize, field: &'static str) -> Result<usize, ParseError> {
    nritems
        .checked_mul(entry_size)
        .and_then(|bytes| BTRFS_HEADER_SIZE.checked_add(bytes))
        .ok_or(ParseError::InvalidField {
            field,
            reason: "overflow",
        })
}

/// Item table of a level 0 node, with every payload range checked.
pub fn parse_leaf_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsItem>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
    let items_end = table_end(nritems, BTRFS_ITEM_SIZE, "items")?;
    if block.len() < items_end {
        return Err(ParseError::InsufficientData {
            needed: items_end,
            offset: BTRFS_HEADER_SIZE,
            actual: block.len().saturating_sub(BTRFS_HEADER_SIZE),
        });
    }

    let payload_len = block.len() - BTRFS_HEADER_SIZE;
    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        let key = parse_disk_key(block, base)?;
        let data_offset = read_le_u32(block, base + 17)?;
        let data_size = read_le_u32(block, base + 21)?;

        let data_end = usize::try_from(data_offset)
            .ok()
            .and_then(|off| off.checked_add(usize::try_from(data_size).ok()?))
            .ok_or(ParseError::InvalidField {
                field: "item_offset",
                reason: "overflow",
            })?;

        if data_end > payload_len {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "item points outside block",
            });
        }

        items.push(BtrfsItem {
            key,
            data_offset,
            data_size,
        });
    }

    Ok((header, items))
}

/// Child pointers of a level > 0 node.
pub fn parse_internal_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsKeyPtr>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }

    header.validate(block.len(), None)?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
    let end = table_end(nritems, BTRFS_KEY_PTR_SIZE, "key_ptrs")?;
    if block.len() < end {
        return Err(ParseError::InsufficientData {
            needed: end,
            offset: BTRFS_HEADER_SIZE,
            actual: block.len().saturating_sub(BTRFS_HEADER_SIZE),
        });
    }

    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        let key = parse_disk_key(block, base)?;
        let blockptr = read_le_u64(block, base + 17)?;
        let generation = read_le_u64(block, base + 25)?;

        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }

        ptrs.push(BtrfsKeyPtr {
            key,
            blockptr,
            generation,
        });
    }

    Ok((header, ptrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(size: usize, nritems: u32, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; size];
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
        block
    }

    #[test]
    fn key_order_is_objectid_type_offset() {
        let a = BtrfsKey::new(256, 108, 9000);
        let b = BtrfsKey::new(256, 168, 0);
        let c = BtrfsKey::new(257, 1, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(BtrfsKey::new(256, 108, 0) < a);
    }

    #[test]
    fn key_encoding_matches_parser() {
        let key = BtrfsKey::new(0x1234, 178, u64::MAX - 1);
        let mut out = Vec::new();
        key.write_to(&mut out);
        assert_eq!(out.len(), BTRFS_DISK_KEY_SIZE);
        assert_eq!(parse_disk_key(&out, 0).expect("key"), key);
    }

    #[test]
    fn parse_leaf_items_uses_header_relative_offsets() {
        let mut block = make_block(512, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base..base + 8].copy_from_slice(&123_u64.to_le_bytes());
        block[base + 8] = 42;
        block[base + 9..base + 17].copy_from_slice(&999_u64.to_le_bytes());
        block[base + 17..base + 21].copy_from_slice(&400_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&8_u32.to_le_bytes());
        block[BTRFS_HEADER_SIZE + 400..BTRFS_HEADER_SIZE + 408]
            .copy_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());

        let (_, items) = parse_leaf_items(&block).expect("leaf parse");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, BtrfsKey::new(123, 42, 999));
        let payload = &block[items[0].data_range()];
        assert_eq!(read_le_u64(payload, 0).expect("payload"), 0xDEAD_BEEF);
    }

    #[test]
    fn parse_leaf_items_rejects_out_of_bounds_data() {
        let mut block = make_block(512, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base..base + 8].copy_from_slice(&1_u64.to_le_bytes());
        block[base + 8] = 1;
        // 405 + 10 runs past the 411 payload bytes of a 512-byte block
        block[base + 17..base + 21].copy_from_slice(&405_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&10_u32.to_le_bytes());

        let err = parse_leaf_items(&block).expect_err("out of bounds");
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "item_offset",
                    ..
                }
            ),
            "expected item_offset error, got: {err:?}"
        );
    }

    #[test]
    fn parse_internal_items_smoke() {
        let mut block = make_block(4096, 2, 1);

        let b0 = BTRFS_HEADER_SIZE;
        block[b0..b0 + 8].copy_from_slice(&256_u64.to_le_bytes());
        block[b0 + 8] = 132;
        block[b0 + 17..b0 + 25].copy_from_slice(&0x4000_u64.to_le_bytes());
        block[b0 + 25..b0 + 33].copy_from_slice(&10_u64.to_le_bytes());

        let b1 = BTRFS_HEADER_SIZE + BTRFS_KEY_PTR_SIZE;
        block[b1..b1 + 8].copy_from_slice(&512_u64.to_le_bytes());
        block[b1 + 8] = 132;
        block[b1 + 9..b1 + 17].copy_from_slice(&100_u64.to_le_bytes());
        block[b1 + 17..b1 + 25].copy_from_slice(&0x8000_u64.to_le_bytes());
        block[b1 + 25..b1 + 33].copy_from_slice(&10_u64.to_le_bytes());

        let (header, ptrs) = parse_internal_items(&block).expect("internal parse");
        assert_eq!(header.level, 1);
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0].blockptr, 0x4000);
        assert_eq!(ptrs[0].generation, 10);
        assert_eq!(ptrs[1].key, BtrfsKey::new(512, 132, 100));
        assert_eq!(ptrs[1].blockptr, 0x8000);
    }

    #[test]
    fn parse_internal_items_rejects_leaf() {
        let block = make_block(4096, 0, 0);
        let err = parse_internal_items(&block).expect_err("leaf");
        assert!(
            matches!(err, ParseError::InvalidField { field: "level", .. }),
            "expected level error, got: {err:?}"
        );
    }

    #[test]
    fn parse_internal_items_rejects_zero_blockptr() {
        let mut block = make_block(4096, 1, 1);
        let b0 = BTRFS_HEADER_SIZE;
        block[b0..b0 + 8].copy_from_slice(&256_u64.to_le_bytes());
        block[b0 + 8] = 132;

        let err = parse_internal_items(&block).expect_err("zero blockptr");
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "blockptr",
                    ..
                }
            ),
            "expected blockptr error, got: {err:?}"
        );
    }

    #[test]
    fn header_validate_bytenr() {
        let mut block = make_block(4096, 0, 0);
        block[0x30..0x38].copy_from_slice(&0x1_0000_u64.to_le_bytes());
        let header = BtrfsHeader::parse_from_block(&block).expect("parse");
        header.validate(4096, Some(0x1_0000)).expect("should match");
        let err = header.validate(4096, Some(0x2000)).expect_err("mismatch");
        assert!(
            matches!(err, ParseError::InvalidField { field: "bytenr", .. }),
            "expected bytenr error, got: {err:?}"
        );
    }

    #[test]
    fn header_validate_nritems_overflow() {
        // (4096-101)/25 = 159 leaf items, (4096-101)/33 = 121 key pointers
        for (nritems, level) in [(200_u32, 0_u8), (130, 1)] {
            let block = make_block(4096, nritems, level);
            let header = BtrfsHeader::parse_from_block(&block).expect("parse");
            let err = header.validate(4096, None).expect_err("too many items");
            assert!(
                matches!(err, ParseError::InvalidField { field: "nritems", .. }),
                "expected nritems error, got: {err:?}"
            );
        }
    }

    #[test]
    fn header_validate_level_too_high() {
        let block = make_block(4096, 0, BTRFS_MAX_LEVEL);
        let header = BtrfsHeader::parse_from_block(&block).expect("parse");
        let err = header.validate(4096, None).expect_err("level");
        assert!(
            matches!(err, ParseError::InvalidField { field: "level", .. }),
            "expected level error, got: {err:?}"
        );
    }

    #[test]
    fn header_serializes_to_json() {
        let block = make_block(4096, 3, 0);
        let header = BtrfsHeader::parse_from_block(&block).expect("parse");
        let json = serde_json::to_value(&header).expect("json");
        assert_eq!(json["nritems"], 3);
        assert_eq!(json["level"], 0);
    }
}
