//! Chunk items: the sys_chunk_array bootstrap and chunk tree entries.

use bref_types::{ParseError, read_fixed, read_le_u16, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};

use crate::node::{BTRFS_DISK_KEY_SIZE, BtrfsKey, parse_disk_key};

const BTRFS_CHUNK_FIXED_SIZE: usize = 48;
const BTRFS_STRIPE_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// Logical range `key.offset..key.offset + length` and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsChunkEntry {
    pub key: BtrfsKey,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub num_stripes: u16,
    pub stripes: Vec<BtrfsStripe>,
}

/// Returns the chunk and how many bytes of `data` it used.
pub fn parse_chunk_item(key: BtrfsKey, data: &[u8]) -> Result<(BtrfsChunkEntry, usize), ParseError> {
    if data.len() < BTRFS_CHUNK_FIXED_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_CHUNK_FIXED_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }

    let length = read_le_u64(data, 0)?;
    let owner = read_le_u64(data, 8)?;
    let stripe_len = read_le_u64(data, 16)?;
    let chunk_type = read_le_u64(data, 24)?;
    // io_align, io_width and sector_size (32..44) are not needed for mapping
    let _sector_size = read_le_u32(data, 40)?;
    let num_stripes = read_le_u16(data, 44)?;

    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }

    let stripes_count = usize::from(num_stripes);
    let mut cur = BTRFS_CHUNK_FIXED_SIZE;
    let consumed = cur + stripes_count * BTRFS_STRIPE_SIZE;
    if consumed > data.len() {
        return Err(ParseError::InsufficientData {
            needed: consumed - cur,
            offset: cur,
            actual: data.len() - cur,
        });
    }

    let mut stripes = Vec::with_capacity(stripes_count);
    for _ in 0..stripes_count {
        stripes.push(BtrfsStripe {
            devid: read_le_u64(data, cur)?,
            offset: read_le_u64(data, cur + 8)?,
            dev_uuid: read_fixed::<16>(data, cur + 16)?,
        });
        cur += BTRFS_STRIPE_SIZE;
    }

    Ok((
        BtrfsChunkEntry {
            key,
            length,
            owner,
            stripe_len,
            chunk_type,
            num_stripes,
            stripes,
        },
        consumed,
    ))
}

/// The superblock's bootstrap chunks: key, chunk, key, chunk, ...
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<BtrfsChunkEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        if cur + BTRFS_DISK_KEY_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_DISK_KEY_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let key = parse_disk_key(data, cur)?;
        cur += BTRFS_DISK_KEY_SIZE;

        let (entry, consumed) = parse_chunk_item(key, &data[cur..])?;
        cur += consumed;
        entries.push(entry);
    }

    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsPhysicalMapping {
    pub devid: u64,
    pub physical: u64,
}

/// Physical location of `logical` on the first stripe of its chunk, or
/// `None` when no chunk covers it.
pub fn map_logical_to_physical(
    chunks: &[BtrfsChunkEntry],
    logical: u64,
) -> Result<Option<BtrfsPhysicalMapping>, ParseError> {
    for chunk in chunks {
        let chunk_start = chunk.key.offset;
        let chunk_end = chunk_start
            .checked_add(chunk.length)
            .ok_or(ParseError::InvalidField {
                field: "chunk_length",
                reason: "logical range overflow",
            })?;

        if (chunk_start..chunk_end).contains(&logical) {
            let stripe = chunk.stripes.first().ok_or(ParseError::InvalidField {
                field: "stripes",
                reason: "chunk has no stripes",
            })?;
            let physical = stripe.offset.checked_add(logical - chunk_start).ok_or(
                ParseError::InvalidField {
                    field: "stripe_offset",
                    reason: "physical address overflow",
                },
            )?;
            return Ok(Some(BtrfsPhysicalMapping {
                devid: stripe.devid,
                physical,
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bref_types::BTRFS_CHUNK_ITEM_KEY;

    fn encode_chunk(length: u64, stripe_offset: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&2_u64.to_le_bytes());
        out.extend_from_slice(&0x1_0000_u64.to_le_bytes());
        out.extend_from_slice(&2_u64.to_le_bytes());
        out.extend_from_slice(&4096_u32.to_le_bytes());
        out.extend_from_slice(&4096_u32.to_le_bytes());
        out.extend_from_slice(&4096_u32.to_le_bytes());
        out.extend_from_slice(&1_u16.to_le_bytes());
        out.extend_from_slice(&0_u16.to_le_bytes());
        out.extend_from_slice(&1_u64.to_le_bytes());
        out.extend_from_slice(&stripe_offset.to_le_bytes());
        out.extend_from_slice(&[0_u8; 16]);
        out
    }

    fn chunk(logical: u64, length: u64, physical: u64) -> BtrfsChunkEntry {
        BtrfsChunkEntry {
            key: BtrfsKey::new(256, BTRFS_CHUNK_ITEM_KEY, logical),
            length,
            owner: 2,
            stripe_len: 0x1_0000,
            chunk_type: 2,
            num_stripes: 1,
            stripes: vec![BtrfsStripe {
                devid: 1,
                offset: physical,
                dev_uuid: [0; 16],
            }],
        }
    }

    #[test]
    fn sys_chunk_array_round_trips_two_entries() {
        let mut array = Vec::new();
        for (logical, physical) in [(0_u64, 0_u64), (0x100_0000, 0x20_0000)] {
            BtrfsKey::new(256, BTRFS_CHUNK_ITEM_KEY, logical).write_to(&mut array);
            array.extend_from_slice(&encode_chunk(0x80_0000, physical));
        }

        let entries = parse_sys_chunk_array(&array).expect("chunk parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].key.offset, 0x100_0000);
        assert_eq!(entries[1].length, 0x80_0000);
        assert_eq!(entries[1].stripes[0].offset, 0x20_0000);
    }

    #[test]
    fn chunk_item_rejects_zero_stripes() {
        let mut body = encode_chunk(4096, 0);
        body[44..46].copy_from_slice(&0_u16.to_le_bytes());
        let err = parse_chunk_item(BtrfsKey::new(256, BTRFS_CHUNK_ITEM_KEY, 0), &body)
            .expect_err("zero stripes");
        assert!(
            matches!(err, ParseError::InvalidField { field: "num_stripes", .. }),
            "expected num_stripes error, got: {err:?}"
        );
    }

    #[test]
    fn parse_sys_chunk_array_truncated_key() {
        let err = parse_sys_chunk_array(&[0_u8; 10]).expect_err("too short");
        assert!(matches!(err, ParseError::InsufficientData { .. }));
        assert!(parse_sys_chunk_array(&[]).expect("empty").is_empty());
    }

    #[test]
    fn map_logical_to_physical_hit_and_miss() {
        let chunks = vec![chunk(0x100_0000, 0x80_0000, 0x20_0000)];
        let mapping = map_logical_to_physical(&chunks, 0x108_0000)
            .expect("mapping should succeed")
            .expect("should find a mapping");
        assert_eq!(mapping.devid, 1);
        assert_eq!(mapping.physical, 0x28_0000);

        assert!(
            map_logical_to_physical(&chunks, 0x200_0000)
                .expect("no error")
                .is_none()
        );
        assert!(map_logical_to_physical(&[], 0x1000).expect("no error").is_none());
    }
}
