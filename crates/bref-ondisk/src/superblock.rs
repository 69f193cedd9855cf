//! Primary superblock parsing.

use bref_types::{
    BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA, BTRFS_MAGIC, BTRFS_SUPER_INFO_OFFSET,
    BTRFS_SUPER_INFO_SIZE, NodeSize, ParseError, read_fixed, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

const BTRFS_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const BTRFS_SYS_CHUNK_ARRAY_MAX: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSuperblock {
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub total_bytes: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub incompat_flags: u64,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub sys_chunk_array: Vec<u8>,
}

impl BtrfsSuperblock {
    /// Parse a 4 KiB superblock region. Only the magic is checked here;
    /// geometry checks live in [`BtrfsSuperblock::validate`].
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > BTRFS_SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end = BTRFS_SYS_CHUNK_ARRAY_OFFSET + sys_array_len;
        let sys_chunk_array = region[BTRFS_SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec();

        Ok(Self {
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            total_bytes: read_le_u64(region, 0x70)?,
            sectorsize: read_le_u32(region, 0x90)?,
            nodesize: read_le_u32(region, 0x94)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            root_level: region[0xC6],
            chunk_root_level: region[0xC7],
            sys_chunk_array,
        })
    }

    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let end = BTRFS_SUPER_INFO_OFFSET + BTRFS_SUPER_INFO_SIZE;
        if image.len() < end {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: BTRFS_SUPER_INFO_OFFSET,
                actual: image.len().saturating_sub(BTRFS_SUPER_INFO_OFFSET),
            });
        }

        Self::parse_superblock_region(&image[BTRFS_SUPER_INFO_OFFSET..end])
    }

    /// Geometry checks: sector size, node size and tree root pointers.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.sectorsize == 0
            || !self.sectorsize.is_power_of_two()
            || self.sectorsize > 256 * 1024
        {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be power of two up to 256K",
            });
        }
        NodeSize::new(self.nodesize)?;
        if self.root == 0 || self.chunk_root == 0 {
            return Err(ParseError::InvalidField {
                field: "root",
                reason: "tree root pointer is zero",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn skinny_metadata(&self) -> bool {
        self.incompat_flags & BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_region() -> Vec<u8> {
        let mut sb = vec![0_u8; BTRFS_SUPER_INFO_SIZE];
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&0x40_0000_u64.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&0x10_0000_u64.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&16384_u32.to_le_bytes());
        sb
    }

    #[test]
    fn parse_superblock_smoke() {
        let mut sb = minimal_region();
        sb[0x48..0x50].copy_from_slice(&9_u64.to_le_bytes());
        sb[0xBC..0xC4].copy_from_slice(&BTRFS_FEATURE_INCOMPAT_SKINNY_METADATA.to_le_bytes());
        sb[0xC6] = 1;
        sb[0xC7] = 0;

        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("superblock parse");
        parsed.validate().expect("valid geometry");
        assert_eq!(parsed.generation, 9);
        assert_eq!(parsed.root, 0x40_0000);
        assert_eq!(parsed.chunk_root, 0x10_0000);
        assert_eq!(parsed.nodesize, 16384);
        assert_eq!(parsed.root_level, 1);
        assert!(parsed.skinny_metadata());
        assert!(parsed.sys_chunk_array.is_empty());
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut sb = minimal_region();
        sb[0x40] ^= 0xFF;
        let err = BtrfsSuperblock::parse_superblock_region(&sb).expect_err("bad magic");
        assert!(
            matches!(err, ParseError::InvalidMagic { .. }),
            "expected magic error, got: {err:?}"
        );
    }

    #[test]
    fn superblock_rejects_non_power_of_two_sizes() {
        let mut sb = minimal_region();
        sb[0x90..0x94].copy_from_slice(&3000_u32.to_le_bytes());
        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("parse");
        let err = parsed.validate().expect_err("sectorsize");
        assert!(
            matches!(err, ParseError::InvalidField { field: "sectorsize", .. }),
            "expected sectorsize error, got: {err:?}"
        );

        let mut sb = minimal_region();
        sb[0x94..0x98].copy_from_slice(&5000_u32.to_le_bytes());
        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("parse");
        let err = parsed.validate().expect_err("nodesize");
        assert!(
            matches!(err, ParseError::InvalidField { field: "nodesize", .. }),
            "expected nodesize error, got: {err:?}"
        );
    }

    #[test]
    fn superblock_rejects_oversized_sys_chunk_array() {
        let mut sb = minimal_region();
        sb[0xA0..0xA4].copy_from_slice(&4000_u32.to_le_bytes());
        let err = BtrfsSuperblock::parse_superblock_region(&sb).expect_err("too large");
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "sys_chunk_array_size",
                    ..
                }
            ),
            "expected sys_chunk_array_size error, got: {err:?}"
        );
    }

    #[test]
    fn parse_from_image_requires_superblock_offset() {
        let err = BtrfsSuperblock::parse_from_image(&[0_u8; 4096]).expect_err("short image");
        assert!(matches!(err, ParseError::InsufficientData { .. }));

        let mut image = vec![0_u8; BTRFS_SUPER_INFO_OFFSET + BTRFS_SUPER_INFO_SIZE];
        image[BTRFS_SUPER_INFO_OFFSET..].copy_from_slice(&minimal_region());
        let parsed = BtrfsSuperblock::parse_from_image(&image).expect("image parse");
        assert_eq!(parsed.magic, BTRFS_MAGIC);
    }
}
