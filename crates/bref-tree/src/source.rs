//! Where tree blocks come from.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bref_error::{BrefError, Result};
use bref_ondisk::{BtrfsChunkEntry, map_logical_to_physical};
use bref_types::{u64_to_usize, usize_to_u64};

use crate::convert::parse_error_at;

/// Reads whole metadata blocks by logical address.
///
/// Implementations perform no caching; every call reads the block again.
pub trait BlockSource {
    fn read_block(&self, logical: u64, len: usize) -> Result<Vec<u8>>;
}

/// Sources that translate logical addresses through chunk entries.
pub(crate) trait ChunkMapped {
    fn set_chunks(&mut self, chunks: Vec<BtrfsChunkEntry>);
}

fn map_address(chunks: &[BtrfsChunkEntry], logical: u64) -> Result<u64> {
    let mapping = map_logical_to_physical(chunks, logical)
        .map_err(|e| parse_error_at(logical, &e))?
        .ok_or_else(|| BrefError::corrupt(logical, "logical address not covered by any chunk"))?;
    Ok(mapping.physical)
}

fn short_read(logical: u64) -> BrefError {
    BrefError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("block at logical {logical} lies past the end of the image"),
    ))
}

/// Blocks held in a map keyed by logical address.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockSource {
    blocks: HashMap<u64, Vec<u8>>,
}

impl MemoryBlockSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, logical: u64, block: Vec<u8>) {
        self.blocks.insert(logical, block);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockSource for MemoryBlockSource {
    fn read_block(&self, logical: u64, len: usize) -> Result<Vec<u8>> {
        let block = self.blocks.get(&logical).ok_or_else(|| {
            BrefError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no block stored at logical {logical}"),
            ))
        })?;
        if block.len() != len {
            return Err(BrefError::corrupt(
                logical,
                format!("block is {} bytes, expected {len}", block.len()),
            ));
        }
        Ok(block.clone())
    }
}

/// A whole single-device image in memory.
#[derive(Debug, Clone)]
pub struct ImageBlockSource {
    image: Vec<u8>,
    chunks: Vec<BtrfsChunkEntry>,
}

impl ImageBlockSource {
    #[must_use]
    pub fn new(image: Vec<u8>, chunks: Vec<BtrfsChunkEntry>) -> Self {
        Self { image, chunks }
    }

    #[must_use]
    pub fn chunks(&self) -> &[BtrfsChunkEntry] {
        &self.chunks
    }
}

impl ChunkMapped for ImageBlockSource {
    fn set_chunks(&mut self, chunks: Vec<BtrfsChunkEntry>) {
        self.chunks = chunks;
    }
}

impl BlockSource for ImageBlockSource {
    fn read_block(&self, logical: u64, len: usize) -> Result<Vec<u8>> {
        let physical = map_address(&self.chunks, logical)?;
        let start = u64_to_usize(physical, "physical").map_err(|e| parse_error_at(logical, &e))?;
        let end = start.checked_add(len).ok_or_else(|| short_read(logical))?;
        self.image
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| short_read(logical))
    }
}

/// Positional reads from an image file or block device.
#[derive(Debug)]
pub struct FileBlockSource {
    file: File,
    len: u64,
    chunks: Vec<BtrfsChunkEntry>,
}

impl FileBlockSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            chunks: Vec::new(),
        })
    }

    /// Read `len` bytes at a physical offset, bypassing chunk mapping.
    pub fn read_physical(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(usize_to_u64(len))
            .ok_or_else(|| short_read(offset))?;
        if end > self.len {
            return Err(short_read(offset));
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| BrefError::OutOfMemory)?;
        buf.resize(len, 0);
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}

impl ChunkMapped for FileBlockSource {
    fn set_chunks(&mut self, chunks: Vec<BtrfsChunkEntry>) {
        self.chunks = chunks;
    }
}

impl BlockSource for FileBlockSource {
    fn read_block(&self, logical: u64, len: usize) -> Result<Vec<u8>> {
        let physical = map_address(&self.chunks, logical)?;
        self.read_physical(physical, len)
    }
}
