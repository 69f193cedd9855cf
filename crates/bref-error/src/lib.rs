#![forbid(unsafe_code)]
//! Error types for bref.
//!
//! # Error Taxonomy
//!
//! bref uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bref-types` | On-disk or wire format violations detected during byte parsing |
//! | Runtime | `BrefError` | `bref-error` (this crate) | Errors returned by every public walk, lookup and decode operation |
//!
//! ## Mapping Policy: ParseError → BrefError
//!
//! `bref-error` does not depend on `bref-types`. The conversion is done in
//! `bref-tree` (metadata blocks) and `bref-send` (stream commands), which know
//! the block address or command being decoded:
//!
//! | ParseError Variant | BrefError Variant |
//! |--------------------|-------------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidMagic` | `Format(detail)` |
//! | `InvalidField` | `Corruption` for live metadata, `Format` while opening an image |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## Soft misses
//!
//! `NotFound` is the only variant closure walks may swallow: a referenced root
//! or a queued metadata block can disappear under a concurrent commit. Use
//! [`BrefError::is_not_found`] rather than matching by hand.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`BrefError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `NoData` | `ENODATA` |

use thiserror::Error;

/// Unified error type for all bref operations.
#[derive(Debug, Error)]
pub enum BrefError {
    /// Reading from the underlying image, device or stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed metadata or stream content.
    ///
    /// For tree blocks `block` is the logical address of the offending node;
    /// for send streams it is the byte offset of the offending command.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Wrong magic or unsupported version of an image or stream.
    #[error("invalid format: {0}")]
    Format(String),

    /// Extent, root, key or inode absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself does not make sense for the target.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer sized from on-disk or wire data could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// The input ended before any header could be read.
    #[error("no data")]
    NoData,
}

impl BrefError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NoData => libc::ENODATA,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Shorthand for a `Corruption` error.
    pub fn corrupt(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `BrefError`.
pub type Result<T> = std::result::Result<T, BrefError>;
