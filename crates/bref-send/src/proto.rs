//! Wire format of a btrfs send stream.
//!
//! # Format Overview
//!
//! ```text
//! Stream:
//! +----------------+
//! | Stream Header  |  (17 bytes)
//! +----------------+
//! | Command        |  (variable)
//! +----------------+
//! | ...            |
//! +----------------+
//!
//! Stream Header:
//! +------------------+---------+
//! | magic            | 13 bytes| = "btrfs-stream\0"
//! | version          | 4 bytes | <= 3
//! +------------------+---------+
//!
//! Command:
//! +------------------+---------+
//! | len              | 4 bytes | payload length (excluding this header)
//! | cmd              | 2 bytes | command type
//! | crc              | 4 bytes | CRC32C of header + payload, crc field zeroed
//! +------------------+---------+
//! | For each attribute:        |
//! |   tlv_type       | 2 bytes |
//! |   tlv_len        | 2 bytes | absent for DATA in version >= 2
//! |   value          | N bytes |
//! +------------------+---------+
//! ```
//!
//! In version 2 and later the `DATA` attribute carries no length and runs to
//! the end of the command, so it must be the last attribute.

use bref_error::{BrefError, Result};
use bref_types::read_le_u32;
use serde::{Deserialize, Serialize};

pub const SEND_STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";
/// Newest stream version this decoder understands.
pub const SEND_STREAM_VERSION: u32 = 3;
pub const STREAM_HEADER_SIZE: usize = 17;
pub const CMD_HEADER_SIZE: usize = 10;
/// Offset of the crc field inside a command header.
pub const CMD_CRC_OFFSET: usize = 6;
pub const UUID_SIZE: usize = 16;
/// `btrfs_timespec`: le64 seconds, le32 nanoseconds.
pub const TIMESPEC_SIZE: usize = 12;

pub const ENCODED_IO_COMPRESSION_NONE: u32 = 0;
pub const ENCODED_IO_ENCRYPTION_NONE: u32 = 0;

/// Command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum SendCommand {
    Subvol = 1,
    Snapshot = 2,
    Mkfile = 3,
    Mkdir = 4,
    Mknod = 5,
    Mkfifo = 6,
    Mksock = 7,
    Symlink = 8,
    Rename = 9,
    Link = 10,
    Unlink = 11,
    Rmdir = 12,
    SetXattr = 13,
    RemoveXattr = 14,
    Write = 15,
    Clone = 16,
    Truncate = 17,
    Chmod = 18,
    Chown = 19,
    Utimes = 20,
    End = 21,
    UpdateExtent = 22,
    // version 2
    Fallocate = 23,
    Fileattr = 24,
    EncodedWrite = 25,
    // version 3
    EnableVerity = 26,
}

impl SendCommand {
    /// Decode a raw command type; `None` for unknown or unspecified types.
    #[must_use]
    pub fn from_raw(val: u16) -> Option<Self> {
        Some(match val {
            1 => Self::Subvol,
            2 => Self::Snapshot,
            3 => Self::Mkfile,
            4 => Self::Mkdir,
            5 => Self::Mknod,
            6 => Self::Mkfifo,
            7 => Self::Mksock,
            8 => Self::Symlink,
            9 => Self::Rename,
            10 => Self::Link,
            11 => Self::Unlink,
            12 => Self::Rmdir,
            13 => Self::SetXattr,
            14 => Self::RemoveXattr,
            15 => Self::Write,
            16 => Self::Clone,
            17 => Self::Truncate,
            18 => Self::Chmod,
            19 => Self::Chown,
            20 => Self::Utimes,
            21 => Self::End,
            22 => Self::UpdateExtent,
            23 => Self::Fallocate,
            24 => Self::Fileattr,
            25 => Self::EncodedWrite,
            26 => Self::EnableVerity,
            _ => return None,
        })
    }

    #[must_use]
    pub fn raw(self) -> u16 {
        self as u16
    }
}

/// Attribute (TLV) types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum SendAttr {
    Uuid = 1,
    Ctransid = 2,
    Ino = 3,
    Size = 4,
    Mode = 5,
    Uid = 6,
    Gid = 7,
    Rdev = 8,
    Ctime = 9,
    Mtime = 10,
    Atime = 11,
    Otime = 12,
    XattrName = 13,
    XattrData = 14,
    Path = 15,
    PathTo = 16,
    PathLink = 17,
    FileOffset = 18,
    Data = 19,
    CloneUuid = 20,
    CloneCtransid = 21,
    ClonePath = 22,
    CloneOffset = 23,
    CloneLen = 24,
    // version 2
    FallocateMode = 25,
    Fileattr = 26,
    UnencodedFileLen = 27,
    UnencodedLen = 28,
    UnencodedOffset = 29,
    Compression = 30,
    Encryption = 31,
    // version 3
    VerityAlgorithm = 32,
    VerityBlockSize = 33,
    VeritySaltData = 34,
    VeritySigData = 35,
}

/// Highest attribute type.
pub const SEND_ATTR_MAX: u16 = 35;

impl SendAttr {
    #[must_use]
    pub fn from_raw(val: u16) -> Option<Self> {
        Some(match val {
            1 => Self::Uuid,
            2 => Self::Ctransid,
            3 => Self::Ino,
            4 => Self::Size,
            5 => Self::Mode,
            6 => Self::Uid,
            7 => Self::Gid,
            8 => Self::Rdev,
            9 => Self::Ctime,
            10 => Self::Mtime,
            11 => Self::Atime,
            12 => Self::Otime,
            13 => Self::XattrName,
            14 => Self::XattrData,
            15 => Self::Path,
            16 => Self::PathTo,
            17 => Self::PathLink,
            18 => Self::FileOffset,
            19 => Self::Data,
            20 => Self::CloneUuid,
            21 => Self::CloneCtransid,
            22 => Self::ClonePath,
            23 => Self::CloneOffset,
            24 => Self::CloneLen,
            25 => Self::FallocateMode,
            26 => Self::Fileattr,
            27 => Self::UnencodedFileLen,
            28 => Self::UnencodedLen,
            29 => Self::UnencodedOffset,
            30 => Self::Compression,
            31 => Self::Encryption,
            32 => Self::VerityAlgorithm,
            33 => Self::VerityBlockSize,
            34 => Self::VeritySaltData,
            35 => Self::VeritySigData,
            _ => return None,
        })
    }

    #[must_use]
    pub fn raw(self) -> u16 {
        self as u16
    }

    /// Name used in error reports.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Ctransid => "ctransid",
            Self::Ino => "ino",
            Self::Size => "size",
            Self::Mode => "mode",
            Self::Uid => "uid",
            Self::Gid => "gid",
            Self::Rdev => "rdev",
            Self::Ctime => "ctime",
            Self::Mtime => "mtime",
            Self::Atime => "atime",
            Self::Otime => "otime",
            Self::XattrName => "xattr_name",
            Self::XattrData => "xattr_data",
            Self::Path => "path",
            Self::PathTo => "path_to",
            Self::PathLink => "path_link",
            Self::FileOffset => "file_offset",
            Self::Data => "data",
            Self::CloneUuid => "clone_uuid",
            Self::CloneCtransid => "clone_ctransid",
            Self::ClonePath => "clone_path",
            Self::CloneOffset => "clone_offset",
            Self::CloneLen => "clone_len",
            Self::FallocateMode => "fallocate_mode",
            Self::Fileattr => "fileattr",
            Self::UnencodedFileLen => "unencoded_file_len",
            Self::UnencodedLen => "unencoded_len",
            Self::UnencodedOffset => "unencoded_offset",
            Self::Compression => "compression",
            Self::Encryption => "encryption",
            Self::VerityAlgorithm => "verity_algorithm",
            Self::VerityBlockSize => "verity_block_size",
            Self::VeritySaltData => "verity_salt_data",
            Self::VeritySigData => "verity_sig_data",
        }
    }
}

/// Encode the stream header for `version`.
#[must_use]
pub fn encode_stream_header(version: u32) -> [u8; STREAM_HEADER_SIZE] {
    let mut buf = [0_u8; STREAM_HEADER_SIZE];
    buf[..SEND_STREAM_MAGIC.len()].copy_from_slice(SEND_STREAM_MAGIC);
    buf[SEND_STREAM_MAGIC.len()..].copy_from_slice(&version.to_le_bytes());
    buf
}

/// Decode a stream header and return its version.
pub fn decode_stream_header(bytes: &[u8; STREAM_HEADER_SIZE]) -> Result<u32> {
    if &bytes[..SEND_STREAM_MAGIC.len()] != SEND_STREAM_MAGIC {
        return Err(BrefError::Format("unexpected send stream header".to_owned()));
    }
    let version = read_le_u32(bytes, SEND_STREAM_MAGIC.len())
        .map_err(|e| BrefError::Format(e.to_string()))?;
    if version > SEND_STREAM_VERSION {
        return Err(BrefError::Format(format!(
            "send stream version {version} not supported (newest is {SEND_STREAM_VERSION})"
        )));
    }
    Ok(version)
}

/// CRC32C of a command as stored in its header: seed 0 with no final
/// inversion, computed over the header with the crc field zeroed, then the
/// payload.
#[must_use]
pub fn command_crc(header: &[u8; CMD_HEADER_SIZE], payload: &[u8]) -> u32 {
    let mut zeroed = *header;
    zeroed[CMD_CRC_OFFSET..].fill(0);
    // the crate pre- and post-inverts; seeding with !0 and inverting the
    // result yields the raw register
    !crc32c::crc32c_append(crc32c::crc32c_append(u32::MAX, &zeroed), payload)
}
