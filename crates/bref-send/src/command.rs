//! Attribute decoding and the typed command set.

use bref_error::Result as BrefResult;
use bref_types::{ParseError, ensure_slice, read_le_u16, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};

use crate::ops::SendOps;
use crate::proto::{
    ENCODED_IO_COMPRESSION_NONE, ENCODED_IO_ENCRYPTION_NONE, SEND_ATTR_MAX, SendAttr,
    SendCommand, TIMESPEC_SIZE, UUID_SIZE,
};

const SLOTS: usize = SEND_ATTR_MAX as usize + 1;

/// The attributes of one command, indexed by type and borrowing the payload.
#[derive(Debug, Clone)]
pub struct Attrs<'a> {
    slots: [Option<&'a [u8]>; SLOTS],
}

fn missing(attr: SendAttr) -> ParseError {
    ParseError::InvalidField {
        field: attr.name(),
        reason: "required attribute missing",
    }
}

fn bad_len(attr: SendAttr) -> ParseError {
    ParseError::InvalidField {
        field: attr.name(),
        reason: "unexpected attribute length",
    }
}

impl<'a> Attrs<'a> {
    /// Split a command payload into attributes. Unknown and duplicate
    /// attribute types are errors, as is a value running past the payload.
    pub fn parse(payload: &'a [u8], version: u32) -> Result<Self, ParseError> {
        let mut slots = [None; SLOTS];
        let mut pos = 0;
        while pos < payload.len() {
            let raw = read_le_u16(payload, pos)?;
            let attr = SendAttr::from_raw(raw).ok_or(ParseError::InvalidField {
                field: "tlv_type",
                reason: "unknown attribute type",
            })?;
            pos += 2;
            let len = if version >= 2 && attr == SendAttr::Data {
                payload.len() - pos
            } else {
                let len = read_le_u16(payload, pos)?;
                pos += 2;
                usize::from(len)
            };
            let value = ensure_slice(payload, pos, len)?;
            let slot = &mut slots[usize::from(raw)];
            if slot.is_some() {
                return Err(ParseError::InvalidField {
                    field: attr.name(),
                    reason: "duplicate attribute",
                });
            }
            *slot = Some(value);
            pos += len;
        }
        Ok(Self { slots })
    }

    #[must_use]
    pub fn get(&self, attr: SendAttr) -> Option<&'a [u8]> {
        self.slots[usize::from(attr.raw())]
    }

    pub fn bytes(&self, attr: SendAttr) -> Result<&'a [u8], ParseError> {
        self.get(attr).ok_or_else(|| missing(attr))
    }

    pub fn owned(&self, attr: SendAttr) -> Result<Vec<u8>, ParseError> {
        self.bytes(attr).map(<[u8]>::to_vec)
    }

    fn fixed<const N: usize>(&self, attr: SendAttr) -> Result<[u8; N], ParseError> {
        let value = self.bytes(attr)?;
        value.try_into().map_err(|_| bad_len(attr))
    }

    pub fn u8(&self, attr: SendAttr) -> Result<u8, ParseError> {
        self.fixed::<1>(attr).map(|b| b[0])
    }

    pub fn u32(&self, attr: SendAttr) -> Result<u32, ParseError> {
        self.fixed(attr).map(u32::from_le_bytes)
    }

    pub fn u64(&self, attr: SendAttr) -> Result<u64, ParseError> {
        self.fixed(attr).map(u64::from_le_bytes)
    }

    pub fn uuid(&self, attr: SendAttr) -> Result<[u8; UUID_SIZE], ParseError> {
        self.fixed(attr)
    }

    pub fn timespec(&self, attr: SendAttr) -> Result<Timespec, ParseError> {
        let raw = self.fixed::<TIMESPEC_SIZE>(attr)?;
        Ok(Timespec {
            sec: read_le_u64(&raw, 0)?,
            nsec: read_le_u32(&raw, 8)?,
        })
    }

    /// An optional `u32` attribute, `default` when absent.
    fn u32_or(&self, attr: SendAttr, default: u32) -> Result<u32, ParseError> {
        match self.get(attr) {
            Some(_) => self.u32(attr),
            None => Ok(default),
        }
    }
}

/// `btrfs_timespec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedWrite {
    pub path: Vec<u8>,
    pub offset: u64,
    pub unencoded_file_len: u64,
    pub unencoded_len: u64,
    pub unencoded_offset: u64,
    pub compression: u32,
    pub encryption: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRange {
    pub path: Vec<u8>,
    pub offset: u64,
    pub len: u64,
    pub clone_uuid: [u8; UUID_SIZE],
    pub clone_ctransid: u64,
    pub clone_path: Vec<u8>,
    pub clone_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableVerity {
    pub path: Vec<u8>,
    pub algorithm: u8,
    pub block_size: u32,
    pub salt: Vec<u8>,
    pub sig: Vec<u8>,
}

/// A decoded command with every attribute it requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Subvol {
        path: Vec<u8>,
        uuid: [u8; UUID_SIZE],
        ctransid: u64,
    },
    Snapshot {
        path: Vec<u8>,
        uuid: [u8; UUID_SIZE],
        ctransid: u64,
        clone_uuid: [u8; UUID_SIZE],
        clone_ctransid: u64,
    },
    Mkfile { path: Vec<u8>, ino: u64 },
    Mkdir { path: Vec<u8>, ino: u64 },
    Mknod {
        path: Vec<u8>,
        ino: u64,
        mode: u64,
        rdev: u64,
    },
    Mkfifo { path: Vec<u8>, ino: u64 },
    Mksock { path: Vec<u8>, ino: u64 },
    Symlink {
        path: Vec<u8>,
        ino: u64,
        target: Vec<u8>,
    },
    Rename { from: Vec<u8>, to: Vec<u8> },
    Link { path: Vec<u8>, target: Vec<u8> },
    Unlink { path: Vec<u8> },
    Rmdir { path: Vec<u8> },
    Write {
        path: Vec<u8>,
        offset: u64,
        data: Vec<u8>,
    },
    EncodedWrite(EncodedWrite),
    Clone(CloneRange),
    SetXattr {
        path: Vec<u8>,
        name: Vec<u8>,
        data: Vec<u8>,
    },
    RemoveXattr { path: Vec<u8>, name: Vec<u8> },
    Truncate { path: Vec<u8>, size: u64 },
    Chmod { path: Vec<u8>, mode: u64 },
    Chown { path: Vec<u8>, uid: u64, gid: u64 },
    Utimes {
        path: Vec<u8>,
        atime: Timespec,
        mtime: Timespec,
        ctime: Timespec,
    },
    UpdateExtent {
        path: Vec<u8>,
        offset: u64,
        len: u64,
    },
    Fallocate {
        path: Vec<u8>,
        mode: u32,
        offset: u64,
        len: u64,
    },
    Fileattr { path: Vec<u8>, attr: u64 },
    EnableVerity(EnableVerity),
    End,
}

impl Command {
    /// Build a command of type `cmd` from its attributes. Attributes the
    /// command does not use are ignored.
    pub fn decode(cmd: SendCommand, a: &Attrs<'_>) -> Result<Self, ParseError> {
        use SendAttr as A;
        Ok(match cmd {
            SendCommand::Subvol => Self::Subvol {
                path: a.owned(A::Path)?,
                uuid: a.uuid(A::Uuid)?,
                ctransid: a.u64(A::Ctransid)?,
            },
            SendCommand::Snapshot => Self::Snapshot {
                path: a.owned(A::Path)?,
                uuid: a.uuid(A::Uuid)?,
                ctransid: a.u64(A::Ctransid)?,
                clone_uuid: a.uuid(A::CloneUuid)?,
                clone_ctransid: a.u64(A::CloneCtransid)?,
            },
            SendCommand::Mkfile => Self::Mkfile {
                path: a.owned(A::Path)?,
                ino: a.u64(A::Ino)?,
            },
            SendCommand::Mkdir => Self::Mkdir {
                path: a.owned(A::Path)?,
                ino: a.u64(A::Ino)?,
            },
            SendCommand::Mknod => Self::Mknod {
                path: a.owned(A::Path)?,
                ino: a.u64(A::Ino)?,
                mode: a.u64(A::Mode)?,
                rdev: a.u64(A::Rdev)?,
            },
            SendCommand::Mkfifo => Self::Mkfifo {
                path: a.owned(A::Path)?,
                ino: a.u64(A::Ino)?,
            },
            SendCommand::Mksock => Self::Mksock {
                path: a.owned(A::Path)?,
                ino: a.u64(A::Ino)?,
            },
            SendCommand::Symlink => Self::Symlink {
                path: a.owned(A::Path)?,
                ino: a.u64(A::Ino)?,
                target: a.owned(A::PathLink)?,
            },
            SendCommand::Rename => Self::Rename {
                from: a.owned(A::Path)?,
                to: a.owned(A::PathTo)?,
            },
            SendCommand::Link => Self::Link {
                path: a.owned(A::Path)?,
                target: a.owned(A::PathLink)?,
            },
            SendCommand::Unlink => Self::Unlink {
                path: a.owned(A::Path)?,
            },
            SendCommand::Rmdir => Self::Rmdir {
                path: a.owned(A::Path)?,
            },
            SendCommand::Write => Self::Write {
                path: a.owned(A::Path)?,
                offset: a.u64(A::FileOffset)?,
                data: a.owned(A::Data)?,
            },
            SendCommand::EncodedWrite => Self::EncodedWrite(EncodedWrite {
                path: a.owned(A::Path)?,
                offset: a.u64(A::FileOffset)?,
                unencoded_file_len: a.u64(A::UnencodedFileLen)?,
                unencoded_len: a.u64(A::UnencodedLen)?,
                unencoded_offset: a.u64(A::UnencodedOffset)?,
                compression: a.u32_or(A::Compression, ENCODED_IO_COMPRESSION_NONE)?,
                encryption: a.u32_or(A::Encryption, ENCODED_IO_ENCRYPTION_NONE)?,
                data: a.owned(A::Data)?,
            }),
            SendCommand::Clone => Self::Clone(CloneRange {
                path: a.owned(A::Path)?,
                offset: a.u64(A::FileOffset)?,
                len: a.u64(A::CloneLen)?,
                clone_uuid: a.uuid(A::CloneUuid)?,
                clone_ctransid: a.u64(A::CloneCtransid)?,
                clone_path: a.owned(A::ClonePath)?,
                clone_offset: a.u64(A::CloneOffset)?,
            }),
            SendCommand::SetXattr => Self::SetXattr {
                path: a.owned(A::Path)?,
                name: a.owned(A::XattrName)?,
                data: a.owned(A::XattrData)?,
            },
            SendCommand::RemoveXattr => Self::RemoveXattr {
                path: a.owned(A::Path)?,
                name: a.owned(A::XattrName)?,
            },
            SendCommand::Truncate => Self::Truncate {
                path: a.owned(A::Path)?,
                size: a.u64(A::Size)?,
            },
            SendCommand::Chmod => Self::Chmod {
                path: a.owned(A::Path)?,
                mode: a.u64(A::Mode)?,
            },
            SendCommand::Chown => Self::Chown {
                path: a.owned(A::Path)?,
                uid: a.u64(A::Uid)?,
                gid: a.u64(A::Gid)?,
            },
            SendCommand::Utimes => Self::Utimes {
                path: a.owned(A::Path)?,
                atime: a.timespec(A::Atime)?,
                mtime: a.timespec(A::Mtime)?,
                ctime: a.timespec(A::Ctime)?,
            },
            SendCommand::UpdateExtent => Self::UpdateExtent {
                path: a.owned(A::Path)?,
                offset: a.u64(A::FileOffset)?,
                len: a.u64(A::Size)?,
            },
            SendCommand::Fallocate => Self::Fallocate {
                path: a.owned(A::Path)?,
                mode: a.u32(A::FallocateMode)?,
                offset: a.u64(A::FileOffset)?,
                len: a.u64(A::Size)?,
            },
            SendCommand::Fileattr => Self::Fileattr {
                path: a.owned(A::Path)?,
                attr: a.u64(A::Fileattr)?,
            },
            SendCommand::EnableVerity => Self::EnableVerity(EnableVerity {
                path: a.owned(A::Path)?,
                algorithm: a.u8(A::VerityAlgorithm)?,
                block_size: a.u32(A::VerityBlockSize)?,
                salt: a.owned(A::VeritySaltData)?,
                sig: a.owned(A::VeritySigData)?,
            }),
            SendCommand::End => Self::End,
        })
    }

    #[must_use]
    pub fn kind(&self) -> SendCommand {
        match self {
            Self::Subvol { .. } => SendCommand::Subvol,
            Self::Snapshot { .. } => SendCommand::Snapshot,
            Self::Mkfile { .. } => SendCommand::Mkfile,
            Self::Mkdir { .. } => SendCommand::Mkdir,
            Self::Mknod { .. } => SendCommand::Mknod,
            Self::Mkfifo { .. } => SendCommand::Mkfifo,
            Self::Mksock { .. } => SendCommand::Mksock,
            Self::Symlink { .. } => SendCommand::Symlink,
            Self::Rename { .. } => SendCommand::Rename,
            Self::Link { .. } => SendCommand::Link,
            Self::Unlink { .. } => SendCommand::Unlink,
            Self::Rmdir { .. } => SendCommand::Rmdir,
            Self::Write { .. } => SendCommand::Write,
            Self::EncodedWrite(_) => SendCommand::EncodedWrite,
            Self::Clone(_) => SendCommand::Clone,
            Self::SetXattr { .. } => SendCommand::SetXattr,
            Self::RemoveXattr { .. } => SendCommand::RemoveXattr,
            Self::Truncate { .. } => SendCommand::Truncate,
            Self::Chmod { .. } => SendCommand::Chmod,
            Self::Chown { .. } => SendCommand::Chown,
            Self::Utimes { .. } => SendCommand::Utimes,
            Self::UpdateExtent { .. } => SendCommand::UpdateExtent,
            Self::Fallocate { .. } => SendCommand::Fallocate,
            Self::Fileattr { .. } => SendCommand::Fileattr,
            Self::EnableVerity(_) => SendCommand::EnableVerity,
            Self::End => SendCommand::End,
        }
    }

    /// Hand the command to the matching operation of `ops`.
    pub fn apply<O: SendOps + ?Sized>(&self, ops: &mut O) -> BrefResult<()> {
        match self {
            Self::Subvol {
                path,
                uuid,
                ctransid,
            } => ops.subvol(path, uuid, *ctransid),
            Self::Snapshot {
                path,
                uuid,
                ctransid,
                clone_uuid,
                clone_ctransid,
            } => ops.snapshot(path, uuid, *ctransid, clone_uuid, *clone_ctransid),
            Self::Mkfile { path, ino } => ops.mkfile(path, *ino),
            Self::Mkdir { path, ino } => ops.mkdir(path, *ino),
            Self::Mknod {
                path,
                ino,
                mode,
                rdev,
            } => ops.mknod(path, *ino, *mode, *rdev),
            Self::Mkfifo { path, ino } => ops.mkfifo(path, *ino),
            Self::Mksock { path, ino } => ops.mksock(path, *ino),
            Self::Symlink { path, ino, target } => ops.symlink(path, *ino, target),
            Self::Rename { from, to } => ops.rename(from, to),
            Self::Link { path, target } => ops.link(path, target),
            Self::Unlink { path } => ops.unlink(path),
            Self::Rmdir { path } => ops.rmdir(path),
            Self::Write { path, offset, data } => ops.write(path, *offset, data),
            Self::EncodedWrite(w) => ops.encoded_write(w),
            Self::Clone(c) => ops.clone_range(c),
            Self::SetXattr { path, name, data } => ops.set_xattr(path, name, data),
            Self::RemoveXattr { path, name } => ops.remove_xattr(path, name),
            Self::Truncate { path, size } => ops.truncate(path, *size),
            Self::Chmod { path, mode } => ops.chmod(path, *mode),
            Self::Chown { path, uid, gid } => ops.chown(path, *uid, *gid),
            Self::Utimes {
                path,
                atime,
                mtime,
                ctime,
            } => ops.utimes(path, atime, mtime, ctime),
            Self::UpdateExtent { path, offset, len } => ops.update_extent(path, *offset, *len),
            Self::Fallocate {
                path,
                mode,
                offset,
                len,
            } => ops.fallocate(path, *mode, *offset, *len),
            Self::Fileattr { path, attr } => ops.fileattr(path, *attr),
            Self::EnableVerity(v) => ops.enable_verity(v),
            Self::End => ops.end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(out: &mut Vec<u8>, attr: SendAttr, value: &[u8]) {
        out.extend_from_slice(&attr.raw().to_le_bytes());
        out.extend_from_slice(&u16::try_from(value.len()).expect("short value").to_le_bytes());
        out.extend_from_slice(value);
    }

    #[test]
    fn data_runs_to_end_in_v2() {
        let mut payload = Vec::new();
        tlv(&mut payload, SendAttr::Path, b"f");
        tlv(&mut payload, SendAttr::FileOffset, &4096_u64.to_le_bytes());
        payload.extend_from_slice(&SendAttr::Data.raw().to_le_bytes());
        payload.extend_from_slice(b"no length prefix here");

        let attrs = Attrs::parse(&payload, 2).expect("v2 attrs");
        assert_eq!(attrs.bytes(SendAttr::Data).expect("data"), b"no length prefix here");
        let cmd = Command::decode(SendCommand::Write, &attrs).expect("write");
        assert_eq!(
            cmd,
            Command::Write {
                path: b"f".to_vec(),
                offset: 4096,
                data: b"no length prefix here".to_vec(),
            }
        );

        // v1 reads the same bytes as a length-prefixed value and overruns
        let err = Attrs::parse(&payload, 1).expect_err("v1 overrun");
        assert!(
            matches!(err, ParseError::InsufficientData { .. }),
            "expected InsufficientData, got: {err:?}"
        );
    }

    #[test]
    fn unknown_and_duplicate_attributes_are_rejected() {
        let mut payload = Vec::new();
        tlv(&mut payload, SendAttr::Path, b"a");
        tlv(&mut payload, SendAttr::Path, b"b");
        let err = Attrs::parse(&payload, 1).expect_err("duplicate");
        assert!(
            matches!(err, ParseError::InvalidField { reason: "duplicate attribute", .. }),
            "expected duplicate error, got: {err:?}"
        );

        let mut payload = Vec::new();
        payload.extend_from_slice(&0_u16.to_le_bytes());
        payload.extend_from_slice(&0_u16.to_le_bytes());
        let err = Attrs::parse(&payload, 1).expect_err("type 0");
        assert!(
            matches!(err, ParseError::InvalidField { field: "tlv_type", .. }),
            "expected tlv_type error, got: {err:?}"
        );
    }

    #[test]
    fn truncated_tlv_header_is_rejected() {
        let payload = [15_u8];
        let err = Attrs::parse(&payload, 1).expect_err("one byte");
        assert!(
            matches!(err, ParseError::InsufficientData { .. }),
            "expected InsufficientData, got: {err:?}"
        );
    }

    #[test]
    fn missing_and_misshapen_attributes() {
        let mut payload = Vec::new();
        tlv(&mut payload, SendAttr::Path, b"dir");
        tlv(&mut payload, SendAttr::Ino, &[1, 2, 3]);
        let attrs = Attrs::parse(&payload, 1).expect("attrs");

        let err = Command::decode(SendCommand::Mkdir, &attrs).expect_err("short ino");
        assert!(
            matches!(err, ParseError::InvalidField { field: "ino", .. }),
            "expected ino error, got: {err:?}"
        );
        let err = Command::decode(SendCommand::Rename, &attrs).expect_err("no path_to");
        assert!(
            matches!(err, ParseError::InvalidField { field: "path_to", reason: "required attribute missing" }),
            "expected path_to error, got: {err:?}"
        );
    }

    #[test]
    fn encoded_write_defaults_to_plain() {
        let mut payload = Vec::new();
        tlv(&mut payload, SendAttr::Path, b"f");
        for attr in [
            SendAttr::FileOffset,
            SendAttr::UnencodedFileLen,
            SendAttr::UnencodedLen,
            SendAttr::UnencodedOffset,
        ] {
            tlv(&mut payload, attr, &8_u64.to_le_bytes());
        }
        payload.extend_from_slice(&SendAttr::Data.raw().to_le_bytes());
        payload.extend_from_slice(b"zstd");

        let attrs = Attrs::parse(&payload, 2).expect("attrs");
        let Command::EncodedWrite(w) =
            Command::decode(SendCommand::EncodedWrite, &attrs).expect("encoded write")
        else {
            panic!("expected encoded write");
        };
        assert_eq!(w.compression, ENCODED_IO_COMPRESSION_NONE);
        assert_eq!(w.encryption, ENCODED_IO_ENCRYPTION_NONE);
        assert_eq!(w.data, b"zstd");
    }

    #[test]
    fn timespec_requires_twelve_bytes() {
        let mut ts = Vec::new();
        ts.extend_from_slice(&1_700_000_000_u64.to_le_bytes());
        ts.extend_from_slice(&5_u32.to_le_bytes());
        let mut payload = Vec::new();
        tlv(&mut payload, SendAttr::Mtime, &ts);
        tlv(&mut payload, SendAttr::Atime, &ts[..8]);
        let attrs = Attrs::parse(&payload, 1).expect("attrs");
        assert_eq!(
            attrs.timespec(SendAttr::Mtime).expect("mtime"),
            Timespec {
                sec: 1_700_000_000,
                nsec: 5
            }
        );
        assert!(attrs.timespec(SendAttr::Atime).is_err());
    }
}
