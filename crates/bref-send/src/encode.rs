//! Producing send streams: a TLV command builder and a stream writer.

use std::io::Write;

use bref_error::{BrefError, Result};

use crate::command::{Command, Timespec};
use crate::proto::{
    CMD_CRC_OFFSET, CMD_HEADER_SIZE, SendAttr, SendCommand, command_crc, encode_stream_header,
};

/// Accumulates the attributes of one command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    cmd: u16,
    version: u32,
    payload: Vec<u8>,
    oversized: Option<SendAttr>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new(cmd: SendCommand, version: u32) -> Self {
        Self::raw(cmd.raw(), version)
    }

    /// A command with an arbitrary type number.
    #[must_use]
    pub fn raw(cmd: u16, version: u32) -> Self {
        Self {
            cmd,
            version,
            payload: Vec::new(),
            oversized: None,
        }
    }

    /// Append a length-prefixed attribute.
    #[must_use]
    pub fn bytes(mut self, attr: SendAttr, value: &[u8]) -> Self {
        let Ok(len) = u16::try_from(value.len()) else {
            self.oversized.get_or_insert(attr);
            return self;
        };
        self.payload.extend_from_slice(&attr.raw().to_le_bytes());
        self.payload.extend_from_slice(&len.to_le_bytes());
        self.payload.extend_from_slice(value);
        self
    }

    #[must_use]
    pub fn u8(self, attr: SendAttr, value: u8) -> Self {
        self.bytes(attr, &[value])
    }

    #[must_use]
    pub fn u32(self, attr: SendAttr, value: u32) -> Self {
        self.bytes(attr, &value.to_le_bytes())
    }

    #[must_use]
    pub fn u64(self, attr: SendAttr, value: u64) -> Self {
        self.bytes(attr, &value.to_le_bytes())
    }

    #[must_use]
    pub fn timespec(self, attr: SendAttr, ts: &Timespec) -> Self {
        let mut raw = [0_u8; 12];
        raw[..8].copy_from_slice(&ts.sec.to_le_bytes());
        raw[8..].copy_from_slice(&ts.nsec.to_le_bytes());
        self.bytes(attr, &raw)
    }

    /// Append the `DATA` attribute. From version 2 on it carries no length
    /// and must be the last attribute.
    #[must_use]
    pub fn data(mut self, value: &[u8]) -> Self {
        if self.version < 2 {
            return self.bytes(SendAttr::Data, value);
        }
        self.payload
            .extend_from_slice(&SendAttr::Data.raw().to_le_bytes());
        self.payload.extend_from_slice(value);
        self
    }

    /// Frame the command: header with length, type and checksum, then the
    /// attributes.
    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some(attr) = self.oversized {
            return Err(BrefError::InvalidArgument(format!(
                "attribute {} longer than {} bytes",
                attr.name(),
                u16::MAX
            )));
        }
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            BrefError::InvalidArgument("command payload exceeds u32".to_owned())
        })?;
        let mut header = [0_u8; CMD_HEADER_SIZE];
        header[0..4].copy_from_slice(&len.to_le_bytes());
        header[4..6].copy_from_slice(&self.cmd.to_le_bytes());
        let crc = command_crc(&header, &self.payload);
        header[CMD_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());

        let mut out = Vec::with_capacity(CMD_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

impl Command {
    /// Encode as a framed command for a stream of `version`.
    pub fn encode(&self, version: u32) -> Result<Vec<u8>> {
        use SendAttr as A;
        let b = CommandBuilder::new(self.kind(), version);
        let b = match self {
            Self::Subvol {
                path,
                uuid,
                ctransid,
            } => b
                .bytes(A::Path, path)
                .bytes(A::Uuid, uuid)
                .u64(A::Ctransid, *ctransid),
            Self::Snapshot {
                path,
                uuid,
                ctransid,
                clone_uuid,
                clone_ctransid,
            } => b
                .bytes(A::Path, path)
                .bytes(A::Uuid, uuid)
                .u64(A::Ctransid, *ctransid)
                .bytes(A::CloneUuid, clone_uuid)
                .u64(A::CloneCtransid, *clone_ctransid),
            Self::Mkfile { path, ino }
            | Self::Mkdir { path, ino }
            | Self::Mkfifo { path, ino }
            | Self::Mksock { path, ino } => b.bytes(A::Path, path).u64(A::Ino, *ino),
            Self::Mknod {
                path,
                ino,
                mode,
                rdev,
            } => b
                .bytes(A::Path, path)
                .u64(A::Ino, *ino)
                .u64(A::Mode, *mode)
                .u64(A::Rdev, *rdev),
            Self::Symlink { path, ino, target } => b
                .bytes(A::Path, path)
                .u64(A::Ino, *ino)
                .bytes(A::PathLink, target),
            Self::Rename { from, to } => b.bytes(A::Path, from).bytes(A::PathTo, to),
            Self::Link { path, target } => b.bytes(A::Path, path).bytes(A::PathLink, target),
            Self::Unlink { path } | Self::Rmdir { path } => b.bytes(A::Path, path),
            Self::Write { path, offset, data } => b
                .bytes(A::Path, path)
                .u64(A::FileOffset, *offset)
                .data(data),
            Self::EncodedWrite(w) => b
                .bytes(A::Path, &w.path)
                .u64(A::FileOffset, w.offset)
                .u64(A::UnencodedFileLen, w.unencoded_file_len)
                .u64(A::UnencodedLen, w.unencoded_len)
                .u64(A::UnencodedOffset, w.unencoded_offset)
                .u32(A::Compression, w.compression)
                .u32(A::Encryption, w.encryption)
                .data(&w.data),
            Self::Clone(c) => b
                .bytes(A::Path, &c.path)
                .u64(A::FileOffset, c.offset)
                .u64(A::CloneLen, c.len)
                .bytes(A::CloneUuid, &c.clone_uuid)
                .u64(A::CloneCtransid, c.clone_ctransid)
                .bytes(A::ClonePath, &c.clone_path)
                .u64(A::CloneOffset, c.clone_offset),
            Self::SetXattr { path, name, data } => b
                .bytes(A::Path, path)
                .bytes(A::XattrName, name)
                .bytes(A::XattrData, data),
            Self::RemoveXattr { path, name } => {
                b.bytes(A::Path, path).bytes(A::XattrName, name)
            }
            Self::Truncate { path, size } => b.bytes(A::Path, path).u64(A::Size, *size),
            Self::Chmod { path, mode } => b.bytes(A::Path, path).u64(A::Mode, *mode),
            Self::Chown { path, uid, gid } => b
                .bytes(A::Path, path)
                .u64(A::Uid, *uid)
                .u64(A::Gid, *gid),
            Self::Utimes {
                path,
                atime,
                mtime,
                ctime,
            } => b
                .bytes(A::Path, path)
                .timespec(A::Atime, atime)
                .timespec(A::Mtime, mtime)
                .timespec(A::Ctime, ctime),
            Self::UpdateExtent { path, offset, len } => b
                .bytes(A::Path, path)
                .u64(A::FileOffset, *offset)
                .u64(A::Size, *len),
            Self::Fallocate {
                path,
                mode,
                offset,
                len,
            } => b
                .bytes(A::Path, path)
                .u32(A::FallocateMode, *mode)
                .u64(A::FileOffset, *offset)
                .u64(A::Size, *len),
            Self::Fileattr { path, attr } => b.bytes(A::Path, path).u64(A::Fileattr, *attr),
            Self::EnableVerity(v) => b
                .bytes(A::Path, &v.path)
                .u8(A::VerityAlgorithm, v.algorithm)
                .u32(A::VerityBlockSize, v.block_size)
                .bytes(A::VeritySaltData, &v.salt)
                .bytes(A::VeritySigData, &v.sig),
            Self::End => b,
        };
        b.finish()
    }
}

/// Writes a stream header followed by framed commands.
#[derive(Debug)]
pub struct StreamWriter<W> {
    writer: W,
    version: u32,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(mut writer: W, version: u32) -> Result<Self> {
        writer.write_all(&encode_stream_header(version))?;
        Ok(Self { writer, version })
    }

    pub fn write_command(&mut self, command: &Command) -> Result<()> {
        let framed = command.encode(self.version)?;
        self.writer.write_all(&framed)?;
        Ok(())
    }

    /// Write pre-framed bytes as they are.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_attribute_is_rejected() {
        let long = vec![b'x'; usize::from(u16::MAX) + 1];
        let err = CommandBuilder::new(SendCommand::Unlink, 1)
            .bytes(SendAttr::Path, &long)
            .finish()
            .expect_err("too long");
        assert!(
            matches!(err, BrefError::InvalidArgument(_)),
            "expected InvalidArgument, got: {err:?}"
        );
    }

    #[test]
    fn v1_data_is_length_prefixed() {
        let framed = CommandBuilder::new(SendCommand::Write, 1)
            .data(b"abc")
            .finish()
            .expect("frame");
        assert_eq!(framed.len(), CMD_HEADER_SIZE + 2 + 2 + 3);
        let framed = CommandBuilder::new(SendCommand::Write, 2)
            .data(b"abc")
            .finish()
            .expect("frame");
        assert_eq!(framed.len(), CMD_HEADER_SIZE + 2 + 3);
    }

    #[test]
    fn large_v2_write_exceeds_tlv_limit() {
        let data = vec![7_u8; 100_000];
        let cmd = Command::Write {
            path: b"big".to_vec(),
            offset: 0,
            data,
        };
        assert!(cmd.encode(2).is_ok());
        let err = cmd.encode(1).expect_err("v1 limit");
        assert!(
            matches!(err, BrefError::InvalidArgument(_)),
            "expected InvalidArgument, got: {err:?}"
        );
    }
}
