//! Framing: stream header, command headers and checksums.

use std::io::{ErrorKind, Read};

use bref_error::{BrefError, Result};
use bref_types::{ParseError, read_le_u16, read_le_u32, u64_to_usize, usize_to_u64};
use tracing::trace;

use crate::command::{Attrs, Command};
use crate::proto::{
    CMD_CRC_OFFSET, CMD_HEADER_SIZE, STREAM_HEADER_SIZE, SendCommand, command_crc,
    decode_stream_header,
};

/// Payloads are read in pieces of at most this size, so a corrupt length
/// field costs no more memory than the input actually holds.
const PAYLOAD_CHUNK: usize = 1 << 20;

/// How much of a buffer a read filled.
enum Fill {
    Full,
    /// End of input before the first byte.
    Eof,
    /// End of input after this many bytes.
    Short(usize),
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<Fill> {
    let mut pos = 0;
    while pos < buf.len() {
        match reader.read(&mut buf[pos..]) {
            Ok(0) if pos == 0 => return Ok(Fill::Eof),
            Ok(0) => return Ok(Fill::Short(pos)),
            Ok(n) => pos += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(BrefError::Io(e)),
        }
    }
    Ok(Fill::Full)
}

/// One checksummed command, not yet split into attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub cmd: u16,
    /// Byte offset of the command header in the stream.
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl RawCommand {
    fn parse_error(&self, err: &ParseError) -> BrefError {
        BrefError::corrupt(
            self.offset,
            format!("command {} at stream offset {}: {err}", self.cmd, self.offset),
        )
    }

    /// Split the payload into attributes.
    pub fn attrs(&self, version: u32) -> Result<Attrs<'_>> {
        Attrs::parse(&self.payload, version).map_err(|e| self.parse_error(&e))
    }

    /// Decode into a typed command; `None` for a command type this decoder
    /// does not know.
    pub fn decode(&self, version: u32) -> Result<Option<Command>> {
        let Some(cmd) = SendCommand::from_raw(self.cmd) else {
            return Ok(None);
        };
        let attrs = self.attrs(version)?;
        Command::decode(cmd, &attrs)
            .map(Some)
            .map_err(|e| self.parse_error(&e))
    }
}

/// Reads commands off a send stream, verifying each checksum.
#[derive(Debug)]
pub struct SendStream<R> {
    reader: R,
    version: u32,
    pos: u64,
}

impl<R: Read> SendStream<R> {
    /// Read and check the stream header. An input with no bytes at all is
    /// `NoData`.
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = [0_u8; STREAM_HEADER_SIZE];
        match read_full(&mut reader, &mut header)? {
            Fill::Full => {}
            Fill::Eof => return Err(BrefError::NoData),
            Fill::Short(n) => {
                return Err(BrefError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("short send stream header: {n} of {STREAM_HEADER_SIZE} bytes"),
                )));
            }
        }
        let version = decode_stream_header(&header)?;
        Ok(Self {
            reader,
            version,
            pos: usize_to_u64(STREAM_HEADER_SIZE),
        })
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read the next command. `None` at a clean end of input between
    /// commands; a truncated command or a checksum mismatch is corruption.
    pub fn next_command(&mut self) -> Result<Option<RawCommand>> {
        let offset = self.pos;
        let mut header = [0_u8; CMD_HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            Fill::Full => {}
            Fill::Eof => return Ok(None),
            Fill::Short(_) => {
                return Err(BrefError::corrupt(offset, "truncated command header"));
            }
        }
        let field = |e: ParseError| BrefError::corrupt(offset, e.to_string());
        let len = read_le_u32(&header, 0).map_err(field)?;
        let cmd = read_le_u16(&header, 4).map_err(field)?;
        let stored = read_le_u32(&header, CMD_CRC_OFFSET).map_err(field)?;

        let len = u64_to_usize(u64::from(len), "cmd_len").map_err(field)?;
        let mut payload = Vec::new();
        while payload.len() < len {
            let start = payload.len();
            let chunk = (len - start).min(PAYLOAD_CHUNK);
            payload
                .try_reserve_exact(chunk)
                .map_err(|_| BrefError::OutOfMemory)?;
            payload.resize(start + chunk, 0);
            match read_full(&mut self.reader, &mut payload[start..])? {
                Fill::Full => {}
                Fill::Eof | Fill::Short(_) => {
                    return Err(BrefError::corrupt(offset, "truncated command payload"));
                }
            }
        }

        let computed = command_crc(&header, &payload);
        if stored != computed {
            return Err(BrefError::corrupt(
                offset,
                format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            ));
        }
        self.pos += usize_to_u64(CMD_HEADER_SIZE + len);
        trace!(offset, cmd, len, "send_command_read");
        Ok(Some(RawCommand {
            cmd,
            offset,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::encode_stream_header;

    #[test]
    fn empty_input_is_no_data() {
        let err = SendStream::new(&[0_u8; 0][..]).expect_err("empty");
        assert!(matches!(err, BrefError::NoData), "expected NoData, got: {err:?}");
    }

    #[test]
    fn short_header_is_io_error() {
        let header = encode_stream_header(1);
        let err = SendStream::new(&header[..10]).expect_err("short");
        assert!(matches!(err, BrefError::Io(_)), "expected Io, got: {err:?}");
    }

    #[test]
    fn header_only_stream_has_no_commands() {
        let header = encode_stream_header(2);
        let mut stream = SendStream::new(&header[..]).expect("open");
        assert_eq!(stream.version(), 2);
        assert_eq!(stream.position(), 17);
        assert_eq!(stream.next_command().expect("read"), None);
    }

    #[test]
    fn truncated_command_header_is_corruption() {
        let mut bytes = encode_stream_header(1).to_vec();
        bytes.extend_from_slice(&[1, 0, 0]);
        let mut stream = SendStream::new(&bytes[..]).expect("open");
        let err = stream.next_command().expect_err("short header");
        assert!(
            matches!(err, BrefError::Corruption { block: 17, .. }),
            "expected Corruption at 17, got: {err:?}"
        );
    }
}
