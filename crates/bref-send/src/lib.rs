#![forbid(unsafe_code)]
//! Decoder for btrfs send streams.
//!
//! A stream is a header followed by checksummed commands whose attributes
//! are TLV encoded (see [`proto`]). [`process_send_stream`] verifies and
//! decodes each command and replays it into a caller's [`SendOps`] table,
//! tolerating failed commands up to a configurable budget.
//! [`StreamWriter`] produces streams in the same format.

mod command;
pub mod encode;
mod ops;
mod process;
pub mod proto;
mod stream;

pub use command::{Attrs, CloneRange, Command, EnableVerity, EncodedWrite, Timespec};
pub use encode::{CommandBuilder, StreamWriter};
pub use ops::SendOps;
pub use process::{
    StreamOptions, StreamSummary, process_send_stream, read_commands, replay_send_stream,
};
pub use proto::{SEND_STREAM_VERSION, SendAttr, SendCommand};
pub use stream::{RawCommand, SendStream};
