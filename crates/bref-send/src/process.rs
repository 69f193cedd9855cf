//! Replaying a stream into a [`SendOps`] table.

use std::io::Read;

use bref_error::{BrefError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::ops::SendOps;
use crate::stream::{RawCommand, SendStream};

/// Per-stream error budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Stop after this many failed commands and return the last failure.
    /// `0` never stops; failures are only counted.
    pub max_errors: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { max_errors: 1 }
    }
}

/// What happened while replaying a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub version: u32,
    /// Commands read, including failed and skipped ones.
    pub commands: u64,
    /// Commands of an unknown type, passed over.
    pub skipped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    /// Whether an `END` command was seen.
    pub ended: bool,
}

enum Step {
    Applied,
    Skipped,
    End,
}

fn process_command<O: SendOps + ?Sized>(
    raw: &RawCommand,
    version: u32,
    ops: &mut O,
) -> Result<Step> {
    let Some(command) = raw.decode(version)? else {
        warn!(offset = raw.offset, cmd = raw.cmd, "send_command_unknown");
        return Ok(Step::Skipped);
    };
    trace!(offset = raw.offset, kind = ?command.kind(), "send_command_apply");
    command.apply(ops)?;
    Ok(if matches!(command, Command::End) {
        Step::End
    } else {
        Step::Applied
    })
}

/// Decode every command of `reader` and hand it to `ops`, until `END`, the
/// end of input, or the error budget runs out.
///
/// Framing failures (bad header, truncated command, checksum mismatch) end
/// the stream with an error regardless of the budget. Attribute errors and
/// failed operations are counted against [`StreamOptions::max_errors`]; if
/// any occurred, the last one is returned once the stream is done.
pub fn process_send_stream<R, O>(reader: R, ops: &mut O, opts: &StreamOptions) -> Result<StreamSummary>
where
    R: Read,
    O: SendOps + ?Sized,
{
    match replay(reader, ops, opts)? {
        (_, Some(last)) => Err(last),
        (summary, None) => Ok(summary),
    }
}

/// Like [`process_send_stream`], but failed commands within the budget only
/// show up in the returned [`StreamSummary`].
pub fn replay_send_stream<R, O>(reader: R, ops: &mut O, opts: &StreamOptions) -> Result<StreamSummary>
where
    R: Read,
    O: SendOps + ?Sized,
{
    replay(reader, ops, opts).map(|(summary, _)| summary)
}

fn replay<R, O>(
    reader: R,
    ops: &mut O,
    opts: &StreamOptions,
) -> Result<(StreamSummary, Option<BrefError>)>
where
    R: Read,
    O: SendOps + ?Sized,
{
    let mut stream = SendStream::new(reader)?;
    let version = stream.version();
    debug!(version, max_errors = opts.max_errors, "send_stream_opened");
    let mut summary = StreamSummary {
        version,
        ..StreamSummary::default()
    };
    let mut last = None;

    while let Some(raw) = stream.next_command()? {
        summary.commands += 1;
        match process_command(&raw, version, ops) {
            Ok(Step::Applied) => {}
            Ok(Step::Skipped) => summary.skipped += 1,
            Ok(Step::End) => {
                summary.ended = true;
                break;
            }
            Err(err) => {
                summary.errors += 1;
                warn!(
                    offset = raw.offset,
                    cmd = raw.cmd,
                    errors = summary.errors,
                    error = %err,
                    "send_command_failed"
                );
                if opts.max_errors > 0 && summary.errors >= opts.max_errors {
                    return Err(err);
                }
                summary.last_error = Some(err.to_string());
                last = Some(err);
            }
        }
    }

    debug!(
        version,
        commands = summary.commands,
        errors = summary.errors,
        ended = summary.ended,
        bytes = stream.position(),
        "send_stream_done"
    );
    Ok((summary, last))
}

/// Decode a whole stream into its commands without applying them. Any
/// error, including an unknown command type, ends the read.
pub fn read_commands(reader: impl Read) -> Result<(u32, Vec<Command>)> {
    let mut stream = SendStream::new(reader)?;
    let version = stream.version();
    let mut commands = Vec::new();
    while let Some(raw) = stream.next_command()? {
        let command = raw.decode(version)?.ok_or_else(|| {
            BrefError::corrupt(raw.offset, format!("unknown command type {}", raw.cmd))
        })?;
        let end = matches!(command, Command::End);
        commands.push(command);
        if end {
            break;
        }
    }
    Ok((version, commands))
}
