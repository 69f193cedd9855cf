//! The operation table a decoded stream is replayed into.

use bref_error::Result;

use crate::command::{CloneRange, EncodedWrite, EnableVerity, Timespec};
use crate::proto::UUID_SIZE;

/// One method per command type. Every method defaults to accepting the
/// command and doing nothing, so implementors override only what they
/// need. Returning an error counts against the stream's error budget.
#[allow(unused_variables)]
pub trait SendOps {
    fn subvol(&mut self, path: &[u8], uuid: &[u8; UUID_SIZE], ctransid: u64) -> Result<()> {
        Ok(())
    }

    fn snapshot(
        &mut self,
        path: &[u8],
        uuid: &[u8; UUID_SIZE],
        ctransid: u64,
        clone_uuid: &[u8; UUID_SIZE],
        clone_ctransid: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn mkfile(&mut self, path: &[u8], ino: u64) -> Result<()> {
        Ok(())
    }

    fn mkdir(&mut self, path: &[u8], ino: u64) -> Result<()> {
        Ok(())
    }

    fn mknod(&mut self, path: &[u8], ino: u64, mode: u64, rdev: u64) -> Result<()> {
        Ok(())
    }

    fn mkfifo(&mut self, path: &[u8], ino: u64) -> Result<()> {
        Ok(())
    }

    fn mksock(&mut self, path: &[u8], ino: u64) -> Result<()> {
        Ok(())
    }

    fn symlink(&mut self, path: &[u8], ino: u64, target: &[u8]) -> Result<()> {
        Ok(())
    }

    fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<()> {
        Ok(())
    }

    fn link(&mut self, path: &[u8], target: &[u8]) -> Result<()> {
        Ok(())
    }

    fn unlink(&mut self, path: &[u8]) -> Result<()> {
        Ok(())
    }

    fn rmdir(&mut self, path: &[u8]) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, path: &[u8], offset: u64, data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn encoded_write(&mut self, write: &EncodedWrite) -> Result<()> {
        Ok(())
    }

    fn clone_range(&mut self, range: &CloneRange) -> Result<()> {
        Ok(())
    }

    fn set_xattr(&mut self, path: &[u8], name: &[u8], data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn remove_xattr(&mut self, path: &[u8], name: &[u8]) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, path: &[u8], size: u64) -> Result<()> {
        Ok(())
    }

    fn chmod(&mut self, path: &[u8], mode: u64) -> Result<()> {
        Ok(())
    }

    fn chown(&mut self, path: &[u8], uid: u64, gid: u64) -> Result<()> {
        Ok(())
    }

    fn utimes(
        &mut self,
        path: &[u8],
        atime: &Timespec,
        mtime: &Timespec,
        ctime: &Timespec,
    ) -> Result<()> {
        Ok(())
    }

    fn update_extent(&mut self, path: &[u8], offset: u64, len: u64) -> Result<()> {
        Ok(())
    }

    fn fallocate(&mut self, path: &[u8], mode: u32, offset: u64, len: u64) -> Result<()> {
        Ok(())
    }

    fn fileattr(&mut self, path: &[u8], attr: u64) -> Result<()> {
        Ok(())
    }

    fn enable_verity(&mut self, verity: &EnableVerity) -> Result<()> {
        Ok(())
    }

    /// The `END` command; processing stops after it.
    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

