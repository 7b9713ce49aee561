//! Filesystem identity and capacity queries
//!
//! A thin wrapper over `statfs(2)` answering the three questions the
//! engine asks about a path: which filesystem is it on, is that
//! filesystem ZFS, and how much free space does it have.

use crate::error::{Result, ZfsRecompError};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// `f_type` reported by ZFS on Linux.
pub const ZFS_SUPER_MAGIC: u64 = 0x2FC1_2FC1;

/// Unit of `st_blocks`.
pub const DEV_BSIZE: u64 = 512;

/// Identity and capacity of the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    /// Opaque filesystem identifier, stable for the mount's lifetime
    pub fsid: u64,
    /// Whether the filesystem reports the ZFS magic
    pub is_zfs: bool,
    /// Free space in bytes
    pub free_bytes: u64,
}

impl FsInfo {
    /// Query the filesystem holding `path`.
    pub fn query(path: &Path) -> Result<FsInfo> {
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
            ZfsRecompError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            )
        })?;

        let mut sfs: libc::statfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statfs(cpath.as_ptr(), &mut sfs) } != 0 {
            return Err(ZfsRecompError::io(path, std::io::Error::last_os_error()));
        }

        // f_fsid is an opaque pair of ints; fold it into one 64-bit key
        let fsid =
            unsafe { std::ptr::read_unaligned(&sfs.f_fsid as *const libc::fsid_t as *const u64) };

        Ok(FsInfo {
            fsid,
            is_zfs: sfs.f_type as u64 == ZFS_SUPER_MAGIC,
            free_bytes: (sfs.f_bfree as u64).saturating_mul(sfs.f_bsize as u64),
        })
    }
}

/// Round `size` up to the filesystem's block granularity.
///
/// Anything below one block occupies a whole block; larger sizes round
/// up to the next block multiple.
pub fn round_to_block_size(size: u64, blksize: u64) -> u64 {
    if size == 0 || blksize == 0 {
        size
    } else if size < blksize {
        blksize
    } else {
        match size % blksize {
            0 => size,
            rem => size + (blksize - rem),
        }
    }
}
