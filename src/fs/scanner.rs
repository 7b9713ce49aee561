//! Candidate-file scanning
//!
//! Walks the argument trees and yields the regular files the rewrite
//! engine should consider, together with a snapshot of their on-disk
//! metadata. Device nodes under `/dev` are pruned, and hard-linked
//! duplicates can be skipped so each inode is rewritten once.

use crate::error::{IoResultExt, Result};
use crate::fs::fsinfo::DEV_BSIZE;
use filetime::FileTime;
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Snapshot of the stat fields the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatSnapshot {
    /// Apparent size in bytes
    pub size: u64,
    /// Allocated 512-byte blocks
    pub blocks: u64,
    /// Preferred I/O block size
    pub blksize: u64,
    /// Full mode word including the file type bits
    pub mode: u32,
    /// Modification time, seconds
    pub mtime_sec: i64,
    /// Modification time, nanoseconds part
    pub mtime_nsec: i64,
    /// Access time, seconds
    pub atime_sec: i64,
    /// Access time, nanoseconds part
    pub atime_nsec: i64,
    /// Device the file lives on
    pub dev: u64,
    /// Inode number
    pub ino: u64,
    /// Hard link count
    pub nlink: u64,
}

impl StatSnapshot {
    /// Build a snapshot from already-fetched metadata.
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        StatSnapshot {
            size: meta.size(),
            blocks: meta.blocks(),
            blksize: meta.blksize(),
            mode: meta.mode(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            atime_sec: meta.atime(),
            atime_nsec: meta.atime_nsec(),
            dev: meta.dev(),
            ino: meta.ino(),
            nlink: meta.nlink(),
        }
    }

    /// Stat `path`, following the final symlink only when asked to.
    pub fn capture(path: &Path, follow_symlinks: bool) -> Result<Self> {
        let meta = if follow_symlinks {
            std::fs::metadata(path).with_path(path)?
        } else {
            std::fs::symlink_metadata(path).with_path(path)?
        };
        Ok(Self::from_metadata(&meta))
    }

    /// Regular file?
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Symbolic link?
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    /// Directory?
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Microseconds part of the mtime, as stored in the marker.
    pub fn mtime_usec(&self) -> i64 {
        self.mtime_nsec / 1000
    }

    /// Access time for `utimes`-style restoration.
    pub fn atime(&self) -> FileTime {
        FileTime::from_unix_time(self.atime_sec, self.atime_nsec as u32)
    }

    /// Modification time for `utimes`-style restoration.
    pub fn mtime(&self) -> FileTime {
        FileTime::from_unix_time(self.mtime_sec, self.mtime_nsec as u32)
    }

    /// Bytes actually allocated on disk.
    pub fn on_disk_size(&self) -> u64 {
        self.blocks * DEV_BSIZE
    }
}

/// A candidate file as produced by the scanner.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path as encountered during the walk
    pub path: PathBuf,
    /// Metadata snapshot taken at scan time
    pub snapshot: StatSnapshot,
}

/// Scanner configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanConfig {
    /// Follow symbolic links and consider their targets
    pub follow_symlinks: bool,
    /// Skip files whose inode has already been seen
    pub detect_hard_links: bool,
}

/// Directory walker feeding the work queue.
///
/// The scanner runs in the single-threaded enqueue phase, so the
/// hard-link bookkeeping needs no synchronization.
pub struct Scanner {
    config: ScanConfig,
    seen_inodes: HashSet<(u64, u64)>,
    /// Files skipped because their inode was already scheduled
    pub hard_link_files: u64,
}

impl Scanner {
    /// Create a scanner.
    pub fn new(config: ScanConfig) -> Self {
        Scanner {
            config,
            seen_inodes: HashSet::new(),
            hard_link_files: 0,
        }
    }

    /// Walk `root` and append candidate files to `out`.
    ///
    /// Traversal errors are logged and skipped so one unreadable
    /// subtree does not abort the run.
    pub fn scan_into(&mut self, root: &Path, out: &mut Vec<FileEntry>) {
        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .into_iter()
            .filter_entry(|e| !e.path().starts_with("/dev"));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("scan error under '{}': {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let snapshot =
                match StatSnapshot::capture(entry.path(), self.config.follow_symlinks) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("{}", e);
                        continue;
                    }
                };
            if self.config.detect_hard_links
                && snapshot.nlink > 1
                && !self.seen_inodes.insert((snapshot.dev, snapshot.ino))
            {
                self.hard_link_files += 1;
                continue;
            }
            out.push(FileEntry {
                path: entry.path().to_path_buf(),
                snapshot,
            });
        }
    }
}
