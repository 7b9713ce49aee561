//! The safe per-file rewrite protocol
//!
//! A rewrite buffers the whole file, truncates it, and writes the same
//! bytes back so ZFS re-stores them under the dataset's (temporarily
//! switched) compression codec. Every failure path funnels through the
//! same cleanup: timestamps and mode bits restored, the dataset hold
//! released, and the transient backup removed unless it is the only
//! surviving copy of content whose rewrite failed.
//!
//! In test mode (`-T test`) the file is opened read-only, nothing is
//! written, and no marker is set.

use crate::config::RewriteConfig;
use crate::dataset::DatasetState;
use crate::error::{IoResultExt, Result, ZfsRecompError};
use crate::fs::{marker, StatSnapshot};
use crate::signals;
use filetime::FileTime;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Outcome of a rewrite attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// The file was rewritten (or fully exercised in test mode)
    Rewritten,
    /// The file was skipped before any modification
    Skipped,
}

/// Rewrites single files according to one run's configuration.
pub struct FileRewriter<'a> {
    config: &'a RewriteConfig,
    io_lock: Option<&'a Mutex<()>>,
    worker_id: usize,
}

/// Cleanup obligations accumulated while a rewrite progresses.
///
/// Dropping the guard performs them, so every exit from the protocol
/// -- success, error return, even a panic in a worker -- converges on
/// the same restoration.
struct CleanupGuard<'a> {
    path: &'a Path,
    dataset: &'a DatasetState,
    testing: bool,
    atime: FileTime,
    mtime: FileTime,
    restore_mode: Option<u32>,
    acquired: bool,
    backup: Option<PathBuf>,
    keep_backup: bool,
}

impl<'a> CleanupGuard<'a> {
    fn new(path: &'a Path, dataset: &'a DatasetState, testing: bool, snap: &StatSnapshot) -> Self {
        CleanupGuard {
            path,
            dataset,
            testing,
            atime: snap.atime(),
            mtime: snap.mtime(),
            restore_mode: None,
            acquired: false,
            backup: None,
            keep_backup: false,
        }
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.testing {
            if let Err(e) = filetime::set_file_times(self.path, self.atime, self.mtime) {
                tracing::debug!(
                    "could not restore times on '{}': {}",
                    self.path.display(),
                    e
                );
            }
            if let Some(mode) = self.restore_mode {
                let _ =
                    std::fs::set_permissions(self.path, Permissions::from_mode(mode & 0o7777));
            }
        }
        if self.acquired {
            if let Err(e) = self.dataset.release() {
                tracing::warn!(
                    "could not restore compression on '{}': {}",
                    self.dataset.name(),
                    e
                );
            }
        }
        if let Some(backup) = self.backup.take() {
            if self.keep_backup {
                tracing::info!("a backup is available as {}", backup.display());
            } else {
                let _ = std::fs::remove_file(&backup);
            }
        }
    }
}

impl<'a> FileRewriter<'a> {
    /// Create a rewriter for one worker.
    pub fn new(
        config: &'a RewriteConfig,
        io_lock: Option<&'a Mutex<()>>,
        worker_id: usize,
    ) -> Self {
        FileRewriter {
            config,
            io_lock,
            worker_id,
        }
    }

    /// Rewrite one file in place.
    ///
    /// `snapshot` is refreshed after the rewrite so the caller sees the
    /// resulting on-disk size. The file's mtime, atime and mode are
    /// preserved across the operation.
    pub fn rewrite(
        &self,
        path: &Path,
        snapshot: &mut StatSnapshot,
        dataset: &DatasetState,
    ) -> Result<RewriteOutcome> {
        if signals::quit_requested() || dataset.is_read_only() {
            return Ok(RewriteOutcome::Skipped);
        }

        let testing = self.config.target.is_test();
        let filesize = snapshot.size;
        // the marker records the mtime the file goes back to
        let orig_mtime_sec = snapshot.mtime_sec;
        let orig_mtime_usec = snapshot.mtime_usec();
        let mut guard = CleanupGuard::new(path, dataset, testing, snapshot);

        // the owner needs read and write access for the duration
        if !testing {
            let orig_mode = snapshot.mode;
            let widened = orig_mode | libc::S_IWUSR | libc::S_IRUSR;
            if widened != orig_mode {
                std::fs::set_permissions(path, Permissions::from_mode(widened & 0o7777))
                    .with_path(path)?;
                *snapshot = StatSnapshot::capture(path, self.config.follow_symlinks)?;
                guard.restore_mode = Some(orig_mode);
            }
        }

        // exclusive lock for the whole rewrite; read-only in test mode
        let mut file = OpenOptions::new()
            .read(true)
            .write(!testing)
            .open(path)
            .with_path(path)?;
        flock_exclusive(&file, path)?;
        advise_sequential(&file);

        let mut buf = vec![0u8; filesize as usize];
        file.read_exact(&mut buf).with_path(path)?;

        if self.config.backup {
            guard.backup = Some(self.write_backup(path, &buf, snapshot)?);
        }

        let _io_guard = self
            .io_lock
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()));

        // just-in-time codec change; release is owed from here on
        guard.acquired = true;
        if let Err(e) = dataset.acquire(&self.config.target.to_string()) {
            tracing::warn!("{}", e);
            return Err(e);
        }

        if !testing {
            if let Err(e) = truncate_and_write(&mut file, &buf, path) {
                guard.keep_backup = guard.backup.is_some();
                self.classify_write_error(&e, dataset);
                return Err(e);
            }
        }

        // drop the lock before the verification pass reopens the file
        drop(file);

        if !testing && (self.config.verbose > 0 || self.config.target.is_off()) {
            if let Err(e) = dataset.sync_pool() {
                tracing::warn!("{}", e);
            }
        }

        *snapshot = StatSnapshot::capture(path, self.config.follow_symlinks)?;

        if self.config.verify && !testing {
            if let Err(e) = verify_contents(path, &buf, filesize) {
                tracing::warn!(
                    "{}: rewrite check failed ({}), trying to rewrite a second time",
                    path.display(),
                    e
                );
                if let Err(e2) = rewrite_once_more(path, &buf) {
                    guard.keep_backup = guard.backup.is_some();
                    self.classify_write_error(&e2, dataset);
                    return Err(e2);
                }
            }
        }

        if !testing {
            marker::write_marker(
                path,
                &self.config.target.to_string(),
                orig_mtime_sec,
                orig_mtime_usec,
            )?;
        }

        Ok(RewriteOutcome::Rewritten)
    }

    /// Copy the buffered contents into a uniquely named file in the
    /// temp directory, preserving times and mode so the backup can
    /// stand in for the original.
    fn write_backup(&self, path: &Path, buf: &[u8], snap: &StatSnapshot) -> Result<PathBuf> {
        let mut base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        base.truncate(992);

        let tmp = tempfile::Builder::new()
            .prefix(&format!(
                "zfsrecomp.{}.{}.",
                std::process::id(),
                self.worker_id
            ))
            .suffix(&format!(".{}", base))
            .tempfile_in(std::env::temp_dir())
            .with_path(path)?;
        tmp.as_file().write_all(buf).with_path(tmp.path())?;

        let (file, backup_path) = tmp
            .keep()
            .map_err(|e| ZfsRecompError::io(path, e.error))?;
        drop(file);

        let _ = filetime::set_file_times(&backup_path, snap.atime(), snap.mtime());
        let _ = std::fs::set_permissions(
            &backup_path,
            Permissions::from_mode(snap.mode & 0o7777),
        );
        Ok(backup_path)
    }

    /// Latch the dataset read-only when the error says the device is
    /// out of space, over quota, or failing.
    fn classify_write_error(&self, error: &ZfsRecompError, dataset: &DatasetState) {
        if let Some(errno) = error.errno() {
            if matches!(errno, libc::EIO | libc::EDQUOT | libc::ENOSPC)
                && dataset.mark_read_only()
            {
                tracing::warn!(
                    "cancelling any future file rewrites on dataset '{}'",
                    dataset.name()
                );
            }
        }
    }
}

fn flock_exclusive(file: &File, path: &Path) -> Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
        return Err(ZfsRecompError::io(path, std::io::Error::last_os_error()));
    }
    Ok(())
}

fn advise_sequential(file: &File) {
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

fn truncate_and_write(file: &mut File, buf: &[u8], path: &Path) -> Result<()> {
    file.set_len(0).with_path(path)?;
    file.seek(SeekFrom::Start(0)).with_path(path)?;
    file.write_all(buf).with_path(path)?;
    Ok(())
}

/// Re-read the file and compare it byte for byte with the buffer.
fn verify_contents(path: &Path, expected: &[u8], expected_size: u64) -> Result<()> {
    let file = File::open(path).with_path(path)?;
    flock_exclusive(&file, path)?;

    let meta = file.metadata().with_path(path)?;
    if meta.len() != expected_size {
        return Err(ZfsRecompError::VerifyFailed(path.to_path_buf()));
    }

    let map = unsafe { memmap2::Mmap::map(&file) }.with_path(path)?;
    let _ = map.advise(memmap2::Advice::Sequential);
    if map[..] != expected[..] {
        return Err(ZfsRecompError::VerifyFailed(path.to_path_buf()));
    }
    Ok(())
}

/// One-shot recovery: write the buffer again through a fresh
/// truncating open.
fn rewrite_once_more(path: &Path, buf: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .with_path(path)?;
    file.write_all(buf).with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, Codec};
    use crate::dataset::testutil::RecordingAdmin;
    use crate::dataset::DatasetProps;
    use clap::Parser;
    use std::os::unix::fs::MetadataExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(target: Codec) -> RewriteConfig {
        let args = CliArgs::parse_from(["zfsrecomp", "-c", "/tank"]);
        let mut config = RewriteConfig::from_cli(&args).unwrap();
        config.target = target;
        config
    }

    fn dataset(admin: Arc<RecordingAdmin>, compression: &str) -> DatasetState {
        DatasetState::new(
            DatasetProps {
                name: "tank/data".to_string(),
                compression: compression.to_string(),
                sync: "standard".to_string(),
            },
            admin,
            true,
        )
    }

    fn test_file(dir: &TempDir, contents: &[u8]) -> (PathBuf, StatSnapshot) {
        let path = dir.path().join("victim.bin");
        std::fs::write(&path, contents).unwrap();
        let snap = StatSnapshot::capture(&path, false).unwrap();
        (path, snap)
    }

    #[test]
    fn test_happy_path_preserves_content_and_metadata() {
        let dir = TempDir::new().unwrap();
        let contents: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        let (path, mut snap) = test_file(&dir, &contents);
        let before = snap;

        let admin = Arc::new(RecordingAdmin::default());
        let ds = dataset(admin.clone(), "lz4");
        let cfg = config(Codec::GzipLevel(6));
        let rewriter = FileRewriter::new(&cfg, None, 0);

        let outcome = rewriter.rewrite(&path, &mut snap, &ds).unwrap();
        assert_eq!(outcome, RewriteOutcome::Rewritten);

        assert_eq!(std::fs::read(&path).unwrap(), contents);
        let after = std::fs::metadata(&path).unwrap();
        assert_eq!(after.mtime(), before.mtime_sec);
        assert_eq!(after.mode(), before.mode);

        // codec switched in and back out (quick reset)
        assert_eq!(
            admin.compression_log(),
            vec![
                ("tank/data".to_string(), "gzip-6".to_string()),
                ("tank/data".to_string(), "lz4".to_string()),
            ]
        );
        assert_eq!(ds.refcount(), 0);
    }

    #[test]
    fn test_test_mode_never_writes() {
        let dir = TempDir::new().unwrap();
        let (path, mut snap) = test_file(&dir, b"do not touch");
        let mtime_before = std::fs::metadata(&path).unwrap().mtime();

        let admin = Arc::new(RecordingAdmin::default());
        let ds = dataset(admin.clone(), "lz4");
        let cfg = config(Codec::Test);
        let rewriter = FileRewriter::new(&cfg, None, 0);

        rewriter.rewrite(&path, &mut snap, &ds).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"do not touch");
        assert_eq!(std::fs::metadata(&path).unwrap().mtime(), mtime_before);
        // the codec still cycles, through whatever admin is configured
        assert_eq!(admin.compression_log().len(), 2);
    }

    #[test]
    fn test_read_only_dataset_skips() {
        let dir = TempDir::new().unwrap();
        let (path, mut snap) = test_file(&dir, b"data");

        let admin = Arc::new(RecordingAdmin::default());
        let ds = dataset(admin.clone(), "lz4");
        ds.mark_read_only();
        let cfg = config(Codec::Lz4);
        let rewriter = FileRewriter::new(&cfg, None, 0);

        let outcome = rewriter.rewrite(&path, &mut snap, &ds).unwrap();
        assert_eq!(outcome, RewriteOutcome::Skipped);
        assert!(admin.compression_log().is_empty());
    }

    #[test]
    fn test_admin_failure_aborts_but_releases() {
        let dir = TempDir::new().unwrap();
        let (path, mut snap) = test_file(&dir, b"data");

        let admin = Arc::new(RecordingAdmin::default());
        admin.fail_set.store(true, std::sync::atomic::Ordering::SeqCst);
        let ds = dataset(admin.clone(), "lz4");
        let cfg = config(Codec::GzipLevel(1));
        let rewriter = FileRewriter::new(&cfg, None, 0);

        assert!(rewriter.rewrite(&path, &mut snap, &ds).is_err());
        assert_eq!(ds.refcount(), 0);
        // nothing was written
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn test_backup_created_and_removed_on_success() {
        let dir = TempDir::new().unwrap();
        let contents = vec![0x5Au8; 4096];
        let (path, mut snap) = test_file(&dir, &contents);

        let admin = Arc::new(RecordingAdmin::default());
        let ds = dataset(admin, "lz4");
        let mut cfg = config(Codec::GzipLevel(6));
        cfg.backup = true;
        let rewriter = FileRewriter::new(&cfg, None, 3);

        rewriter.rewrite(&path, &mut snap, &ds).unwrap();

        // a successful rewrite leaves no backup behind
        let prefix = format!("zfsrecomp.{}.3.", std::process::id());
        let leftovers: Vec<_> = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_widened_mode_is_restored() {
        let dir = TempDir::new().unwrap();
        let (path, mut snap) = test_file(&dir, b"locked down");
        std::fs::set_permissions(&path, Permissions::from_mode(0o400)).unwrap();
        snap = StatSnapshot::capture(&path, false).unwrap();

        let admin = Arc::new(RecordingAdmin::default());
        let ds = dataset(admin, "lz4");
        let cfg = config(Codec::GzipLevel(6));
        let rewriter = FileRewriter::new(&cfg, None, 0);

        rewriter.rewrite(&path, &mut snap, &ds).unwrap();

        let mode = std::fs::metadata(&path).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o400);
        assert_eq!(std::fs::read(&path).unwrap(), b"locked down");
    }

    #[test]
    fn test_exclusive_io_lock_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let (path, mut snap) = test_file(&dir, b"serialized");

        let admin = Arc::new(RecordingAdmin::default());
        let ds = dataset(admin, "lz4");
        let cfg = config(Codec::GzipLevel(6));
        let io_lock = Mutex::new(());
        let rewriter = FileRewriter::new(&cfg, Some(&io_lock), 0);

        rewriter.rewrite(&path, &mut snap, &ds).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"serialized");
        // the lock is free again afterwards
        assert!(io_lock.try_lock().is_ok());
    }

    #[test]
    fn test_snapshot_refreshed_after_rewrite() {
        let dir = TempDir::new().unwrap();
        let contents = vec![1u8; 8192];
        let (path, mut snap) = test_file(&dir, &contents);

        let admin = Arc::new(RecordingAdmin::default());
        let ds = dataset(admin, "lz4");
        let cfg = config(Codec::GzipLevel(6));
        let rewriter = FileRewriter::new(&cfg, None, 0);

        rewriter.rewrite(&path, &mut snap, &ds).unwrap();
        assert_eq!(snap.size, 8192);
        assert!(snap.is_regular());
    }
}
