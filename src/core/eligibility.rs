//! Rewrite eligibility
//!
//! Decides whether a file is worth handing to the rewriter, given its
//! on-disk metadata, the dataset it lives on, and the per-file marker
//! left behind by earlier runs. The marker makes repeated runs with
//! the same target cheap; its recorded mtime invalidates it whenever
//! the file has been modified since.

use crate::config::RewriteConfig;
use crate::dataset::DatasetState;
use crate::fs::{marker, round_to_block_size, FsInfo, StatSnapshot, DEV_BSIZE};
use std::path::Path;

/// Should `path` be rewritten under `config.target`?
pub fn is_rewritable(
    path: &Path,
    snapshot: &StatSnapshot,
    config: &RewriteConfig,
    dataset: &DatasetState,
    fsinfo: &FsInfo,
) -> bool {
    if !fsinfo.is_zfs {
        return false;
    }
    if !(snapshot.is_regular() || (config.follow_symlinks && snapshot.is_symlink())) {
        return false;
    }
    if snapshot.size == 0 {
        tracing::trace!("skipping empty file '{}'", path.display());
        return false;
    }
    if config.max_size > 0 && snapshot.size > config.max_size {
        tracing::trace!(
            "skipping '{}': size {} > max size {}",
            path.display(),
            snapshot.size,
            config.max_size
        );
        return false;
    }

    // Rewriting without compression cannot shrink the file, so a file
    // whose block-rounded size no longer fits would fill the dataset.
    if config.target.is_off()
        && round_to_block_size(snapshot.size, snapshot.blksize) >= fsinfo.free_bytes
    {
        tracing::warn!(
            "skipping '{}': size {} >= {} available on its dataset",
            path.display(),
            snapshot.size,
            fsinfo.free_bytes
        );
        return false;
    }

    marker_allows(
        marker::read_marker(path).as_ref(),
        snapshot,
        config,
        dataset,
    )
}

/// The marker-driven part of the decision, split out so the logic can
/// be exercised without privileged `trusted.*` attributes on disk.
fn marker_allows(
    marker: Option<&marker::Marker>,
    snapshot: &StatSnapshot,
    config: &RewriteConfig,
    dataset: &DatasetState,
) -> bool {
    let target = config.target.to_string();
    match marker {
        Some(m) => {
            m.codec != target
                || config.allow_recompress
                || m.mtime_sec != snapshot.mtime_sec
                || m.mtime_usec != snapshot.mtime_usec()
        }
        None => {
            dataset.original_codec() != target
                || config.allow_recompress
                || (config.target.is_off() && snapshot.blocks * DEV_BSIZE < snapshot.size)
        }
    }
}
