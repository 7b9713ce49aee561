//! Process-wide dataset registry
//!
//! Maps filesystem identifiers and paths to their [`DatasetState`].
//! The registry owns the states; workers borrow `Arc` clones for the
//! duration of a rewrite. After the worker pool has joined, `clear`
//! sweeps every touched dataset back to its original codec.

use crate::dataset::admin::{DatasetAdmin, DatasetProps};
use crate::dataset::state::DatasetState;
use crate::error::{IoResultExt, Result};
use crate::fs::{FsInfo, StatSnapshot};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Maps {
    by_fsid: HashMap<u64, Arc<DatasetState>>,
    by_path: HashMap<PathBuf, Arc<DatasetState>>,
}

/// Registry of every dataset touched by the current run.
pub struct DatasetRegistry {
    admin: Arc<dyn DatasetAdmin>,
    restore_on_idle: bool,
    maps: Mutex<Maps>,
}

impl DatasetRegistry {
    /// Create an empty registry.
    ///
    /// `restore_on_idle` is handed to every state constructed here;
    /// it selects quick-reset behavior for the whole run.
    pub fn new(admin: Arc<dyn DatasetAdmin>, restore_on_idle: bool) -> Self {
        DatasetRegistry {
            admin,
            restore_on_idle,
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Resolve the dataset state for `path`, creating it on first
    /// contact with a filesystem.
    ///
    /// Returns `None` for paths the engine must leave alone: non-ZFS
    /// filesystems, non-regular files (symlinks count as regular only
    /// when `follow_symlinks` is set), and paths `zfs list` cannot
    /// attribute to a dataset.
    pub fn dataset_for(
        &self,
        path: &Path,
        snapshot: &StatSnapshot,
        fsinfo: &FsInfo,
        follow_symlinks: bool,
    ) -> Result<Option<Arc<DatasetState>>> {
        if !fsinfo.is_zfs {
            return Ok(None);
        }
        if !(snapshot.is_regular() || (follow_symlinks && snapshot.is_symlink())) {
            return Ok(None);
        }

        {
            let mut maps = self.lock();
            if let Some(state) = maps.by_path.get(path) {
                return Ok(Some(state.clone()));
            }
            if let Some(state) = maps.by_fsid.get(&fsinfo.fsid).cloned() {
                maps.by_path.insert(path.to_path_buf(), state.clone());
                return Ok(Some(state));
            }
        }

        // First contact with this filesystem. The lookup shells out and
        // may take a while, so it runs outside the registry lock; a
        // concurrent first contact is resolved at insertion below.
        let abs = std::fs::canonicalize(path).with_path(path)?;
        let props = match self.admin.lookup(&abs)? {
            Some(props) => props,
            None => return Ok(None),
        };

        let mut maps = self.lock();
        let state = match maps.by_fsid.entry(fsinfo.fsid) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                let state = self.build_state(props);
                v.insert(state.clone());
                state
            }
        };
        maps.by_path.insert(path.to_path_buf(), state.clone());
        Ok(Some(state))
    }

    fn build_state(&self, props: DatasetProps) -> Arc<DatasetState> {
        tracing::info!(
            "dataset '{}' of pool '{}' has compression '{}' and sync={}",
            props.name,
            props.name.split('/').next().unwrap_or(&props.name),
            props.compression,
            props.sync
        );
        Arc::new(DatasetState::new(
            props,
            self.admin.clone(),
            self.restore_on_idle,
        ))
    }

    /// Look up a previously associated path without side effects.
    pub fn by_path(&self, path: &Path) -> Option<Arc<DatasetState>> {
        self.lock().by_path.get(path).cloned()
    }

    /// Number of distinct datasets observed so far.
    pub fn dataset_count(&self) -> usize {
        self.lock().by_fsid.len()
    }

    /// Restore every dataset to its original codec and drop all
    /// entries. Must only run after the worker pool has joined.
    ///
    /// Read-only datasets are exempt: an earlier I/O failure means the
    /// property state over there is not worth another write attempt.
    pub fn clear(&self) {
        let mut maps = self.lock();
        for state in maps.by_fsid.values() {
            if state.is_read_only() {
                continue;
            }
            if let Err(e) = state.force_restore() {
                tracing::warn!(
                    "could not restore compression '{}' on '{}': {}",
                    state.original_codec(),
                    state.name(),
                    e
                );
            }
        }
        maps.by_path.clear();
        maps.by_fsid.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }
}
