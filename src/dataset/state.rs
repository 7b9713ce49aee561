//! Per-dataset compression state
//!
//! One [`DatasetState`] exists per dataset touched by a run. Workers
//! call [`DatasetState::acquire`] before rewriting a file on the
//! dataset and [`DatasetState::release`] afterwards; the state keeps a
//! refcount so the `compression` property is changed once on the way
//! in and restored once on the way out, no matter how many rewrites
//! overlap. Codec values are carried as strings because `zfs list`
//! may report settings outside the supported target set.

use crate::dataset::admin::DatasetAdmin;
use crate::dataset::DatasetProps;
use crate::error::Result;
use crate::signals;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Refcounted compression state of one ZFS dataset.
pub struct DatasetState {
    name: String,
    pool: String,
    original_codec: String,
    original_sync: String,
    current_codec: Mutex<String>,
    refcount: AtomicU32,
    shunted_increases: AtomicU64,
    shunted_decreases: AtomicU64,
    read_only: AtomicBool,
    restore_on_idle: bool,
    admin: Arc<dyn DatasetAdmin>,
}

impl DatasetState {
    /// Build the state for a freshly looked-up dataset.
    ///
    /// With `restore_on_idle` (quick-reset mode) the original codec is
    /// put back every time the refcount drops to zero; otherwise
    /// restoration waits for the registry's final sweep.
    pub fn new(props: DatasetProps, admin: Arc<dyn DatasetAdmin>, restore_on_idle: bool) -> Self {
        let pool = props
            .name
            .split('/')
            .next()
            .unwrap_or(props.name.as_str())
            .to_string();
        DatasetState {
            pool,
            original_codec: props.compression.clone(),
            original_sync: props.sync,
            current_codec: Mutex::new(props.compression),
            name: props.name,
            refcount: AtomicU32::new(0),
            shunted_increases: AtomicU64::new(0),
            shunted_decreases: AtomicU64::new(0),
            read_only: AtomicBool::new(false),
            restore_on_idle,
            admin,
        }
    }

    /// Dataset name, e.g. `tank/home`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the pool the dataset lives in.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// The compression codec the dataset had when first observed.
    pub fn original_codec(&self) -> &str {
        &self.original_codec
    }

    /// The `sync` property the dataset had when first observed.
    pub fn original_sync(&self) -> &str {
        &self.original_sync
    }

    /// The codec currently set on the dataset, as tracked here.
    pub fn current_codec(&self) -> String {
        self.lock_current().clone()
    }

    /// Number of rewrites currently holding the dataset.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Acquisitions that found the codec already in place.
    pub fn shunted_increases(&self) -> u64 {
        self.shunted_increases.load(Ordering::Relaxed)
    }

    /// Releases that left the codec alone.
    pub fn shunted_decreases(&self) -> u64 {
        self.shunted_decreases.load(Ordering::Relaxed)
    }

    /// Whether the dataset has been latched read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Latch the dataset read-only. Returns true only for the call
    /// that flips the latch, so the caller can log exactly once.
    pub fn mark_read_only(&self) -> bool {
        !self.read_only.swap(true, Ordering::AcqRel)
    }

    /// Register a rewrite and make sure `codec` is active.
    ///
    /// Returns `Ok(true)` when the dataset's property was actually
    /// changed, `Ok(false)` when it was already in place (or a pending
    /// quit suppressed the change). The refcount rises on every call,
    /// including the error path, so the caller must pair each
    /// `acquire` with one [`release`](Self::release).
    pub fn acquire(&self, codec: &str) -> Result<bool> {
        let mut current = self.lock_current();
        self.refcount.fetch_add(1, Ordering::AcqRel);
        let changed = self.set_codec_locked(&mut current, codec)?;
        if !changed {
            self.shunted_increases.fetch_add(1, Ordering::Relaxed);
        }
        Ok(changed)
    }

    /// Drop one rewrite's hold on the dataset.
    ///
    /// In quick-reset mode the final release restores the original
    /// codec; otherwise the decrement is all that happens and the
    /// registry sweep restores later. Returns true when a codec change
    /// occurred.
    pub fn release(&self) -> Result<bool> {
        match self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(1) if self.restore_on_idle => self.force_restore(),
            Ok(_) => {
                self.shunted_decreases.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(_) => {
                tracing::debug!("release without matching acquire on '{}'", self.name);
                Ok(false)
            }
        }
    }

    /// Put the original codec back regardless of the refcount.
    ///
    /// No-op when the dataset is already at its original codec.
    pub fn force_restore(&self) -> Result<bool> {
        let mut current = self.lock_current();
        let original = self.original_codec.clone();
        self.set_codec_locked(&mut current, &original)
    }

    /// Sync the pool the dataset lives in.
    pub fn sync_pool(&self) -> Result<()> {
        self.admin.sync_pool(&self.pool)
    }

    fn lock_current(&self) -> MutexGuard<'_, String> {
        // a poisoned lock must still let shutdown restore the codec
        self.current_codec
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Change the dataset property while the codec mutex is held.
    ///
    /// Once a quit has been requested only changes back toward the
    /// original codec go through. An admin failure leaves the tracked
    /// codec untouched.
    fn set_codec_locked(
        &self,
        current: &mut MutexGuard<'_, String>,
        new_codec: &str,
    ) -> Result<bool> {
        if current.as_str() == new_codec {
            return Ok(false);
        }
        if signals::quit_requested() && new_codec != self.original_codec {
            tracing::info!(
                "quitting - not setting new compression {} on '{}'",
                new_codec,
                self.name
            );
            return Ok(false);
        }
        self.admin.set_compression(&self.name, new_codec)?;
        tracing::debug!(
            "'{}': compression {} -> {} (refcount {})",
            self.name,
            current.as_str(),
            new_codec,
            self.refcount.load(Ordering::Relaxed)
        );
        **current = new_codec.to_string();
        Ok(true)
    }
}

impl Drop for DatasetState {
    fn drop(&mut self) {
        let current = self
            .current_codec
            .get_mut()
            .unwrap_or_else(|e| e.into_inner());
        if *current != self.original_codec {
            if let Err(e) = self
                .admin
                .set_compression(&self.name, &self.original_codec)
            {
                tracing::warn!(
                    "could not restore compression '{}' on '{}': {}",
                    self.original_codec,
                    self.name,
                    e
                );
            } else {
                *current = self.original_codec.clone();
            }
        }
    }
}

impl std::fmt::Debug for DatasetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetState")
            .field("name", &self.name)
            .field("original_codec", &self.original_codec)
            .field("current_codec", &self.current_codec())
            .field("refcount", &self.refcount())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testutil::RecordingAdmin;

    fn state_with(admin: Arc<RecordingAdmin>, quick: bool) -> DatasetState {
        DatasetState::new(
            DatasetProps {
                name: "tank/data".to_string(),
                compression: "lz4".to_string(),
                sync: "standard".to_string(),
            },
            admin,
            quick,
        )
    }

    #[test]
    fn test_acquire_changes_codec_once() {
        let admin = Arc::new(RecordingAdmin::default());
        let state = state_with(admin.clone(), true);

        assert!(state.acquire("gzip-6").unwrap());
        assert!(!state.acquire("gzip-6").unwrap());
        assert_eq!(state.refcount(), 2);
        assert_eq!(state.shunted_increases(), 1);
        assert_eq!(state.current_codec(), "gzip-6");
        assert_eq!(
            admin.compression_log(),
            vec![("tank/data".to_string(), "gzip-6".to_string())]
        );
    }

    #[test]
    fn test_quick_release_restores_at_zero() {
        let admin = Arc::new(RecordingAdmin::default());
        let state = state_with(admin.clone(), true);

        state.acquire("zle").unwrap();
        state.acquire("zle").unwrap();

        assert!(!state.release().unwrap());
        assert_eq!(state.shunted_decreases(), 1);
        assert_eq!(state.current_codec(), "zle");

        assert!(state.release().unwrap());
        assert_eq!(state.refcount(), 0);
        assert_eq!(state.current_codec(), "lz4");
        assert_eq!(
            admin.compression_log(),
            vec![
                ("tank/data".to_string(), "zle".to_string()),
                ("tank/data".to_string(), "lz4".to_string()),
            ]
        );
    }

    #[test]
    fn test_deferred_release_leaves_codec() {
        let admin = Arc::new(RecordingAdmin::default());
        let state = state_with(admin.clone(), false);

        state.acquire("zle").unwrap();
        assert!(!state.release().unwrap());
        assert_eq!(state.refcount(), 0);
        assert_eq!(state.current_codec(), "zle");

        assert!(state.force_restore().unwrap());
        assert_eq!(state.current_codec(), "lz4");
    }

    #[test]
    fn test_admin_failure_leaves_current_codec() {
        let admin = Arc::new(RecordingAdmin::default());
        admin.fail_set.store(true, Ordering::SeqCst);
        let state = state_with(admin.clone(), true);

        assert!(state.acquire("gzip-9").is_err());
        // the hold is still registered and must be released by the caller
        assert_eq!(state.refcount(), 1);
        assert_eq!(state.current_codec(), "lz4");
    }

    #[test]
    fn test_unbalanced_release_is_harmless() {
        let admin = Arc::new(RecordingAdmin::default());
        let state = state_with(admin.clone(), true);
        assert!(!state.release().unwrap());
        assert_eq!(state.refcount(), 0);
    }

    #[test]
    fn test_read_only_latch_reports_once() {
        let admin = Arc::new(RecordingAdmin::default());
        let state = state_with(admin, true);
        assert!(!state.is_read_only());
        assert!(state.mark_read_only());
        assert!(!state.mark_read_only());
        assert!(state.is_read_only());
    }

    #[test]
    fn test_drop_restores_unreleased_codec() {
        let admin = Arc::new(RecordingAdmin::default());
        {
            let state = state_with(admin.clone(), false);
            state.acquire("zle").unwrap();
            state.release().unwrap();
            // deferred mode: still at zle when the state goes away
        }
        let log = admin.compression_log();
        assert_eq!(log.last().unwrap().1, "lz4");
    }

    #[test]
    fn test_quit_refuses_new_codec_but_allows_restore() {
        let admin = Arc::new(RecordingAdmin::default());
        let state = state_with(admin.clone(), true);
        state.acquire("zle").unwrap();

        signals::request_quit();
        let acquired = state.acquire("gzip-1");
        let restored = state.force_restore();
        signals::reset_quit();

        assert!(!acquired.unwrap());
        assert!(restored.unwrap());
        assert_eq!(state.current_codec(), "lz4");
    }

    #[test]
    fn test_pool_name_is_first_component() {
        let admin = Arc::new(RecordingAdmin::default());
        let state = DatasetState::new(
            DatasetProps {
                name: "rpool/home/user".to_string(),
                compression: "on".to_string(),
                sync: "standard".to_string(),
            },
            admin,
            true,
        );
        assert_eq!(state.pool(), "rpool");
        assert_eq!(state.name(), "rpool/home/user");
        assert_eq!(state.original_sync(), "standard");
    }
}
