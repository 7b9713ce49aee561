//! Dataset administration capability
//!
//! The engine talks to ZFS exclusively through the [`DatasetAdmin`]
//! trait: resolve the dataset a path belongs to, set a dataset's
//! compression property, and sync a pool. The production
//! implementation shells out to the `zfs`/`zpool` tools; the dry-run
//! implementation logs every mutating command instead of executing it.

use crate::error::{Result, ZfsRecompError};
use crate::exec::{self, RunCode};
use std::path::Path;
use std::sync::Arc;

/// Properties reported by a dataset lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetProps {
    /// Dataset name, e.g. `tank/home`
    pub name: String,
    /// Current `compression` property value
    pub compression: String,
    /// Current `sync` property value
    pub sync: String,
}

/// Administrative operations on ZFS datasets.
pub trait DatasetAdmin: Send + Sync {
    /// Resolve the dataset holding `path` along with its current
    /// compression and sync properties. `None` when the path does not
    /// belong to a dataset.
    fn lookup(&self, path: &Path) -> Result<Option<DatasetProps>>;

    /// Set the `compression` property on `dataset`. An error means the
    /// property is unchanged.
    fn set_compression(&self, dataset: &str, codec: &str) -> Result<()>;

    /// Ask the pool to sync outstanding writes.
    fn sync_pool(&self, pool: &str) -> Result<()>;
}

const LOOKUP_OUTPUT_CAP: usize = libc::PATH_MAX as usize;
const LOOKUP_TIMEOUT_MS: i32 = 250;
const SET_TIMEOUT_MS: i32 = 150;
const SYNC_TIMEOUT_MS: i32 = 10;

/// `DatasetAdmin` backed by the `zfs` and `zpool` command-line tools.
#[derive(Debug, Default)]
pub struct ZfsCliAdmin;

impl ZfsCliAdmin {
    /// Create an admin that shells out to `zfs`/`zpool` on `PATH`.
    pub fn new() -> Self {
        ZfsCliAdmin
    }
}

impl DatasetAdmin for ZfsCliAdmin {
    fn lookup(&self, path: &Path) -> Result<Option<DatasetProps>> {
        let command = format!(
            "zfs list -H -o name,compression,sync \"{}\"",
            path.display()
        );
        let outcome = exec::run(&command, true, LOOKUP_OUTPUT_CAP, LOOKUP_TIMEOUT_MS);
        match outcome.code {
            RunCode::Ok => {}
            RunCode::Fail => {
                tracing::debug!(
                    "`{}` returned {:?}: {}",
                    outcome.command,
                    outcome.exit,
                    outcome.output
                );
                return Ok(None);
            }
            RunCode::NoOutput => {
                tracing::warn!(
                    "skipping '{}': cannot obtain its dataset name",
                    path.display()
                );
                return Ok(None);
            }
            RunCode::NoStart => {
                return Err(ZfsRecompError::CommandStart {
                    command: outcome.command,
                    source: std::io::Error::last_os_error(),
                });
            }
        }

        let fields: Vec<&str> = outcome.output.split('\t').collect();
        if fields.len() != 3 {
            tracing::warn!(
                "skipping '{}': '{}' parses to {} properties",
                path.display(),
                outcome.output,
                fields.len()
            );
            return Ok(None);
        }
        Ok(Some(DatasetProps {
            name: fields[0].to_string(),
            compression: fields[1].to_string(),
            sync: fields[2].to_string(),
        }))
    }

    fn set_compression(&self, dataset: &str, codec: &str) -> Result<()> {
        let command = format!("zfs set compression={} \"{}\"", codec, dataset);
        run_mutation(&command, SET_TIMEOUT_MS)
    }

    fn sync_pool(&self, pool: &str) -> Result<()> {
        let command = format!("zpool sync \"{}\"", pool);
        run_mutation(&command, SYNC_TIMEOUT_MS)
    }
}

fn run_mutation(command: &str, timeout_ms: i32) -> Result<()> {
    let outcome = exec::run(command, false, exec::DEFAULT_OUTPUT_CAP, timeout_ms);
    match outcome.code {
        RunCode::Ok | RunCode::NoOutput => Ok(()),
        RunCode::NoStart => Err(ZfsRecompError::CommandStart {
            command: outcome.command,
            source: std::io::Error::last_os_error(),
        }),
        RunCode::Fail => Err(ZfsRecompError::CommandFailed {
            command: outcome.command,
            exit: outcome.exit.unwrap_or(-1),
            output: outcome.output,
        }),
    }
}

/// Dry-run admin: lookups pass through to the wrapped implementation,
/// mutating commands are logged and succeed without running anything.
pub struct EchoAdmin {
    inner: Arc<dyn DatasetAdmin>,
}

impl EchoAdmin {
    /// Wrap `inner`, echoing its mutating commands.
    pub fn new(inner: Arc<dyn DatasetAdmin>) -> Self {
        EchoAdmin { inner }
    }
}

impl DatasetAdmin for EchoAdmin {
    fn lookup(&self, path: &Path) -> Result<Option<DatasetProps>> {
        self.inner.lookup(path)
    }

    fn set_compression(&self, dataset: &str, codec: &str) -> Result<()> {
        tracing::info!("test: zfs set compression={} \"{}\"", codec, dataset);
        Ok(())
    }

    fn sync_pool(&self, pool: &str) -> Result<()> {
        tracing::info!("test: zpool sync \"{}\"", pool);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Admin double recording every call; shared by dataset and engine
    /// tests.
    #[derive(Default)]
    pub(crate) struct RecordingAdmin {
        /// `(dataset, codec)` pairs in call order
        pub(crate) compression_calls: Mutex<Vec<(String, String)>>,
        /// Pools synced, in call order
        pub(crate) sync_calls: Mutex<Vec<String>>,
        /// When set, `set_compression` fails without recording a change
        pub(crate) fail_set: AtomicBool,
        /// Lookup answer
        pub(crate) props: Option<DatasetProps>,
    }

    impl RecordingAdmin {
        pub(crate) fn with_props(name: &str, compression: &str, sync: &str) -> Self {
            RecordingAdmin {
                props: Some(DatasetProps {
                    name: name.to_string(),
                    compression: compression.to_string(),
                    sync: sync.to_string(),
                }),
                ..Default::default()
            }
        }

        pub(crate) fn compression_log(&self) -> Vec<(String, String)> {
            self.compression_calls.lock().unwrap().clone()
        }
    }

    impl DatasetAdmin for RecordingAdmin {
        fn lookup(&self, _path: &Path) -> Result<Option<DatasetProps>> {
            Ok(self.props.clone())
        }

        fn set_compression(&self, dataset: &str, codec: &str) -> Result<()> {
            if self.fail_set.load(Ordering::SeqCst) {
                return Err(ZfsRecompError::CommandFailed {
                    command: format!("zfs set compression={} \"{}\"", codec, dataset),
                    exit: 1,
                    output: "permission denied".to_string(),
                });
            }
            self.compression_calls
                .lock()
                .unwrap()
                .push((dataset.to_string(), codec.to_string()));
            Ok(())
        }

        fn sync_pool(&self, pool: &str) -> Result<()> {
            self.sync_calls.lock().unwrap().push(pool.to_string());
            Ok(())
        }
    }
}
