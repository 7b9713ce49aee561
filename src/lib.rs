//! # zfsrecomp - in-place recompression for ZFS datasets
//!
//! zfsrecomp rewrites regular files in place so that ZFS re-stores
//! their blocks under a different dataset-level compression codec.
//! ZFS applies compression at write time from the dataset's
//! `compression` property; existing blocks keep whatever codec they
//! were written under. The tool switches the property to the target
//! codec, rewrites each eligible file's full contents (same bytes,
//! same metadata), and restores the property afterwards.
//!
//! ## How a rewrite stays safe
//!
//! - The file is held under an exclusive `flock` while its contents
//!   are buffered, truncated and written back.
//! - mtime, atime and mode bits are restored afterwards.
//! - An optional verification pass re-reads the file and compares it
//!   byte for byte with the buffer, retrying the write once on a
//!   mismatch.
//! - Opt-in backups land in the temp directory and survive any rewrite
//!   that fails.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use zfsrecomp::config::{CliArgs, RewriteConfig};
//! use zfsrecomp::core::{FileRewriter, WorkerPool};
//! use zfsrecomp::dataset::{DatasetRegistry, ZfsCliAdmin};
//! use clap::Parser;
//!
//! let args = CliArgs::parse_from(["zfsrecomp", "-c", "-T", "gzip-6", "/tank/data"]);
//! let config = RewriteConfig::from_cli(&args).unwrap();
//! let registry = DatasetRegistry::new(Arc::new(ZfsCliAdmin::new()), config.quick_reset);
//! ```
//!
//! Per-dataset state is refcounted: concurrent workers on one dataset
//! change the codec once on the way in and once on the way out, and a
//! final registry sweep restores every dataset on shutdown.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod dataset;
pub mod error;
pub mod exec;
pub mod fs;
pub mod report;
pub mod signals;

pub use crate::config::{Codec, RewriteConfig};
pub use crate::core::{FileRewriter, JobStats, WorkItem, WorkerPool};
pub use crate::dataset::{DatasetAdmin, DatasetRegistry, DatasetState};
pub use crate::error::{Result, ZfsRecompError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use zfsrecomp::prelude::*;
    //! ```

    pub use crate::config::{CliArgs, Codec, RewriteConfig};
    pub use crate::core::{is_rewritable, FileRewriter, JobStats, WorkItem, WorkerPool};
    pub use crate::dataset::{
        DatasetAdmin, DatasetProps, DatasetRegistry, DatasetState, EchoAdmin, ZfsCliAdmin,
    };
    pub use crate::error::{IoResultExt, Result, ZfsRecompError};
    pub use crate::fs::{FileEntry, FsInfo, ScanConfig, Scanner, StatSnapshot};
}
