//! File system support module
//!
//! Filesystem identity queries, the per-file rewrite marker attribute,
//! and candidate-file scanning for the rewrite engine.

mod fsinfo;
pub mod marker;
mod scanner;

pub use fsinfo::{round_to_block_size, FsInfo, DEV_BSIZE, ZFS_SUPER_MAGIC};
pub use scanner::{FileEntry, ScanConfig, Scanner, StatSnapshot};
