//! ZFS dataset handling
//!
//! The administrative capability (property lookup and mutation), the
//! per-dataset refcounted compression state, and the process-wide
//! registry mapping filesystems and paths to their dataset state.

mod admin;
mod registry;
mod state;

pub use admin::{DatasetAdmin, DatasetProps, EchoAdmin, ZfsCliAdmin};

#[cfg(test)]
pub(crate) use admin::testutil;
pub use registry::DatasetRegistry;
pub use state::DatasetState;
