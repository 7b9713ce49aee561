//! Configuration module
//!
//! Command-line arguments, the target codec set, and the resolved
//! rewrite configuration shared by the engine.

mod settings;

pub use settings::*;
