//! Configuration module for skysync
//!
//! Provides CLI argument definitions, the runtime option set built from
//! them, and the sectioned remotes config file.

mod file;
mod settings;

pub use file::*;
pub use settings::*;
