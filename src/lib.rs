//! # skysync - sync for heterogeneous object storage
//!
//! skysync is a command-line file-synchronization engine between object
//! storage backends: cloud object stores and local filesystems. Given a
//! source and a destination tree, each identified by a scheme-qualified
//! path (`name:path`), it reconciles the destination toward the source
//! with minimal transfers.
//!
//! ## Features
//!
//! - **Capability-based backends**: adapters declare hash and mod-time
//!   support; server-side copy/move/purge are optional interfaces
//! - **Streaming reconciliation**: bounded-memory listings feed a pair
//!   builder, parallel equality checkers and transfer workers
//! - **Minimal transfers**: size, mod-time and MD5/SHA-1 comparisons,
//!   with mod-time repair when only the timestamp drifted
//! - **Rich filtering**: ordered include/exclude globs, files-from
//!   manifests, size and age bounds
//! - **Bandwidth limiting**: one process-wide token bucket on the read
//!   side of every transfer
//! - **Delete ordering**: extraneous destination files removed before,
//!   during or after transfers, with whole-run retries
//!
//! ## Quick start
//!
//! ```no_run
//! use skysync::backend::new_backend;
//! use skysync::config::{ConfigFile, SyncOptions};
//! use skysync::filter::Filter;
//! use skysync::progress::Stats;
//! use skysync::sync::SyncRun;
//! use std::sync::Arc;
//!
//! let config = ConfigFile::default();
//! let src = new_backend("/home/me/photos", &config).unwrap();
//! let dst = new_backend("backup:photos", &config).unwrap();
//!
//! let stats = Arc::new(Stats::new());
//! let run = SyncRun::new(
//!     src,
//!     dst,
//!     SyncOptions::default(),
//!     Arc::new(Filter::new()),
//!     Arc::clone(&stats),
//! );
//! run.sync().unwrap();
//! println!("{}", stats.snapshot());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod hash;
pub mod paths;
pub mod progress;
pub mod sync;
pub mod throttle;

// Re-export commonly used types
pub use backend::{new_backend, Backend, Object};
pub use config::{CliArgs, ConfigFile, SyncOptions};
pub use error::{Result, SyncError};
pub use filter::Filter;
pub use progress::Stats;
pub use sync::SyncRun;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use skysync::prelude::*;
    //! ```

    pub use crate::backend::{new_backend, Backend, Copier, Mover, Object, Purger};
    pub use crate::config::{ConfigFile, DeleteMode, SyncOptions};
    pub use crate::error::{Result, SyncError};
    pub use crate::filter::Filter;
    pub use crate::hash::{HashKind, HashTypeSet};
    pub use crate::progress::{Reporter, Stats};
    pub use crate::sync::{delete_files, purge, SyncRun};
    pub use crate::throttle::BandwidthLimiter;
}
