//! The reconciliation engine
//!
//! A multi-stage, bounded-concurrency pipeline: the pair builder consumes
//! both listings and pairs entries, the equality oracle decides whether a
//! transfer is needed, and the checker/transferrer pools carry out the
//! work under the orchestrator's delete-phase and retry discipline.

mod equality;
mod orchestrator;
mod pair;
mod transfer;

pub use equality::{check_equal, compare_hashes, modify_window, Equality};
pub use orchestrator::{delete_files, purge, SyncRun};
pub use pair::{PairBuilder, PairEvent};
pub use transfer::{
    copy_object, delete_object, spawn_checkers, spawn_transferrers, CheckTask, TransferContext,
    TransferJob,
};
