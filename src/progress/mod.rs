//! Run statistics and the periodic reporter
//!
//! One logical aggregator exists per run. Counters are atomic and
//! eventually consistent while workers are active; final totals are
//! accurate once the orchestrator has shut down.

mod stats;

pub use stats::*;
