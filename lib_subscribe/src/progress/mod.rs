//! # Progress Module
//!
//! Per-table high-water-marks of a subscription and their on-disk form.

/// Sorted `(uid, key)` records.
pub mod set;
/// Topic-named progress files.
pub mod store;

pub use set::{DEFAULT_PROGRESS_CAPACITY, KEY_FROM_BEGINNING, ProgressEntry, ProgressSet};
pub use store::{LoadOutcome, ProgressFile, ProgressStore, SUBSCRIBE_DIR};
