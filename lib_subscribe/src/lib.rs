//! Client-side subscriptions over time-series tables: a `SELECT` that is
//! re-executed periodically and only returns rows newer than what it already
//! delivered, with per-table progress persisted across restarts.

// Declare the modules to re-export
pub mod client;
pub mod configs;
pub mod core;
pub mod error;
#[cfg(feature = "loggers")]
pub mod loggers; // Global tracing subscriber and log rotation
pub mod progress;

// Re-export the everyday surface
pub use client::{ClientError, Connection, QueryObject};
pub use configs::{ConfigOverrides, SubscribeConfig, load_config};
pub use crate::core::{
    ScheduledSubscription, SubscribeOptions, Subscription, subscribe, subscribe_with_callback,
};
pub use error::{Result, SubscribeError};
pub use progress::{LoadOutcome, ProgressEntry, ProgressSet, ProgressStore};
