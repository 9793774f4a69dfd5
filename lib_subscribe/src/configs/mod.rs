//! # Configuration Modules
//!
//! Layered settings for the subscription engine and its binaries.

/// Engine settings: data directory, refresh cadence, retry budget, logging.
pub mod config_sub;

pub use config_sub::{ConfigOverrides, SubscribeConfig, load_config};
