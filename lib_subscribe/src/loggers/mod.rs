/// Installs the global tracing subscriber with optional rotated file output.
pub mod logsetup;

pub use logsetup::{LogOptions, init_logging};
