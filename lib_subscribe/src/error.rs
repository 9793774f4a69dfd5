//! # Subscription Errors
//!
//! A single error type for every fallible operation of the subscription engine.
//! Collaborator failures (parser, RPC, auxiliary queries) arrive as a
//! [`ClientError`] and are wrapped with the stage at which they happened.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::client::ClientError;

/// Custom error types for subscription operations.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The connection handed to `subscribe` is not live.
    #[error("connection disconnected")]
    Disconnected,

    /// The topic is empty or cannot be used as a file name.
    #[error("invalid subscription topic: {0:?}")]
    InvalidTopic(String),

    /// The collaborator rejected the SQL text.
    #[error("failed to parse sql statement: {0}")]
    InvalidSql(#[source] ClientError),

    /// The statement parsed, but it is not a `SELECT`.
    #[error("only 'select' statement is allowed in subscription: {topic}")]
    OnlySelectAllowed { topic: String },

    /// The statement has no `from` clause to derive the table list from.
    #[error("subscription sql has no 'from' clause: {0}")]
    MissingFromClause(String),

    /// The auxiliary `select tbid(tbname) ...` query failed.
    #[error("failed to retrieve table id: {0}")]
    TopologyQueryFailed(#[source] ClientError),

    /// Every execution attempt of a consume cycle failed.
    #[error("failed to query data after {attempts} attempts: {source}")]
    QueryFailed {
        attempts: u32,
        #[source]
        source: ClientError,
    },

    /// Reading, writing or removing a progress file failed.
    #[error("progress file I/O error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration could not be resolved.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SubscribeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SubscribeError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Shorthand used across the crate.
pub type Result<T, E = SubscribeError> = std::result::Result<T, E>;
