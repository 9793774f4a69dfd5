//! # Database Client Contracts
//!
//! The subscription engine does not talk to database nodes itself. Parsing,
//! RPC, result materialisation and vgroup planning belong to the enclosing
//! database client, and this module captures only what the engine needs from
//! it:
//!
//! - **`Connection`**: a live session able to prepare statements and to run
//!   the auxiliary table-id query used for topology refresh.
//! - **`QueryObject`**: a prepared `SELECT` the engine re-executes on every
//!   consume cycle. Execution is asynchronous; the query reports back through
//!   a [`QueryCompletion`] hook which the engine awaits.
//!
//! An in-process implementation lives in [`memory`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::cmp::Ordering;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::progress::{ProgressEntry, ProgressSet};

/// In-memory reference client used by tests and demos.
pub mod memory;

/// Error reported by any client collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code:#06x})")]
pub struct ClientError {
    /// Numeric error code as defined by the database.
    pub code: i32,
    /// Human readable description.
    pub message: String,
}

impl ClientError {
    /// Generic failure.
    pub const CODE_FAILED: i32 = 0x0001;
    /// The statement could not be parsed.
    pub const CODE_INVALID_SQL: i32 = 0x0216;
    /// The referenced table does not exist.
    pub const CODE_INVALID_TABLE: i32 = 0x0362;
    /// The completion hook was dropped before reporting an outcome.
    pub const CODE_NO_RESPONSE: i32 = 0x000B;

    /// Creates a new error with the given code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn no_response() -> Self {
        Self::new(Self::CODE_NO_RESPONSE, "query completed without a response")
    }
}

/// The statement class recognised by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCommand {
    /// A `SELECT` statement, the only kind a subscription accepts.
    Select,
    /// Anything else (DDL, inserts, `SHOW`, ...).
    Other,
}

/// What the `FROM` clause of a subscription resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// A single physical table. Its progress set is pinned to this uid.
    Normal {
        /// Server-assigned table uid.
        uid: i64,
    },
    /// A super table whose child tables are enumerated on every topology refresh.
    Super,
}

/// Query type flags carried by a prepared query across resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct QueryType(u32);

impl QueryType {
    /// No flags set.
    pub const EMPTY: QueryType = QueryType(0);
    /// The query fans out over an explicit list of child tables.
    pub const MULTITABLE_QUERY: QueryType = QueryType(0x0000_0100);

    /// Raw flag bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Builds a flag set from raw bits.
    pub fn from_bits(bits: u32) -> Self {
        QueryType(bits)
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: QueryType) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets every bit of `other`.
    pub fn insert(&mut self, other: QueryType) {
        self.0 |= other.0;
    }
}

/// One row of the auxiliary `select tbid(tbname) ...` query.
///
/// The database defines the record; the engine only reads `uid` and hands
/// the sorted vector back to the query planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdTags {
    /// Uid of the child table.
    pub uid: i64,
    /// Vgroup (shard group) hosting the table.
    pub vgroup_id: i32,
    /// Fingerprint of the table's tag values.
    pub tag_hash: u64,
}

impl TableIdTags {
    /// Planner ordering: by vgroup, then by uid.
    pub fn cmp_tid_tags(&self, other: &Self) -> Ordering {
        self.vgroup_id
            .cmp(&other.vgroup_id)
            .then_with(|| self.uid.cmp(&other.uid))
    }
}

/// Successful outcome of one query execution.
#[derive(Debug, Clone)]
pub struct QueryResult<R> {
    /// Materialised rows, owned by the caller once handed out.
    pub rows: R,
    /// Highest timestamp delivered for every table that produced rows.
    pub progress: Vec<ProgressEntry>,
}

/// Outcome reported through a [`QueryCompletion`].
pub type QueryOutcome<R> = Result<QueryResult<R>, ClientError>;

/// # Query Completion Hook
///
/// The rendezvous between an asynchronously executing query and the engine
/// waiting for it. The query side calls [`QueryCompletion::complete`] exactly
/// once, from any thread; the engine awaits the paired receiver. Dropping the
/// hook without completing counts as a failed execution.
#[derive(Debug)]
pub struct QueryCompletion<R> {
    sender: oneshot::Sender<QueryOutcome<R>>,
}

impl<R> QueryCompletion<R> {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<QueryOutcome<R>>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    /// Reports the outcome of the execution.
    pub fn complete(self, outcome: QueryOutcome<R>) {
        // The engine may have given up on this execution; nothing to do then.
        let _ = self.sender.send(outcome);
    }
}

/// A live session with the database.
pub trait Connection: Send + Sync + 'static {
    /// The prepared query type produced by [`Connection::prepare`].
    type Query: QueryObject;

    /// Whether the session is still usable.
    fn is_connected(&self) -> bool;

    /// Allocates a query object and parses `sql` into it.
    fn prepare(&self, sql: &str) -> impl Future<Output = Result<Self::Query, ClientError>> + Send;

    /// Runs the auxiliary table-id query and collects every row.
    fn query_table_ids(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<Vec<TableIdTags>, ClientError>> + Send;
}

/// A prepared statement owned by a subscription.
pub trait QueryObject: Send + 'static {
    /// Materialised result handed to the subscriber.
    type Rows: Send + 'static;

    /// Statement class determined by the parser.
    fn command(&self) -> SqlCommand;

    /// Resolution of the statement's `FROM` clause.
    fn table_kind(&self) -> TableKind;

    /// Current query type flags.
    fn query_type(&self) -> QueryType;

    /// Replaces the query type flags.
    fn set_query_type(&mut self, query_type: QueryType);

    /// Clears the previous result, sets the row count back to 1, rewinds the
    /// vgroup cursor and marks the command as `SELECT`.
    fn reset(&mut self);

    /// Removes the query from the client's in-flight list.
    fn detach(&mut self);

    /// Hands the planner the child tables, sorted by [`TableIdTags::cmp_tid_tags`].
    fn build_vgroup_table_info(&mut self, tables: &[TableIdTags]);

    /// Starts an execution that only returns rows newer than `progress`.
    ///
    /// The outcome must be reported through `completion`.
    fn execute(&mut self, progress: &ProgressSet, completion: QueryCompletion<Self::Rows>);
}
