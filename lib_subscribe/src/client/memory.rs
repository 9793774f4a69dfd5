//! # In-Memory Client
//!
//! A self-contained [`Connection`] holding super tables, child tables and
//! normal tables with `(ts, value)` rows. It understands just enough SQL to
//! back a subscription (`select ... from <table> ...`) and offers fault
//! injection hooks so failure paths can be driven deterministically.
//!
//! Executions filter each table's rows by the key recorded in the progress
//! set and report the highest delivered timestamp per table, which is the
//! contract a real client fulfils against the database nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::client::{
    ClientError, Connection, QueryCompletion, QueryObject, QueryOutcome, QueryResult, QueryType,
    SqlCommand, TableIdTags, TableKind,
};
use crate::core::topology::find_from_clause;
use crate::progress::{KEY_FROM_BEGINNING, ProgressEntry, ProgressSet};

/// Uid assigned to the first table created on a connection.
const FIRST_UID: i64 = 1000;

/// Number of vgroups tables are spread over.
const VGROUPS: i64 = 4;

/// One delivered row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRow {
    /// Uid of the table the row belongs to.
    pub uid: i64,
    /// Name of that table.
    pub table: String,
    /// Row timestamp.
    pub ts: i64,
    /// Row value.
    pub value: f64,
}

#[derive(Debug)]
struct Table {
    uid: i64,
    parent: Option<String>,
    vgroup_id: i32,
    rows: BTreeMap<i64, f64>,
}

#[derive(Debug)]
struct State {
    connected: bool,
    next_uid: i64,
    super_tables: BTreeSet<String>,
    tables: BTreeMap<String, Table>,
    fail_next: u32,
    fail_all: bool,
    fail_topology: bool,
    latency: Duration,
    executions: u64,
    topology_queries: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connected: true,
            next_uid: FIRST_UID,
            super_tables: BTreeSet::new(),
            tables: BTreeMap::new(),
            fail_next: 0,
            fail_all: false,
            fail_topology: false,
            latency: Duration::ZERO,
            executions: 0,
            topology_queries: 0,
        }
    }
}

impl State {
    fn table_by_uid(&self, uid: i64) -> Option<(&String, &Table)> {
        self.tables.iter().find(|(_, t)| t.uid == uid)
    }

    fn take_injected_failure(&mut self) -> bool {
        if self.fail_all {
            return true;
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return true;
        }
        false
    }
}

/// # Memory Connection
///
/// Cheap to clone; clones share the same tables and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

impl MemoryConnection {
    /// A connected, empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the session as live or dead.
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// Declares a super table.
    pub fn create_super_table(&self, name: &str) {
        self.state().super_tables.insert(name.to_lowercase());
    }

    /// Creates a table, as a child of `parent` when given, and returns its uid.
    pub fn create_table(&self, name: &str, parent: Option<&str>) -> i64 {
        let mut state = self.state();
        let uid = state.next_uid;
        state.next_uid += 1;
        state.tables.insert(
            name.to_lowercase(),
            Table {
                uid,
                parent: parent.map(str::to_lowercase),
                vgroup_id: (uid % VGROUPS) as i32,
                rows: BTreeMap::new(),
            },
        );
        uid
    }

    /// Drops a table and its rows.
    pub fn drop_table(&self, name: &str) {
        self.state().tables.remove(&name.to_lowercase());
    }

    /// Uid of a table, if it exists.
    pub fn uid_of(&self, name: &str) -> Option<i64> {
        self.state().tables.get(&name.to_lowercase()).map(|t| t.uid)
    }

    /// Writes a row. Returns `false` when the table does not exist.
    pub fn insert(&self, table: &str, ts: i64, value: f64) -> bool {
        match self.state().tables.get_mut(&table.to_lowercase()) {
            Some(t) => {
                t.rows.insert(ts, value);
                true
            }
            None => false,
        }
    }

    /// Makes the next `count` executions fail.
    pub fn fail_next_executions(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Makes every execution fail until switched off.
    pub fn fail_all_executions(&self, fail: bool) {
        self.state().fail_all = fail;
    }

    /// Makes the auxiliary table-id query fail until switched off.
    pub fn fail_topology(&self, fail: bool) {
        self.state().fail_topology = fail;
    }

    /// Delays every completion by `latency`, reported from a spawned task.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Number of query executions started so far.
    pub fn executions(&self) -> u64 {
        self.state().executions
    }

    /// Number of table-id queries run so far.
    pub fn topology_queries(&self) -> u64 {
        self.state().topology_queries
    }

    fn parse(&self, sql: &str) -> Result<MemoryQuery, ClientError> {
        let normalized = sql.trim().to_lowercase();
        let first_word = normalized.split_whitespace().next().unwrap_or_default();
        if first_word.is_empty() {
            return Err(ClientError::new(ClientError::CODE_INVALID_SQL, "empty statement"));
        }

        let mut query = MemoryQuery {
            state: Arc::clone(&self.state),
            command: SqlCommand::Other,
            kind: TableKind::Super,
            source: String::new(),
            query_type: QueryType::EMPTY,
            planned: Vec::new(),
            attached: false,
            resets: 0,
        };
        if first_word != "select" {
            return Ok(query);
        }

        let name = source_table(&normalized).ok_or_else(|| {
            ClientError::new(ClientError::CODE_INVALID_SQL, format!("no table in: {}", sql))
        })?;

        let state = self.state();
        query.kind = if state.super_tables.contains(&name) {
            TableKind::Super
        } else if let Some(table) = state.tables.get(&name) {
            TableKind::Normal { uid: table.uid }
        } else {
            return Err(ClientError::new(
                ClientError::CODE_INVALID_TABLE,
                format!("table does not exist: {}", name),
            ));
        };
        query.command = SqlCommand::Select;
        query.source = name;
        Ok(query)
    }

    fn child_tables(&self, sql: &str) -> Result<Vec<TableIdTags>, ClientError> {
        let mut state = self.state();
        state.topology_queries += 1;
        if state.fail_topology {
            return Err(ClientError::new(ClientError::CODE_FAILED, "injected table id failure"));
        }

        let name = source_table(&sql.to_lowercase())
            .ok_or_else(|| ClientError::new(ClientError::CODE_INVALID_SQL, sql.to_string()))?;
        if !state.super_tables.contains(&name) {
            return Err(ClientError::new(
                ClientError::CODE_INVALID_TABLE,
                format!("not a super table: {}", name),
            ));
        }

        Ok(state
            .tables
            .values()
            .filter(|t| t.parent.as_deref() == Some(name.as_str()))
            .map(|t| TableIdTags {
                uid: t.uid,
                vgroup_id: t.vgroup_id,
                tag_hash: t.uid as u64,
            })
            .collect())
    }
}

/// Name following the statement's `from` keyword.
fn source_table(sql: &str) -> Option<String> {
    let idx = find_from_clause(sql)?;
    sql[idx + 4..]
        .split_whitespace()
        .next()
        .map(|name| name.trim_end_matches(';').to_string())
        .filter(|name| !name.is_empty())
}

impl Connection for MemoryConnection {
    type Query = MemoryQuery;

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn prepare(&self, sql: &str) -> impl Future<Output = Result<MemoryQuery, ClientError>> + Send {
        let result = self.parse(sql);
        async move { result }
    }

    fn query_table_ids(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<Vec<TableIdTags>, ClientError>> + Send {
        let result = self.child_tables(sql);
        async move { result }
    }
}

/// # Memory Query
///
/// A prepared `SELECT` over one normal table or over the planned children of
/// a super table.
#[derive(Debug)]
pub struct MemoryQuery {
    state: Arc<Mutex<State>>,
    command: SqlCommand,
    kind: TableKind,
    source: String,
    query_type: QueryType,
    planned: Vec<TableIdTags>,
    attached: bool,
    resets: u64,
}

impl MemoryQuery {
    /// Name of the table in the `FROM` clause.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Child tables handed over by the last planning step, in planner order.
    pub fn planned_tables(&self) -> &[TableIdTags] {
        &self.planned
    }

    /// Whether an execution is registered as in flight.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Number of resets since preparation.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    fn run(&self, state: &State, progress: &ProgressSet) -> QueryOutcome<Vec<MemoryRow>> {
        let uids: Vec<i64> = match self.kind {
            TableKind::Normal { uid } => vec![uid],
            TableKind::Super => self.planned.iter().map(|t| t.uid).collect(),
        };

        let mut rows = Vec::new();
        let mut delivered = Vec::new();
        for uid in uids {
            let Some((name, table)) = state.table_by_uid(uid) else {
                if let TableKind::Normal { .. } = self.kind {
                    return Err(ClientError::new(
                        ClientError::CODE_INVALID_TABLE,
                        format!("table does not exist: {}", self.source),
                    ));
                }
                continue;
            };

            let from = progress.get_or(uid, KEY_FROM_BEGINNING);
            let mut newest = None;
            for (&ts, &value) in table.rows.range((Bound::Excluded(from), Bound::Unbounded)) {
                rows.push(MemoryRow {
                    uid,
                    table: name.clone(),
                    ts,
                    value,
                });
                newest = Some(ts);
            }
            if let Some(key) = newest {
                delivered.push(ProgressEntry::new(uid, key));
            }
        }

        Ok(QueryResult {
            rows,
            progress: delivered,
        })
    }
}

impl QueryObject for MemoryQuery {
    type Rows = Vec<MemoryRow>;

    fn command(&self) -> SqlCommand {
        self.command
    }

    fn table_kind(&self) -> TableKind {
        self.kind
    }

    fn query_type(&self) -> QueryType {
        self.query_type
    }

    fn set_query_type(&mut self, query_type: QueryType) {
        self.query_type = query_type;
    }

    fn reset(&mut self) {
        self.query_type = QueryType::EMPTY;
        self.command = SqlCommand::Select;
        self.resets += 1;
    }

    fn detach(&mut self) {
        self.attached = false;
    }

    fn build_vgroup_table_info(&mut self, tables: &[TableIdTags]) {
        self.planned = tables.to_vec();
    }

    fn execute(&mut self, progress: &ProgressSet, completion: QueryCompletion<Vec<MemoryRow>>) {
        self.attached = true;

        let (outcome, latency) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.executions += 1;
            let outcome = if state.take_injected_failure() {
                Err(ClientError::new(ClientError::CODE_FAILED, "injected execution failure"))
            } else {
                self.run(&state, progress)
            };
            (outcome, state.latency)
        };
        trace!(source = %self.source, ok = outcome.is_ok(), "memory query executed");

        if latency.is_zero() {
            completion.complete(outcome);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                completion.complete(outcome);
            });
        }
    }
}
