//! # Subscription Object
//!
//! A subscription is a named, long-lived `SELECT` that is re-executed
//! periodically and only ever returns rows newer than what it already
//! delivered. This module owns its identity, its prepared query, its progress
//! set and its pacing state, and implements creation, topology refresh and
//! teardown. The consume cycle lives in [`super::engine`].
//!
//! ## Lifecycle
//!
//! 1. **Create**: validate the connection, prepare the lowercased SQL and
//!    insist on a `SELECT`. Any failure drops what was already acquired.
//! 2. **Seed progress**: either from the topic's progress file or empty.
//! 3. **Refresh topology**: pin a normal table, or enumerate a super table's
//!    children, keeping the keys of surviving tables.
//! 4. **Consume** repeatedly.
//! 5. **Unsubscribe**: flush or delete the progress file and release the query.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::client::{Connection, QueryObject, QueryType, SqlCommand, TableKind};
use crate::configs::SubscribeConfig;
use crate::core::scheduler::TimerId;
use crate::core::topology::resolve_tables;
use crate::error::{Result, SubscribeError};
use crate::progress::{
    DEFAULT_PROGRESS_CAPACITY, KEY_FROM_BEGINNING, LoadOutcome, ProgressEntry, ProgressSet,
    ProgressStore,
};

/// Longest topic kept, in bytes. Longer topics are truncated.
pub const MAX_TOPIC_LEN: usize = 31;

/// Rows produced by a connection's prepared query.
pub type RowsOf<C> = <<C as Connection>::Query as QueryObject>::Rows;

/// # Subscribe Options
///
/// Per-subscription parameters of [`subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Name of the subscription and of its progress file.
    pub topic: String,
    /// The `SELECT` to re-execute.
    pub sql: String,
    /// Ignore any recorded progress and start fresh.
    pub restart: bool,
    /// Minimum time between two consumes; the timer period in callback mode.
    pub interval: Duration,
}

impl SubscribeOptions {
    /// Options resuming from recorded progress, without pacing.
    pub fn new(topic: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            sql: sql.into(),
            restart: false,
            interval: Duration::ZERO,
        }
    }

    /// Sets the restart flag.
    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    /// Sets the consume interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// # Subscription
///
/// Exclusively owns its prepared query and its progress. One consumer at a
/// time: every mutating operation takes `&mut self`.
pub struct Subscription<C: Connection> {
    pub(crate) topic: String,
    pub(crate) sql: String,
    pub(crate) conn: Arc<C>,
    pub(crate) query: C::Query,
    pub(crate) progress: ProgressSet,
    pub(crate) store: ProgressStore,
    /// `None` forces a topology refresh on the next consume.
    pub(crate) last_sync: Option<Instant>,
    pub(crate) last_consume: Option<Instant>,
    pub(crate) interval: Duration,
    pub(crate) timer: Option<TimerId>,
    pub(crate) topology_refresh: Duration,
    pub(crate) max_attempts: u32,
    pub(crate) resync_after_consume: bool,
}

impl<C: Connection> std::fmt::Debug for Subscription<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("sql", &self.sql)
            .field("progress", &self.progress)
            .field("interval", &self.interval)
            .field("scheduled", &self.timer.is_some())
            .finish()
    }
}

/// Truncates `topic` to [`MAX_TOPIC_LEN`] bytes and rejects names that are
/// not usable as a file name.
pub fn normalize_topic(topic: &str) -> Result<String> {
    let mut end = topic.len().min(MAX_TOPIC_LEN);
    while !topic.is_char_boundary(end) {
        end -= 1;
    }
    let kept = &topic[..end];

    if kept.is_empty() || kept == "." || kept == ".." || kept.contains(['/', '\\', '\0']) {
        return Err(SubscribeError::InvalidTopic(topic.to_string()));
    }
    if end < topic.len() {
        warn!(topic, kept, "subscription topic truncated");
    }
    Ok(kept.to_string())
}

/// Lowercases `sql` and folds line breaks into spaces, so the text fits the
/// first line of a progress file.
pub fn normalize_sql(sql: &str) -> String {
    sql.replace(['\r', '\n'], " ").to_lowercase()
}

impl<C: Connection> Subscription<C> {
    /// Builds a subscription object without touching recorded progress or
    /// the table topology.
    pub async fn create(
        conn: Arc<C>,
        topic: &str,
        sql: &str,
        config: &SubscribeConfig,
    ) -> Result<Self> {
        if !conn.is_connected() {
            error!("connection disconnected");
            return Err(SubscribeError::Disconnected);
        }

        let topic = normalize_topic(topic)?;
        let sql = normalize_sql(sql);

        let query = conn.prepare(&sql).await.map_err(|e| {
            error!(topic = %topic, error = %e, "failed to parse sql statement");
            SubscribeError::InvalidSql(e)
        })?;

        if query.command() != SqlCommand::Select {
            error!(topic = %topic, "only 'select' statement is allowed in subscription");
            return Err(SubscribeError::OnlySelectAllowed { topic });
        }

        Ok(Self {
            topic,
            sql,
            conn,
            query,
            progress: ProgressSet::with_capacity(DEFAULT_PROGRESS_CAPACITY),
            store: config.progress_store(),
            last_sync: None,
            last_consume: None,
            interval: Duration::ZERO,
            timer: None,
            topology_refresh: config.topology_refresh,
            max_attempts: config.max_attempts,
            resync_after_consume: config.resync_after_consume,
        })
    }

    /// Name of the subscription.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The stored, lowercased SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Current high-water-marks.
    pub fn progress(&self) -> &ProgressSet {
        &self.progress
    }

    /// The prepared query.
    pub fn query(&self) -> &C::Query {
        &self.query
    }

    /// The connection the subscription was created on.
    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    /// What the statement's `FROM` clause resolved to.
    pub fn table_kind(&self) -> TableKind {
        self.query.table_kind()
    }

    /// Minimum time between two consumes.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the table topology was last refreshed, if it is not due.
    pub fn last_sync(&self) -> Option<Instant> {
        self.last_sync
    }

    /// When the last successful consume finished.
    pub fn last_consume(&self) -> Option<Instant> {
        self.last_consume
    }

    /// Whether a timer drives this subscription.
    pub fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }

    /// Location of this subscription's progress file.
    pub fn progress_path(&self) -> std::path::PathBuf {
        self.store.path_for(&self.topic)
    }

    /// Highest delivered timestamp of table `uid`, or `default`.
    pub fn progress_of(&self, uid: i64, default: i64) -> i64 {
        self.progress.get_or(uid, default)
    }

    /// Overwrites the recorded key of a tracked table. Untracked tables are ignored.
    pub fn update_progress(&mut self, uid: i64, key: i64) {
        self.progress.update(uid, key);
    }

    /// Seeds the progress set from the topic's progress file.
    ///
    /// A missing, mismatching or unreadable file leaves the set empty.
    pub fn load_progress(&mut self) -> LoadOutcome {
        let outcome = match self.store.load(&self.topic, &self.sql) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "failed to read subscription progress");
                LoadOutcome::Corrupt
            }
        };

        match &outcome {
            LoadOutcome::Loaded(progress) => self.progress.replace_all(progress.clone()),
            _ => self.progress.clear(),
        }
        outcome
    }

    /// Writes the current progress to disk. Failures are logged only.
    pub fn save_progress(&self) {
        if let Err(e) = self.store.save(&self.topic, &self.sql, &self.progress) {
            error!(topic = %self.topic, error = %e, "failed to save subscription progress");
        }
    }

    /// Re-synchronises the progress set with the tables the query covers.
    ///
    /// A normal table pins the set to its own uid. A super table has its
    /// children enumerated: surviving tables keep their key, new tables start
    /// from the beginning and dropped tables disappear. The planner then gets
    /// the child list and the query is marked as a multi-table query.
    pub async fn update_subscription(&mut self) -> Result<()> {
        self.last_sync = Some(Instant::now());

        match self.query.table_kind() {
            TableKind::Normal { uid } => {
                if self.progress.len() != 1 || !self.progress.contains(uid) {
                    let key = self.progress.get_or(uid, 0);
                    self.progress.clear();
                    self.progress.upsert(uid, key);
                }
                Ok(())
            }
            TableKind::Super => {
                let mut tables = resolve_tables(&*self.conn, &self.sql).await?;

                let refreshed: ProgressSet = tables
                    .iter()
                    .map(|t| ProgressEntry::new(t.uid, self.progress.get_or(t.uid, KEY_FROM_BEGINNING)))
                    .collect();
                debug!(
                    topic = %self.topic,
                    before = self.progress.len(),
                    after = refreshed.len(),
                    "subscription tables synchronised"
                );
                self.progress.replace_all(refreshed);

                tables.sort_by(|a, b| a.cmp_tid_tags(b));
                self.query.build_vgroup_table_info(&tables);

                let mut query_type = self.query.query_type();
                query_type.insert(QueryType::MULTITABLE_QUERY);
                self.query.set_query_type(query_type);
                Ok(())
            }
        }
    }

    /// Flushes or deletes the progress file and detaches the query.
    pub(crate) fn teardown(&mut self, keep_progress: bool) {
        self.timer = None;

        if keep_progress {
            self.save_progress();
        } else {
            match self.store.remove(&self.topic) {
                Ok(()) => trace!(topic = %self.topic, "subscription progress removed"),
                Err(SubscribeError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    debug!(topic = %self.topic, "no progress file to remove")
                }
                Err(e) => error!(topic = %self.topic, error = %e, "failed to remove progress file"),
            }
        }

        self.query.detach();
    }

    /// Ends the subscription. With `keep_progress` the progress is flushed so
    /// a later subscription on the same topic resumes from it; otherwise the
    /// progress file is deleted.
    pub fn unsubscribe(mut self, keep_progress: bool) {
        self.teardown(keep_progress);
    }
}

/// Creates a subscription driven by explicit [`Subscription::consume`] calls.
///
/// Unless `options.restart` is set, progress recorded for the topic under the
/// same SQL text is resumed. If the initial topology refresh fails the
/// subscription is torn down, keeping its progress file, and the error is
/// returned.
pub async fn subscribe<C: Connection>(
    conn: Arc<C>,
    options: SubscribeOptions,
    config: &SubscribeConfig,
) -> Result<Subscription<C>> {
    let mut sub = Subscription::create(conn, &options.topic, &options.sql, config).await?;

    if options.restart {
        trace!(topic = %sub.topic, "restart subscription");
    } else {
        sub.load_progress();
    }

    if let Err(e) = sub.update_subscription().await {
        sub.teardown(true);
        return Err(e);
    }

    sub.interval = options.interval;
    Ok(sub)
}
