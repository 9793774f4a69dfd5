//! End-to-end behaviour of subscriptions against an in-memory database and a
//! fixed-topology client.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lib_subscribe::client::memory::{MemoryConnection, MemoryRow};
use lib_subscribe::client::{
    ClientError, Connection, QueryCompletion, QueryObject, QueryResult, QueryType, SqlCommand,
    TableIdTags, TableKind,
};
use lib_subscribe::progress::KEY_FROM_BEGINNING;
use lib_subscribe::{
    LoadOutcome, ProgressEntry, ProgressSet, SubscribeConfig, SubscribeError, SubscribeOptions,
    Subscription, subscribe, subscribe_with_callback,
};
use tempfile::tempdir;

/// A client whose super table always has the same children and whose
/// every table holds a single row at `uid * 100`.
struct FixedTables {
    uids: Vec<i64>,
}

struct FixedQuery {
    query_type: QueryType,
    planned: Vec<i64>,
}

impl Connection for FixedTables {
    type Query = FixedQuery;

    fn is_connected(&self) -> bool {
        true
    }

    async fn prepare(&self, _sql: &str) -> Result<FixedQuery, ClientError> {
        Ok(FixedQuery {
            query_type: QueryType::EMPTY,
            planned: Vec::new(),
        })
    }

    async fn query_table_ids(&self, _sql: &str) -> Result<Vec<TableIdTags>, ClientError> {
        Ok(self
            .uids
            .iter()
            .rev()
            .map(|&uid| TableIdTags {
                uid,
                vgroup_id: 0,
                tag_hash: 0,
            })
            .collect())
    }
}

impl QueryObject for FixedQuery {
    type Rows = Vec<(i64, i64)>;

    fn command(&self) -> SqlCommand {
        SqlCommand::Select
    }

    fn table_kind(&self) -> TableKind {
        TableKind::Super
    }

    fn query_type(&self) -> QueryType {
        self.query_type
    }

    fn set_query_type(&mut self, query_type: QueryType) {
        self.query_type = query_type;
    }

    fn reset(&mut self) {
        self.query_type = QueryType::EMPTY;
    }

    fn detach(&mut self) {}

    fn build_vgroup_table_info(&mut self, tables: &[TableIdTags]) {
        self.planned = tables.iter().map(|t| t.uid).collect();
    }

    fn execute(&mut self, progress: &ProgressSet, completion: QueryCompletion<Self::Rows>) {
        let rows: Vec<(i64, i64)> = self
            .planned
            .iter()
            .map(|&uid| (uid, uid * 100))
            .filter(|&(uid, ts)| progress.get_or(uid, KEY_FROM_BEGINNING) < ts)
            .collect();
        let delivered = rows.iter().map(|&(uid, ts)| ProgressEntry::new(uid, ts)).collect();
        completion.complete(Ok(QueryResult {
            rows,
            progress: delivered,
        }));
    }
}

fn meters(conn: &MemoryConnection) -> Vec<i64> {
    conn.create_super_table("s");
    ["d1", "d2", "d3"]
        .iter()
        .map(|name| conn.create_table(name, Some("s")))
        .collect()
}

#[tokio::test]
async fn fresh_super_table_subscription() {
    let dir = tempdir().unwrap();
    let config = SubscribeConfig::with_data_dir(dir.path());
    let conn = Arc::new(FixedTables {
        uids: vec![10, 20, 30],
    });

    let mut sub = subscribe(
        conn,
        SubscribeOptions::new("t1", "select * from s")
            .restart(true)
            .interval(Duration::from_millis(1000)),
        &config,
    )
    .await
    .unwrap();

    let expected_before: Vec<ProgressEntry> = [10, 20, 30]
        .iter()
        .map(|&uid| ProgressEntry::new(uid, KEY_FROM_BEGINNING))
        .collect();
    assert_eq!(sub.progress().as_slice(), expected_before.as_slice());
    assert!(sub.query().query_type().contains(QueryType::MULTITABLE_QUERY));

    let rows = sub.consume().await.unwrap();
    assert_eq!(rows, vec![(10, 1000), (20, 2000), (30, 3000)]);
    assert_eq!(sub.progress_of(10, 0), 1000);
    assert_eq!(sub.progress_of(20, 0), 2000);
    assert_eq!(sub.progress_of(30, 0), 3000);

    let content = fs::read_to_string(dir.path().join("subscribe").join("t1")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "select * from s");
    assert_eq!(lines[1], format!("10:{}", i64::MIN));
}

#[tokio::test]
async fn resume_after_restart() {
    let dir = tempdir().unwrap();
    let config = SubscribeConfig::with_data_dir(dir.path());
    let conn = Arc::new(MemoryConnection::new());
    let uids = meters(&conn);

    let store = config.progress_store();
    fs::create_dir_all(store.dir()).unwrap();
    fs::write(
        store.path_for("t1"),
        format!("select * from s\n{}:30\n{}:10\n{}:20\n", uids[2], uids[0], uids[1]),
    )
    .unwrap();

    let sub = subscribe(conn, SubscribeOptions::new("t1", "select * from s"), &config)
        .await
        .unwrap();
    assert_eq!(
        sub.progress().as_slice(),
        &[
            ProgressEntry::new(uids[0], 10),
            ProgressEntry::new(uids[1], 20),
            ProgressEntry::new(uids[2], 30),
        ]
    );
}

#[tokio::test]
async fn changed_sql_invalidates_the_file() {
    let dir = tempdir().unwrap();
    let config = SubscribeConfig::with_data_dir(dir.path());
    let conn = Arc::new(MemoryConnection::new());
    let uids = meters(&conn);

    let store = config.progress_store();
    let recorded = ProgressSet::from_unsorted(uids.iter().map(|&uid| ProgressEntry::new(uid, 5)).collect());
    store.save("t1", "select * from s", &recorded).unwrap();

    let mut sub = subscribe(
        Arc::clone(&conn),
        SubscribeOptions::new("t1", "select ts from s"),
        &config,
    )
    .await
    .unwrap();
    assert!(sub.progress().iter().all(|e| e.key == KEY_FROM_BEGINNING));

    sub.consume().await.unwrap();
    assert!(matches!(
        store.load("t1", "select ts from s").unwrap(),
        LoadOutcome::Loaded(_)
    ));
    assert_eq!(store.load("t1", "select * from s").unwrap(), LoadOutcome::Mismatch);
}

#[tokio::test]
async fn retry_succeeds_on_second_attempt() {
    let dir = tempdir().unwrap();
    let conn = Arc::new(MemoryConnection::new());
    meters(&conn);
    conn.insert("d1", 100, 1.0);

    let mut sub = subscribe(
        Arc::clone(&conn),
        SubscribeOptions::new("t1", "select * from s").restart(true),
        &SubscribeConfig::with_data_dir(dir.path()),
    )
    .await
    .unwrap();
    assert!(sub.last_consume().is_none());

    conn.fail_next_executions(1);
    let rows = sub.consume().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(sub.last_consume().is_some());
    assert_eq!(conn.executions(), 2);
}

#[tokio::test]
async fn retry_exhausted() {
    let dir = tempdir().unwrap();
    let config = SubscribeConfig::with_data_dir(dir.path());
    let conn = Arc::new(MemoryConnection::new());
    meters(&conn);
    conn.insert("d1", 100, 1.0);

    let mut sub = subscribe(
        Arc::clone(&conn),
        SubscribeOptions::new("t1", "select * from s").restart(true),
        &config,
    )
    .await
    .unwrap();
    sub.consume().await.unwrap();

    conn.insert("d2", 200, 2.0);
    conn.fail_all_executions(true);
    let before = sub.progress().clone();
    let executions = conn.executions();

    let err = sub.consume().await.unwrap_err();
    assert!(matches!(err, SubscribeError::QueryFailed { attempts: 3, .. }));
    assert_eq!(conn.executions() - executions, 3);
    assert_eq!(sub.progress(), &before);
    assert_eq!(
        config.progress_store().load("t1", sub.sql()).unwrap(),
        LoadOutcome::Loaded(before)
    );
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_without_progress_stops_the_timer() {
    let dir = tempdir().unwrap();
    let config = SubscribeConfig::with_data_dir(dir.path());
    let conn = Arc::new(MemoryConnection::new());
    meters(&conn);

    let fires = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fires);
    let handle = subscribe_with_callback(
        Arc::clone(&conn),
        SubscribeOptions::new("t1", "select * from s").interval(Duration::from_millis(100)),
        &config,
        move |_: &Subscription<MemoryConnection>, _: Vec<MemoryRow>| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(fires.load(Ordering::SeqCst), 3);
    handle.unsubscribe(false).await;

    let fired = fires.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fires.load(Ordering::SeqCst), fired);
    assert!(!config.progress_store().path_for("t1").exists());
}

#[tokio::test]
async fn unsubscribe_keeping_progress_lets_a_later_subscription_resume() {
    let dir = tempdir().unwrap();
    let config = SubscribeConfig::with_data_dir(dir.path());
    let conn = Arc::new(MemoryConnection::new());
    meters(&conn);
    conn.insert("d1", 100, 1.0);

    let mut sub = subscribe(Arc::clone(&conn), SubscribeOptions::new("t1", "select * from s"), &config)
        .await
        .unwrap();
    assert_eq!(sub.consume().await.unwrap().len(), 1);
    sub.unsubscribe(true);

    conn.insert("d1", 101, 1.0);
    let mut sub = subscribe(Arc::clone(&conn), SubscribeOptions::new("t1", "select * from s"), &config)
        .await
        .unwrap();
    let rows = sub.consume().await.unwrap();
    assert_eq!(rows.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![101]);
}

#[tokio::test]
async fn restart_ignores_recorded_progress() {
    let dir = tempdir().unwrap();
    let config = SubscribeConfig::with_data_dir(dir.path());
    let conn = Arc::new(MemoryConnection::new());
    let uids = meters(&conn);

    let recorded = ProgressSet::from_unsorted(uids.iter().map(|&uid| ProgressEntry::new(uid, 77)).collect());
    config.progress_store().save("t1", "select * from s", &recorded).unwrap();

    let sub = subscribe(
        conn,
        SubscribeOptions::new("t1", "select * from s").restart(true),
        &config,
    )
    .await
    .unwrap();
    assert_eq!(sub.progress().len(), 3);
    assert!(sub.progress().iter().all(|e| e.key == KEY_FROM_BEGINNING));
}

#[tokio::test]
async fn progress_never_moves_backward() {
    let dir = tempdir().unwrap();
    let conn = Arc::new(MemoryConnection::new());
    let uids = meters(&conn);

    let mut sub = subscribe(
        Arc::clone(&conn),
        SubscribeOptions::new("t1", "select * from s").restart(true),
        &SubscribeConfig::with_data_dir(dir.path()),
    )
    .await
    .unwrap();

    let mut observed = Vec::new();
    for ts in [50, 40, 60, 10] {
        conn.insert("d1", ts, 0.0);
        sub.consume().await.unwrap();
        observed.push(sub.progress_of(uids[0], KEY_FROM_BEGINNING));
        assert!(sub.progress().as_slice().windows(2).all(|w| w[0].uid < w[1].uid));
    }
    assert_eq!(observed, vec![50, 50, 60, 60]);
}

#[tokio::test]
async fn normal_table_subscription_stays_pinned() {
    let dir = tempdir().unwrap();
    let conn = Arc::new(MemoryConnection::new());
    let uid = conn.create_table("plain", None);
    for ts in 1..=3 {
        conn.insert("plain", ts, ts as f64);
    }

    let mut sub = subscribe(
        Arc::clone(&conn),
        SubscribeOptions::new("plain", "SELECT * FROM plain").restart(true),
        &SubscribeConfig::with_data_dir(dir.path()),
    )
    .await
    .unwrap();
    assert_eq!(sub.sql(), "select * from plain");

    for _ in 0..2 {
        sub.consume().await.unwrap();
        assert_eq!(sub.progress().len(), 1);
        assert_eq!(sub.progress().as_slice()[0].uid, uid);
    }
    assert_eq!(sub.progress_of(uid, 0), 3);
    assert_eq!(conn.topology_queries(), 0);
}
