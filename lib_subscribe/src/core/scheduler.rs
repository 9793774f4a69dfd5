//! # Subscription Scheduler
//!
//! Callback mode: a background task consumes the subscription every
//! `interval` and hands each successful result to a user callback.
//!
//! The task waits on a `select!` between the interval sleep and a
//! cancellation token. On every fire it takes the subscription lock and
//! checks that the subscription still carries the timer id the task was
//! started with; a stale fire does nothing. Unsubscribing cancels the token
//! and joins the task before tearing the subscription down, so no callback
//! runs afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Connection;
use crate::configs::SubscribeConfig;
use crate::core::subscription::{RowsOf, SubscribeOptions, Subscription, subscribe};
use crate::error::{Result, SubscribeError};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one scheduling timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    fn next() -> Self {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receives every successful consume of a scheduled subscription.
pub type SubscriptionCallback<C> = Box<dyn FnMut(&Subscription<C>, RowsOf<C>) + Send + 'static>;

/// # Scheduled Subscription
///
/// Handle of a timer-driven subscription. Dropping the handle stops the
/// timer without touching the progress file; call
/// [`ScheduledSubscription::unsubscribe`] for an orderly shutdown.
pub struct ScheduledSubscription<C: Connection> {
    topic: String,
    timer_id: TimerId,
    inner: Arc<Mutex<Subscription<C>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<C: Connection> ScheduledSubscription<C> {
    /// Starts driving `sub` from a background task.
    pub fn start(mut sub: Subscription<C>, callback: SubscriptionCallback<C>) -> Self {
        let timer_id = TimerId::next();
        sub.timer = Some(timer_id);

        let topic = sub.topic().to_string();
        let interval = sub.interval();
        let inner = Arc::new(Mutex::new(sub));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_timer(
            Arc::clone(&inner),
            cancel.clone(),
            timer_id,
            interval,
            callback,
        ));
        info!(topic = %topic, interval_ms = interval.as_millis() as u64, "subscription timer started");

        Self {
            topic,
            timer_id,
            inner,
            cancel,
            task: Some(task),
        }
    }

    /// Name of the subscription.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Identity of the driving timer.
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Locks the subscription, waiting for an in-flight fire to finish.
    pub async fn lock(&self) -> MutexGuard<'_, Subscription<C>> {
        self.inner.lock().await
    }

    /// Stops the timer, waits for a running callback to return, then ends
    /// the subscription as [`Subscription::unsubscribe`] does.
    pub async fn unsubscribe(mut self, keep_progress: bool) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(topic = %self.topic, error = %e, "subscription timer task failed");
            }
        }

        let mut sub = self.inner.lock().await;
        sub.teardown(keep_progress);
        debug!(topic = %self.topic, keep_progress, "scheduled subscription closed");
    }
}

impl<C: Connection> Drop for ScheduledSubscription<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_timer<C: Connection>(
    inner: Arc<Mutex<Subscription<C>>>,
    cancel: CancellationToken,
    timer_id: TimerId,
    interval: Duration,
    mut callback: SubscriptionCallback<C>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let mut sub = inner.lock().await;
        if sub.timer != Some(timer_id) {
            debug!(topic = %sub.topic(), "stale subscription timer fired");
            break;
        }

        match sub.consume().await {
            Ok(rows) => callback(&*sub, rows),
            Err(e) => warn!(topic = %sub.topic(), error = %e, "scheduled consume failed"),
        }
    }
}

/// Creates a subscription consumed every `options.interval` by a background
/// task, each result being handed to `callback`.
///
/// The interval must be non-zero. Must be called within a Tokio runtime.
pub async fn subscribe_with_callback<C, F>(
    conn: Arc<C>,
    options: SubscribeOptions,
    config: &SubscribeConfig,
    callback: F,
) -> Result<ScheduledSubscription<C>>
where
    C: Connection,
    F: FnMut(&Subscription<C>, RowsOf<C>) + Send + 'static,
{
    if options.interval.is_zero() {
        return Err(SubscribeError::Config(
            "a callback subscription needs a non-zero interval".to_string(),
        ));
    }

    let sub = subscribe(conn, options, config).await?;
    Ok(ScheduledSubscription::start(sub, Box::new(callback)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryConnection, MemoryRow};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn callback_fires_every_interval() {
        let dir = tempdir().unwrap();
        let conn = Arc::new(MemoryConnection::new());
        conn.create_table("d1", None);
        conn.insert("d1", 1, 1.0);

        let seen: Arc<StdMutex<Vec<usize>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let handle = subscribe_with_callback(
            Arc::clone(&conn),
            SubscribeOptions::new("cb", "select * from d1").interval(Duration::from_secs(1)),
            &SubscribeConfig::with_data_dir(dir.path()),
            move |_sub: &Subscription<MemoryConnection>, rows: Vec<MemoryRow>| {
                sink.lock().unwrap().push(rows.len());
            },
        )
        .await
        .unwrap();

        sleep(Duration::from_millis(3500)).await;
        handle.unsubscribe(false).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_without_a_matching_timer_is_skipped() {
        let dir = tempdir().unwrap();
        let conn = Arc::new(MemoryConnection::new());
        conn.create_table("d1", None);
        conn.insert("d1", 1, 1.0);

        let calls = Arc::new(StdMutex::new(0usize));
        let counter = Arc::clone(&calls);
        let handle = subscribe_with_callback(
            Arc::clone(&conn),
            SubscribeOptions::new("cb", "select * from d1").interval(Duration::from_secs(1)),
            &SubscribeConfig::with_data_dir(dir.path()),
            move |_: &Subscription<MemoryConnection>, _: Vec<MemoryRow>| {
                *counter.lock().unwrap() += 1;
            },
        )
        .await
        .unwrap();

        handle.lock().await.timer = None;
        sleep(Duration::from_millis(3500)).await;

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(conn.executions(), 0);
        handle.unsubscribe(true).await;
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let dir = tempdir().unwrap();
        let conn = Arc::new(MemoryConnection::new());
        conn.create_table("d1", None);

        let result = subscribe_with_callback(
            conn,
            SubscribeOptions::new("cb", "select * from d1"),
            &SubscribeConfig::with_data_dir(dir.path()),
            |_: &Subscription<MemoryConnection>, _: Vec<MemoryRow>| {},
        )
        .await;
        assert!(matches!(result, Err(SubscribeError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_driven_consumes_are_not_paced() {
        let dir = tempdir().unwrap();
        let conn = Arc::new(MemoryConnection::new());
        conn.create_table("d1", None);

        let handle = subscribe_with_callback(
            Arc::clone(&conn),
            SubscribeOptions::new("cb", "select * from d1").interval(Duration::from_secs(1)),
            &SubscribeConfig::with_data_dir(dir.path()),
            |_: &Subscription<MemoryConnection>, _: Vec<MemoryRow>| {},
        )
        .await
        .unwrap();

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(conn.executions(), 2);
        assert!(handle.lock().await.is_scheduled());
        handle.unsubscribe(true).await;
    }
}
