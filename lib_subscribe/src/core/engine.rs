//! # Consumption Engine
//!
//! One consume cycle: persist the current progress, pace the caller,
//! refresh the table topology when it is stale, then execute the prepared
//! query with bounded retries and fold the reported high-water-marks back
//! into the progress set.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, error, trace, warn};

use crate::client::{ClientError, Connection, QueryCompletion, QueryObject};
use crate::core::subscription::{RowsOf, Subscription};
use crate::error::{Result, SubscribeError};

impl<C: Connection> Subscription<C> {
    /// Whether the table topology is due for a refresh.
    pub fn topology_is_stale(&self) -> bool {
        match self.last_sync {
            None => true,
            Some(at) => at.elapsed() > self.topology_refresh,
        }
    }

    /// Returns the rows produced since the previous successful consume.
    ///
    /// Progress is written to disk before anything else, so a crash during
    /// the cycle never loses already delivered positions. Unless a timer
    /// drives the subscription, the call sleeps until `interval` has passed
    /// since the last successful consume. The query is executed up to
    /// `max_attempts` times; if every attempt fails the last client error is
    /// returned and the progress set is left untouched.
    pub async fn consume(&mut self) -> Result<RowsOf<C>> {
        self.save_progress();

        if let Some(wait) = self.pacing_delay() {
            trace!(topic = %self.topic, wait_ms = wait.as_millis() as u64, "pacing consume");
            sleep(wait).await;
        }

        let mut last_error = ClientError::no_response();
        for attempt in 1..=self.max_attempts {
            self.query.detach();

            if self.topology_is_stale() {
                debug!(topic = %self.topic, "begin table synchronization");
                self.update_subscription().await?;
                debug!(topic = %self.topic, "table synchronization completed");
            }

            let query_type = self.query.query_type();
            self.query.reset();
            self.query.set_query_type(query_type);

            let (completion, response) = QueryCompletion::channel();
            self.query.execute(&self.progress, completion);

            match response.await.unwrap_or_else(|_| Err(ClientError::no_response())) {
                Ok(result) => {
                    for entry in &result.progress {
                        self.progress.advance(entry.uid, entry.key);
                    }
                    if self.resync_after_consume {
                        self.last_sync = None;
                    }
                    self.last_consume = Some(Instant::now());
                    trace!(topic = %self.topic, attempt, "subscription consumed");
                    return Ok(result.rows);
                }
                Err(e) => {
                    warn!(topic = %self.topic, attempt, error = %e, "subscription query failed");
                    last_error = e;
                }
            }
        }

        error!(
            topic = %self.topic,
            attempts = self.max_attempts,
            error = %last_error,
            "failed to query data"
        );
        self.query.detach();
        Err(SubscribeError::QueryFailed {
            attempts: self.max_attempts,
            source: last_error,
        })
    }

    /// Time left before a caller-driven consume may run. Timer-driven
    /// subscriptions are never paced.
    fn pacing_delay(&self) -> Option<Duration> {
        if self.timer.is_some() {
            return None;
        }
        let elapsed = self.last_consume?.elapsed();
        self.interval.checked_sub(elapsed).filter(|wait| !wait.is_zero())
    }
}
