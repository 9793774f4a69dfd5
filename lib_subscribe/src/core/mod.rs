//! # Subscription Core
//!
//! The subscription object, its consume cycle, the table topology resolver
//! and the timer that drives callback-mode subscriptions.

/// Consume cycle: pacing, topology refresh, bounded retries.
pub mod engine;
/// Timer-driven consumption with callbacks.
pub mod scheduler;
/// Subscription creation, topology refresh and teardown.
pub mod subscription;
/// Child table enumeration through the auxiliary `tbid` query.
pub mod topology;

pub use scheduler::{ScheduledSubscription, SubscriptionCallback, TimerId, subscribe_with_callback};
pub use subscription::{
    MAX_TOPIC_LEN, RowsOf, SubscribeOptions, Subscription, normalize_sql, normalize_topic,
    subscribe,
};
pub use topology::{find_from_clause, resolve_tables, table_id_sql};
