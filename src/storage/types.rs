use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::feed::{from_millis, validate_year, Feed, FeedActivityPattern};

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database
    #[error("The database is locked by another process. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY, SQLITE_LOCKED and SQLITE_CANTOPEN messages.
pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Errors returned by [`FeedStore`](super::FeedStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database failed
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// No feed with this id exists
    #[error("Feed {0} not found")]
    NotFound(i64),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(DatabaseError::from_sqlx(err))
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Durable columns of the `feeds` table, in insert/update bind order.
pub(crate) const FEED_COLUMNS: [&str; 20] = [
    "url",
    "checks",
    "update_interval",
    "unreachable_count",
    "unparsable_count",
    "misses",
    "last_miss_time",
    "total_processing_time_ms",
    "number_of_items_received",
    "window_size",
    "variable_window_size",
    "last_poll_time",
    "last_but_one_poll_time",
    "last_successful_check_time",
    "http_last_modified",
    "http_date_last_poll",
    "last_etag",
    "activity_pattern",
    "blocked",
    "last_feed_task_result",
];

/// One row of the `feeds` table. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub url: String,
    pub checks: i64,
    pub update_interval: i64,
    pub unreachable_count: i64,
    pub unparsable_count: i64,
    pub misses: i64,
    pub last_miss_time: Option<i64>,
    pub total_processing_time_ms: i64,
    pub number_of_items_received: i64,
    pub window_size: Option<i64>,
    pub variable_window_size: Option<bool>,
    pub last_poll_time: Option<i64>,
    pub last_but_one_poll_time: Option<i64>,
    pub last_successful_check_time: Option<i64>,
    pub http_last_modified: Option<i64>,
    pub http_date_last_poll: Option<i64>,
    pub last_etag: Option<String>,
    pub activity_pattern: String,
    pub blocked: bool,
    pub last_feed_task_result: Option<String>,
}

fn millis(date: Option<DateTime<Utc>>) -> Option<i64> {
    validate_year(date).map(|d| d.timestamp_millis())
}

fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

impl FeedRow {
    pub fn from_feed(feed: &Feed) -> Self {
        Self {
            id: feed.id,
            url: feed.url.clone(),
            checks: i64::from(feed.checks),
            update_interval: i64::from(feed.update_interval),
            unreachable_count: i64::from(feed.unreachable_count),
            unparsable_count: i64::from(feed.unparsable_count),
            misses: i64::from(feed.misses()),
            last_miss_time: millis(feed.last_miss_time()),
            total_processing_time_ms: i64::try_from(feed.total_processing_time_ms).unwrap_or(i64::MAX),
            number_of_items_received: i64::try_from(feed.number_of_items_received())
                .unwrap_or(i64::MAX),
            window_size: feed.window_size().map(i64::from),
            variable_window_size: feed.has_variable_window_size(),
            last_poll_time: millis(feed.last_poll_time()),
            last_but_one_poll_time: millis(feed.last_but_one_poll_time()),
            last_successful_check_time: millis(feed.last_successful_check_time),
            http_last_modified: millis(feed.http_last_modified()),
            http_date_last_poll: millis(feed.http_date_last_poll()),
            last_etag: feed.last_etag.clone(),
            activity_pattern: feed.activity_pattern.as_str().to_string(),
            blocked: feed.is_blocked(),
            last_feed_task_result: feed.last_feed_task_result.map(|r| r.as_str().to_string()),
        }
    }

    pub fn into_feed(self, cache: HashMap<String, DateTime<Utc>>) -> Feed {
        let mut feed = Feed::new(self.url).with_id(self.id);
        feed.checks = count(self.checks);
        feed.update_interval = count(self.update_interval);
        feed.unreachable_count = count(self.unreachable_count);
        feed.unparsable_count = count(self.unparsable_count);
        feed.misses = count(self.misses);
        feed.last_miss_time = validate_year(from_millis(self.last_miss_time));
        feed.total_processing_time_ms = u64::try_from(self.total_processing_time_ms).unwrap_or_default();
        feed.number_of_items_received = u64::try_from(self.number_of_items_received).unwrap_or_default();
        feed.window_size = self.window_size.and_then(|w| u32::try_from(w).ok());
        feed.variable_window_size = self.variable_window_size;
        feed.last_poll_time = validate_year(from_millis(self.last_poll_time));
        feed.last_but_one_poll_time = validate_year(from_millis(self.last_but_one_poll_time));
        feed.last_successful_check_time = validate_year(from_millis(self.last_successful_check_time));
        feed.set_http_last_modified(from_millis(self.http_last_modified));
        feed.set_http_date_last_poll(from_millis(self.http_date_last_poll));
        feed.last_etag = self.last_etag;
        feed.activity_pattern = self.activity_pattern.parse().unwrap_or_else(|_| {
            tracing::warn!(feed_id = self.id, value = %self.activity_pattern, "Unknown activity pattern");
            FeedActivityPattern::Unknown
        });
        feed.blocked = self.blocked;
        feed.last_feed_task_result = self
            .last_feed_task_result
            .as_deref()
            .and_then(|r| r.parse().ok());
        feed.restore_item_cache(cache);
        feed
    }
}
