use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteArguments;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;

use super::schema::Database;
use super::types::{FeedRow, StoreError, FEED_COLUMNS};
use super::FeedStore;
use crate::feed::{from_millis, Feed, FeedItem};

/// Batch size for multi-row inserts (3-8 binds per row, well below SQLite's limit).
const BATCH_SIZE: usize = 100;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

type CacheRow = (i64, String, i64);

/// Bind every column of [`FEED_COLUMNS`] in order.
fn bind_feed(query: SqliteQuery<'_>, row: FeedRow) -> SqliteQuery<'_> {
    query
        .bind(row.url)
        .bind(row.checks)
        .bind(row.update_interval)
        .bind(row.unreachable_count)
        .bind(row.unparsable_count)
        .bind(row.misses)
        .bind(row.last_miss_time)
        .bind(row.total_processing_time_ms)
        .bind(row.number_of_items_received)
        .bind(row.window_size)
        .bind(row.variable_window_size)
        .bind(row.last_poll_time)
        .bind(row.last_but_one_poll_time)
        .bind(row.last_successful_check_time)
        .bind(row.http_last_modified)
        .bind(row.http_date_last_poll)
        .bind(row.last_etag)
        .bind(row.activity_pattern)
        .bind(row.blocked)
        .bind(row.last_feed_task_result)
}

fn select_feeds_sql(filter: &str) -> String {
    format!("SELECT id, {} FROM feeds {}", FEED_COLUMNS.join(", "), filter)
}

fn group_cache(rows: Vec<CacheRow>) -> HashMap<i64, HashMap<String, DateTime<Utc>>> {
    let mut caches: HashMap<i64, HashMap<String, DateTime<Utc>>> = HashMap::new();
    for (feed_id, hash, published) in rows {
        if let Some(date) = from_millis(Some(published)) {
            caches.entry(feed_id).or_default().insert(hash, date);
        }
    }
    caches
}

async fn write_item_cache(
    conn: &mut SqliteConnection,
    feed_id: i64,
    cache: &HashMap<String, DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM feed_item_cache WHERE feed_id = ?")
        .bind(feed_id)
        .execute(&mut *conn)
        .await?;

    let entries: Vec<(&String, &DateTime<Utc>)> = cache.iter().collect();
    for chunk in entries.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO feed_item_cache (feed_id, hash, corrected_published) ");
        builder.push_values(chunk, |mut b, (hash, published)| {
            b.push_bind(feed_id)
                .push_bind(hash.as_str())
                .push_bind(published.timestamp_millis());
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

impl Database {
    /// Number of archived items of a feed.
    pub async fn count_feed_items(&self, feed_id: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feed_items WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete a feed together with its cache and archived items.
    pub async fn remove_feed(&self, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FeedStore for Database {
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let rows: Vec<FeedRow> = sqlx::query_as(&select_feeds_sql("ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        let cache_rows: Vec<CacheRow> =
            sqlx::query_as("SELECT feed_id, hash, corrected_published FROM feed_item_cache")
                .fetch_all(&self.pool)
                .await?;

        let mut caches = group_cache(cache_rows);
        let feeds = rows
            .into_iter()
            .map(|row| {
                let cache = caches.remove(&row.id).unwrap_or_default();
                row.into_feed(cache)
            })
            .collect();
        Ok(feeds)
    }

    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        let row: Option<FeedRow> = sqlx::query_as(&select_feeds_sql("WHERE url = ?"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let cache_rows: Vec<CacheRow> = sqlx::query_as(
            "SELECT feed_id, hash, corrected_published FROM feed_item_cache WHERE feed_id = ?",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        let cache = group_cache(cache_rows).remove(&row.id).unwrap_or_default();
        Ok(Some(row.into_feed(cache)))
    }

    async fn add_feed(&self, feed: &Feed) -> Result<bool, StoreError> {
        let sql = format!(
            "INSERT INTO feeds ({}) VALUES ({}) ON CONFLICT(url) DO NOTHING",
            FEED_COLUMNS.join(", "),
            vec!["?"; FEED_COLUMNS.len()].join(", ")
        );

        let mut tx = self.pool.begin().await?;
        let result = bind_feed(sqlx::query(&sql), FeedRow::from_feed(feed))
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tracing::debug!(url = %feed.url, "Feed already stored");
            return Ok(false);
        }

        if !feed.cached_items().is_empty() {
            write_item_cache(&mut tx, result.last_insert_rowid(), feed.cached_items()).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn update_feed(&self, feed: &Feed, replace_cached_items: bool) -> Result<(), StoreError> {
        let assignments: Vec<String> = FEED_COLUMNS.iter().map(|c| format!("{c} = ?")).collect();
        let sql = format!("UPDATE feeds SET {} WHERE id = ?", assignments.join(", "));

        let mut tx = self.pool.begin().await?;
        let result = bind_feed(sqlx::query(&sql), FeedRow::from_feed(feed))
            .bind(feed.id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(feed.id));
        }

        if replace_cached_items {
            write_item_cache(&mut tx, feed.id, feed.cached_items()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn add_feed_items(&self, feed_id: i64, items: &[FeedItem]) -> Result<usize, StoreError> {
        let items: Vec<&FeedItem> = items.iter().filter(|i| i.hash.is_some()).collect();
        if items.is_empty() {
            return Ok(0);
        }

        let fetched_at = Utc::now().timestamp_millis();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for chunk in items.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO feed_items (feed_id, hash, title, link, raw_id, published, corrected_published, fetched_at) ",
            );
            builder.push_values(chunk, |mut b, item| {
                b.push_bind(feed_id)
                    .push_bind(item.hash.as_deref())
                    .push_bind(item.title.as_deref())
                    .push_bind(item.link.as_deref())
                    .push_bind(item.raw_id.as_deref())
                    .push_bind(item.published.map(|d| d.timestamp_millis()))
                    .push_bind(item.corrected_published.map(|d| d.timestamp_millis()))
                    .push_bind(fetched_at);
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    }
}
