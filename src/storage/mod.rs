//! Persistence of feed state.
//!
//! [`FeedStore`] is the narrow interface the reader depends on. [`Database`]
//! implements it on SQLite, [`MemoryStore`] keeps everything in process.

mod feeds;
mod memory;
mod schema;
mod types;

use async_trait::async_trait;

use crate::feed::{Feed, FeedItem};

pub use memory::MemoryStore;
pub use schema::Database;
pub use types::{DatabaseError, StoreError};

/// Load and save feeds.
///
/// Implementations must tolerate concurrent calls for distinct feeds.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// All feeds including their item caches, ordered by id.
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError>;

    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError>;

    /// Insert a new feed. Returns `false` if a feed with the same URL exists.
    async fn add_feed(&self, feed: &Feed) -> Result<bool, StoreError>;

    /// Write back the state of an existing feed.
    ///
    /// The item cache is only rewritten when `replace_cached_items` is set.
    /// Fails with [`StoreError::NotFound`] for unknown ids.
    async fn update_feed(&self, feed: &Feed, replace_cached_items: bool) -> Result<(), StoreError>;

    /// Archive items of a feed, ignoring ones already stored. Returns the
    /// number of items inserted.
    async fn add_feed_items(&self, feed_id: i64, items: &[FeedItem]) -> Result<usize, StoreError>;
}
