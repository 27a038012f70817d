use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::types::StoreError;
use super::FeedStore;
use crate::feed::{Feed, FeedItem};

#[derive(Default)]
struct State {
    feeds: BTreeMap<i64, Feed>,
    items: HashMap<i64, HashSet<String>>,
    next_id: i64,
}

/// In-process [`FeedStore`]. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the given feed URLs already added.
    pub fn with_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut state = store.lock();
            for url in urls {
                insert(&mut state, Feed::new(url));
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a feed by URL. Returns whether it existed.
    pub fn remove_feed(&self, url: &str) -> bool {
        let mut state = self.lock();
        let id = state.feeds.values().find(|f| f.url == url).map(|f| f.id);
        match id {
            Some(id) => {
                state.feeds.remove(&id);
                state.items.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Number of archived items of a feed.
    pub fn item_count(&self, feed_id: i64) -> usize {
        self.lock().items.get(&feed_id).map_or(0, HashSet::len)
    }
}

/// Insert unless the URL is taken. Returns whether the feed was added.
fn insert(state: &mut State, mut feed: Feed) -> bool {
    if state.feeds.values().any(|f| f.url == feed.url) {
        return false;
    }
    state.next_id += 1;
    feed.id = state.next_id;
    feed.free_memory();
    state.feeds.insert(feed.id, feed);
    true
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        Ok(self.lock().feeds.values().cloned().collect())
    }

    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        Ok(self.lock().feeds.values().find(|f| f.url == url).cloned())
    }

    async fn add_feed(&self, feed: &Feed) -> Result<bool, StoreError> {
        Ok(insert(&mut self.lock(), feed.clone()))
    }

    async fn update_feed(&self, feed: &Feed, replace_cached_items: bool) -> Result<(), StoreError> {
        let mut state = self.lock();
        let stored = state
            .feeds
            .get_mut(&feed.id)
            .ok_or(StoreError::NotFound(feed.id))?;

        let mut updated = feed.clone();
        updated.free_memory();
        if !replace_cached_items {
            updated.restore_item_cache(stored.cached_items().clone());
        }
        *stored = updated;
        Ok(())
    }

    async fn add_feed_items(&self, feed_id: i64, items: &[FeedItem]) -> Result<usize, StoreError> {
        let mut state = self.lock();
        if !state.feeds.contains_key(&feed_id) {
            return Err(StoreError::NotFound(feed_id));
        }
        let archived = state.items.entry(feed_id).or_default();
        let inserted = items
            .iter()
            .filter_map(|item| item.hash.clone())
            .filter(|hash| archived.insert(hash.clone()))
            .count();
        Ok(inserted)
    }
}
