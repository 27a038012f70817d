//! The per-feed record: durable polling state plus the de-duplication window.
//!
//! A [`Feed`] is owned by exactly one party at a time. The scheduler holds it
//! while idle and moves it into a [`FeedTask`](crate::reader::FeedTask) for
//! the duration of a poll; the task hands it back when done. The lazily
//! derived window dates are memoized in a [`OnceLock`] that every item-set
//! mutation replaces.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use super::item::{FeedItem, ItemHasher};
use super::types::{FeedActivityPattern, FeedTaskResult};

/// Update interval (minutes) for feeds nothing has been learned about yet.
pub const DEFAULT_UPDATE_INTERVAL: u32 = 60;

/// Publish dates before 1990-01-01T00:00:00Z are treated as garbage.
const SANITY_FLOOR_SECS: i64 = 631_152_000;

/// Dates beyond this year are corrupt and stored as absent.
const MAX_VALID_YEAR: i32 = 9999;

/// Newest, second-newest and oldest corrected timestamps of the cached window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowDates {
    pub newest: Option<DateTime<Utc>>,
    pub newest_hash: Option<String>,
    pub second_newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
}

/// A monitored feed and everything learned about it.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub url: String,

    /// Items of the current poll. Freed after each task.
    items: Vec<FeedItem>,
    /// Item hash -> corrected publish date for the most recent non-empty window.
    item_cache: HashMap<String, DateTime<Utc>>,
    /// Items of the current poll that were not in the cache.
    new_items: Vec<FeedItem>,
    pub(crate) number_of_items_received: u64,

    pub(crate) window_size: Option<u32>,
    /// `None` until a second window has been observed; `Some(true)` is permanent.
    pub(crate) variable_window_size: Option<bool>,

    pub checks: u32,
    /// Minutes until the feed is expected to have at least one new item.
    pub update_interval: u32,
    pub unreachable_count: u32,
    pub unparsable_count: u32,
    pub(crate) misses: u32,
    pub(crate) last_miss_time: Option<DateTime<Utc>>,
    pub(crate) total_processing_time_ms: u64,

    pub(crate) last_poll_time: Option<DateTime<Utc>>,
    pub(crate) last_but_one_poll_time: Option<DateTime<Utc>>,
    pub last_successful_check_time: Option<DateTime<Utc>>,
    pub(crate) http_last_modified: Option<DateTime<Utc>>,
    pub(crate) http_date_last_poll: Option<DateTime<Utc>>,
    pub last_etag: Option<String>,

    pub activity_pattern: FeedActivityPattern,
    /// Once set, the feed is never scheduled again.
    pub(crate) blocked: bool,
    pub last_feed_task_result: Option<FeedTaskResult>,

    window_dates: OnceLock<WindowDates>,
}

impl Feed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: -1,
            url: url.into(),
            items: Vec::new(),
            item_cache: HashMap::new(),
            new_items: Vec::new(),
            number_of_items_received: 0,
            window_size: None,
            variable_window_size: None,
            checks: 0,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            unreachable_count: 0,
            unparsable_count: 0,
            misses: 0,
            last_miss_time: None,
            total_processing_time_ms: 0,
            last_poll_time: None,
            last_but_one_poll_time: None,
            last_successful_check_time: None,
            http_last_modified: None,
            http_date_last_poll: None,
            last_etag: None,
            activity_pattern: FeedActivityPattern::Unknown,
            blocked: false,
            last_feed_task_result: None,
            window_dates: OnceLock::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    // ========================================================================
    // Item Window
    // ========================================================================

    /// Replace the current window with `items`.
    ///
    /// Items whose hash is not cached are new: their publish date is corrected
    /// and they are collected in [`new_items`](Self::new_items). Known items keep
    /// the corrected date recorded when they were first seen. The cache is then
    /// replaced by the new window, unless the new window is empty and the cache
    /// is not: feeds that briefly serve an empty document must not lose their
    /// dedup history.
    pub fn set_items(&mut self, items: Vec<FeedItem>, hasher: &dyn ItemHasher) {
        let mut new_items = Vec::new();
        let mut cache = HashMap::with_capacity(items.len());
        let mut window = Vec::with_capacity(items.len());
        let reference = self.reference_instant();

        for mut item in items {
            let hash = hasher.hash(&item);
            let known = self
                .item_cache
                .get(&hash)
                .or_else(|| cache.get(&hash))
                .copied();
            let corrected = known.unwrap_or_else(|| correct_against(item.published, reference));
            item.corrected_published = Some(corrected);
            cache.insert(hash.clone(), corrected);
            item.hash = Some(hash);
            if known.is_none() {
                new_items.push(item.clone());
            }
            window.push(item);
        }

        if self.item_cache.is_empty() || !cache.is_empty() {
            self.item_cache = cache;
        }
        self.number_of_items_received += new_items.len() as u64;
        self.new_items = new_items;
        self.items = window;
        self.window_dates = OnceLock::new();
    }

    /// Add a single item to the current window, extending the cache.
    pub fn add_item(&mut self, mut item: FeedItem, hasher: &dyn ItemHasher) {
        let hash = hasher.hash(&item);
        let known = self.item_cache.get(&hash).copied();
        let corrected =
            known.unwrap_or_else(|| correct_against(item.published, self.reference_instant()));
        item.corrected_published = Some(corrected);
        item.hash = Some(hash.clone());
        if known.is_none() {
            self.item_cache.insert(hash, corrected);
            self.new_items.push(item.clone());
            self.number_of_items_received += 1;
        }
        self.items.push(item);
        self.window_dates = OnceLock::new();
    }

    /// Sanitize a raw publish date against the poll that fetched it.
    ///
    /// The reference instant is the last poll time, or now if the feed was
    /// never polled. Absent dates, dates after the reference and dates before
    /// 1990-01-01 are replaced by the reference; anything else is kept. The
    /// last-but-one poll time does not influence the outcome.
    pub fn correct_timestamp(
        raw: Option<DateTime<Utc>>,
        last_poll_time: Option<DateTime<Utc>>,
        _last_but_one_poll_time: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        correct_against(raw, last_poll_time.unwrap_or_else(Utc::now))
    }

    /// The instant undated items are pinned to. One window shares one instant.
    fn reference_instant(&self) -> DateTime<Utc> {
        self.last_poll_time.unwrap_or_else(Utc::now)
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    pub fn new_items(&self) -> &[FeedItem] {
        &self.new_items
    }

    pub fn has_new_items(&self) -> bool {
        !self.new_items.is_empty()
    }

    pub fn cached_items(&self) -> &HashMap<String, DateTime<Utc>> {
        &self.item_cache
    }

    pub fn corrected_item_timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.item_cache.values().copied()
    }

    /// Install a cache loaded from storage.
    pub(crate) fn restore_item_cache(&mut self, cache: HashMap<String, DateTime<Utc>>) {
        self.item_cache = cache;
        self.window_dates = OnceLock::new();
    }

    pub fn number_of_items_received(&self) -> u64 {
        self.number_of_items_received
    }

    /// Drop the per-poll item lists. The cache is kept.
    pub fn free_memory(&mut self) {
        self.items = Vec::new();
        self.new_items = Vec::new();
    }

    // ========================================================================
    // Window Size
    // ========================================================================

    pub fn window_size(&self) -> Option<u32> {
        self.window_size
    }

    /// Record the size of the latest window.
    ///
    /// A size that differs from the previous one marks the feed as having a
    /// variable window, permanently. Otherwise the flag is set to `false` the
    /// first time a size is recorded and left alone afterwards.
    pub fn set_window_size(&mut self, size: u32) {
        let previous = self.window_size.replace(size);
        match previous {
            Some(old) if old != size => self.variable_window_size = Some(true),
            _ if self.variable_window_size.is_none() => self.variable_window_size = Some(false),
            _ => {}
        }
    }

    pub fn has_variable_window_size(&self) -> Option<bool> {
        self.variable_window_size
    }

    // ========================================================================
    // Derived Window Dates
    // ========================================================================

    fn window_dates(&self) -> &WindowDates {
        self.window_dates
            .get_or_init(|| compute_window_dates(&self.item_cache))
    }

    pub fn newest_item(&self) -> Option<DateTime<Utc>> {
        self.window_dates().newest
    }

    pub fn newest_item_hash(&self) -> Option<&str> {
        self.window_dates().newest_hash.as_deref()
    }

    pub fn second_newest_item(&self) -> Option<DateTime<Utc>> {
        self.window_dates().second_newest
    }

    pub fn oldest_item_in_window(&self) -> Option<DateTime<Utc>> {
        self.window_dates().oldest
    }

    // ========================================================================
    // Poll Bookkeeping
    // ========================================================================

    pub fn last_poll_time(&self) -> Option<DateTime<Utc>> {
        self.last_poll_time
    }

    pub fn last_but_one_poll_time(&self) -> Option<DateTime<Utc>> {
        self.last_but_one_poll_time
    }

    /// Record a new poll; the previous poll time becomes the last-but-one.
    pub fn set_last_poll_time(&mut self, time: DateTime<Utc>) {
        self.last_but_one_poll_time = self.last_poll_time;
        self.last_poll_time = Some(time);
    }

    pub fn http_last_modified(&self) -> Option<DateTime<Utc>> {
        self.http_last_modified
    }

    pub fn set_http_last_modified(&mut self, date: Option<DateTime<Utc>>) {
        self.http_last_modified = validate_year(date);
    }

    pub fn http_date_last_poll(&self) -> Option<DateTime<Utc>> {
        self.http_date_last_poll
    }

    pub fn set_http_date_last_poll(&mut self, date: Option<DateTime<Utc>>) {
        self.http_date_last_poll = validate_year(date);
    }

    pub fn increase_checks(&mut self) {
        self.checks += 1;
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn last_miss_time(&self) -> Option<DateTime<Utc>> {
        self.last_miss_time
    }

    pub fn increase_misses(&mut self) {
        self.misses += 1;
        self.last_miss_time = self.last_poll_time;
    }

    pub fn total_processing_time(&self) -> Duration {
        Duration::from_millis(self.total_processing_time_ms)
    }

    pub fn add_processing_time(&mut self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.total_processing_time_ms = self.total_processing_time_ms.saturating_add(ms);
    }

    /// Total processing time divided by the number of completed attempts.
    pub fn average_processing_time(&self) -> Duration {
        let attempts = u64::from(self.checks + self.unreachable_count).max(1);
        Duration::from_millis(self.total_processing_time_ms / attempts)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Exclude the feed from scheduling. There is no way back.
    pub fn block(&mut self) {
        self.blocked = true;
    }
}

fn correct_against(raw: Option<DateTime<Utc>>, reference: DateTime<Utc>) -> DateTime<Utc> {
    match raw {
        Some(date) if date > reference => {
            tracing::trace!(published = %date, reference = %reference, "Publish date in the future");
            reference
        }
        Some(date) if date.timestamp() < SANITY_FLOOR_SECS => {
            tracing::trace!(published = %date, "Publish date before 1990");
            reference
        }
        Some(date) => date,
        None => reference,
    }
}

/// Normalize dates with an impossible year to `None`.
pub fn validate_year(date: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    date.filter(|d| d.year() <= MAX_VALID_YEAR)
}

/// Convert epoch milliseconds to a UTC date, dropping out-of-range values.
pub fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn compute_window_dates(cache: &HashMap<String, DateTime<Utc>>) -> WindowDates {
    let mut entries: Vec<(&String, &DateTime<Utc>)> = cache.iter().collect();
    // Newest first; the hash breaks ties so the newest hash is deterministic.
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    WindowDates {
        newest: validate_year(entries.first().map(|(_, d)| **d)),
        newest_hash: entries.first().map(|(h, _)| (*h).clone()),
        second_newest: validate_year(entries.get(1).map(|(_, d)| **d)),
        oldest: validate_year(entries.last().map(|(_, d)| **d)),
    }
}
