//! Update-interval policies.
//!
//! A strategy looks at the posting statistics gathered after a successful
//! check and decides how many minutes to wait before the next one.

use std::fmt;

use crate::feed::{Feed, PostStatistics, DEFAULT_UPDATE_INTERVAL};

pub trait UpdateStrategy: Send + Sync + fmt::Debug {
    /// New update interval in minutes, or `None` to keep the current one.
    fn next_interval(&self, feed: &Feed, stats: &PostStatistics, benchmark: bool) -> Option<u32>;

    fn name(&self) -> &'static str;

    /// Apply the policy to `feed` and count the check.
    fn update(&self, feed: &mut Feed, stats: &PostStatistics, benchmark: bool) {
        if let Some(minutes) = self.next_interval(feed, stats, benchmark) {
            if minutes != feed.update_interval {
                tracing::trace!(
                    feed_id = feed.id,
                    strategy = self.name(),
                    from = feed.update_interval,
                    to = minutes,
                    "Update interval changed"
                );
            }
            feed.update_interval = minutes;
        }
        feed.increase_checks();
    }
}

/// Compute fresh statistics for `feed` and let `strategy` update it.
pub fn update_check_interval(strategy: &dyn UpdateStrategy, feed: &mut Feed, benchmark: bool) {
    let stats = PostStatistics::new(feed);
    strategy.update(feed, &stats, benchmark);
}

/// Always checks every `minutes`.
#[derive(Debug, Clone, Copy)]
pub struct FixedIntervalStrategy {
    pub minutes: u32,
}

impl Default for FixedIntervalStrategy {
    fn default() -> Self {
        Self {
            minutes: DEFAULT_UPDATE_INTERVAL,
        }
    }
}

impl UpdateStrategy for FixedIntervalStrategy {
    fn next_interval(&self, _feed: &Feed, _stats: &PostStatistics, _benchmark: bool) -> Option<u32> {
        Some(self.minutes.max(1))
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Checks as often as the feed posts on average, within bounds.
///
/// Feeds whose statistics are not yet meaningful keep their interval. A feed
/// that just missed items is checked at the lower bound until the window
/// stops overflowing.
#[derive(Debug, Clone, Copy)]
pub struct MovingAverageStrategy {
    pub min_minutes: u32,
    pub max_minutes: u32,
}

impl Default for MovingAverageStrategy {
    fn default() -> Self {
        Self {
            min_minutes: 1,
            max_minutes: 24 * 60,
        }
    }
}

impl MovingAverageStrategy {
    fn clamp(&self, minutes: u64) -> u32 {
        let clamped = minutes.clamp(u64::from(self.min_minutes), u64::from(self.max_minutes));
        u32::try_from(clamped).unwrap_or(self.max_minutes)
    }
}

impl UpdateStrategy for MovingAverageStrategy {
    fn next_interval(&self, feed: &Feed, stats: &PostStatistics, _benchmark: bool) -> Option<u32> {
        if !stats.is_valid() {
            return None;
        }
        if feed.last_miss_time().is_some() && feed.last_miss_time() == feed.last_poll_time() {
            return Some(self.min_minutes);
        }
        Some(self.clamp(stats.average_gap().as_secs() / 60))
    }

    fn name(&self) -> &'static str {
        "moving_average"
    }
}
