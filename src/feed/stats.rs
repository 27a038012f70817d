//! Posting statistics derived from a feed's corrected item timestamps.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::record::Feed;

/// Gap and rate metrics over the cached item window.
///
/// Gap statistics are only meaningful when [`is_valid`](Self::is_valid)
/// returns true, i.e. the window holds at least two distinct timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostStatistics {
    item_count: usize,
    time_oldest: Option<DateTime<Utc>>,
    time_newest: Option<DateTime<Utc>>,
    /// Gaps between consecutive timestamps, ascending.
    gaps: Vec<Duration>,
    median_gap: Duration,
    average_gap: Duration,
    gap_std_dev: Duration,
    longest_gap: Duration,
    last_interval: Option<Duration>,
    avg_items_per_day: f64,
    delay_to_newest: Duration,
    valid: bool,
}

impl PostStatistics {
    /// Statistics for `feed`, measured against its last poll time.
    pub fn new(feed: &Feed) -> Self {
        Self::from_timestamps(feed.corrected_item_timestamps(), feed.last_poll_time())
    }

    /// Statistics over arbitrary timestamps. Without a poll time the current
    /// time is the reference for the delay.
    pub fn from_timestamps(
        timestamps: impl IntoIterator<Item = DateTime<Utc>>,
        last_poll_time: Option<DateTime<Utc>>,
    ) -> Self {
        let mut sorted: Vec<DateTime<Utc>> = timestamps.into_iter().collect();
        sorted.sort();

        let mut stats = Self {
            item_count: sorted.len(),
            ..Self::default()
        };
        let (Some(&oldest), Some(&newest)) = (sorted.first(), sorted.last()) else {
            return stats;
        };
        stats.time_oldest = Some(oldest);
        stats.time_newest = Some(newest);

        let reference = last_poll_time.unwrap_or_else(Utc::now);
        stats.delay_to_newest = to_std(reference - newest);

        let range = newest - oldest;
        let range_days = range.num_days().max(1) as f64;
        stats.avg_items_per_day = sorted.len() as f64 / range_days;

        stats.valid = sorted.windows(2).any(|w| w[0] != w[1]);
        if !stats.valid {
            return stats;
        }

        let mut gaps: Vec<Duration> = sorted.windows(2).map(|w| to_std(w[1] - w[0])).collect();
        // Sorted ascending, so the last pair holds the newest two items
        stats.last_interval = gaps.last().copied();
        gaps.sort();

        stats.median_gap = median(&gaps);
        stats.average_gap = to_std(range) / gaps.len() as u32;
        stats.gap_std_dev = std_dev(&gaps);
        stats.longest_gap = gaps.last().copied().unwrap_or_default();
        stats.gaps = gaps;
        stats
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn time_oldest(&self) -> Option<DateTime<Utc>> {
        self.time_oldest
    }

    pub fn time_newest(&self) -> Option<DateTime<Utc>> {
        self.time_newest
    }

    pub fn gaps(&self) -> &[Duration] {
        &self.gaps
    }

    pub fn median_gap(&self) -> Duration {
        self.median_gap
    }

    /// Time range divided by the number of gaps.
    pub fn average_gap(&self) -> Duration {
        self.average_gap
    }

    /// Population standard deviation of the gaps.
    pub fn gap_std_dev(&self) -> Duration {
        self.gap_std_dev
    }

    pub fn longest_gap(&self) -> Duration {
        self.longest_gap
    }

    /// Gap between the newest and second-newest item.
    pub fn last_interval(&self) -> Option<Duration> {
        self.last_interval
    }

    pub fn avg_items_per_day(&self) -> f64 {
        self.avg_items_per_day
    }

    /// Time from the newest item to the reference poll.
    pub fn delay_to_newest(&self) -> Duration {
        self.delay_to_newest
    }
}

fn to_std(delta: chrono::TimeDelta) -> Duration {
    delta.to_std().unwrap_or_default()
}

fn median(sorted: &[Duration]) -> Duration {
    let n = sorted.len();
    match n {
        0 => Duration::ZERO,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2,
    }
}

fn std_dev(gaps: &[Duration]) -> Duration {
    if gaps.is_empty() {
        return Duration::ZERO;
    }
    let n = gaps.len() as f64;
    let mean = gaps.iter().map(Duration::as_secs_f64).sum::<f64>() / n;
    let variance = gaps
        .iter()
        .map(|g| (g.as_secs_f64() - mean).powi(2))
        .sum::<f64>()
        / n;
    Duration::from_secs_f64(variance.sqrt())
}
