//! The periodic dispatch pass.
//!
//! [`SchedulerTask`] owns every feed it schedules. An idle feed sits in the
//! slot map by value; dispatching moves it into a spawned [`FeedTask`] and
//! leaves the join handle in its slot, so a feed can never be polled twice at
//! once. Finished handles are harvested at the start of the next pass, which
//! puts the updated feed back.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::task::{FeedTask, TaskContext};
use crate::feed::{Feed, FeedActivityPattern, FeedTaskResult};

/// Dispatch and blocking policy.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum number of feed tasks running at the same time.
    pub thread_count: usize,
    pub wake_up_interval: Duration,
    /// Failure allowance for feeds that have never been checked successfully.
    pub max_immediate_retries: u32,
    pub max_average_processing_time: Duration,
    pub checks_to_unreachable_ratio: u32,
    pub checks_to_unparsable_ratio: u32,
    /// When non-empty, only feeds with one of these patterns are scheduled.
    pub activity_patterns: Vec<FeedActivityPattern>,
    pub monitoring: MonitoringSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            thread_count: 200,
            wake_up_interval: Duration::from_secs(60),
            max_immediate_retries: 3,
            max_average_processing_time: Duration::from_secs(10 * 60),
            checks_to_unreachable_ratio: 10,
            checks_to_unparsable_ratio: 10,
            activity_patterns: Vec::new(),
            monitoring: MonitoringSettings::default(),
        }
    }
}

/// Thresholds for the per-pass health report.
#[derive(Debug, Clone)]
pub struct MonitoringSettings {
    pub max_slow_percentage: u32,
    pub max_unreachable_percentage: u32,
    pub max_unparsable_percentage: u32,
    pub wake_up_warning: Duration,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            max_slow_percentage: 10,
            max_unreachable_percentage: 2,
            max_unparsable_percentage: 2,
            wake_up_warning: Duration::from_secs(2 * 60),
        }
    }
}

/// Below this many affected feeds a result class is never reported.
const MIN_TOLERATED_FEEDS: usize = 10;
const MAX_DELAYED_FEEDS: usize = 10;
const LOW_THROUGHPUT_PASSES: u32 = 3;

impl SchedulerSettings {
    /// Why `feed` should be blocked, if it should.
    pub fn block_reason(&self, feed: &Feed) -> Option<&'static str> {
        let attempts = feed.checks + feed.unreachable_count + feed.unparsable_count;
        if attempts >= 3 && feed.average_processing_time() >= self.max_average_processing_time {
            return Some("average processing time too high");
        }
        if let Some(limit) = feed.unreachable_count.checked_div(self.checks_to_unreachable_ratio) {
            if feed.checks < limit {
                return Some("unreachable too often");
            }
        }
        if let Some(limit) = feed.unparsable_count.checked_div(self.checks_to_unparsable_ratio) {
            if feed.checks < limit {
                return Some("unparsable too often");
            }
        }
        None
    }

    /// Whether `feed` is due for a poll at `now`.
    pub fn needs_lookup(&self, feed: &Feed, now: DateTime<Utc>) -> bool {
        if feed.is_blocked() {
            return false;
        }
        let Some(last_poll) = feed.last_poll_time() else {
            return true;
        };
        let immediate_retry = feed.checks == 0
            && feed.unreachable_count <= self.max_immediate_retries
            && feed.unparsable_count <= self.max_immediate_retries;
        let interval = chrono::Duration::minutes(i64::from(feed.update_interval));
        immediate_retry || now - last_poll > interval
    }

    pub fn is_selected(&self, feed: &Feed) -> bool {
        self.activity_patterns.is_empty() || self.activity_patterns.contains(&feed.activity_pattern)
    }
}

/// Counters for one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Feeds dispatched in this pass.
    pub scheduled: usize,
    /// Feeds skipped because their previous task is still running.
    pub delayed: usize,
    /// Tasks harvested since the previous pass.
    pub processed: usize,
    pub results: BTreeMap<FeedTaskResult, usize>,
    /// Feeds blocked in this pass.
    pub blocked: usize,
    /// Time since the previous pass; `None` on the first one.
    pub wake_up_gap: Option<Duration>,
    pub problems: Vec<String>,
}

impl PassReport {
    pub fn count(&self, result: FeedTaskResult) -> usize {
        self.results.get(&result).copied().unwrap_or(0)
    }

    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

struct RunningTask {
    url: String,
    handle: JoinHandle<(Feed, FeedTaskResult)>,
}

enum Slot {
    Idle(Feed),
    Running(RunningTask),
}

impl Slot {
    fn url(&self) -> &str {
        match self {
            Slot::Idle(feed) => &feed.url,
            Slot::Running(task) => &task.url,
        }
    }
}

pub struct SchedulerTask {
    slots: HashMap<i64, Slot>,
    /// Feeds removed from the store while their task was running.
    removed: HashSet<i64>,
    ctx: Arc<TaskContext>,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    last_wake_up: Option<Instant>,
    low_throughput_passes: u32,
    /// A feed was lost from the slot map and only the store can restore it.
    resync_needed: bool,
}

impl SchedulerTask {
    pub fn new(feeds: Vec<Feed>, ctx: Arc<TaskContext>, settings: SchedulerSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.thread_count.max(1)));
        Self {
            slots: feeds.into_iter().map(|f| (f.id, Slot::Idle(f))).collect(),
            removed: HashSet::new(),
            ctx,
            settings,
            permits,
            last_wake_up: None,
            low_throughput_passes: 0,
            resync_needed: false,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn feed_count(&self) -> usize {
        self.slots.len()
    }

    pub fn running_count(&self) -> usize {
        self.slots.values().filter(|s| matches!(s, Slot::Running(_))).count()
    }

    /// Whether the next tick must call [`synchronize`](Self::synchronize)
    /// regardless of the store sync interval.
    pub fn needs_resync(&self) -> bool {
        self.resync_needed
    }

    /// The feed with `id`, unless it is currently being polled.
    pub fn idle_feed(&self, id: i64) -> Option<&Feed> {
        match self.slots.get(&id) {
            Some(Slot::Idle(feed)) => Some(feed),
            _ => None,
        }
    }

    /// Adopt feeds that appeared in the store and drop those that vanished.
    ///
    /// Feeds already known keep their in-memory state. A vanished feed whose
    /// task is still running is dropped once the task finishes.
    /// Returns `(added, removed)`.
    pub fn synchronize(&mut self, feeds: Vec<Feed>) -> (usize, usize) {
        self.resync_needed = false;
        let urls: HashSet<&str> = feeds.iter().map(|f| f.url.as_str()).collect();
        let vanished: Vec<(i64, bool)> = self
            .slots
            .iter()
            .filter(|(id, slot)| !urls.contains(slot.url()) && !self.removed.contains(*id))
            .map(|(id, slot)| (*id, matches!(slot, Slot::Running(_))))
            .collect();

        for (id, running) in &vanished {
            if *running {
                self.removed.insert(*id);
            } else {
                self.slots.remove(id);
            }
        }

        let mut added = 0;
        for feed in feeds {
            if !self.slots.contains_key(&feed.id) {
                self.slots.insert(feed.id, Slot::Idle(feed));
                added += 1;
            }
        }

        if added > 0 || !vanished.is_empty() {
            tracing::info!(added, removed = vanished.len(), "Synchronized feeds with store");
        }
        (added, vanished.len())
    }

    /// One dispatch pass at the current time.
    pub async fn run(&mut self) -> PassReport {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&mut self, now: DateTime<Utc>) -> PassReport {
        let wake_up = Instant::now();
        let mut report = PassReport {
            wake_up_gap: self.last_wake_up.map(|last| wake_up.duration_since(last)),
            ..PassReport::default()
        };
        self.last_wake_up = Some(wake_up);

        self.harvest(&mut report).await;

        let mut ids: Vec<i64> = self.slots.keys().copied().collect();
        ids.shuffle(&mut rand::rng());

        for id in ids {
            let Some(slot) = self.slots.remove(&id) else {
                continue;
            };
            let slot = match slot {
                Slot::Running(task) => {
                    report.delayed += 1;
                    Slot::Running(task)
                }
                Slot::Idle(feed) if !self.settings.is_selected(&feed) => Slot::Idle(feed),
                Slot::Idle(mut feed) => {
                    if self.apply_blocking(&mut feed).await {
                        report.blocked += 1;
                    }
                    if self.settings.needs_lookup(&feed, now) {
                        report.scheduled += 1;
                        Slot::Running(self.dispatch(feed))
                    } else {
                        Slot::Idle(feed)
                    }
                }
            };
            self.slots.insert(id, slot);
        }

        report.problems = self.health_problems(&report);
        log_report(&report);
        report
    }

    /// Wait for every running task and put its feed back.
    pub async fn drain(&mut self) -> PassReport {
        let mut report = PassReport::default();
        let running: Vec<i64> = self
            .slots
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Running(_)))
            .map(|(id, _)| *id)
            .collect();
        for id in running {
            self.collect(id, &mut report).await;
        }
        report
    }

    async fn harvest(&mut self, report: &mut PassReport) {
        let finished: Vec<i64> = self
            .slots
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Running(task) if task.handle.is_finished()))
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.collect(id, report).await;
        }
    }

    async fn collect(&mut self, id: i64, report: &mut PassReport) {
        let Some(Slot::Running(task)) = self.slots.remove(&id) else {
            return;
        };

        let (feed, result) = match task.handle.await {
            Ok(done) => (Some(done.0), done.1),
            Err(e) => {
                tracing::error!(feed_id = id, url = %task.url, error = %e, "Feed task aborted");
                let reloaded = match self.ctx.store.get_feed_by_url(&task.url).await {
                    Ok(feed) => feed,
                    Err(e) => {
                        tracing::error!(
                            feed_id = id,
                            url = %task.url,
                            error = %e,
                            "Failed to reload feed, resynchronizing on next tick"
                        );
                        self.resync_needed = true;
                        None
                    }
                };
                (reloaded, FeedTaskResult::Error)
            }
        };

        report.processed += 1;
        *report.results.entry(result).or_default() += 1;

        if self.removed.remove(&id) {
            tracing::debug!(feed_id = id, url = %task.url, "Dropping feed removed from store");
            return;
        }
        if let Some(feed) = feed {
            self.slots.insert(id, Slot::Idle(feed));
        }
    }

    /// Block `feed` if the policy says so. Returns whether it was blocked now.
    async fn apply_blocking(&self, feed: &mut Feed) -> bool {
        if feed.is_blocked() {
            return false;
        }
        let Some(reason) = self.settings.block_reason(feed) else {
            return false;
        };

        feed.block();
        tracing::error!(
            feed_id = feed.id,
            url = %feed.url,
            reason,
            checks = feed.checks,
            unreachable = feed.unreachable_count,
            unparsable = feed.unparsable_count,
            avg_processing_ms = feed.average_processing_time().as_millis() as u64,
            "Blocking feed"
        );
        if let Err(e) = self.ctx.store.update_feed(feed, false).await {
            tracing::error!(feed_id = feed.id, error = %e, "Failed to persist blocked feed");
        }
        true
    }

    fn dispatch(&self, feed: Feed) -> RunningTask {
        let url = feed.url.clone();
        let permits = Arc::clone(&self.permits);
        let ctx = Arc::clone(&self.ctx);
        let handle = tokio::spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            FeedTask::new(feed, ctx).run().await
        });
        RunningTask { url, handle }
    }

    fn health_problems(&mut self, report: &PassReport) -> Vec<String> {
        let monitoring = &self.settings.monitoring;
        let mut problems = Vec::new();

        let errors = report.count(FeedTaskResult::Error);
        if errors > 0 {
            problems.push(format!("{errors} feed tasks ended with ERROR"));
        }

        if let Some(gap) = report.wake_up_gap {
            if gap > monitoring.wake_up_warning {
                problems.push(format!("scheduler woke up {}s after the previous pass", gap.as_secs()));
            }
        }

        let thresholds = [
            (FeedTaskResult::ExecutionTimeWarning, monitoring.max_slow_percentage, "slow"),
            (FeedTaskResult::Unreachable, monitoring.max_unreachable_percentage, "unreachable"),
            (FeedTaskResult::Unparsable, monitoring.max_unparsable_percentage, "unparsable"),
        ];
        for (result, percentage, label) in thresholds {
            let tolerated = (report.processed * percentage as usize / 100).max(MIN_TOLERATED_FEEDS);
            let count = report.count(result);
            if count > tolerated {
                problems.push(format!("{count} of {} processed feeds were {label}", report.processed));
            }
        }

        let wake_up_minutes = (self.settings.wake_up_interval.as_secs() / 60).max(1) as usize;
        let expected = 3 * self.settings.thread_count * wake_up_minutes;
        if report.delayed > MAX_DELAYED_FEEDS && report.processed < expected {
            self.low_throughput_passes += 1;
            if self.low_throughput_passes >= LOW_THROUGHPUT_PASSES {
                problems.push(format!(
                    "{} feeds still running and only {} processed for {} passes in a row",
                    report.delayed, report.processed, self.low_throughput_passes
                ));
                self.low_throughput_passes = 0;
            }
        } else {
            self.low_throughput_passes = 0;
        }

        problems
    }
}

fn log_report(report: &PassReport) {
    let wake_up = report
        .wake_up_gap
        .map_or_else(|| "first start".to_string(), |gap| format!("{}s", gap.as_secs()));

    if report.is_healthy() {
        tracing::info!(
            scheduled = report.scheduled,
            delayed = report.delayed,
            processed = report.processed,
            success = report.count(FeedTaskResult::Success),
            misses = report.count(FeedTaskResult::Miss),
            unreachable = report.count(FeedTaskResult::Unreachable),
            unparsable = report.count(FeedTaskResult::Unparsable),
            slow = report.count(FeedTaskResult::ExecutionTimeWarning),
            errors = report.count(FeedTaskResult::Error),
            blocked = report.blocked,
            wake_up = %wake_up,
            "Scheduler pass finished"
        );
    } else {
        tracing::error!(
            scheduled = report.scheduled,
            delayed = report.delayed,
            processed = report.processed,
            success = report.count(FeedTaskResult::Success),
            misses = report.count(FeedTaskResult::Miss),
            unreachable = report.count(FeedTaskResult::Unreachable),
            unparsable = report.count(FeedTaskResult::Unparsable),
            slow = report.count(FeedTaskResult::ExecutionTimeWarning),
            errors = report.count(FeedTaskResult::Error),
            blocked = report.blocked,
            wake_up = %wake_up,
            problems = %report.problems.join("; "),
            "Scheduler pass finished with problems"
        );
    }
}
