//! One polling cycle for one feed.
//!
//! A [`FeedTask`] owns its [`Feed`] for the whole cycle: conditional GET,
//! outcome classification, parsing and de-duplication, interval update,
//! processing hooks and persistence. Whatever happens in between, including a
//! panic, the feed is persisted, its per-poll item lists are freed, and it is
//! handed back together with exactly one ranked result.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::action::{FeedOutcome, LoggingAction, ProcessingAction};
use super::http::{format_http_date, HttpClient};
use super::strategy::{update_check_interval, MovingAverageStrategy, UpdateStrategy};
use crate::feed::{
    classify, FeedParser, FeedRsParser, FeedTaskResult, ItemHasher, ResultSet, Sha256ItemHasher,
    Feed,
};
use crate::storage::FeedStore;

/// Cycles slower than this are reported as EXECUTION_TIME_WARNING.
pub const DEFAULT_EXECUTION_WARN: Duration = Duration::from_secs(3 * 60);

/// Collaborators and settings shared by every task of a reader.
pub struct TaskContext {
    pub http: Arc<dyn HttpClient>,
    pub store: Arc<dyn FeedStore>,
    pub parser: Arc<dyn FeedParser>,
    pub strategy: Arc<dyn UpdateStrategy>,
    pub action: Arc<dyn ProcessingAction>,
    pub hasher: Arc<dyn ItemHasher>,
    pub execution_warn: Duration,
    /// Passed through to the update strategy.
    pub benchmark: bool,
}

impl TaskContext {
    pub fn new(http: Arc<dyn HttpClient>, store: Arc<dyn FeedStore>) -> Self {
        Self {
            http,
            store,
            parser: Arc::new(FeedRsParser),
            strategy: Arc::new(MovingAverageStrategy::default()),
            action: Arc::new(LoggingAction),
            hasher: Arc::new(Sha256ItemHasher),
            execution_warn: DEFAULT_EXECUTION_WARN,
            benchmark: false,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn FeedParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn UpdateStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_action(mut self, action: Arc<dyn ProcessingAction>) -> Self {
        self.action = action;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ItemHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_execution_warn(mut self, threshold: Duration) -> Self {
        self.execution_warn = threshold;
        self
    }
}

pub struct FeedTask {
    feed: Feed,
    ctx: Arc<TaskContext>,
    results: ResultSet,
}

impl FeedTask {
    pub fn new(feed: Feed, ctx: Arc<TaskContext>) -> Self {
        Self {
            feed,
            ctx,
            results: ResultSet::new(),
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    /// Run the cycle to completion and hand the feed back.
    pub async fn run(mut self) -> (Feed, FeedTaskResult) {
        let started = Instant::now();
        tracing::debug!(feed_id = self.feed.id, url = %self.feed.url, "Polling feed");

        if AssertUnwindSafe(self.process()).catch_unwind().await.is_err() {
            tracing::error!(feed_id = self.feed.id, url = %self.feed.url, "Feed task panicked");
            self.results.insert(FeedTaskResult::Error);
        }

        self.finish(started.elapsed()).await
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("cache-control".to_string(), "no-cache".to_string())];

        let conditional = self
            .feed
            .last_feed_task_result
            .is_some_and(|r| r.allows_conditional_get());
        if conditional {
            if let Some(etag) = &self.feed.last_etag {
                headers.push(("if-none-match".to_string(), etag.clone()));
            }
            if let Some(modified) = self.feed.http_last_modified() {
                headers.push(("if-modified-since".to_string(), format_http_date(modified)));
            }
        }
        headers
    }

    async fn process(&mut self) {
        let headers = self.request_headers();
        self.feed.set_last_poll_time(Utc::now());
        let misses_before = self.feed.misses();

        let response = match self.ctx.http.get(&self.feed.url, &headers).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(feed_id = self.feed.id, url = %self.feed.url, error = %e, "Feed unreachable");
                self.feed.unreachable_count += 1;
                self.results.insert(FeedTaskResult::Unreachable);
                let outcome = FeedOutcome::Error {
                    feed: &self.feed,
                    response: None,
                    error: Some(&e),
                };
                if !invoke(self.ctx.action.as_ref(), outcome).await {
                    self.results.insert(FeedTaskResult::Error);
                }
                return;
            }
        };

        if response.is_error() {
            tracing::warn!(
                feed_id = self.feed.id,
                url = %self.feed.url,
                status = response.status,
                "Feed returned error status"
            );
            self.feed.unreachable_count += 1;
            self.results.insert(FeedTaskResult::Unreachable);
            let outcome = FeedOutcome::Error {
                feed: &self.feed,
                response: Some(&response),
                error: None,
            };
            if !invoke(self.ctx.action.as_ref(), outcome).await {
                self.results.insert(FeedTaskResult::Error);
            }
            return;
        }

        if response.is_not_modified() {
            update_check_interval(self.ctx.strategy.as_ref(), &mut self.feed, self.ctx.benchmark);
            self.feed.last_successful_check_time = self.feed.last_poll_time();
            let outcome = FeedOutcome::Unmodified {
                feed: &self.feed,
                response: &response,
            };
            if !invoke(self.ctx.action.as_ref(), outcome).await {
                self.results.insert(FeedTaskResult::Error);
            }
        } else {
            self.feed.last_etag = response.etag().map(str::to_string);
            self.feed.set_http_last_modified(response.last_modified());

            let items = match self.ctx.parser.parse(&response.body) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(feed_id = self.feed.id, url = %self.feed.url, error = %e, "Feed unparsable");
                    self.feed.unparsable_count += 1;
                    self.results.insert(FeedTaskResult::Unparsable);
                    let outcome = FeedOutcome::Exception {
                        feed: &self.feed,
                        response: &response,
                        error: &e,
                    };
                    if !invoke(self.ctx.action.as_ref(), outcome).await {
                        self.results.insert(FeedTaskResult::Error);
                    }
                    return;
                }
            };

            let checked_before = self.feed.checks > 0;
            let window_size = u32::try_from(items.len()).unwrap_or(u32::MAX);
            self.feed.set_http_date_last_poll(response.date());
            self.feed.set_items(items, self.ctx.hasher.as_ref());
            self.feed.set_window_size(window_size);
            self.feed.last_successful_check_time = self.feed.last_poll_time();

            // Every item of a known feed is new: the window overflowed since the last poll
            let all_new = self.feed.new_items().len() == self.feed.cached_items().len();
            if checked_before && window_size > 0 && all_new {
                self.feed.increase_misses();
            }

            update_check_interval(self.ctx.strategy.as_ref(), &mut self.feed, self.ctx.benchmark);
            self.feed.activity_pattern = classify(&self.feed);

            let outcome = FeedOutcome::Modified {
                feed: &self.feed,
                response: &response,
            };
            if !invoke(self.ctx.action.as_ref(), outcome).await {
                self.results.insert(FeedTaskResult::Error);
            }
        }

        if self.feed.misses() > misses_before {
            self.results.insert(FeedTaskResult::Miss);
        } else {
            self.results.insert(FeedTaskResult::Success);
        }
    }

    async fn finish(mut self, elapsed: Duration) -> (Feed, FeedTaskResult) {
        if elapsed > self.ctx.execution_warn {
            tracing::warn!(
                feed_id = self.feed.id,
                url = %self.feed.url,
                elapsed_ms = elapsed.as_millis() as u64,
                "Feed task exceeded execution time threshold"
            );
            self.results.insert(FeedTaskResult::ExecutionTimeWarning);
        }

        self.feed.last_feed_task_result = Some(self.results.ranked());
        self.feed.add_processing_time(elapsed);

        let replace_cache = self.feed.has_new_items();
        let stored = AssertUnwindSafe(self.ctx.store.update_feed(&self.feed, replace_cache))
            .catch_unwind()
            .await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(feed_id = self.feed.id, url = %self.feed.url, error = %e, "Failed to persist feed");
                self.results.insert(FeedTaskResult::Error);
            }
            Err(_) => {
                tracing::error!(feed_id = self.feed.id, url = %self.feed.url, "Feed store panicked");
                self.results.insert(FeedTaskResult::Error);
            }
        }

        let result = self.results.ranked();
        self.feed.last_feed_task_result = Some(result);
        self.feed.free_memory();

        if result == FeedTaskResult::Error {
            tracing::error!(
                feed_id = self.feed.id,
                url = %self.feed.url,
                elapsed_ms = elapsed.as_millis() as u64,
                "Feed task failed"
            );
        } else {
            tracing::debug!(
                feed_id = self.feed.id,
                url = %self.feed.url,
                result = %result,
                checks = self.feed.checks,
                interval = self.feed.update_interval,
                elapsed_ms = elapsed.as_millis() as u64,
                "Feed task finished"
            );
        }

        (self.feed, result)
    }
}

/// Run a processing hook. Returns false if it failed.
async fn invoke(action: &dyn ProcessingAction, outcome: FeedOutcome<'_>) -> bool {
    let feed_id = outcome.feed().id;
    let kind = outcome.kind();
    match action.handle(outcome).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(feed_id, hook = kind, error = %e, "Processing action failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedActivityPattern;
    use crate::reader::http::ReqwestHttpClient;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <item>
      <title>Second</title>
      <link>https://example.com/2</link>
      <guid>urn:2</guid>
      <pubDate>Tue, 02 Jan 2024 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>First</title>
      <link>https://example.com/1</link>
      <guid>urn:1</guid>
      <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

    struct FailingAction;

    #[async_trait]
    impl ProcessingAction for FailingAction {
        async fn handle(&self, _outcome: FeedOutcome<'_>) -> anyhow::Result<()> {
            anyhow::bail!("hook failed")
        }
    }

    struct PanickingAction;

    #[async_trait]
    impl ProcessingAction for PanickingAction {
        async fn handle(&self, _outcome: FeedOutcome<'_>) -> anyhow::Result<()> {
            panic!("hook panicked")
        }
    }

    fn context(store: Arc<MemoryStore>) -> TaskContext {
        let http = ReqwestHttpClient::new(Duration::from_secs(5), 1024 * 1024, "feedwatch-test").unwrap();
        TaskContext::new(Arc::new(http), store)
    }

    async fn stored_feed(store: &MemoryStore, url: &str) -> Feed {
        assert!(store.add_feed(&Feed::new(url)).await.unwrap());
        store.get_feed_by_url(url).await.unwrap().unwrap()
    }

    async fn mount_rss(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc\"")
                    .insert_header("Last-Modified", "Tue, 02 Jan 2024 10:00:00 GMT")
                    .set_body_string(RSS),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_successful_poll_updates_and_persists_feed() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        let url = format!("{}/feed.xml", server.uri());
        let feed = stored_feed(&store, &url).await;

        let ctx = Arc::new(context(store.clone()));
        let (feed, result) = FeedTask::new(feed, ctx).run().await;

        assert_eq!(result, FeedTaskResult::Success);
        assert_eq!(feed.checks, 1);
        assert_eq!(feed.last_etag.as_deref(), Some("\"abc\""));
        assert!(feed.http_last_modified().is_some());
        assert_eq!(feed.window_size(), Some(2));
        assert_eq!(feed.cached_items().len(), 2);
        assert!(feed.items().is_empty(), "item list is freed after the task");
        assert_eq!(feed.last_successful_check_time, feed.last_poll_time());
        assert_eq!(feed.activity_pattern, FeedActivityPattern::Zombie);

        let persisted = store.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(persisted.checks, 1);
        assert_eq!(persisted.cached_items().len(), 2);
        assert_eq!(persisted.last_feed_task_result, Some(FeedTaskResult::Success));
    }

    #[tokio::test]
    async fn test_conditional_get_after_success_and_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .and(header("if-none-match", "\"abc\""))
            .and(header("cache-control", "no-cache"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryStore::new());
        let url = format!("{}/feed.xml", server.uri());
        let mut feed = stored_feed(&store, &url).await;
        feed.last_etag = Some("\"abc\"".to_string());
        feed.last_feed_task_result = Some(FeedTaskResult::Success);
        feed.checks = 3;

        let (feed, result) = FeedTask::new(feed, Arc::new(context(store))).run().await;

        assert_eq!(result, FeedTaskResult::Success);
        assert_eq!(feed.checks, 4);
        assert_eq!(feed.last_successful_check_time, feed.last_poll_time());
        assert_eq!(feed.unreachable_count, 0);
    }

    #[tokio::test]
    async fn test_no_conditional_headers_after_unreachable() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        let url = format!("{}/feed.xml", server.uri());
        let mut feed = stored_feed(&store, &url).await;
        feed.last_etag = Some("\"old\"".to_string());
        feed.set_http_last_modified(Some(Utc::now()));
        feed.last_feed_task_result = Some(FeedTaskResult::Unreachable);

        let (_, result) = FeedTask::new(feed, Arc::new(context(store))).run().await;
        assert_eq!(result, FeedTaskResult::Success);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("if-none-match"));
        assert!(!requests[0].headers.contains_key("if-modified-since"));
        assert!(requests[0].headers.contains_key("cache-control"));
    }

    #[tokio::test]
    async fn test_error_status_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryStore::new());
        let url = format!("{}/feed.xml", server.uri());
        let feed = stored_feed(&store, &url).await;

        let (feed, result) = FeedTask::new(feed, Arc::new(context(store.clone()))).run().await;

        assert_eq!(result, FeedTaskResult::Unreachable);
        assert_eq!(feed.unreachable_count, 1);
        assert_eq!(feed.checks, 0);
        assert!(feed.last_successful_check_time.is_none());

        let persisted = store.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(persisted.last_feed_task_result, Some(FeedTaskResult::Unreachable));
    }

    #[tokio::test]
    async fn test_malformed_body_is_unparsable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryStore::new());
        let feed = stored_feed(&store, &format!("{}/feed.xml", server.uri())).await;

        let (feed, result) = FeedTask::new(feed, Arc::new(context(store))).run().await;

        assert_eq!(result, FeedTaskResult::Unparsable);
        assert_eq!(feed.unparsable_count, 1);
        assert_eq!(feed.checks, 0);
    }

    #[tokio::test]
    async fn test_slow_cycle_reports_execution_time_warning() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        let feed = stored_feed(&store, &format!("{}/feed.xml", server.uri())).await;

        let ctx = context(store).with_execution_warn(Duration::ZERO);
        let (feed, result) = FeedTask::new(feed, Arc::new(ctx)).run().await;

        assert_eq!(result, FeedTaskResult::ExecutionTimeWarning);
        assert_eq!(feed.last_feed_task_result, Some(FeedTaskResult::ExecutionTimeWarning));
    }

    #[tokio::test]
    async fn test_all_new_window_on_known_feed_is_miss() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        let mut feed = stored_feed(&store, &format!("{}/feed.xml", server.uri())).await;
        feed.checks = 5;

        let (feed, result) = FeedTask::new(feed, Arc::new(context(store))).run().await;

        assert_eq!(result, FeedTaskResult::Miss);
        assert_eq!(feed.misses(), 1);
        assert_eq!(feed.last_miss_time(), feed.last_poll_time());
    }

    #[tokio::test]
    async fn test_second_poll_without_changes_is_success() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        let url = format!("{}/feed.xml", server.uri());
        let feed = stored_feed(&store, &url).await;
        let ctx = Arc::new(context(store.clone()));

        let (feed, _) = FeedTask::new(feed, ctx.clone()).run().await;
        let (feed, result) = FeedTask::new(feed, ctx).run().await;

        assert_eq!(result, FeedTaskResult::Success);
        assert_eq!(feed.misses(), 0);
        assert_eq!(feed.number_of_items_received(), 2);
        assert_eq!(feed.checks, 2);
    }

    #[tokio::test]
    async fn test_failing_hook_is_error_but_feed_persisted() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        let url = format!("{}/feed.xml", server.uri());
        let feed = stored_feed(&store, &url).await;

        let ctx = context(store.clone()).with_action(Arc::new(FailingAction));
        let (feed, result) = FeedTask::new(feed, Arc::new(ctx)).run().await;

        assert_eq!(result, FeedTaskResult::Error);
        assert_eq!(feed.checks, 1);
        let persisted = store.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(persisted.last_feed_task_result, Some(FeedTaskResult::Error));
    }

    #[tokio::test]
    async fn test_panicking_hook_is_error_and_returns_feed() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        let url = format!("{}/feed.xml", server.uri());
        let feed = stored_feed(&store, &url).await;
        let id = feed.id;

        let ctx = context(store.clone()).with_action(Arc::new(PanickingAction));
        let (feed, result) = FeedTask::new(feed, Arc::new(ctx)).run().await;

        assert_eq!(result, FeedTaskResult::Error);
        assert_eq!(feed.id, id);
        assert!(feed.items().is_empty());
        let persisted = store.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(persisted.last_feed_task_result, Some(FeedTaskResult::Error));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_error() {
        let server = MockServer::start().await;
        mount_rss(&server).await;
        let store = Arc::new(MemoryStore::new());
        // Never added to the store, so the update fails
        let feed = Feed::new(format!("{}/feed.xml", server.uri())).with_id(99);

        let (feed, result) = FeedTask::new(feed, Arc::new(context(store))).run().await;

        assert_eq!(result, FeedTaskResult::Error);
        assert_eq!(feed.last_feed_task_result, Some(FeedTaskResult::Error));
        assert!(feed.items().is_empty());
        assert!(!feed.has_new_items());
    }

    #[tokio::test]
    async fn test_transport_failure_is_unreachable() {
        let store = Arc::new(MemoryStore::new());
        let feed = stored_feed(&store, "http://127.0.0.1:9/feed.xml").await;

        let (feed, result) = FeedTask::new(feed, Arc::new(context(store))).run().await;

        assert_eq!(result, FeedTaskResult::Unreachable);
        assert_eq!(feed.unreachable_count, 1);
    }
}
