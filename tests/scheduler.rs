//! Integration tests for scheduler passes over a SQLite-backed store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use feedwatch::feed::{Feed, FeedTaskResult};
use feedwatch::reader::{
    FeedReader, ReqwestHttpClient, SchedulerSettings, SchedulerTask, TaskContext, MAX_RESPONSE_BYTES,
};
use feedwatch::storage::{Database, FeedStore, MemoryStore};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Example</title>
<item><title>One</title><link>https://example.com/1</link><guid>urn:1</guid></item>
</channel></rss>"#;

fn context(store: Arc<dyn FeedStore>) -> Arc<TaskContext> {
    let http = ReqwestHttpClient::new(Duration::from_secs(5), MAX_RESPONSE_BYTES, "feedwatch-test").unwrap();
    Arc::new(TaskContext::new(Arc::new(http), store))
}

async fn mount(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{ not xml"))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, to: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == to)
        .count()
}

#[tokio::test]
async fn test_failing_feeds_are_retried_immediately() {
    let server = MockServer::start().await;
    mount(&server).await;

    let db: Arc<dyn FeedStore> = Arc::new(Database::open(":memory:").await.unwrap());
    for name in ["ok", "gone", "broken"] {
        db.add_feed(&Feed::new(format!("{}/{name}", server.uri()))).await.unwrap();
    }

    let feeds = db.list_feeds().await.unwrap();
    let mut scheduler = SchedulerTask::new(feeds, context(Arc::clone(&db)), SchedulerSettings::default());

    assert_eq!(scheduler.run().await.scheduled, 3);
    let first = scheduler.drain().await;
    assert_eq!(first.count(FeedTaskResult::Success), 1);
    assert_eq!(first.count(FeedTaskResult::Unreachable), 1);
    assert_eq!(first.count(FeedTaskResult::Unparsable), 1);

    // Never checked successfully and within the retry allowance.
    assert_eq!(scheduler.run().await.scheduled, 2);
    scheduler.drain().await;

    assert_eq!(requests_to(&server, "/ok").await, 1);
    assert_eq!(requests_to(&server, "/gone").await, 2);
    assert_eq!(requests_to(&server, "/broken").await, 2);

    let gone = db.get_feed_by_url(&format!("{}/gone", server.uri())).await.unwrap().unwrap();
    assert_eq!(gone.unreachable_count, 2);
    assert_eq!(gone.last_feed_task_result, Some(FeedTaskResult::Unreachable));
    let ok = db.get_feed_by_url(&format!("{}/ok", server.uri())).await.unwrap().unwrap();
    assert_eq!(ok.checks, 1);
}

#[tokio::test]
async fn test_retries_stop_once_allowance_is_used() {
    let server = MockServer::start().await;
    mount(&server).await;

    let store: Arc<dyn FeedStore> = Arc::new(MemoryStore::with_urls([format!("{}/gone", server.uri())]));
    let feeds = store.list_feeds().await.unwrap();
    let mut scheduler = SchedulerTask::new(feeds, context(Arc::clone(&store)), SchedulerSettings::default());

    for _ in 0..6 {
        scheduler.run().await;
        scheduler.drain().await;
    }

    // First poll plus three immediate retries, then the regular interval applies.
    assert_eq!(requests_to(&server, "/gone").await, 4);
}

#[tokio::test]
async fn test_chronically_unreachable_feed_is_blocked_in_database() {
    let server = MockServer::start().await;
    mount(&server).await;

    let db: Arc<dyn FeedStore> = Arc::new(Database::open(":memory:").await.unwrap());
    let url = format!("{}/gone", server.uri());
    db.add_feed(&Feed::new(url.as_str())).await.unwrap();
    let mut feed = db.get_feed_by_url(&url).await.unwrap().unwrap();
    feed.unreachable_count = 30;
    feed.checks = 2;
    feed.set_last_poll_time(Utc::now() - chrono::Duration::days(1));
    db.update_feed(&feed, false).await.unwrap();

    let feeds = db.list_feeds().await.unwrap();
    let mut scheduler = SchedulerTask::new(feeds, context(Arc::clone(&db)), SchedulerSettings::default());
    let report = scheduler.run().await;

    assert_eq!(report.blocked, 1);
    assert_eq!(report.scheduled, 0);
    assert!(db.get_feed_by_url(&url).await.unwrap().unwrap().is_blocked());
    assert_eq!(requests_to(&server, "/gone").await, 0);
}

#[tokio::test]
async fn test_reader_skips_feeds_outside_pattern_filter() {
    let server = MockServer::start().await;
    mount(&server).await;

    let store = Arc::new(MemoryStore::with_urls([format!("{}/ok", server.uri())]));
    let ctx = TaskContext::new(
        Arc::new(ReqwestHttpClient::new(Duration::from_secs(5), MAX_RESPONSE_BYTES, "feedwatch-test").unwrap()),
        Arc::clone(&store) as Arc<dyn FeedStore>,
    );
    let settings = SchedulerSettings {
        wake_up_interval: Duration::from_millis(50),
        activity_patterns: vec![feedwatch::feed::FeedActivityPattern::Constant],
        ..SchedulerSettings::default()
    };

    let handle = FeedReader::new(ctx, settings).start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop().await.unwrap();

    assert_eq!(requests_to(&server, "/ok").await, 0);
    assert_eq!(store.list_feeds().await.unwrap()[0].checks, 0);
}
