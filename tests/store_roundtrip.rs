//! Integration tests for polling cycles persisted in SQLite.
//!
//! Each test creates its own in-memory database for isolation and drives
//! `FeedTask` against a local HTTP server.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use feedwatch::feed::{Feed, FeedTaskResult};
use feedwatch::reader::{FeedTask, ReqwestHttpClient, StoreItemsAction, TaskContext, MAX_RESPONSE_BYTES};
use feedwatch::storage::{Database, FeedStore};
use pretty_assertions::assert_eq;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rss(days: &[u32]) -> String {
    let items: String = days
        .iter()
        .map(|day| {
            let published = Utc.with_ymd_and_hms(2024, 1, *day, 10, 0, 0).unwrap().to_rfc2822();
            format!(
                "<item><title>Post {day}</title><link>https://example.com/{day}</link>\
                 <guid>urn:{day}</guid><pubDate>{published}</pubDate></item>"
            )
        })
        .collect();
    format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Example</title>{items}</channel></rss>"#)
}

async fn test_db() -> Arc<Database> {
    Arc::new(Database::open(":memory:").await.unwrap())
}

fn context(db: &Arc<Database>) -> Arc<TaskContext> {
    let http = ReqwestHttpClient::new(Duration::from_secs(5), MAX_RESPONSE_BYTES, "feedwatch-test").unwrap();
    let store: Arc<dyn FeedStore> = db.clone();
    Arc::new(TaskContext::new(Arc::new(http), store.clone()).with_action(Arc::new(StoreItemsAction::new(store))))
}

async fn poll(db: &Arc<Database>, ctx: &Arc<TaskContext>, url: &str) -> FeedTaskResult {
    let feed = db.get_feed_by_url(url).await.unwrap().unwrap();
    let (_, result) = FeedTask::new(feed, Arc::clone(ctx)).run().await;
    result
}

#[tokio::test]
async fn test_item_cache_survives_reload_between_polls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[2, 1])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[3, 2, 1])))
        .mount(&server)
        .await;

    let db = test_db().await;
    let ctx = context(&db);
    let url = format!("{}/feed.xml", server.uri());
    assert!(db.add_feed(&Feed::new(url.as_str())).await.unwrap());

    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Success);
    let first = db.get_feed_by_url(&url).await.unwrap().unwrap();
    assert_eq!(first.cached_items().len(), 2);
    assert_eq!(first.number_of_items_received(), 2);
    assert_eq!(db.count_feed_items(first.id).await.unwrap(), 2);

    // One new item on top of the two already cached.
    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Success);
    let second = db.get_feed_by_url(&url).await.unwrap().unwrap();
    assert_eq!(second.checks, 2);
    assert_eq!(second.misses(), 0);
    assert_eq!(second.cached_items().len(), 3);
    assert_eq!(second.number_of_items_received(), 3);
    assert_eq!(db.count_feed_items(second.id).await.unwrap(), 3);

    // Nothing new: the cache is kept as is.
    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Success);
    let third = db.get_feed_by_url(&url).await.unwrap().unwrap();
    assert_eq!(third.checks, 3);
    assert_eq!(third.cached_items(), second.cached_items());
    assert_eq!(third.number_of_items_received(), 3);
    assert_eq!(third.newest_item(), second.newest_item());
}

#[tokio::test]
async fn test_window_overflow_is_recorded_as_miss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[2, 1])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[4, 3])))
        .mount(&server)
        .await;

    let db = test_db().await;
    let ctx = context(&db);
    let url = format!("{}/feed.xml", server.uri());
    db.add_feed(&Feed::new(url.as_str())).await.unwrap();

    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Success);
    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Miss);

    let feed = db.get_feed_by_url(&url).await.unwrap().unwrap();
    assert_eq!(feed.misses(), 1);
    assert_eq!(feed.last_miss_time(), feed.last_poll_time());
    assert_eq!(feed.last_feed_task_result, Some(FeedTaskResult::Miss));
    assert_eq!(db.count_feed_items(feed.id).await.unwrap(), 4);
}

#[tokio::test]
async fn test_failures_are_counted_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a feed"))
        .mount(&server)
        .await;

    let db = test_db().await;
    let ctx = context(&db);
    let url = format!("{}/feed.xml", server.uri());
    db.add_feed(&Feed::new(url.as_str())).await.unwrap();

    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Unreachable);
    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Unreachable);
    assert_eq!(poll(&db, &ctx, &url).await, FeedTaskResult::Unparsable);

    let feed = db.get_feed_by_url(&url).await.unwrap().unwrap();
    assert_eq!(feed.checks, 0);
    assert_eq!(feed.unreachable_count, 2);
    assert_eq!(feed.unparsable_count, 1);
    assert_eq!(feed.last_feed_task_result, Some(FeedTaskResult::Unparsable));
    assert!(feed.last_successful_check_time.is_none());
    assert!(feed.cached_items().is_empty());
}
