//! Rule-based activity classification.

use futures::stream::{self, StreamExt};
use std::time::Duration;

use super::item::ItemHasher;
use super::parser::FeedParser;
use super::record::Feed;
use super::stats::PostStatistics;
use super::types::FeedActivityPattern;
use crate::reader::HttpClient;
use crate::storage::{FeedStore, StoreError};

const SECOND: Duration = Duration::from_secs(1);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Classify a feed by the corrected timestamps in its item cache.
///
/// Rules are evaluated in order, the first match wins.
pub fn classify(feed: &Feed) -> FeedActivityPattern {
    let count = feed.cached_items().len();
    match count {
        0 => return FeedActivityPattern::Empty,
        1 => return FeedActivityPattern::SingleEntry,
        _ => {}
    }
    classify_statistics(&PostStatistics::new(feed))
}

/// The statistics part of [`classify`], for windows of two or more items.
pub fn classify_statistics(stats: &PostStatistics) -> FeedActivityPattern {
    if !stats.is_valid() {
        return FeedActivityPattern::Unknown;
    }

    let median = stats.median_gap();
    let delay = stats.delay_to_newest();

    if median < 5 * SECOND {
        return if delay < 5 * SECOND {
            FeedActivityPattern::OnTheFly
        } else {
            FeedActivityPattern::Chunked
        };
    }

    if delay >= 8 * median && delay >= 8 * WEEK {
        return FeedActivityPattern::Zombie;
    }

    if stats.gap_std_dev() >= median / 10 && median > DAY {
        return FeedActivityPattern::Spontaneous;
    }

    let longest = stats.longest_gap();
    if longest < 12 * median && longest < 2 * HOUR && stats.avg_items_per_day() >= 4.0 {
        return FeedActivityPattern::Constant;
    }

    FeedActivityPattern::Sliced
}

/// Download and classify a feed that is not necessarily in the store.
///
/// A feed that cannot be downloaded is DEAD; one that downloads but does not
/// parse is UNKNOWN.
pub async fn classify_url(
    url: &str,
    http: &dyn HttpClient,
    parser: &dyn FeedParser,
    hasher: &dyn ItemHasher,
) -> FeedActivityPattern {
    let response = match http.get(url, &[]).await {
        Ok(response) if !response.is_error() => response,
        Ok(response) => {
            tracing::debug!(url = %url, status = response.status, "Feed dead");
            return FeedActivityPattern::Dead;
        }
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Feed dead");
            return FeedActivityPattern::Dead;
        }
    };

    let items = match parser.parse(&response.body) {
        Ok(items) => items,
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Feed not classifiable");
            return FeedActivityPattern::Unknown;
        }
    };

    let mut feed = Feed::new(url);
    feed.set_last_poll_time(chrono::Utc::now());
    feed.set_items(items, hasher);
    classify(&feed)
}

/// Classify every stored feed and persist the result.
///
/// Feeds are fetched with at most `concurrency` requests in flight. Returns
/// the number of feeds classified.
pub async fn classify_store(
    store: &dyn FeedStore,
    http: &dyn HttpClient,
    parser: &dyn FeedParser,
    hasher: &dyn ItemHasher,
    concurrency: usize,
) -> Result<usize, StoreError> {
    let feeds = store.list_feeds().await?;
    let total = feeds.len();
    tracing::info!(feeds = total, concurrency, "Classifying stored feeds");

    let classified: Vec<Feed> = stream::iter(feeds)
        .map(|mut feed| async move {
            feed.activity_pattern = classify_url(&feed.url, http, parser, hasher).await;
            tracing::debug!(feed_id = feed.id, url = %feed.url, pattern = %feed.activity_pattern, "Feed classified");
            feed
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for feed in &classified {
        store.update_feed(feed, false).await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn poll() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap()
    }

    fn classify_at(offsets: &[TimeDelta]) -> FeedActivityPattern {
        let stamps = offsets.iter().map(|o| poll() - *o);
        classify_statistics(&PostStatistics::from_timestamps(stamps, Some(poll())))
    }

    fn every(gap: TimeDelta, count: i32, delay: TimeDelta) -> Vec<TimeDelta> {
        (0..count).map(|i| delay + gap * i).collect()
    }

    #[test]
    fn test_empty_and_single_entry() {
        use crate::feed::item::{FeedItem, Sha256ItemHasher};

        let mut feed = Feed::new("https://example.com/feed.xml");
        feed.set_last_poll_time(poll());
        assert_eq!(classify(&feed), FeedActivityPattern::Empty);

        feed.set_items(
            vec![FeedItem::new("a", "https://example.com/a", "a", Some(poll()))],
            &Sha256ItemHasher,
        );
        assert_eq!(classify(&feed), FeedActivityPattern::SingleEntry);
    }

    #[test]
    fn test_identical_timestamps_unknown() {
        let same = TimeDelta::hours(1);
        assert_eq!(classify_at(&[same, same, same]), FeedActivityPattern::Unknown);
    }

    #[test]
    fn test_on_the_fly() {
        // Two items 2 seconds apart, newest 1 second before the poll
        let offsets = [TimeDelta::seconds(1), TimeDelta::seconds(3)];
        assert_eq!(classify_at(&offsets), FeedActivityPattern::OnTheFly);
    }

    #[test]
    fn test_chunked() {
        let offsets = every(TimeDelta::seconds(1), 10, TimeDelta::hours(3));
        assert_eq!(classify_at(&offsets), FeedActivityPattern::Chunked);
    }

    #[test]
    fn test_zombie() {
        let offsets = every(TimeDelta::hours(6), 10, TimeDelta::weeks(10));
        assert_eq!(classify_at(&offsets), FeedActivityPattern::Zombie);
    }

    #[test]
    fn test_long_delay_below_eight_weeks_is_not_zombie() {
        let offsets = every(TimeDelta::hours(6), 10, TimeDelta::weeks(7));
        assert_ne!(classify_at(&offsets), FeedActivityPattern::Zombie);
    }

    #[test]
    fn test_spontaneous() {
        let offsets = [
            TimeDelta::days(1),
            TimeDelta::days(3),
            TimeDelta::days(8),
            TimeDelta::days(10),
        ];
        assert_eq!(classify_at(&offsets), FeedActivityPattern::Spontaneous);
    }

    #[test]
    fn test_constant() {
        let offsets = every(TimeDelta::minutes(30), 48, TimeDelta::minutes(10));
        assert_eq!(classify_at(&offsets), FeedActivityPattern::Constant);
    }

    #[test]
    fn test_sliced() {
        // Hourly during the day with a 10 hour break at night
        let mut offsets = every(TimeDelta::hours(1), 14, TimeDelta::minutes(30));
        offsets.extend(every(TimeDelta::hours(1), 14, TimeDelta::hours(24) + TimeDelta::minutes(30)));
        assert_eq!(classify_at(&offsets), FeedActivityPattern::Sliced);
    }

    fn client() -> crate::reader::ReqwestHttpClient {
        crate::reader::ReqwestHttpClient::new(
            std::time::Duration::from_secs(5),
            crate::reader::MAX_RESPONSE_BYTES,
            "feedwatch-test",
        )
        .unwrap()
    }

    fn rss_body(items: usize) -> String {
        let items: String = (0..items)
            .map(|i| {
                let date = (Utc::now() - TimeDelta::hours(i as i64 + 1)).to_rfc2822();
                format!(
                    "<item><title>{i}</title><link>https://a.example/{i}</link><guid>{i}</guid><pubDate>{date}</pubDate></item>"
                )
            })
            .collect();
        format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title>{items}</channel></rss>"#)
    }

    async fn classify_served(template: wiremock::ResponseTemplate) -> FeedActivityPattern {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer};

        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(template).mount(&server).await;
        let url = format!("{}/feed.xml", server.uri());
        classify_url(&url, &client(), &crate::feed::FeedRsParser, &crate::feed::Sha256ItemHasher).await
    }

    #[tokio::test]
    async fn test_not_found_is_dead() {
        let pattern = classify_served(wiremock::ResponseTemplate::new(404)).await;
        assert_eq!(pattern, FeedActivityPattern::Dead);
    }

    #[tokio::test]
    async fn test_refused_connection_is_dead() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("http://{addr}/feed.xml");
        let pattern =
            classify_url(&url, &client(), &crate::feed::FeedRsParser, &crate::feed::Sha256ItemHasher)
                .await;
        assert_eq!(pattern, FeedActivityPattern::Dead);
    }

    #[tokio::test]
    async fn test_malformed_body_is_unknown() {
        let template = wiremock::ResponseTemplate::new(200).set_body_string("this is not a feed <<<");
        assert_eq!(classify_served(template).await, FeedActivityPattern::Unknown);
    }

    #[tokio::test]
    async fn test_hourly_feed_is_classified_from_download() {
        let template = wiremock::ResponseTemplate::new(200).set_body_string(rss_body(10));
        assert_eq!(classify_served(template).await, FeedActivityPattern::Constant);
    }

    #[tokio::test]
    async fn test_classify_store_persists_patterns() {
        use crate::storage::MemoryStore;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/one"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(1)))
            .mount(&server)
            .await;

        let gone = format!("{}/gone", server.uri());
        let one = format!("{}/one", server.uri());
        let store = MemoryStore::with_urls([gone.clone(), one.clone()]);

        let count = classify_store(
            &store,
            &client(),
            &crate::feed::FeedRsParser,
            &crate::feed::Sha256ItemHasher,
            2,
        )
        .await
        .unwrap();
        assert_eq!(count, 2);

        let feeds = store.list_feeds().await.unwrap();
        let pattern_of = |url: &str| {
            feeds
                .iter()
                .find(|f| f.url == url)
                .map(|f| f.activity_pattern)
        };
        assert_eq!(pattern_of(&gone), Some(FeedActivityPattern::Dead));
        assert_eq!(pattern_of(&one), Some(FeedActivityPattern::SingleEntry));
    }
}
