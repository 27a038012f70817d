use feed_rs::parser;
use thiserror::Error;

use super::item::FeedItem;

/// The downloaded document is not a feed we can read.
#[derive(Debug, Error)]
#[error("Parse error: {0}")]
pub struct ParseError(pub String);

/// Turns a raw response body into the flat list of items in its window.
pub trait FeedParser: Send + Sync {
    fn parse(&self, body: &[u8]) -> Result<Vec<FeedItem>, ParseError>;
}

/// RSS, Atom and JSON Feed support via `feed-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRsParser;

impl FeedParser for FeedRsParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<FeedItem>, ParseError> {
        let feed = parser::parse(body).map_err(|e| ParseError(e.to_string()))?;

        let items = feed
            .entries
            .into_iter()
            .map(|entry| {
                let link = entry.links.first().map(|l| l.href.clone());
                let raw_id = Some(entry.id.trim().to_string()).filter(|id| !id.is_empty());
                FeedItem {
                    title: entry.title.map(|t| t.content),
                    link,
                    raw_id,
                    published: entry.published.or(entry.updated),
                    corrected_published: None,
                    hash: None,
                }
            })
            .collect();

        Ok(items)
    }
}
