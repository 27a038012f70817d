use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// One entry of a fetched feed window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    /// Identifier as published by the feed (`<guid>`, `<id>`).
    pub raw_id: Option<String>,
    /// Publish date as published by the feed, if any.
    pub published: Option<DateTime<Utc>>,
    /// Publish date after sanitization against poll times. Set on ingestion.
    pub corrected_published: Option<DateTime<Utc>>,
    /// Dedup fingerprint. Set on ingestion by the feed's [`ItemHasher`].
    pub hash: Option<String>,
}

impl FeedItem {
    pub fn new(
        title: impl Into<String>,
        link: impl Into<String>,
        raw_id: impl Into<String>,
        published: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            title: Some(title.into()),
            link: Some(link.into()),
            raw_id: Some(raw_id.into()),
            published,
            corrected_published: None,
            hash: None,
        }
    }
}

/// Strategy producing the stable fingerprint used for de-duplication.
///
/// Passed explicitly to [`Feed::set_items`](crate::feed::Feed::set_items) so
/// that different deployments (or tests) can choose what identifies an item.
pub trait ItemHasher: Send + Sync {
    fn hash(&self, item: &FeedItem) -> String;
}

/// Default hasher: SHA-256 over title, link and raw id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ItemHasher;

impl ItemHasher for Sha256ItemHasher {
    fn hash(&self, item: &FeedItem) -> String {
        let input = format!(
            "{}|{}|{}",
            item.title.as_deref().unwrap_or(""),
            item.link.as_deref().unwrap_or(""),
            item.raw_id.as_deref().unwrap_or("")
        );
        format!("{:x}", Sha256::digest(input.as_bytes()))
    }
}

/// Hashes only the raw id, falling back to the link.
///
/// Useful for feeds that rewrite titles of already published items.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawIdItemHasher;

impl ItemHasher for RawIdItemHasher {
    fn hash(&self, item: &FeedItem) -> String {
        let key = item
            .raw_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or(item.link.as_deref())
            .unwrap_or("");
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash_is_stable_and_ignores_dates() {
        let a = FeedItem::new("Title", "https://example.com/1", "1", None);
        let mut b = a.clone();
        b.published = Some(Utc::now());
        assert_eq!(Sha256ItemHasher.hash(&a), Sha256ItemHasher.hash(&b));
        assert_eq!(Sha256ItemHasher.hash(&a).len(), 64);
    }

    #[test]
    fn test_sha256_hash_differs_on_title() {
        let a = FeedItem::new("Title", "https://example.com/1", "1", None);
        let b = FeedItem::new("Other", "https://example.com/1", "1", None);
        assert_ne!(Sha256ItemHasher.hash(&a), Sha256ItemHasher.hash(&b));
    }

    #[test]
    fn test_raw_id_hasher_ignores_title_changes() {
        let a = FeedItem::new("Title", "https://example.com/1", "guid-1", None);
        let b = FeedItem::new("Edited title", "https://example.com/1", "guid-1", None);
        assert_eq!(RawIdItemHasher.hash(&a), RawIdItemHasher.hash(&b));
    }

    #[test]
    fn test_raw_id_hasher_falls_back_to_link() {
        let a = FeedItem::new("A", "https://example.com/1", "  ", None);
        let b = FeedItem::new("B", "https://example.com/1", "", None);
        assert_eq!(RawIdItemHasher.hash(&a), RawIdItemHasher.hash(&b));
    }
}
