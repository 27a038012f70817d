//! Feed state and everything derived from it.
//!
//! - `record` - the per-feed [`Feed`] record with de-duplication and timestamp correction
//! - `stats` - [`PostStatistics`] over corrected item timestamps
//! - `classifier` - activity-pattern classification
//! - `parser` - response body to [`FeedItem`]s via `feed-rs`
//! - `opml` - subscription import

mod address;
mod classifier;
mod item;
mod opml;
mod parser;
mod record;
mod stats;
mod types;

pub use address::{validate_feed_url, UrlValidationError};
pub use classifier::{classify, classify_statistics, classify_store, classify_url};
pub use item::{FeedItem, ItemHasher, RawIdItemHasher, Sha256ItemHasher};
pub use opml::{import, parse_feed_urls, ImportSummary, OpmlError};
pub use parser::{FeedParser, FeedRsParser, ParseError};
pub use record::{from_millis, validate_year, Feed, WindowDates, DEFAULT_UPDATE_INTERVAL};
pub use stats::PostStatistics;
pub use types::{FeedActivityPattern, FeedTaskResult, ResultSet, UnknownVariant};
