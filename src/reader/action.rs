//! Hooks invoked once per polling cycle with the cycle's outcome.

use async_trait::async_trait;
use std::sync::Arc;

use super::http::{HttpError, HttpResult};
use crate::feed::{Feed, ParseError};
use crate::storage::FeedStore;

/// What a polling cycle produced, handed to a [`ProcessingAction`].
#[derive(Debug)]
pub enum FeedOutcome<'a> {
    /// A document was downloaded and parsed.
    Modified {
        feed: &'a Feed,
        response: &'a HttpResult,
    },
    /// The server answered 304 Not Modified.
    Unmodified {
        feed: &'a Feed,
        response: &'a HttpResult,
    },
    /// A document was downloaded but could not be parsed.
    Exception {
        feed: &'a Feed,
        response: &'a HttpResult,
        error: &'a ParseError,
    },
    /// The request failed or returned an error status.
    Error {
        feed: &'a Feed,
        response: Option<&'a HttpResult>,
        error: Option<&'a HttpError>,
    },
}

impl FeedOutcome<'_> {
    pub fn feed(&self) -> &Feed {
        match self {
            Self::Modified { feed, .. }
            | Self::Unmodified { feed, .. }
            | Self::Exception { feed, .. }
            | Self::Error { feed, .. } => feed,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Modified { .. } => "modified",
            Self::Unmodified { .. } => "unmodified",
            Self::Exception { .. } => "exception",
            Self::Error { .. } => "error",
        }
    }
}

/// Reacts to polling outcomes. An `Err` marks the cycle as ERROR but never
/// aborts it.
#[async_trait]
pub trait ProcessingAction: Send + Sync {
    async fn handle(&self, outcome: FeedOutcome<'_>) -> anyhow::Result<()>;
}

/// Logs each outcome and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAction;

#[async_trait]
impl ProcessingAction for LoggingAction {
    async fn handle(&self, outcome: FeedOutcome<'_>) -> anyhow::Result<()> {
        let feed = outcome.feed();
        match &outcome {
            FeedOutcome::Modified { .. } => tracing::debug!(
                feed_id = feed.id,
                url = %feed.url,
                new_items = feed.new_items().len(),
                "Feed modified"
            ),
            FeedOutcome::Unmodified { .. } => {
                tracing::debug!(feed_id = feed.id, url = %feed.url, "Feed not modified")
            }
            FeedOutcome::Exception { error, .. } => {
                tracing::warn!(feed_id = feed.id, url = %feed.url, error = %error, "Feed unparsable")
            }
            FeedOutcome::Error { response, error, .. } => tracing::warn!(
                feed_id = feed.id,
                url = %feed.url,
                status = response.map(|r| r.status),
                error = ?error.map(ToString::to_string),
                "Feed unreachable"
            ),
        }
        Ok(())
    }
}

/// Archives the new items of every modified feed in the store.
pub struct StoreItemsAction {
    store: Arc<dyn FeedStore>,
}

impl StoreItemsAction {
    pub fn new(store: Arc<dyn FeedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProcessingAction for StoreItemsAction {
    async fn handle(&self, outcome: FeedOutcome<'_>) -> anyhow::Result<()> {
        let FeedOutcome::Modified { feed, .. } = outcome else {
            return Ok(());
        };
        if !feed.has_new_items() {
            return Ok(());
        }

        let inserted = self.store.add_feed_items(feed.id, feed.new_items()).await?;
        tracing::trace!(feed_id = feed.id, inserted, "Archived new items");
        Ok(())
    }
}
