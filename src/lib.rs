//! Adaptive feed polling.
//!
//! Feeds are polled on a schedule that follows how often they publish. A
//! [`reader::FeedReader`] wakes up periodically, dispatches every due feed to a
//! bounded pool of [`reader::FeedTask`]s and persists the updated state through
//! a [`storage::FeedStore`].

pub mod config;
pub mod feed;
pub mod reader;
pub mod storage;
