use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Feed Task Result
// ============================================================================

/// Outcome of one polling cycle.
///
/// Variants are declared in ascending priority: when a cycle accumulates
/// several results, the highest one is reported (see [`ResultSet::ranked`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedTaskResult {
    /// No result has been recorded yet.
    Open,
    /// The feed was fetched and processed.
    Success,
    /// Every item in the window was new; items may have been missed.
    Miss,
    /// The cycle succeeded but took longer than the warning threshold.
    ExecutionTimeWarning,
    /// The document was downloaded but could not be parsed.
    Unparsable,
    /// Transport failure or HTTP status >= 400.
    Unreachable,
    /// Uncategorized fault: hook failure, persistence failure, panic.
    Error,
}

impl FeedTaskResult {
    pub const ALL: [FeedTaskResult; 7] = [
        Self::Open,
        Self::Success,
        Self::Miss,
        Self::ExecutionTimeWarning,
        Self::Unparsable,
        Self::Unreachable,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Success => "SUCCESS",
            Self::Miss => "MISS",
            Self::ExecutionTimeWarning => "EXECUTION_TIME_WARNING",
            Self::Unparsable => "UNPARSABLE",
            Self::Unreachable => "UNREACHABLE",
            Self::Error => "ERROR",
        }
    }

    /// Whether the validators (ETag, Last-Modified) from this cycle may be
    /// reused for a conditional request in the next one.
    pub fn allows_conditional_get(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Miss | Self::ExecutionTimeWarning
        )
    }
}

impl fmt::Display for FeedTaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedTaskResult {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Results accumulated during one cycle.
#[derive(Debug, Default, Clone)]
pub struct ResultSet(BTreeSet<FeedTaskResult>);

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: FeedTaskResult) {
        self.0.insert(result);
    }

    pub fn contains(&self, result: FeedTaskResult) -> bool {
        self.0.contains(&result)
    }

    /// Highest-priority result, or `Open` when nothing was recorded.
    pub fn ranked(&self) -> FeedTaskResult {
        self.0.last().copied().unwrap_or(FeedTaskResult::Open)
    }
}

// ============================================================================
// Feed Activity Pattern
// ============================================================================

/// Qualitative category of how a feed publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedActivityPattern {
    /// Not classified yet, or the document could not be parsed.
    #[default]
    Unknown,
    /// The feed does not return a document.
    Dead,
    /// Alive, zero items.
    Empty,
    /// Alive, exactly one item.
    SingleEntry,
    /// Was active, is not anymore.
    Zombie,
    /// Posts rarely and at irregular intervals.
    Spontaneous,
    /// Posts during the day with a longer gap at night.
    Sliced,
    /// Posts around the clock at a similar interval.
    Constant,
    /// All items are published together.
    Chunked,
    /// Items are generated at request time.
    OnTheFly,
}

impl FeedActivityPattern {
    pub const ALL: [FeedActivityPattern; 10] = [
        Self::Unknown,
        Self::Dead,
        Self::Empty,
        Self::SingleEntry,
        Self::Zombie,
        Self::Spontaneous,
        Self::Sliced,
        Self::Constant,
        Self::Chunked,
        Self::OnTheFly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Dead => "dead",
            Self::Empty => "empty",
            Self::SingleEntry => "single_entry",
            Self::Zombie => "zombie",
            Self::Spontaneous => "spontaneous",
            Self::Sliced => "sliced",
            Self::Constant => "constant",
            Self::Chunked => "chunked",
            Self::OnTheFly => "on_the_fly",
        }
    }
}

impl fmt::Display for FeedActivityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedActivityPattern {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

#[derive(Debug, Error)]
#[error("Unknown value: {0}")]
pub struct UnknownVariant(pub String);
