use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeStatus {
    Unfinished,
    Finished,
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeStatus::Unfinished => write!(f, "unfinished"),
            ScrapeStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Discriminates the persisted checkpoint shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeKind {
    Chunked,
    Cursor,
    Queue,
}

impl fmt::Display for ScrapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeKind::Chunked => write!(f, "chunked"),
            ScrapeKind::Cursor => write!(f, "cursor"),
            ScrapeKind::Queue => write!(f, "queue"),
        }
    }
}

/// Half-open range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk<B> {
    pub start: B,
    pub end: B,
}

impl<B: fmt::Display> fmt::Display for Chunk<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.start, self.end)
    }
}

/// What a scrape run ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// All work is recorded as complete
    Finished,
    /// The checkpoint was already finished; nothing was fetched
    AlreadyFinished,
    /// A unit of work failed; the checkpoint stays unfinished for a later resume
    Incomplete { reason: String },
}

impl ScrapeOutcome {
    pub fn is_complete(&self) -> bool {
        !matches!(self, ScrapeOutcome::Incomplete { .. })
    }
}
