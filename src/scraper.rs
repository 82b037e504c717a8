//! The capability every scrape kind offers, and the config-driven way of
//! picking one.

use crate::checkpoint::{Checkpoint, Namespace};
use crate::chunk::{self, ChunkCheckpoint, ChunkScraper, RangeQuery};
use crate::config::{Credentials, Pacing, DEFAULT_MAX_ATTEMPTS};
use crate::merge::MergeOutcome;
use crate::models::{ScrapeKind, ScrapeOutcome, ScrapeStatus};
use crate::pager::{self, CursorCheckpoint, FeedMode, FeedQuery, FeedScraper};
use crate::queue::{self, items_from_table, QueueCheckpoint, QueueScraper};
use crate::source::{CrowdTangleSource, ImageSource, RapidApiFeedSource};
use crate::stats::ScrapeStats;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub trait Scraper {
    fn kind(&self) -> ScrapeKind;

    fn namespace(&self) -> &Namespace;

    fn status(&self) -> ScrapeStatus;

    /// Counters for the current invocation only.
    fn stats(&self) -> &ScrapeStats;

    /// Works until the checkpoint is finished or a unit fails for good.
    fn scrape(&mut self) -> Result<ScrapeOutcome>;

    /// Writes the namespace's result table; skipped when it exists unless `force`.
    fn combine_results(&self, force: bool) -> Result<MergeOutcome>;

    /// Like [`combine_results`](Scraper::combine_results), but an existing
    /// table is rewritten whenever this invocation worked any unit, since it
    /// no longer reflects the namespace.
    fn refresh_results(&self, force: bool) -> Result<MergeOutcome> {
        self.combine_results(force || self.stats().units() > 0)
    }

    fn is_finished(&self) -> bool {
        self.status() == ScrapeStatus::Finished
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_media_endpoint() -> bool {
    true
}

/// Which scraper to build, as written in a config file:
///
/// ```json
/// {"kind": "cursor", "mode": "hashtag", "term": "glasgow"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScraperSpec {
    Chunked {
        #[serde(flatten)]
        query: RangeQuery,
    },
    Cursor {
        mode: FeedMode,
        term: String,
    },
    Queue {
        /// Table with `id`, `shortcode` and `thumbnail_src` columns
        input: PathBuf,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_media_endpoint")]
        media_endpoint: bool,
        /// Fetch items again even when their artifact is already on disk
        #[serde(default)]
        refetch_existing: bool,
    },
}

impl ScraperSpec {
    pub fn kind(&self) -> ScrapeKind {
        match self {
            ScraperSpec::Chunked { .. } => ScrapeKind::Chunked,
            ScraperSpec::Cursor { .. } => ScrapeKind::Cursor,
            ScraperSpec::Queue { .. } => ScrapeKind::Queue,
        }
    }
}

/// Builds the HTTP-backed scraper `spec` describes, resuming `namespace` if it
/// already holds a checkpoint of the same kind.
pub fn build_scraper(
    spec: &ScraperSpec,
    namespace: Namespace,
    credentials: &Credentials,
    pacing: Pacing,
) -> Result<Box<dyn Scraper>> {
    if let Some(existing) = namespace.detect_kind()? {
        if existing != spec.kind() {
            bail!(
                "namespace {:?} holds a {} scrape, not a {} scrape",
                namespace.root(),
                existing,
                spec.kind()
            );
        }
    }

    Ok(match spec {
        ScraperSpec::Chunked { query } => {
            let source = CrowdTangleSource::new(credentials.crowdtangle_token()?, pacing.clone())?;
            Box::new(ChunkScraper::open(namespace, source, query.clone(), pacing)?)
        }
        ScraperSpec::Cursor { mode, term } => {
            // the source must page the feed the checkpoint records
            let query = match namespace.store().resume::<CursorCheckpoint>()? {
                Some(existing) => existing.query,
                None => FeedQuery::new(*mode, term),
            };
            let source = RapidApiFeedSource::new(credentials.rapidapi_key()?, query.clone())?;
            Box::new(FeedScraper::open(namespace, source, query, pacing)?)
        }
        ScraperSpec::Queue {
            input,
            max_attempts,
            media_endpoint,
            refetch_existing,
        } => {
            let items = if namespace.store().resume::<QueueCheckpoint>()?.is_some() {
                Vec::new()
            } else {
                items_from_table(input, *max_attempts)?
            };
            let source = ImageSource::new(*media_endpoint)?;
            let scraper = QueueScraper::open(namespace, source, items, pacing)?;
            if *refetch_existing {
                Box::new(scraper.refetch_existing())
            } else {
                Box::new(scraper)
            }
        }
    })
}

/// A namespace's checkpoint, loaded without any source attached.
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted {
    Chunked(ChunkCheckpoint),
    Cursor(CursorCheckpoint),
    Queue(QueueCheckpoint),
}

impl Persisted {
    pub fn load(namespace: &Namespace) -> Result<Option<Self>> {
        let store = namespace.store();
        Ok(match namespace.detect_kind()? {
            None => None,
            Some(ScrapeKind::Chunked) => store.resume()?.map(Persisted::Chunked),
            Some(ScrapeKind::Cursor) => store.resume()?.map(Persisted::Cursor),
            Some(ScrapeKind::Queue) => store.resume()?.map(Persisted::Queue),
        })
    }

    pub fn kind(&self) -> ScrapeKind {
        match self {
            Persisted::Chunked(_) => ScrapeKind::Chunked,
            Persisted::Cursor(_) => ScrapeKind::Cursor,
            Persisted::Queue(_) => ScrapeKind::Queue,
        }
    }

    pub fn status(&self) -> ScrapeStatus {
        match self {
            Persisted::Chunked(c) => c.status(),
            Persisted::Cursor(c) => c.status(),
            Persisted::Queue(c) => c.status(),
        }
    }

    /// One-line progress description for listings.
    pub fn progress(&self) -> String {
        match self {
            Persisted::Chunked(c) => {
                let done = c.chunks.len() - c.remaining().len();
                format!(
                    "{} {}..{}: {}/{} chunks",
                    c.query.query_type,
                    c.query.start,
                    c.query.end,
                    done,
                    c.chunks.len()
                )
            }
            Persisted::Cursor(c) => {
                let expected = c
                    .expected_total
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!(
                    "{}: {} pages, {}/{} posts",
                    c.query.slug(),
                    c.pages,
                    c.collected,
                    expected
                )
            }
            Persisted::Queue(c) => c.summary().to_string(),
        }
    }

    pub fn combine(&self, namespace: &Namespace, force: bool) -> Result<MergeOutcome> {
        match self {
            Persisted::Chunked(_) => chunk::combine(namespace, force),
            Persisted::Cursor(c) => pager::combine(namespace, c, force),
            Persisted::Queue(c) => queue::write_manifest(namespace, c, force),
        }
    }
}
