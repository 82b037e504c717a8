//! Cursor-paginated scrapes: one page per unit of work, continuation tokens
//! kept in the checkpoint so a re-run picks up at the last saved cursor.

use crate::checkpoint::{
    decode_json, encode_json, read_json_artifact, write_json_artifact, Checkpoint, CheckpointStore,
    Namespace,
};
use crate::config::{
    pause, Pacing, ANOMALY_RETRIES, CHECKPOINT_FILE, CHECKPOINT_VERSION, CURSOR_NAME_MAX,
    DEFAULT_MAX_TRIES,
};
use crate::error::FetchError;
use crate::extract::FeedPostExtractor;
use crate::merge::{merge_artifacts, MergeOutcome};
use crate::models::{ScrapeKind, ScrapeOutcome, ScrapeStatus};
use crate::retry::with_retries;
use crate::scraper::Scraper;
use crate::stats::ScrapeStats;
use anyhow::{bail, Result};
use indicatif::ProgressBar;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info, warn};

static UNSAFE_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    Location,
    Hashtag,
    User,
}

impl FeedMode {
    /// Query parameter the feed endpoint expects the search term under.
    pub fn param_name(&self) -> &'static str {
        match self {
            FeedMode::Location => "location_id",
            FeedMode::Hashtag => "hashtag",
            FeedMode::User => "username",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Location => "location",
            FeedMode::Hashtag => "hashtag",
            FeedMode::User => "user",
        }
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "location" => Ok(FeedMode::Location),
            "hashtag" => Ok(FeedMode::Hashtag),
            "user" => Ok(FeedMode::User),
            other => bail!("unknown feed mode '{}' (expected location, hashtag or user)", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedQuery {
    pub mode: FeedMode,
    pub term: String,
}

impl FeedQuery {
    /// Strips the leading `#` / `@` users tend to type.
    pub fn new(mode: FeedMode, term: &str) -> Self {
        let term = match mode {
            FeedMode::Hashtag => term.trim().trim_start_matches('#'),
            FeedMode::User => term.trim().trim_start_matches('@'),
            FeedMode::Location => term.trim(),
        };
        Self {
            mode,
            term: term.to_string(),
        }
    }

    /// Namespace directory name, e.g. `hashtag-glasgow`
    pub fn slug(&self) -> String {
        format!("{}-{}", self.mode, self.term)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorCheckpoint {
    pub version: u32,
    pub kind: ScrapeKind,
    pub status: ScrapeStatus,
    pub query: FeedQuery,
    /// Total the source reported on the first page, if any
    pub expected_total: Option<u64>,
    pub collected: u64,
    /// Pages completed; also the index of the next page
    pub pages: usize,
    /// Seed cursor followed by every cursor received; the last one is next
    pub cursors: Vec<String>,
}

impl CursorCheckpoint {
    pub fn new(query: FeedQuery, seed_cursor: &str) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            kind: ScrapeKind::Cursor,
            status: ScrapeStatus::Unfinished,
            query,
            expected_total: None,
            collected: 0,
            pages: 0,
            cursors: vec![seed_cursor.to_string()],
        }
    }

    pub fn current_cursor(&self) -> &str {
        self.cursors.last().map(String::as_str).unwrap_or("")
    }
}

impl Checkpoint for CursorCheckpoint {
    const FILE_NAME: &'static str = CHECKPOINT_FILE;

    fn status(&self) -> ScrapeStatus {
        self.status
    }

    fn encode<W: Write>(&self, writer: W) -> Result<()> {
        encode_json(self, writer)
    }

    fn decode<R: Read>(reader: R) -> Result<Self> {
        let checkpoint: CursorCheckpoint = decode_json(reader, |c: &CursorCheckpoint| c.version)?;
        if checkpoint.kind != ScrapeKind::Cursor {
            bail!("checkpoint belongs to a {} scrape", checkpoint.kind);
        }
        Ok(checkpoint)
    }
}

/// The parts of one page response the pager needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: String,
    pub has_more: bool,
    pub total: Option<u64>,
}

pub trait PageSource {
    /// The raw response for `cursor`, persisted unmodified as the page artifact.
    fn fetch_raw(&mut self, cursor: &str) -> Result<Value, FetchError>;

    /// Reads a raw response (fresh or replayed from disk).
    fn decode(&self, raw: &Value) -> Result<Page, FetchError>;
}

/// `000042_<cursor>.json`; the seed page's empty cursor becomes `seed`.
pub fn page_artifact_name(index: usize, cursor: &str) -> String {
    let cleaned = UNSAFE_NAME_CHARS.replace_all(cursor, "_");
    let mut name: String = cleaned.chars().take(CURSOR_NAME_MAX).collect();
    if name.is_empty() {
        name.push_str("seed");
    }
    format!("{:06}_{}.json", index, name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagerOutcome {
    Exhausted,
    Aborted { reason: String },
}

pub struct CursorPager<'a> {
    store: &'a CheckpointStore,
    data_dir: PathBuf,
    pacing: &'a Pacing,
    max_tries: u32,
    anomaly_retries: u32,
}

impl<'a> CursorPager<'a> {
    pub fn new(store: &'a CheckpointStore, data_dir: &Path, pacing: &'a Pacing) -> Self {
        Self {
            store,
            data_dir: data_dir.to_path_buf(),
            pacing,
            max_tries: DEFAULT_MAX_TRIES,
            anomaly_retries: ANOMALY_RETRIES,
        }
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_anomaly_retries(mut self, retries: u32) -> Self {
        self.anomaly_retries = retries;
        self
    }

    /// Follows cursors from the checkpoint's last one until the source has no more pages.
    pub fn drive<S: PageSource>(
        &self,
        source: &mut S,
        checkpoint: &mut CursorCheckpoint,
        stats: &mut ScrapeStats,
    ) -> Result<PagerOutcome> {
        let pb = ProgressBar::new_spinner();
        let mut anomalies = 0u32;

        while checkpoint.status == ScrapeStatus::Unfinished {
            let cursor = checkpoint.current_cursor().to_string();
            let path = self.data_dir.join(page_artifact_name(checkpoint.pages, &cursor));
            let replayed = path.exists();

            let raw = if replayed {
                read_json_artifact(&path)?
            } else {
                let unit = format!("page {}", checkpoint.pages);
                let fetched =
                    with_retries(self.max_tries, self.pacing, &unit, || source.fetch_raw(&cursor));
                match fetched {
                    Ok(raw) => raw,
                    Err(e) => {
                        stats.record_failure();
                        pb.abandon();
                        error!(
                            cursor = %cursor,
                            page = checkpoint.pages,
                            error = %e,
                            "Request failed; re-run to resume from this cursor"
                        );
                        return Ok(PagerOutcome::Aborted {
                            reason: format!("page {} failed: {}", checkpoint.pages, e),
                        });
                    }
                }
            };

            let page = match source.decode(&raw) {
                Ok(page) => page,
                Err(e) => {
                    stats.record_failure();
                    pb.abandon();
                    error!(cursor = %cursor, error = %e, "Page response could not be read");
                    return Ok(PagerOutcome::Aborted {
                        reason: format!("page {} unreadable: {}", checkpoint.pages, e),
                    });
                }
            };

            // An empty "last" page is usually throttling, not the end of the feed.
            if !replayed
                && !page.has_more
                && page.items.is_empty()
                && anomalies < self.anomaly_retries
            {
                anomalies += 1;
                warn!(cursor = %cursor, attempt = anomalies, "Unexpected empty response, retrying");
                pause(self.pacing.anomaly_delay);
                continue;
            }
            anomalies = 0;

            if replayed {
                info!(page = checkpoint.pages, "Page artifact already on disk, skipping request");
                stats.record_replay();
            } else {
                write_json_artifact(&path, &raw)?;
                stats.record_fetch(page.items.len());
            }

            if checkpoint.pages == 0 {
                checkpoint.expected_total = page.total;
                if let Some(total) = page.total {
                    info!(total, query = %checkpoint.query.slug(), "Source reports matching posts");
                }
            }
            checkpoint.collected += page.items.len() as u64;
            checkpoint.pages += 1;
            checkpoint.cursors.push(page.next_cursor.clone());
            if !page.has_more {
                checkpoint.status = ScrapeStatus::Finished;
            }
            self.store.save(&*checkpoint)?;

            pb.set_message(format!(
                "{} pages, {} posts",
                checkpoint.pages, checkpoint.collected
            ));
            pb.tick();
            info!(
                page = checkpoint.pages,
                collected = checkpoint.collected,
                expected = ?checkpoint.expected_total,
                "Page saved"
            );

            if !replayed && page.has_more {
                pause(self.pacing.request_delay);
            }
        }

        pb.finish_and_clear();
        Ok(PagerOutcome::Exhausted)
    }
}

pub struct FeedScraper<S> {
    namespace: Namespace,
    checkpoint: CursorCheckpoint,
    source: S,
    pacing: Pacing,
    max_tries: u32,
    stats: ScrapeStats,
}

impl<S: PageSource> FeedScraper<S> {
    pub fn open(namespace: Namespace, source: S, query: FeedQuery, pacing: Pacing) -> Result<Self> {
        let store = namespace.store();
        let checkpoint = match store.resume::<CursorCheckpoint>()? {
            Some(existing) => {
                if existing.query != query {
                    warn!(
                        namespace = ?namespace.root(),
                        "Requested feed differs from the checkpoint; continuing with its feed"
                    );
                }
                existing
            }
            None => {
                info!(
                    namespace = ?namespace.root(),
                    query = %query.slug(),
                    "Initializing new feed scrape"
                );
                let fresh = CursorCheckpoint::new(query, "");
                store.save(&fresh)?;
                fresh
            }
        };

        Ok(Self {
            namespace,
            checkpoint,
            source,
            pacing,
            max_tries: DEFAULT_MAX_TRIES,
            stats: ScrapeStats::new(),
        })
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn checkpoint(&self) -> &CursorCheckpoint {
        &self.checkpoint
    }
}

impl<S: PageSource> Scraper for FeedScraper<S> {
    fn kind(&self) -> ScrapeKind {
        ScrapeKind::Cursor
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn status(&self) -> ScrapeStatus {
        self.checkpoint.status
    }

    fn stats(&self) -> &ScrapeStats {
        &self.stats
    }

    fn scrape(&mut self) -> Result<ScrapeOutcome> {
        if self.checkpoint.status == ScrapeStatus::Finished {
            info!("This scrape is complete. To re-do it, start a new one in a different namespace");
            return Ok(ScrapeOutcome::AlreadyFinished);
        }

        let store = self.namespace.store();
        let pager = CursorPager::new(&store, &self.namespace.data_dir(), &self.pacing)
            .with_max_tries(self.max_tries);
        match pager.drive(&mut self.source, &mut self.checkpoint, &mut self.stats)? {
            PagerOutcome::Exhausted => {
                info!(
                    query = %self.checkpoint.query.slug(),
                    pages = self.checkpoint.pages,
                    collected = self.checkpoint.collected,
                    "Feed scrape complete"
                );
                Ok(ScrapeOutcome::Finished)
            }
            PagerOutcome::Aborted { reason } => Ok(ScrapeOutcome::Incomplete { reason }),
        }
    }

    fn combine_results(&self, force: bool) -> Result<MergeOutcome> {
        combine(&self.namespace, &self.checkpoint, force)
    }
}

pub fn combine(
    namespace: &Namespace,
    checkpoint: &CursorCheckpoint,
    force: bool,
) -> Result<MergeOutcome> {
    let extractor = FeedPostExtractor::new(checkpoint.query.mode, &checkpoint.query.term);
    merge_artifacts(&namespace.data_dir(), &extractor, &namespace.result_path(), force)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Replays scripted responses; each entry is one call's outcome.
    struct Scripted {
        responses: VecDeque<Result<Value, FetchError>>,
        seen_cursors: Vec<String>,
        seen_at: Vec<Instant>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Value, FetchError>>) -> Self {
            Self {
                responses: responses.into(),
                seen_cursors: Vec::new(),
                seen_at: Vec::new(),
            }
        }
    }

    fn page(ids: &[u32], next: &str, more: bool) -> Result<Value, FetchError> {
        Ok(json!({ "items": ids, "next": next, "more": more, "count": 99 }))
    }

    impl PageSource for Scripted {
        fn fetch_raw(&mut self, cursor: &str) -> Result<Value, FetchError> {
            self.seen_cursors.push(cursor.to_string());
            self.seen_at.push(Instant::now());
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transient("script exhausted".into())))
        }

        fn decode(&self, raw: &Value) -> Result<Page, FetchError> {
            Ok(Page {
                items: raw["items"].as_array().cloned().ok_or_else(|| FetchError::schema("items"))?,
                next_cursor: raw["next"].as_str().unwrap_or_default().to_string(),
                has_more: raw["more"].as_bool().ok_or_else(|| FetchError::schema("more"))?,
                total: raw["count"].as_u64(),
            })
        }
    }

    fn fresh(dir: &TempDir) -> (Namespace, CursorCheckpoint) {
        let ns = Namespace::open(dir.path()).unwrap();
        let cp = CursorCheckpoint::new(FeedQuery::new(FeedMode::Hashtag, "#rust"), "");
        (ns, cp)
    }

    fn artifact_items(ns: &Namespace) -> Vec<Value> {
        let mut names: Vec<_> = std::fs::read_dir(ns.data_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        names.sort();
        names
            .iter()
            .flat_map(|p| read_json_artifact(p).unwrap()["items"].as_array().cloned().unwrap())
            .collect()
    }

    #[test]
    fn feed_query_strips_prefixes() {
        assert_eq!(FeedQuery::new(FeedMode::Hashtag, "#glasgow").term, "glasgow");
        assert_eq!(FeedQuery::new(FeedMode::User, "@someone").term, "someone");
        assert_eq!(FeedQuery::new(FeedMode::Location, " 123 ").slug(), "location-123");
        assert!("planet".parse::<FeedMode>().is_err());
    }

    #[test]
    fn artifact_names_are_sanitized_and_ordered() {
        assert_eq!(page_artifact_name(0, ""), "000000_seed.json");
        assert_eq!(page_artifact_name(12, "QVFD+a/b=="), "000012_QVFD_a_b__.json");
        let long = "x".repeat(200);
        assert_eq!(page_artifact_name(1, &long).len(), 6 + 1 + CURSOR_NAME_MAX + 5);
        assert!(page_artifact_name(9, "z") < page_artifact_name(10, "a"));
    }

    #[test]
    fn drives_to_exhaustion_and_concatenates_in_order() {
        let dir = TempDir::new().unwrap();
        let (ns, mut cp) = fresh(&dir);
        let mut source = Scripted::new(vec![
            page(&[1, 2], "c1", true),
            page(&[3], "c2", true),
            page(&[4, 5], "", false),
        ]);
        let pacing = Pacing::immediate();
        let store = ns.store();
        let mut stats = ScrapeStats::new();

        let outcome = CursorPager::new(&store, &ns.data_dir(), &pacing)
            .drive(&mut source, &mut cp, &mut stats)
            .unwrap();

        assert_eq!(outcome, PagerOutcome::Exhausted);
        assert_eq!(cp.status, ScrapeStatus::Finished);
        assert_eq!(cp.pages, 3);
        assert_eq!(cp.collected, 5);
        assert_eq!(cp.expected_total, Some(99));
        assert_eq!(source.seen_cursors, vec!["", "c1", "c2"]);
        assert_eq!(cp.cursors, vec!["", "c1", "c2", ""]);
        assert_eq!(artifact_items(&ns), (1..=5).map(|i| json!(i)).collect::<Vec<_>>());

        let persisted: CursorCheckpoint = store.resume().unwrap().unwrap();
        assert_eq!(persisted, cp);
    }

    #[test]
    fn request_delay_separates_fetched_pages() {
        let dir = TempDir::new().unwrap();
        let (ns, mut cp) = fresh(&dir);
        let pacing = Pacing {
            request_delay: Duration::from_millis(20),
            ..Pacing::immediate()
        };
        let store = ns.store();
        let mut stats = ScrapeStats::new();
        let mut source = Scripted::new(vec![
            page(&[1], "c1", true),
            page(&[2], "c2", true),
            page(&[3], "", false),
        ]);

        CursorPager::new(&store, &ns.data_dir(), &pacing)
            .drive(&mut source, &mut cp, &mut stats)
            .unwrap();

        let gaps: Vec<Duration> = source
            .seen_at
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect();
        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|g| *g >= Duration::from_millis(20)));
    }

    #[test]
    fn failure_aborts_and_resume_continues_from_cursor() {
        let dir = TempDir::new().unwrap();
        let (ns, mut cp) = fresh(&dir);
        let pacing = Pacing::immediate();
        let store = ns.store();
        let mut stats = ScrapeStats::new();

        let mut flaky = Scripted::new(vec![
            page(&[1], "c1", true),
            Err(FetchError::Transient("reset".into())),
            Err(FetchError::Transient("reset".into())),
        ]);
        let outcome = CursorPager::new(&store, &ns.data_dir(), &pacing)
            .with_max_tries(2)
            .drive(&mut flaky, &mut cp, &mut stats)
            .unwrap();
        assert!(matches!(outcome, PagerOutcome::Aborted { .. }));
        assert_eq!(cp.status, ScrapeStatus::Unfinished);

        let mut resumed: CursorCheckpoint = store.resume().unwrap().unwrap();
        let mut healthy = Scripted::new(vec![page(&[2, 3], "", false)]);
        CursorPager::new(&store, &ns.data_dir(), &pacing)
            .drive(&mut healthy, &mut resumed, &mut stats)
            .unwrap();
        assert_eq!(healthy.seen_cursors, vec!["c1"]);
        assert_eq!(resumed.collected, 3);
        assert_eq!(resumed.status, ScrapeStatus::Finished);
    }

    #[test]
    fn empty_final_page_is_retried_then_accepted() {
        let dir = TempDir::new().unwrap();
        let (ns, mut cp) = fresh(&dir);
        let pacing = Pacing::immediate();
        let store = ns.store();
        let mut stats = ScrapeStats::new();

        let mut source = Scripted::new(vec![
            page(&[], "", false),
            page(&[7], "c1", true),
            page(&[], "", false),
            page(&[], "", false),
            page(&[], "", false),
        ]);
        CursorPager::new(&store, &ns.data_dir(), &pacing)
            .with_anomaly_retries(2)
            .drive(&mut source, &mut cp, &mut stats)
            .unwrap();

        // first empty page retried once and recovered; last one retried twice then believed
        assert_eq!(source.seen_cursors, vec!["", "", "c1", "c1", "c1"]);
        assert_eq!(cp.status, ScrapeStatus::Finished);
        assert_eq!(cp.collected, 1);
    }

    #[test]
    fn saved_artifact_is_replayed_without_request() {
        let dir = TempDir::new().unwrap();
        let (ns, mut cp) = fresh(&dir);
        let pacing = Pacing::immediate();
        let store = ns.store();
        let mut stats = ScrapeStats::new();

        // crash after the artifact was written but before the checkpoint save
        write_json_artifact(
            &ns.data_dir().join(page_artifact_name(0, "")),
            &json!({ "items": [1], "next": "c1", "more": true }),
        )
        .unwrap();

        let mut source = Scripted::new(vec![page(&[2], "", false)]);
        CursorPager::new(&store, &ns.data_dir(), &pacing)
            .drive(&mut source, &mut cp, &mut stats)
            .unwrap();

        assert_eq!(source.seen_cursors, vec!["c1"]);
        assert_eq!(stats.units_replayed, 1);
        assert_eq!(cp.collected, 2);
    }

    #[test]
    fn schema_error_aborts_without_saving_page() {
        let dir = TempDir::new().unwrap();
        let (ns, mut cp) = fresh(&dir);
        let pacing = Pacing::immediate();
        let store = ns.store();
        let mut stats = ScrapeStats::new();

        let mut source = Scripted::new(vec![Ok(json!({ "unexpected": true }))]);
        let outcome = CursorPager::new(&store, &ns.data_dir(), &pacing)
            .drive(&mut source, &mut cp, &mut stats)
            .unwrap();
        assert!(matches!(outcome, PagerOutcome::Aborted { .. }));
        assert_eq!(cp.pages, 0);
        assert!(artifact_items(&ns).is_empty());
    }

    #[test]
    fn finished_feed_refuses_more_work() {
        let dir = TempDir::new().unwrap();
        let ns = Namespace::open(dir.path()).unwrap();
        let source = Scripted::new(vec![page(&[1], "", false)]);
        let query = FeedQuery::new(FeedMode::User, "x");
        let mut scraper =
            FeedScraper::open(ns.clone(), source, query.clone(), Pacing::immediate()).unwrap();
        assert_eq!(scraper.scrape().unwrap(), ScrapeOutcome::Finished);

        let again = Scripted::new(vec![]);
        let mut reopened = FeedScraper::open(ns, again, query, Pacing::immediate()).unwrap();
        assert_eq!(reopened.scrape().unwrap(), ScrapeOutcome::AlreadyFinished);
        assert!(reopened.source.seen_cursors.is_empty());
    }
}
