//! Identity-addressed scrapes: a fixed item set worked through in rounds, each
//! item retried until it is scraped or hits its attempt ceiling.

use crate::checkpoint::{write_atomic, Checkpoint, CheckpointStore, Namespace};
use crate::config::{pause, Pacing, QUEUE_CHECKPOINT_FILE, TABLE_BUFFER_SIZE};
use crate::error::FetchError;
use crate::merge::MergeOutcome;
use crate::models::{ScrapeKind, ScrapeOutcome, ScrapeStatus};
use crate::scraper::Scraper;
use crate::stats::ScrapeStats;
use anyhow::{bail, Context, Result};
use csv::{Reader, Writer};
use indicatif::{ProgressBar, ProgressStyle};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Done,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryItem {
    pub key: String,
    pub scraped: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Secondary identity used in the artifact name (e.g. a shortcode)
    pub label: String,
    pub url: String,
}

impl RetryItem {
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        url: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            key: key.into(),
            scraped: false,
            attempts: 0,
            max_attempts,
            label: label.into(),
            url: url.into(),
        }
    }

    pub fn state(&self) -> ItemState {
        if self.scraped {
            ItemState::Done
        } else if self.attempts >= self.max_attempts {
            ItemState::Exhausted
        } else {
            ItemState::Pending
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.state() == ItemState::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSummary {
    pub total: usize,
    pub done: usize,
    pub scraped: usize,
    pub failed: usize,
}

impl fmt::Display for QueueSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {}, done {}, scraped {}, failed {}",
            self.total, self.done, self.scraped, self.failed
        )
    }
}

/// One row per item; status is derived from the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCheckpoint {
    pub items: Vec<RetryItem>,
}

impl QueueCheckpoint {
    pub fn new(items: Vec<RetryItem>) -> Result<Self> {
        let mut seen = FxHashSet::default();
        for item in &items {
            if !seen.insert(item.key.as_str()) {
                bail!("duplicate item key '{}'; remove duplicates before queueing", item.key);
            }
        }
        Ok(Self { items })
    }

    pub fn has_eligible(&self) -> bool {
        self.items.iter().any(RetryItem::is_eligible)
    }

    pub fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary {
            total: self.items.len(),
            ..Default::default()
        };
        for item in &self.items {
            match item.state() {
                ItemState::Done => {
                    summary.done += 1;
                    summary.scraped += 1;
                }
                ItemState::Exhausted => {
                    summary.done += 1;
                    summary.failed += 1;
                }
                ItemState::Pending => {}
            }
        }
        summary
    }

    /// Items never scraped: still pending or out of attempts.
    pub fn unscraped(&self) -> Vec<&RetryItem> {
        self.items.iter().filter(|i| !i.scraped).collect()
    }
}

impl Checkpoint for QueueCheckpoint {
    const FILE_NAME: &'static str = QUEUE_CHECKPOINT_FILE;

    fn status(&self) -> ScrapeStatus {
        if self.has_eligible() {
            ScrapeStatus::Unfinished
        } else {
            ScrapeStatus::Finished
        }
    }

    fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = Writer::from_writer(writer);
        for item in &self.items {
            writer.serialize(item)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut reader = Reader::from_reader(reader);
        let items = reader
            .deserialize()
            .collect::<std::result::Result<Vec<RetryItem>, _>>()?;
        QueueCheckpoint::new(items)
    }
}

/// A source addressed by item identity, returning one record per key.
pub trait ItemSource {
    /// Extension of the artifacts this source produces, without the dot.
    fn extension(&self) -> &str;

    fn fetch(&mut self, item: &RetryItem) -> Result<Vec<u8>, FetchError>;
}

fn escape_name_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '_' => out.push_str("%5F"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    out
}

/// `<key>_<label>` with `%`, `_` and path separators escaped in both parts,
/// so the only bare `_` is the separator and no two items share a stem.
pub fn artifact_stem(item: &RetryItem) -> String {
    format!("{}_{}", escape_name_part(&item.key), escape_name_part(&item.label))
}

pub fn artifact_name(item: &RetryItem, extension: &str) -> String {
    format!("{}.{}", artifact_stem(item), extension)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Artifact already on disk; no request made
    Skipped,
    Scraped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub rounds: u32,
    pub summary: QueueSummary,
    pub unscraped: Vec<String>,
}

pub struct RetryQueue<'a> {
    store: &'a CheckpointStore,
    data_dir: PathBuf,
    pacing: &'a Pacing,
    skip_existing: bool,
}

impl<'a> RetryQueue<'a> {
    pub fn new(store: &'a CheckpointStore, data_dir: &Path, pacing: &'a Pacing) -> Self {
        Self {
            store,
            data_dir: data_dir.to_path_buf(),
            pacing,
            skip_existing: true,
        }
    }

    /// Re-fetch items even when their artifact already exists.
    pub fn refetch_existing(mut self) -> Self {
        self.skip_existing = false;
        self
    }

    /// Works one item; persists the checkpoint before returning.
    pub fn execute<S: ItemSource>(
        &self,
        source: &mut S,
        checkpoint: &mut QueueCheckpoint,
        index: usize,
        stats: &mut ScrapeStats,
    ) -> Result<ItemOutcome> {
        let item = &checkpoint.items[index];
        let path = self.data_dir.join(artifact_name(item, source.extension()));

        if self.skip_existing && path.exists() {
            checkpoint.items[index].scraped = true;
            self.store.save(&*checkpoint)?;
            stats.record_replay();
            return Ok(ItemOutcome::Skipped);
        }

        checkpoint.items[index].attempts += 1;
        let item = &checkpoint.items[index];
        let outcome = match source.fetch(item) {
            Ok(bytes) => {
                write_atomic(&path, &bytes)?;
                stats.record_fetch(1);
                checkpoint.items[index].scraped = true;
                ItemOutcome::Scraped
            }
            Err(e) => {
                stats.record_failure();
                warn!(
                    key = %item.key,
                    label = %item.label,
                    attempt = item.attempts,
                    max_attempts = item.max_attempts,
                    error = %e,
                    "Item fetch failed"
                );
                if let FetchError::RateLimited(_) = e {
                    pause(self.pacing.rate_limit_delay);
                }
                ItemOutcome::Failed
            }
        };
        self.store.save(&*checkpoint)?;

        let item = &checkpoint.items[index];
        info!(
            key = %item.key,
            label = %item.label,
            result = if outcome == ItemOutcome::Scraped { "success" } else { "fail" },
            "Item attempted"
        );
        pause(self.pacing.item_delay);
        Ok(outcome)
    }

    /// Runs rounds until no item is eligible.
    ///
    /// Every fetch either marks an item scraped or raises its attempt count
    /// toward the ceiling, so this stops after at most items × ceiling fetches.
    pub fn run<S: ItemSource>(
        &self,
        source: &mut S,
        checkpoint: &mut QueueCheckpoint,
        stats: &mut ScrapeStats,
    ) -> Result<QueueReport> {
        let mut rounds = 0u32;

        while checkpoint.has_eligible() {
            if rounds > 0 && !self.pacing.round_cooldown.is_zero() {
                info!(
                    secs = self.pacing.round_cooldown.as_secs(),
                    "Cooling down before next round"
                );
                pause(self.pacing.round_cooldown);
            }
            rounds += 1;

            let eligible: Vec<usize> = checkpoint
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_eligible())
                .map(|(i, _)| i)
                .collect();

            let pb = ProgressBar::new(eligible.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} round {msg} [{bar:40.cyan/blue}] {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb.set_message(rounds.to_string());

            for index in eligible {
                self.execute(source, checkpoint, index, stats)?;
                pb.inc(1);
            }
            pb.finish_and_clear();

            info!(round = rounds, summary = %checkpoint.summary(), "Round complete");
        }

        let unscraped: Vec<String> = checkpoint
            .unscraped()
            .iter()
            .map(|i| i.label.clone())
            .collect();
        if !unscraped.is_empty() {
            warn!(items = ?unscraped, "Items never scraped");
        }

        Ok(QueueReport {
            rounds,
            summary: checkpoint.summary(),
            unscraped,
        })
    }
}

pub struct QueueScraper<S> {
    namespace: Namespace,
    checkpoint: QueueCheckpoint,
    source: S,
    pacing: Pacing,
    skip_existing: bool,
    stats: ScrapeStats,
}

impl<S: ItemSource> QueueScraper<S> {
    /// Resumes the namespace's queue, or creates it from `items`.
    pub fn open(
        namespace: Namespace,
        source: S,
        items: Vec<RetryItem>,
        pacing: Pacing,
    ) -> Result<Self> {
        let store = namespace.store();
        let checkpoint = match store.resume::<QueueCheckpoint>()? {
            Some(existing) => existing,
            None => {
                info!(
                    namespace = ?namespace.root(),
                    items = items.len(),
                    "Initializing new queue scrape"
                );
                let fresh = QueueCheckpoint::new(items)?;
                store.save(&fresh)?;
                fresh
            }
        };

        Ok(Self {
            namespace,
            checkpoint,
            source,
            pacing,
            skip_existing: true,
            stats: ScrapeStats::new(),
        })
    }

    pub fn refetch_existing(mut self) -> Self {
        self.skip_existing = false;
        self
    }

    pub fn checkpoint(&self) -> &QueueCheckpoint {
        &self.checkpoint
    }
}

impl<S: ItemSource> Scraper for QueueScraper<S> {
    fn kind(&self) -> ScrapeKind {
        ScrapeKind::Queue
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn status(&self) -> ScrapeStatus {
        self.checkpoint.status()
    }

    fn stats(&self) -> &ScrapeStats {
        &self.stats
    }

    fn scrape(&mut self) -> Result<ScrapeOutcome> {
        info!(summary = %self.checkpoint.summary(), "Queue status");
        if !self.checkpoint.has_eligible() {
            info!("This scrape is complete. To re-do it, start a new one in a different namespace");
            return Ok(ScrapeOutcome::AlreadyFinished);
        }

        let store = self.namespace.store();
        let mut queue = RetryQueue::new(&store, &self.namespace.data_dir(), &self.pacing);
        if !self.skip_existing {
            queue = queue.refetch_existing();
        }
        let report = queue.run(&mut self.source, &mut self.checkpoint, &mut self.stats)?;
        info!(
            rounds = report.rounds,
            summary = %report.summary,
            data_dir = ?self.namespace.data_dir(),
            "Queue scrape complete"
        );
        Ok(ScrapeOutcome::Finished)
    }

    fn combine_results(&self, force: bool) -> Result<MergeOutcome> {
        write_manifest(&self.namespace, &self.checkpoint, force)
    }
}

pub const MANIFEST_COLUMNS: &[&str] = &["key", "label", "scraped", "attempts", "artifact"];

/// Writes one row per item with the artifact it produced (empty if none).
///
/// Artifacts are matched to items by their exact [`artifact_stem`], so the
/// manifest needs no source.
pub fn write_manifest(
    namespace: &Namespace,
    checkpoint: &QueueCheckpoint,
    force: bool,
) -> Result<MergeOutcome> {
    let path = namespace.result_path();
    if path.exists() && !force {
        info!(path = ?path, "Table already exists, skipping");
        return Ok(MergeOutcome::Skipped { path });
    }

    let data_dir = namespace.data_dir();
    let mut on_disk: FxHashMap<String, PathBuf> = FxHashMap::default();
    for entry in std::fs::read_dir(&data_dir)
        .with_context(|| format!("Failed to list artifacts in: {:?}", data_dir))?
    {
        let entry_path = entry?.path();
        if entry_path.extension().is_some_and(|ext| ext == "tmp") {
            continue;
        }
        let stem = entry_path.file_stem().and_then(|s| s.to_str()).map(str::to_string);
        if let Some(stem) = stem {
            on_disk.insert(stem, entry_path);
        }
    }

    let mut buf = Vec::new();
    {
        let mut writer = Writer::from_writer(BufWriter::with_capacity(TABLE_BUFFER_SIZE, &mut buf));
        writer.write_record(MANIFEST_COLUMNS)?;
        for item in &checkpoint.items {
            let artifact = on_disk
                .get(&artifact_stem(item))
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            writer.write_record([
                item.key.as_str(),
                item.label.as_str(),
                if item.scraped { "true" } else { "false" },
                item.attempts.to_string().as_str(),
                artifact.as_str(),
            ])?;
        }
        writer.flush()?;
    }
    write_atomic(&path, &buf)?;

    info!(path = ?path, rows = checkpoint.items.len(), "Manifest table written");
    Ok(MergeOutcome::Written {
        path,
        rows: checkpoint.items.len(),
        duplicates: 0,
    })
}

/// Reads `RetryItem` seeds from a table with `id`, `shortcode` and
/// `thumbnail_src` columns, honoring an optional boolean `scrape_image` filter.
pub fn items_from_table(path: &Path, max_attempts: u32) -> Result<Vec<RetryItem>> {
    let file = File::open(path).with_context(|| format!("Failed to open input table: {:?}", path))?;
    let mut reader = Reader::from_reader(file);
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h == name);

    let id = column("id").context("Input table has no 'id' column")?;
    let shortcode = column("shortcode").context("Input table has no 'shortcode' column")?;
    let url = column("thumbnail_src");
    let filter = column("scrape_image");

    let mut items = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(f) = filter {
            let wanted = record.get(f).unwrap_or("");
            if !matches!(wanted.trim(), "True" | "true" | "1") {
                continue;
            }
        }
        items.push(RetryItem::new(
            record.get(id).unwrap_or(""),
            record.get(shortcode).unwrap_or(""),
            url.and_then(|u| record.get(u)).unwrap_or(""),
            max_attempts,
        ));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Fails each key a scripted number of times (`u32::MAX` = always).
    struct Flaky {
        failures: FxHashMap<String, u32>,
        calls: Vec<String>,
    }

    impl Flaky {
        fn new(failures: &[(&str, u32)]) -> Self {
            Self {
                failures: failures.iter().map(|(k, n)| (k.to_string(), *n)).collect(),
                calls: Vec::new(),
            }
        }
    }

    impl ItemSource for Flaky {
        fn extension(&self) -> &str {
            "bin"
        }

        fn fetch(&mut self, item: &RetryItem) -> Result<Vec<u8>, FetchError> {
            self.calls.push(item.key.clone());
            match self.failures.get_mut(&item.key) {
                Some(n) if *n > 0 => {
                    *n = n.saturating_sub(1);
                    Err(FetchError::NotFound(item.key.clone()))
                }
                _ => Ok(item.key.as_bytes().to_vec()),
            }
        }
    }

    /// Records when each fetch happened; keys in `pending` fail once with the given error.
    struct Clocked {
        calls: Vec<(String, Instant)>,
        pending: FxHashMap<String, FetchError>,
    }

    impl Clocked {
        fn new(pending: &[(&str, FetchError)]) -> Self {
            Self {
                calls: Vec::new(),
                pending: pending.iter().map(|(k, e)| (k.to_string(), e.clone())).collect(),
            }
        }

        fn gap(&self, from: usize, to: usize) -> Duration {
            self.calls[to].1.duration_since(self.calls[from].1)
        }
    }

    impl ItemSource for Clocked {
        fn extension(&self) -> &str {
            "bin"
        }

        fn fetch(&mut self, item: &RetryItem) -> Result<Vec<u8>, FetchError> {
            self.calls.push((item.key.clone(), Instant::now()));
            match self.pending.remove(&item.key) {
                Some(e) => Err(e),
                None => Ok(vec![1]),
            }
        }
    }

    fn run_paced(pacing: Pacing, keys: &[&str], source: &mut Clocked) -> QueueReport {
        let dir = TempDir::new().unwrap();
        let ns = Namespace::open(dir.path()).unwrap();
        let store = ns.store();
        let mut cp = QueueCheckpoint::new(items(keys, 3)).unwrap();
        let mut stats = ScrapeStats::new();
        RetryQueue::new(&store, &ns.data_dir(), &pacing)
            .run(source, &mut cp, &mut stats)
            .unwrap()
    }

    fn items(keys: &[&str], ceiling: u32) -> Vec<RetryItem> {
        keys.iter()
            .map(|k| {
                let url = format!("https://example.test/{}", k);
                RetryItem::new(*k, k.to_lowercase(), url, ceiling)
            })
            .collect()
    }

    fn run_queue(dir: &TempDir, cp: &mut QueueCheckpoint, source: &mut Flaky) -> QueueReport {
        let ns = Namespace::open(dir.path()).unwrap();
        let store = ns.store();
        let pacing = Pacing::immediate();
        let mut stats = ScrapeStats::new();
        RetryQueue::new(&store, &ns.data_dir(), &pacing)
            .run(source, cp, &mut stats)
            .unwrap()
    }

    #[test]
    fn item_state_transitions() {
        let mut item = RetryItem::new("a", "a", "", 2);
        assert_eq!(item.state(), ItemState::Pending);
        item.attempts = 2;
        assert_eq!(item.state(), ItemState::Exhausted);
        item.scraped = true;
        assert_eq!(item.state(), ItemState::Done);
        assert_eq!(RetryItem::new("z", "z", "", 0).state(), ItemState::Exhausted);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        assert!(QueueCheckpoint::new(items(&["A", "B", "A"], 2)).is_err());
    }

    #[test]
    fn documented_example_abc() {
        let dir = TempDir::new().unwrap();
        let mut cp = QueueCheckpoint::new(items(&["A", "B", "C"], 2)).unwrap();
        let mut source = Flaky::new(&[("B", u32::MAX)]);

        let report = run_queue(&dir, &mut cp, &mut source);

        assert!(report.rounds <= 2);
        let by_key = |k: &str| cp.items.iter().find(|i| i.key == k).unwrap().clone();
        assert_eq!((by_key("A").state(), by_key("A").attempts), (ItemState::Done, 1));
        assert_eq!((by_key("B").state(), by_key("B").attempts), (ItemState::Exhausted, 2));
        assert_eq!((by_key("C").state(), by_key("C").attempts), (ItemState::Done, 1));
        assert_eq!(report.unscraped, vec!["b"]);
        assert_eq!(report.summary, QueueSummary { total: 3, done: 3, scraped: 2, failed: 1 });
    }

    #[test]
    fn terminates_for_all_failure_patterns() {
        for ceiling in 0..4u32 {
            for pattern in 0..16u32 {
                let dir = TempDir::new().unwrap();
                let keys = ["k0", "k1", "k2", "k3"];
                let mut cp = QueueCheckpoint::new(items(&keys, ceiling)).unwrap();
                let failures: Vec<(&str, u32)> = keys
                    .iter()
                    .enumerate()
                    .map(|(i, k)| (*k, if pattern & (1 << i) != 0 { u32::MAX } else { i as u32 }))
                    .collect();
                let mut source = Flaky::new(&failures);

                let report = run_queue(&dir, &mut cp, &mut source);

                assert!(!cp.has_eligible());
                assert!(source.calls.len() as u32 <= keys.len() as u32 * ceiling);
                assert!(report.rounds <= ceiling);
                for item in &cp.items {
                    assert!(item.attempts <= item.max_attempts);
                    assert_ne!(item.state(), ItemState::Pending);
                }
            }
        }
    }

    #[test]
    fn existing_artifact_skips_network_call() {
        let dir = TempDir::new().unwrap();
        let ns = Namespace::open(dir.path()).unwrap();
        fs::write(ns.data_dir().join("A_a.bin"), b"cached").unwrap();

        let mut cp = QueueCheckpoint::new(items(&["A", "B"], 3)).unwrap();
        let mut source = Flaky::new(&[]);
        run_queue(&dir, &mut cp, &mut source);

        assert_eq!(source.calls, vec!["B"]);
        assert_eq!(cp.items[0].attempts, 0);
        assert!(cp.items[0].scraped);
    }

    #[test]
    fn every_attempt_is_persisted() {
        let dir = TempDir::new().unwrap();
        let ns = Namespace::open(dir.path()).unwrap();
        let store = ns.store();
        let pacing = Pacing::immediate();
        let mut cp = QueueCheckpoint::new(items(&["A"], 3)).unwrap();
        let mut source = Flaky::new(&[("A", 1)]);
        let mut stats = ScrapeStats::new();

        let queue = RetryQueue::new(&store, &ns.data_dir(), &pacing);
        let outcome = queue.execute(&mut source, &mut cp, 0, &mut stats).unwrap();
        assert_eq!(outcome, ItemOutcome::Failed);
        let persisted: QueueCheckpoint = store.resume().unwrap().unwrap();
        assert_eq!(persisted.items[0].attempts, 1);
        assert!(!persisted.items[0].scraped);

        let outcome = queue.execute(&mut source, &mut cp, 0, &mut stats).unwrap();
        assert_eq!(outcome, ItemOutcome::Scraped);
        let persisted: QueueCheckpoint = store.resume().unwrap().unwrap();
        assert_eq!(persisted.items[0].attempts, 2);
        assert!(persisted.items[0].scraped);
        assert_eq!(fs::read(ns.data_dir().join("A_a.bin")).unwrap(), b"A");
    }

    #[test]
    fn queue_scraper_resumes_persisted_rows() {
        let dir = TempDir::new().unwrap();
        let ns = Namespace::open(dir.path()).unwrap();
        let source = Flaky::new(&[("B", u32::MAX)]);
        let seeds = items(&["A", "B"], 1);
        let mut first = QueueScraper::open(ns.clone(), source, seeds, Pacing::immediate()).unwrap();
        assert_eq!(first.scrape().unwrap(), ScrapeOutcome::Finished);
        assert_eq!(first.status(), ScrapeStatus::Finished);

        // new seeds are ignored once a queue exists
        let mut second =
            QueueScraper::open(ns.clone(), Flaky::new(&[]), items(&["X"], 1), Pacing::immediate())
                .unwrap();
        assert_eq!(second.checkpoint().items.len(), 2);
        assert_eq!(second.scrape().unwrap(), ScrapeOutcome::AlreadyFinished);

        let outcome = second.combine_results(false).unwrap();
        assert!(matches!(outcome, MergeOutcome::Written { rows: 2, .. }));
        let table = fs::read_to_string(ns.result_path()).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "key,label,scraped,attempts,artifact");
        assert!(lines[1].starts_with("A,a,true,1,"));
        assert!(lines[1].ends_with("A_a.bin"));
        assert_eq!(lines[2], "B,b,false,1,");
    }

    #[test]
    fn rate_limited_attempt_pauses_before_next_request() {
        let pacing = Pacing {
            rate_limit_delay: Duration::from_millis(40),
            ..Pacing::immediate()
        };
        let mut source = Clocked::new(&[("A", FetchError::RateLimited("429".into()))]);

        let report = run_paced(pacing, &["A", "B"], &mut source);

        let order: Vec<&str> = source.calls.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "A"]);
        assert!(source.gap(0, 1) >= Duration::from_millis(40));
        assert_eq!(report.summary.scraped, 2);
    }

    #[test]
    fn cooldown_separates_rounds() {
        let pacing = Pacing {
            round_cooldown: Duration::from_millis(40),
            ..Pacing::immediate()
        };
        let mut source = Clocked::new(&[("A", FetchError::NotFound("gone".into()))]);

        let report = run_paced(pacing, &["A", "B"], &mut source);

        assert_eq!(report.rounds, 2);
        assert_eq!(source.calls.len(), 3);
        assert!(source.gap(1, 2) >= Duration::from_millis(40));
    }

    #[test]
    fn item_delay_follows_every_attempt() {
        let pacing = Pacing {
            item_delay: Duration::from_millis(20),
            ..Pacing::immediate()
        };
        let mut source = Clocked::new(&[("B", FetchError::Transient("reset".into()))]);

        run_paced(pacing, &["A", "B", "C"], &mut source);

        assert_eq!(source.calls.len(), 4);
        for i in 1..source.calls.len() {
            assert!(source.gap(i - 1, i) >= Duration::from_millis(20));
        }
    }

    #[test]
    fn artifact_names_never_collide_on_underscores() {
        let a = RetryItem::new("1", "a_b", "", 1);
        let b = RetryItem::new("1_a", "b", "", 1);
        assert_ne!(artifact_stem(&a), artifact_stem(&b));
        assert_eq!(artifact_name(&b, "jpg"), "1%5Fa_b.jpg");
        assert_eq!(artifact_name(&RetryItem::new("x/y", "%", "", 1), "jpg"), "x%2Fy_%25.jpg");

        let dir = TempDir::new().unwrap();
        let ns = Namespace::open(dir.path()).unwrap();
        fs::write(ns.data_dir().join(artifact_name(&b, "bin")), b"x").unwrap();
        let cp = QueueCheckpoint::new(vec![a, b.clone()]).unwrap();

        write_manifest(&ns, &cp, false).unwrap();
        let table = fs::read_to_string(ns.result_path()).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[1], "1,a_b,false,0,");
        assert!(lines[2].starts_with("1_a,b,false,0,"));
        assert!(lines[2].ends_with("1%5Fa_b.bin"));
    }

    #[test]
    fn items_from_table_honors_filter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("posts.csv");
        fs::write(
            &path,
            "id,shortcode,thumbnail_src,scrape_image\n\
             1,aa,http://x/1,True\n\
             2,bb,http://x/2,False\n\
             3,cc,http://x/3,true\n",
        )
        .unwrap();
        let seeds = items_from_table(&path, 4).unwrap();
        let keys: Vec<&str> = seeds.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["1", "3"]);
        assert_eq!(seeds[1].url, "http://x/3");
        assert_eq!(seeds[1].max_attempts, 4);
    }
}
