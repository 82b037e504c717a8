//! Range-bounded scrapes: the requested range is planned once into fixed-size
//! chunks, and each chunk is fetched as one unit of work.

use crate::checkpoint::{decode_json, encode_json, write_json_artifact, Checkpoint, Namespace};
use crate::config::{
    pause, Pacing, CHECKPOINT_FILE, CHECKPOINT_VERSION, DEFAULT_MAX_TRIES, ESTIMATE_REQUEST_LATENCY,
};
use crate::error::FetchError;
use crate::extract::PostSearchExtractor;
use crate::merge::{merge_artifacts, MergeOutcome};
use crate::models::{Chunk, ScrapeKind, ScrapeOutcome, ScrapeStatus};
use crate::retry::with_retries;
use crate::scraper::Scraper;
use crate::stats::ScrapeStats;
use anyhow::{bail, Result};
use chrono::{Days, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{error, info, warn};

/// A range endpoint that can be stepped forward.
pub trait Boundary: Copy + Ord {
    type Step: Copy;

    /// `None` on overflow, which `plan` treats as "past the end".
    fn offset(self, step: Self::Step) -> Option<Self>;
}

impl Boundary for NaiveDate {
    type Step = Days;

    fn offset(self, step: Days) -> Option<Self> {
        self.checked_add_days(step)
    }
}

impl Boundary for i64 {
    type Step = i64;

    fn offset(self, step: i64) -> Option<Self> {
        self.checked_add(step)
    }
}

/// Splits `[start, end)` into contiguous chunks of `size`, the last one clipped to `end`.
pub fn plan<B: Boundary>(start: B, end: B, size: B::Step) -> Result<Vec<Chunk<B>>> {
    if end < start {
        bail!("range end lies before its start");
    }

    let mut chunks = Vec::new();
    let mut current = start;
    while current < end {
        let next = match current.offset(size) {
            Some(next) if next <= current => bail!("chunk size must be positive"),
            Some(next) => next.min(end),
            None => end,
        };
        chunks.push(Chunk {
            start: current,
            end: next,
        });
        current = next;
    }
    Ok(chunks)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeQuery {
    /// Source-specific endpoint selector, e.g. `/posts/search`
    pub query_type: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub chunk_days: u32,
    /// Extra search parameters passed through to the source untouched
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub version: u32,
    pub kind: ScrapeKind,
    pub status: ScrapeStatus,
    pub query: RangeQuery,
    pub chunks: Vec<Chunk<NaiveDate>>,
    pub current_chunk: usize,
}

impl ChunkCheckpoint {
    pub fn new(query: RangeQuery) -> Result<Self> {
        let chunks = plan(query.start, query.end, Days::new(u64::from(query.chunk_days)))?;
        let status = if chunks.is_empty() {
            ScrapeStatus::Finished
        } else {
            ScrapeStatus::Unfinished
        };
        Ok(Self {
            version: CHECKPOINT_VERSION,
            kind: ScrapeKind::Chunked,
            status,
            query,
            chunks,
            current_chunk: 0,
        })
    }

    pub fn current(&self) -> Option<Chunk<NaiveDate>> {
        if self.status == ScrapeStatus::Finished {
            return None;
        }
        self.chunks.get(self.current_chunk).copied()
    }

    pub fn remaining(&self) -> &[Chunk<NaiveDate>] {
        &self.chunks[self.current_chunk.min(self.chunks.len())..]
    }
}

impl Checkpoint for ChunkCheckpoint {
    const FILE_NAME: &'static str = CHECKPOINT_FILE;

    fn status(&self) -> ScrapeStatus {
        self.status
    }

    fn encode<W: Write>(&self, writer: W) -> Result<()> {
        encode_json(self, writer)
    }

    fn decode<R: Read>(reader: R) -> Result<Self> {
        let checkpoint: ChunkCheckpoint = decode_json(reader, |c: &ChunkCheckpoint| c.version)?;
        if checkpoint.kind != ScrapeKind::Chunked {
            bail!("checkpoint belongs to a {} scrape", checkpoint.kind);
        }
        Ok(checkpoint)
    }
}

/// Marks the current chunk done; the last one finishes the checkpoint.
pub fn advance(checkpoint: &mut ChunkCheckpoint) {
    if checkpoint.status == ScrapeStatus::Finished {
        return;
    }
    checkpoint.current_chunk += 1;
    if checkpoint.current_chunk >= checkpoint.chunks.len() {
        checkpoint.current_chunk = checkpoint.chunks.len();
        checkpoint.status = ScrapeStatus::Finished;
    }
}

const CHUNK_BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}";

pub fn chunk_artifact_name(chunk: &Chunk<NaiveDate>) -> String {
    format!("{}.json", chunk)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeEstimate {
    pub total: Duration,
    pub per_chunk: Duration,
}

/// Advisory time left: one request per `page_size` hits over the whole
/// query at a fixed latency, scaled by the share of chunks still to fetch.
pub fn estimate(
    hits: u64,
    page_size: u32,
    chunks_left: usize,
    chunks_total: usize,
    latency: Duration,
) -> ScrapeEstimate {
    let page_size = u64::from(page_size.max(1));
    let requests = hits.div_ceil(page_size);
    let full = latency.saturating_mul(u32::try_from(requests).unwrap_or(u32::MAX));
    let chunks_total = chunks_total.max(1);
    let chunks_left = chunks_left.min(chunks_total);
    let total = full.mul_f64(chunks_left as f64 / chunks_total as f64);
    let per_chunk = total / u32::try_from(chunks_left.max(1)).unwrap_or(u32::MAX);
    ScrapeEstimate { total, per_chunk }
}

fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// A source queried per date chunk, with a cap on results per query.
pub trait RangeSource {
    /// All records for one chunk, as the source returned them.
    fn fetch_chunk(
        &mut self,
        query: &RangeQuery,
        chunk: &Chunk<NaiveDate>,
    ) -> Result<Value, FetchError>;

    /// Total hits for `[from, query.end)`, for the pre-flight estimate.
    fn hit_count(&mut self, _query: &RangeQuery, _from: NaiveDate) -> Result<u64, FetchError> {
        Err(FetchError::schema("hit count not supported by this source"))
    }

    fn page_size(&self) -> u32 {
        100
    }

    /// Results beyond this many per query may be silently dropped by the source.
    fn result_cap(&self) -> Option<usize> {
        None
    }
}

pub struct ChunkScraper<S> {
    namespace: Namespace,
    checkpoint: ChunkCheckpoint,
    source: S,
    pacing: Pacing,
    max_tries: u32,
    estimate: bool,
    stats: ScrapeStats,
}

impl<S: RangeSource> ChunkScraper<S> {
    /// Resumes the namespace's checkpoint, or plans a new one from `query`.
    pub fn open(
        namespace: Namespace,
        source: S,
        query: RangeQuery,
        pacing: Pacing,
    ) -> Result<Self> {
        let store = namespace.store();
        let checkpoint = match store.resume::<ChunkCheckpoint>()? {
            Some(existing) => {
                if existing.query != query {
                    warn!(
                        namespace = ?namespace.root(),
                        "Requested query differs from the checkpoint; continuing with its query"
                    );
                }
                existing
            }
            None => {
                info!(namespace = ?namespace.root(), "Initializing new chunked scrape");
                let fresh = ChunkCheckpoint::new(query)?;
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
            estimate: true,
            stats: ScrapeStats::new(),
        })
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn without_estimate(mut self) -> Self {
        self.estimate = false;
        self
    }

    pub fn checkpoint(&self) -> &ChunkCheckpoint {
        &self.checkpoint
    }

    /// Failure here only costs the estimate.
    fn log_estimate(&mut self) {
        let chunks_left = self.checkpoint.remaining().len();
        if chunks_left == 0 {
            return;
        }
        let query = &self.checkpoint.query;
        match self.source.hit_count(query, query.start) {
            Ok(hits) => {
                let chunks_total = self.checkpoint.chunks.len();
                let est = estimate(
                    hits,
                    self.source.page_size(),
                    chunks_left,
                    chunks_total,
                    ESTIMATE_REQUEST_LATENCY,
                );
                info!(
                    hits,
                    chunks_done = self.checkpoint.current_chunk,
                    chunks_total,
                    total = %format_hms(est.total),
                    per_chunk = %format_hms(est.per_chunk),
                    "Estimated remaining scrape time"
                );
            }
            Err(e) => warn!(error = %e, "Could not estimate scrape time"),
        }
    }
}

impl<S: RangeSource> Scraper for ChunkScraper<S> {
    fn kind(&self) -> ScrapeKind {
        ScrapeKind::Chunked
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

        if self.estimate {
            self.log_estimate();
        }

        let store = self.namespace.store();
        let data_dir = self.namespace.data_dir();
        let pacing = self.pacing.clone();
        let total = self.checkpoint.chunks.len();

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(CHUNK_BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_position(self.checkpoint.current_chunk as u64);

        while let Some(chunk) = self.checkpoint.current() {
            let path = data_dir.join(chunk_artifact_name(&chunk));
            pb.set_message(chunk.to_string());

            if path.exists() {
                info!(chunk = %chunk, "Artifact already on disk, skipping request");
                self.stats.record_replay();
            } else {
                let query = self.checkpoint.query.clone();
                let unit = chunk.to_string();
                let source = &mut self.source;
                let fetched = with_retries(self.max_tries, &pacing, &unit, || {
                    source.fetch_chunk(&query, &chunk)
                });

                match fetched {
                    Ok(records) => {
                        let count = records.as_array().map_or(0, Vec::len);
                        if let Some(cap) = self.source.result_cap() {
                            if count >= cap {
                                warn!(
                                    chunk = %chunk,
                                    count,
                                    cap,
                                    "Result cap reached, chunk may be truncated; use smaller chunks"
                                );
                            }
                        }
                        write_json_artifact(&path, &records)?;
                        self.stats.record_fetch(count);
                        info!(chunk = %chunk, records = count, "Chunk fetched");
                    }
                    Err(e) => {
                        self.stats.record_failure();
                        pb.abandon();
                        error!(
                            chunk = %chunk,
                            error = %e,
                            "Chunk failed; re-run to resume from this chunk"
                        );
                        let left: Vec<String> = self
                            .checkpoint
                            .remaining()
                            .iter()
                            .map(|c| c.to_string())
                            .collect();
                        info!(chunks = ?left, "Chunks not yet completed");
                        return Ok(ScrapeOutcome::Incomplete {
                            reason: format!("chunk {} failed: {}", chunk, e),
                        });
                    }
                }
                pause(pacing.request_delay);
            }

            advance(&mut self.checkpoint);
            store.save(&self.checkpoint)?;
            pb.inc(1);
            info!(
                done = self.checkpoint.current_chunk,
                total,
                "Chunk progress"
            );
        }

        pb.finish_and_clear();
        info!(namespace = ?self.namespace.root(), "Chunked scrape complete");
        Ok(ScrapeOutcome::Finished)
    }

    fn combine_results(&self, force: bool) -> Result<MergeOutcome> {
        combine(&self.namespace, force)
    }
}

pub fn combine(namespace: &Namespace, force: bool) -> Result<MergeOutcome> {
    merge_artifacts(
        &namespace.data_dir(),
        &PostSearchExtractor,
        &namespace.result_path(),
        force,
    )
}
