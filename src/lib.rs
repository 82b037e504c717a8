//! Gleaner: resumable collection of rate-limited API sources into tables
//!
//! Every scrape lives in a namespace directory holding a checkpoint, the raw
//! per-unit response artifacts, and the consolidated result table. The
//! checkpoint is saved atomically after every unit of work, so a crash or an
//! exhausted quota costs at most one repeated request.
//!
//! Three scrape kinds share that protocol:
//!
//! 1. **Chunked** -- a date range split into fixed-size chunks, one query per
//!    chunk, for sources that cap results per query
//! 2. **Cursor** -- a feed followed page by page through opaque continuation
//!    tokens until the source reports no more pages
//! 3. **Queue** -- a fixed item set fetched in rounds, each item retried until
//!    it succeeds or hits its attempt ceiling
//!
//! A pipeline chains scrapes with external processing commands, gating each
//! stage on the existence of its input.
//!
//! # Key Modules
//!
//! - [`checkpoint`] -- Namespaces, the `Checkpoint` trait and atomic saves
//! - [`chunk`] -- Chunk planning and the chunked scraper
//! - [`pager`] -- The cursor pager and feed scraper
//! - [`queue`] -- Round-based retry queue and image manifest
//! - [`merge`] / [`extract`] -- Artifacts to deduplicated tables
//! - [`scraper`] -- The `Scraper` capability and config-driven construction
//! - [`source`] -- CrowdTangle, RapidAPI and image HTTP sources
//! - [`pipeline`] / [`stages`] -- Stage sequencing and built-in stages
//! - [`retry`] / [`error`] -- Failure kinds and bounded immediate retries
//! - [`config`] -- Constants, pacing and credentials
//!
//! # Example Usage
//!
//! ```bash
//! # Feed scrape for one hashtag, resumable
//! gleaner feed -n scrapes/glasgow --mode hashtag --term glasgow --rapidapi-key $KEY
//!
//! # How far did it get?
//! gleaner status scrapes/glasgow
//!
//! # Full pipeline from a config
//! gleaner run --config pipeline.json --root data/ --rapidapi-key $KEY
//! ```

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod error;
pub mod extract;
pub mod merge;
pub mod models;
pub mod pager;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod scraper;
pub mod source;
pub mod stages;
pub mod stats;
