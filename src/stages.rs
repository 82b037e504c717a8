//! The stage implementations a pipeline config can name.

use crate::checkpoint::Namespace;
use crate::chunk::RangeQuery;
use crate::config::DEFAULT_MAX_ATTEMPTS;
use crate::merge::{concat_tables, MergeOutcome};
use crate::models::ScrapeOutcome;
use crate::pager::{FeedMode, FeedQuery};
use crate::pipeline::{Stage, StageContext, StageRegistry, StageStatus};
use crate::scraper::{build_scraper, Scraper, ScraperSpec};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use tracing::{info, warn};

/// Opens (or resumes) the scraper for a spec in a namespace.
pub type ScraperFactory = Rc<dyn Fn(&ScraperSpec, Namespace) -> Result<Box<dyn Scraper>>>;

/// Factory backed by the real HTTP sources and the context's credentials.
pub fn http_factory(ctx: &StageContext) -> ScraperFactory {
    let credentials = ctx.credentials.clone();
    let pacing = ctx.pacing.clone();
    Rc::new(move |spec: &ScraperSpec, namespace: Namespace| {
        build_scraper(spec, namespace, &credentials, pacing.clone())
    })
}

/// Registry of every built-in stage, wired to live sources.
pub fn default_registry() -> StageRegistry {
    registry_with(http_factory)
}

/// Registry whose scraping stages get their scrapers from `factory`.
pub fn registry_with<F>(factory: F) -> StageRegistry
where
    F: Fn(&StageContext) -> ScraperFactory + Clone + 'static,
{
    let mut registry = StageRegistry::new();

    let f = factory.clone();
    registry.register("feed_scraper", move |ctx| {
        Ok(Box::new(FeedScrapeStage::new(ctx, f(ctx))?))
    });
    let f = factory.clone();
    registry.register("post_search_scraper", move |ctx| {
        Ok(Box::new(PostSearchScrapeStage::new(ctx, f(ctx))?))
    });
    let f = factory;
    registry.register("image_scraper", move |ctx| {
        Ok(Box::new(ImageScrapeStage::new(ctx, f(ctx))?))
    });
    registry.register("command", |ctx| Ok(Box::new(CommandStage::new(ctx)?)));

    registry
}

/// Runs a scraper unless its checkpoint is already finished.
fn scrape_to_end(scraper: &mut dyn Scraper) -> Result<ScrapeOutcome> {
    if scraper.is_finished() {
        info!(namespace = ?scraper.namespace().root(), "Scrape already finished");
        return Ok(ScrapeOutcome::AlreadyFinished);
    }
    let outcome = scraper.scrape()?;
    let stats = scraper.stats();
    info!(
        namespace = ?scraper.namespace().root(),
        units = stats.units(),
        failed = stats.units_failed,
        records = stats.records,
        "Scrape pass done"
    );
    Ok(outcome)
}

/// One cursor scrape per search term; per-term tables are concatenated.
pub struct FeedScrapeStage {
    scrape_dir: PathBuf,
    mode: FeedMode,
    terms: Vec<String>,
    factory: ScraperFactory,
}

impl FeedScrapeStage {
    pub fn new(ctx: &StageContext, factory: ScraperFactory) -> Result<Self> {
        Ok(Self {
            scrape_dir: ctx.scrape_dir(),
            mode: ctx.param("mode")?,
            terms: ctx.param("terms")?,
            factory,
        })
    }
}

impl Stage for FeedScrapeStage {
    /// The output is only written once every term's feed is exhausted.
    fn run(
        &mut self,
        _input: Option<&Path>,
        output: &Path,
        skip_if_exists: bool,
    ) -> Result<StageStatus> {
        let mut tables = Vec::new();
        let mut incomplete = Vec::new();

        for term in &self.terms {
            let query = FeedQuery::new(self.mode, term);
            let namespace = Namespace::open(self.scrape_dir.join(query.slug()))?;
            let spec = ScraperSpec::Cursor {
                mode: query.mode,
                term: query.term.clone(),
            };
            let mut scraper = (self.factory)(&spec, namespace)?;

            if let ScrapeOutcome::Incomplete { reason } = scrape_to_end(scraper.as_mut())? {
                warn!(term = %query.slug(), reason = %reason, "Feed scrape incomplete");
                incomplete.push(query.slug());
                continue;
            }
            let merged = scraper.refresh_results(!skip_if_exists)?;
            tables.push(merged.path().to_path_buf());
        }

        if !incomplete.is_empty() {
            return Ok(StageStatus::NotRun(format!("incomplete feeds: {}", incomplete.join(", "))));
        }
        concat_tables(&tables, output)?;
        Ok(StageStatus::Completed)
    }
}

/// Date-chunked post search in its own namespace; the result table is
/// copied to the stage output.
pub struct PostSearchScrapeStage {
    namespace_dir: PathBuf,
    query: RangeQuery,
    factory: ScraperFactory,
}

impl PostSearchScrapeStage {
    pub fn new(ctx: &StageContext, factory: ScraperFactory) -> Result<Self> {
        let query: RangeQuery = serde_json::from_value(ctx.params.clone())
            .with_context(|| {
                format!("stage '{}' params do not describe a range query", ctx.stage_name)
            })?;
        Ok(Self {
            namespace_dir: ctx.scrape_dir().join(&ctx.stage_name),
            query,
            factory,
        })
    }
}

impl Stage for PostSearchScrapeStage {
    fn run(
        &mut self,
        _input: Option<&Path>,
        output: &Path,
        skip_if_exists: bool,
    ) -> Result<StageStatus> {
        let namespace = Namespace::open(&self.namespace_dir)?;
        let spec = ScraperSpec::Chunked {
            query: self.query.clone(),
        };
        let mut scraper = (self.factory)(&spec, namespace)?;

        if let ScrapeOutcome::Incomplete { reason } = scrape_to_end(scraper.as_mut())? {
            return Ok(StageStatus::NotRun(reason));
        }

        let merged = scraper.refresh_results(!skip_if_exists)?;
        let refreshed = matches!(merged, MergeOutcome::Written { .. });
        if output.exists() && skip_if_exists && !refreshed {
            info!(path = ?output, "Output already exists, skipping copy");
        } else {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(merged.path(), output)
                .with_context(|| format!("Failed to copy {:?} to {:?}", merged.path(), output))?;
        }
        Ok(StageStatus::Completed)
    }
}

/// Image download queue over a posts table; the stage output is the queue's
/// namespace directory.
pub struct ImageScrapeStage {
    max_attempts: u32,
    media_endpoint: bool,
    refetch_existing: bool,
    factory: ScraperFactory,
}

impl ImageScrapeStage {
    pub fn new(ctx: &StageContext, factory: ScraperFactory) -> Result<Self> {
        Ok(Self {
            max_attempts: ctx.param_or("max_attempts", DEFAULT_MAX_ATTEMPTS)?,
            media_endpoint: ctx.param_or("media_endpoint", true)?,
            refetch_existing: ctx.param_or("refetch_existing", false)?,
            factory,
        })
    }
}

impl Stage for ImageScrapeStage {
    fn run(
        &mut self,
        input: Option<&Path>,
        output: &Path,
        skip_if_exists: bool,
    ) -> Result<StageStatus> {
        let Some(input) = input else {
            return Ok(StageStatus::NotRun("image scraping needs an input posts table".to_string()));
        };
        let namespace = Namespace::open(output)?;
        let spec = ScraperSpec::Queue {
            input: input.to_path_buf(),
            max_attempts: self.max_attempts,
            media_endpoint: self.media_endpoint,
            refetch_existing: self.refetch_existing,
        };
        let mut scraper = (self.factory)(&spec, namespace)?;
        scrape_to_end(scraper.as_mut())?;
        let manifest = scraper.refresh_results(!skip_if_exists)?;
        info!(manifest = ?manifest.path(), "Image manifest ready");
        Ok(StageStatus::Completed)
    }
}

/// An external program, e.g. a preprocessing or labelling script.
///
/// `{input}` and `{output}` in the arguments are replaced with the stage paths.
pub struct CommandStage {
    program: String,
    args: Vec<String>,
}

impl CommandStage {
    pub fn new(ctx: &StageContext) -> Result<Self> {
        Ok(Self {
            program: ctx.param("program")?,
            args: ctx.param_or("args", Vec::new())?,
        })
    }

    pub fn resolved_args(&self, input: Option<&Path>, output: &Path) -> Vec<String> {
        let input = input.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

impl Stage for CommandStage {
    fn run(
        &mut self,
        input: Option<&Path>,
        output: &Path,
        skip_if_exists: bool,
    ) -> Result<StageStatus> {
        if skip_if_exists && output.exists() {
            info!(path = ?output, "Output already exists, skipping command");
            return Ok(StageStatus::Completed);
        }

        let args = self.resolved_args(input, output);
        info!(program = %self.program, args = ?args, "Running command");
        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .with_context(|| format!("Failed to start '{}'", self.program))?;

        if status.success() {
            Ok(StageStatus::Completed)
        } else {
            Ok(StageStatus::NotRun(format!("'{}' exited with {}", self.program, status)))
        }
    }
}
