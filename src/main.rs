use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use gleaner::checkpoint::Namespace;
use gleaner::chunk::RangeQuery;
use gleaner::config::{Credentials, Pacing, DEFAULT_MAX_ATTEMPTS};
use gleaner::merge::MergeOutcome;
use gleaner::models::ScrapeOutcome;
use gleaner::pager::FeedMode;
use gleaner::pipeline::{render_summary, PipelineConfig, PipelineRunner, StageResult};
use gleaner::scraper::{build_scraper, Persisted, ScraperSpec};
use gleaner::stages::default_registry;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "gleaner")]
#[command(about = "Resumable scraping of rate-limited APIs into consolidated tables")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline of scraping and processing stages from a JSON config
    Run(RunArgs),
    /// Date-chunked CrowdTangle post scrape
    Posts(PostsArgs),
    /// Cursor-paged Instagram feed scrape
    Feed(FeedArgs),
    /// Round-based image download queue over a posts table
    Images(ImagesArgs),
    /// Show the progress of one or more scrape namespaces
    Status(StatusArgs),
    /// (Re)build a namespace's result table from its artifacts
    Merge(MergeArgs),
}

#[derive(Args, Clone, Default)]
struct CredentialArgs {
    /// RapidAPI key for the Instagram feed endpoints
    #[arg(long)]
    rapidapi_key: Option<String>,

    /// CrowdTangle API token
    #[arg(long)]
    crowdtangle_token: Option<String>,
}

impl From<CredentialArgs> for Credentials {
    fn from(args: CredentialArgs) -> Self {
        Credentials {
            rapidapi_key: args.rapidapi_key,
            crowdtangle_token: args.crowdtangle_token,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Path to the pipeline config (.json)
    #[arg(short, long)]
    config: PathBuf,

    /// Directory the dataset directory is created in
    #[arg(short, long, default_value = "data")]
    root: PathBuf,

    #[command(flatten)]
    credentials: CredentialArgs,
}

#[derive(Args)]
struct PostsArgs {
    /// Namespace directory for checkpoint, artifacts and result table
    #[arg(short, long)]
    namespace: PathBuf,

    /// Endpoint, e.g. /posts/search
    #[arg(long, default_value = "/posts/search")]
    query_type: String,

    /// First day (inclusive), YYYY-MM-DD
    #[arg(long)]
    start: NaiveDate,

    /// Last day (exclusive), YYYY-MM-DD
    #[arg(long)]
    end: NaiveDate,

    /// Days per chunk; keep each chunk under the source's result cap
    #[arg(long, default_value_t = 7)]
    chunk_days: u32,

    /// Extra search parameter as key=value (repeatable)
    #[arg(short, long = "param")]
    params: Vec<String>,

    /// Rebuild the result table even if it exists
    #[arg(long)]
    force_merge: bool,

    #[command(flatten)]
    credentials: CredentialArgs,
}

#[derive(Args)]
struct FeedArgs {
    #[arg(short, long)]
    namespace: PathBuf,

    /// location, hashtag or user
    #[arg(long)]
    mode: FeedMode,

    /// Location id, hashtag or username
    #[arg(long)]
    term: String,

    #[arg(long)]
    force_merge: bool,

    #[command(flatten)]
    credentials: CredentialArgs,
}

#[derive(Args)]
struct ImagesArgs {
    #[arg(short, long)]
    namespace: PathBuf,

    /// Table with id, shortcode and thumbnail_src columns
    #[arg(short, long)]
    input: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Download from the recorded thumbnail URL instead of the media endpoint
    #[arg(long)]
    direct_urls: bool,

    /// Download items again even if their image is already on disk
    #[arg(long)]
    refetch: bool,

    /// Seconds to wait after every item
    #[arg(long, default_value_t = 0)]
    item_delay: u64,

    /// Seconds to wait between rounds
    #[arg(long, default_value_t = 0)]
    round_cooldown: u64,

    #[arg(long)]
    force_merge: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Namespace directories to inspect
    #[arg(required = true)]
    namespaces: Vec<PathBuf>,
}

#[derive(Args)]
struct MergeArgs {
    #[arg(short, long)]
    namespace: PathBuf,

    /// Overwrite an existing result table
    #[arg(long)]
    force: bool,
}

/// `key=value`, with the value read as JSON when it parses and as a string otherwise.
fn parse_params(raw: &[String]) -> Result<BTreeMap<String, Value>> {
    raw.iter()
        .map(|p| {
            let (key, value) = p
                .split_once('=')
                .with_context(|| format!("parameter '{}' is not key=value", p))?;
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| Value::String(value.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

fn run_scrape(
    spec: ScraperSpec,
    namespace: PathBuf,
    credentials: Credentials,
    pacing: Pacing,
    force_merge: bool,
) -> Result<()> {
    let namespace = Namespace::open(&namespace)?;
    let mut scraper = build_scraper(&spec, namespace, &credentials, pacing)?;

    let start = Instant::now();
    let outcome = scraper.scrape()?;
    let scrape_duration = start.elapsed();

    let merged = if outcome.is_complete() {
        Some(scraper.refresh_results(force_merge)?)
    } else {
        None
    };

    println!();
    println!("=== Summary ===");
    println!("Kind:               {}", scraper.kind());
    println!("Status:             {}", scraper.status());
    println!("Scrape time:        {:.2}s", scrape_duration.as_secs_f64());
    println!("{}", scraper.stats());
    match &merged {
        Some(MergeOutcome::Written { path, rows, duplicates }) => {
            println!(
                "Result table:       {} ({} rows, {} duplicates dropped)",
                path.display(),
                rows,
                duplicates
            );
        }
        Some(MergeOutcome::Skipped { path }) => {
            println!("Result table:       {} (kept existing)", path.display());
        }
        None => {}
    }

    if let ScrapeOutcome::Incomplete { reason } = outcome {
        bail!("scrape stopped before finishing ({}); re-run the same command to resume", reason);
    }
    Ok(())
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let config = PipelineConfig::from_path(&args.config)?;
    let registry = default_registry();
    let runner =
        PipelineRunner::new(&registry, &args.root).with_credentials(args.credentials.into());

    let reports = runner.run(&config)?;

    println!();
    println!("=== Pipeline Summary ===");
    print!("{}", render_summary(&reports));

    let failed = reports
        .iter()
        .filter(|r| matches!(r.result, StageResult::Failed(_)))
        .count();
    if failed > 0 {
        info!(failed, "Some stages could not run");
    }
    Ok(())
}

fn run_status(args: StatusArgs) -> Result<()> {
    for path in &args.namespaces {
        if !path.is_dir() {
            println!("{}: no such directory", path.display());
            continue;
        }
        let namespace = Namespace::open(path)?;
        match Persisted::load(&namespace)? {
            Some(persisted) => println!(
                "{}: {} {} -- {}",
                path.display(),
                persisted.kind(),
                persisted.status(),
                persisted.progress()
            ),
            None => println!("{}: no scrape", path.display()),
        }
    }
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let namespace = Namespace::open(&args.namespace)?;
    let persisted = Persisted::load(&namespace)?
        .with_context(|| format!("no scrape checkpoint in {:?}", args.namespace))?;
    match persisted.combine(&namespace, args.force)? {
        MergeOutcome::Written { path, rows, .. } => {
            println!("Wrote {} rows to {}", rows, path.display())
        }
        MergeOutcome::Skipped { path } => {
            println!("{} exists; pass --force to rebuild", path.display())
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Posts(args) => parse_params(&args.params).and_then(|params| {
            let spec = ScraperSpec::Chunked {
                query: RangeQuery {
                    query_type: args.query_type,
                    start: args.start,
                    end: args.end,
                    chunk_days: args.chunk_days,
                    params,
                },
            };
            run_scrape(
                spec,
                args.namespace,
                args.credentials.into(),
                Pacing::default(),
                args.force_merge,
            )
        }),
        Commands::Feed(args) => run_scrape(
            ScraperSpec::Cursor {
                mode: args.mode,
                term: args.term,
            },
            args.namespace,
            args.credentials.into(),
            Pacing::default(),
            args.force_merge,
        ),
        Commands::Images(args) => {
            let pacing = Pacing {
                item_delay: Duration::from_secs(args.item_delay),
                round_cooldown: Duration::from_secs(args.round_cooldown),
                ..Pacing::default()
            };
            run_scrape(
                ScraperSpec::Queue {
                    input: args.input,
                    max_attempts: args.max_attempts,
                    media_endpoint: !args.direct_urls,
                    refetch_existing: args.refetch,
                },
                args.namespace,
                Credentials::default(),
                pacing,
                args.force_merge,
            )
        }
        Commands::Status(args) => run_status(args),
        Commands::Merge(args) => run_merge(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
