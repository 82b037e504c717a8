use std::time::Duration;

/// Bumped whenever the JSON checkpoint layout changes
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint file for chunk- and cursor-based scrapes
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Checkpoint file for queue-based scrapes (one CSV row per item)
pub const QUEUE_CHECKPOINT_FILE: &str = "queue.csv";

/// Sub-directory of a namespace holding raw artifacts
pub const DATA_DIR: &str = "data";

/// Consolidated table written by combine-results
pub const RESULT_FILE: &str = "result.csv";

/// Immediate retries for one page or chunk request before the unit fails
pub const DEFAULT_MAX_TRIES: u32 = 10;

/// Attempt ceiling per queue item
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How often an empty final page is re-requested before it is believed
pub const ANOMALY_RETRIES: u32 = 3;

/// Delay after every page / chunk request
pub const REQUEST_DELAY: Duration = Duration::from_secs(1);

/// Delay before re-requesting an empty final page
pub const ANOMALY_DELAY: Duration = Duration::from_secs(10);

/// Delay before retrying a rate-limited request
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// Advisory latency per request, used only for time estimates
pub const ESTIMATE_REQUEST_LATENCY: Duration = Duration::from_secs(10);

/// Results per CrowdTangle request
pub const CROWDTANGLE_PAGE_SIZE: u32 = 100;

/// CrowdTangle stops returning correct results past this many per query
pub const CROWDTANGLE_RESULT_CAP: usize = 10_000;

/// Cursors are truncated to this many characters in artifact names
pub const CURSOR_NAME_MAX: usize = 64;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub const USER_AGENT: &str = concat!("gleaner/", env!("CARGO_PKG_VERSION"));

/// Buffer size for table writers
pub const TABLE_BUFFER_SIZE: usize = 256 * 1024;

/// Fixed delays applied between units of work.
///
/// Delays are static: the only exception to "one fixed delay per request" is
/// the empty-final-page retry in the cursor pager.
#[derive(Debug, Clone)]
pub struct Pacing {
    pub request_delay: Duration,
    pub anomaly_delay: Duration,
    pub rate_limit_delay: Duration,
    pub item_delay: Duration,
    pub round_cooldown: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            request_delay: REQUEST_DELAY,
            anomaly_delay: ANOMALY_DELAY,
            rate_limit_delay: RATE_LIMIT_DELAY,
            item_delay: Duration::ZERO,
            round_cooldown: Duration::ZERO,
        }
    }
}

impl Pacing {
    /// No waiting at all; for tests and replays from disk.
    pub fn immediate() -> Self {
        Self {
            request_delay: Duration::ZERO,
            anomaly_delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
            item_delay: Duration::ZERO,
            round_cooldown: Duration::ZERO,
        }
    }
}

pub(crate) fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

/// API credentials, supplied explicitly (CLI flags or pipeline config).
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub rapidapi_key: Option<String>,
    pub crowdtangle_token: Option<String>,
}

impl Credentials {
    pub fn rapidapi_key(&self) -> anyhow::Result<&str> {
        self.rapidapi_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("a RapidAPI key is required (--rapidapi-key)"))
    }

    pub fn crowdtangle_token(&self) -> anyhow::Result<&str> {
        self.crowdtangle_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("a CrowdTangle token is required (--crowdtangle-token)"))
    }
}
