use crate::config::{pause, Pacing};
use crate::error::FetchError;
use tracing::warn;

/// Runs `op` up to `max_tries` times, retrying only transient failures.
///
/// Transient errors are retried immediately; rate-limit errors wait
/// `pacing.rate_limit_delay` first. Permanent and schema errors are returned
/// on first sight.
pub fn with_retries<T, F>(
    max_tries: u32,
    pacing: &Pacing,
    unit: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Result<T, FetchError>,
{
    let max_tries = max_tries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_tries => {
                warn!(unit, attempt, max_tries, error = %e, "Request failed, retrying");
                if let FetchError::RateLimited(_) = e {
                    pause(pacing.rate_limit_delay);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
