//! Bounded re-invocation of retryable operations

use std::thread;
use std::time::Duration;

use crate::error::{ErrorKind, HelperError, HelperResult};

/// Default number of additional attempts.
pub const DEFAULT_RETRY: u32 = 2;

/// Default pause between attempts.
pub const DEFAULT_RETRY_TIME: Duration = Duration::from_secs(1);

/// Additional attempts allowed once the server reports service unavailable.
pub const SERVICE_UNAVAILABLE_RETRY: u32 = 5;

/// Retry policy: `retry` additional attempts, `retry_time` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::Args)]
pub struct RetryHelper {
    /// How many times to retry upload
    #[arg(long, default_value_t = DEFAULT_RETRY)]
    pub retry: u32,

    /// How long to wait between retries
    #[arg(long = "retry-time", default_value = "1s", value_parser = parse_duration)]
    pub retry_time: Duration,
}

/// Parse `500ms`, `1s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    let seconds = match unit {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(format!("invalid duration unit {unit:?} in {value:?}")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {value:?}: {e}"))
}

impl Default for RetryHelper {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            retry_time: DEFAULT_RETRY_TIME,
        }
    }
}

impl RetryHelper {
    pub fn new(retry: u32, retry_time: Duration) -> Self {
        Self { retry, retry_time }
    }

    /// Run `handler` until it succeeds, fails with a non-retryable error, or
    /// has been called `retry + 1` times. The handler gets the zero-based
    /// attempt number.
    pub fn do_retry<T, F>(&self, handler: F) -> HelperResult<T>
    where
        F: FnMut(u32) -> HelperResult<T>,
    {
        self.do_retry_with(handler, |_| self.retry)
    }

    /// Like [`do_retry`](Self::do_retry) with the artifact upload cap: the
    /// limit rises to [`SERVICE_UNAVAILABLE_RETRY`] additional attempts while
    /// the server answers service unavailable.
    pub fn do_upload_retry<T, F>(&self, handler: F) -> HelperResult<T>
    where
        F: FnMut(u32) -> HelperResult<T>,
    {
        self.do_retry_with(handler, |inner| {
            if inner.kind() == ErrorKind::ServiceUnavailable {
                self.retry.max(SERVICE_UNAVAILABLE_RETRY)
            } else {
                self.retry
            }
        })
    }

    /// Retry with a limit chosen from the inner error of each failure.
    pub fn do_retry_with<T, F, C>(&self, mut handler: F, limit: C) -> HelperResult<T>
    where
        F: FnMut(u32) -> HelperResult<T>,
        C: Fn(&HelperError) -> u32,
    {
        let mut attempt = 0;
        loop {
            let err = match handler(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let HelperError::Retryable(inner) = &err else {
                return Err(err);
            };
            if attempt >= limit(inner) {
                return Err(err);
            }

            attempt += 1;
            tracing::warn!(error = %inner, attempt, "retrying");
            thread::sleep(self.retry_time);
        }
    }
}
