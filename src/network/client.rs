//! Preconfigured HTTP client for cache transfers

use std::time::Duration;

use reqwest::blocking::{Client, ClientBuilder};

use crate::error::HelperResult;

/// Dial timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// TCP keep-alive interval.
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// How long an idle pooled connection is kept.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// Blocking client reused across retries of one cache command.
#[derive(Debug, Clone)]
pub struct CacheClient {
    client: Client,
}

impl CacheClient {
    /// Client with an overall request timeout of `timeout_minutes`; zero
    /// disables the overall timeout.
    pub fn new(timeout_minutes: u64) -> HelperResult<Self> {
        let client = Self::builder(timeout_minutes).build()?;
        Ok(Self { client })
    }

    /// Builder carrying the cache transport settings.
    pub fn builder(timeout_minutes: u64) -> ClientBuilder {
        let overall = (timeout_minutes > 0).then(|| Duration::from_secs(timeout_minutes * 60));
        Client::builder()
            .timeout(overall)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(KEEP_ALIVE)
            .pool_idle_timeout(IDLE_CONNECTION_TIMEOUT)
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }
}
