//! Counting occurrences of a pattern in documents downloaded over HTTP.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Url};
use thiserror::Error;
use urlstat_cache::Fetch;

use crate::config::Config;

/// The user agent sent with every request.
pub const USER_AGENT: &str = concat!("urlstat/", env!("CARGO_PKG_VERSION"));

/// An error that happens when fetching a document.
///
/// Fetch errors end up in the cache and are handed to every caller asking for the same URL, so
/// they only carry rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// The download did not finish in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The request could not be sent, for example due to DNS resolution or a refused
    /// connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The response body could not be read.
    #[error("failed to read body: {0}")]
    Body(String),
}

/// Timeouts for fetching a single document.
#[derive(Copy, Clone, Debug)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl FetchTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Creates the HTTP client used for all downloads.
pub fn create_client(timeouts: &FetchTimeouts) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(timeouts.connect)
        .user_agent(USER_AGENT)
        .build()
}

/// Counts the non-overlapping occurrences of `pattern` in `text`.
///
/// An empty pattern matches at every char boundary.
pub fn count_occurrences(text: &str, pattern: &str) -> usize {
    text.matches(pattern).count()
}

/// Downloads documents and counts how often a fixed pattern occurs in them.
///
/// The status code of a response is not interpreted: the body of an error page is counted like
/// any other body.
#[derive(Clone, Debug)]
pub struct SubstringCounter {
    client: Client,
    pattern: Arc<str>,
    timeouts: FetchTimeouts,
}

impl SubstringCounter {
    pub fn new(client: Client, pattern: impl Into<Arc<str>>, timeouts: FetchTimeouts) -> Self {
        Self {
            client,
            pattern: pattern.into(),
            timeouts,
        }
    }

    /// Creates a counter for the configured pattern, with its own client.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let timeouts = FetchTimeouts::from_config(config);
        let client = create_client(&timeouts)?;
        Ok(Self::new(client, config.pattern.as_str(), timeouts))
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Downloads `url` and counts the occurrences of the pattern in its body.
    pub async fn count(&self, url: &str) -> Result<usize, FetchError> {
        let url = Url::parse(url).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        let timeout = self.timeouts.max_download;

        tracing::debug!("Fetching document from `{}`", url);

        let body = tokio::time::timeout(timeout, self.download(url))
            .await
            .map_err(|_| FetchError::Timeout(timeout))??;

        Ok(count_occurrences(&body, &self.pattern))
    }

    async fn download(&self, url: Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| self.request_error(err))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, %status, "Counting body of unsuccessful response");
        }

        response
            .text()
            .await
            .map_err(|err| FetchError::Body(err.to_string()))
    }

    fn request_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout(self.timeouts.connect);
        }

        // The top level error only says which URL failed, the cause is in the source chain.
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        FetchError::ConnectionFailed(message)
    }
}

impl Fetch<String> for SubstringCounter {
    type Value = usize;
    type Error = FetchError;

    fn fetch(&self, url: String) -> BoxFuture<'_, Result<usize, FetchError>> {
        Box::pin(async move { self.count(&url).await })
    }
}
