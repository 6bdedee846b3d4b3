//! Lightweight metadata probes against download URLs.
//!
//! A probe is a HEAD request reading three response headers: the content
//! length, the `ETag` change-fingerprint, and the `Last-Modified` date.
//! Probes gate UI responsiveness, so they run on a dedicated client with a
//! short overall timeout, separate from the transfer client.
//!
//! A missing `ETag` is legal and meaningful: launcher release assets carry
//! none, and the downloader uses that absence to route completion through
//! the self-update path instead of the regular one.

use std::path::Path;
use std::time::{Duration, SystemTime};

use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use tracing::{debug, instrument};
use url::Url;

use super::error::DownloadError;

/// Overall timeout for a metadata request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Metadata describing the current remote version of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Size advertised by the server, 0 when the header is absent.
    pub content_length: u64,
    /// Opaque change-fingerprint, if the server provides one.
    pub etag: Option<String>,
    /// Remote modification time, if the server provides one.
    pub last_modified: Option<SystemTime>,
}

/// Issues metadata requests against download URLs.
#[derive(Debug, Clone)]
pub struct Probe {
    client: reqwest::Client,
}

impl Default for Probe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe {
    /// Creates a probe with the standard short timeout.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Creates a probe on top of a caller-supplied client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetches the remote metadata for a URL.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] if the URL is invalid, the remote is
    /// unreachable, or it answers with a non-success status. Callers treat
    /// all of these as retryable.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<RemoteMetadata, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(std::string::ToString::to_string);
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok());

        debug!(
            content_length,
            has_etag = etag.is_some(),
            has_last_modified = last_modified.is_some(),
            "probe complete"
        );

        Ok(RemoteMetadata {
            content_length,
            etag,
            last_modified,
        })
    }

    /// Fetches only the fingerprint for a URL.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`fetch`](Self::fetch).
    pub async fn fetch_etag(&self, url: &str) -> Result<Option<String>, DownloadError> {
        Ok(self.fetch(url).await?.etag)
    }

    /// Decides whether a local file needs (re)downloading.
    ///
    /// Stale when the file is missing, or when the recorded fingerprint no
    /// longer matches the remote one. When the fingerprint comparison is
    /// inconclusive, falls back to modification times: a local file older
    /// than the remote `Last-Modified` is stale. A remote without a
    /// `Last-Modified` header is treated as changed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] if the remote cannot be probed.
    #[instrument(level = "debug", skip(self, dest), fields(url = %url, dest = %dest.display()))]
    pub async fn requires_update(
        &self,
        url: &str,
        dest: &Path,
        recorded_etag: Option<&str>,
    ) -> Result<bool, DownloadError> {
        if !dest.exists() {
            debug!("local file does not exist yet");
            return Ok(true);
        }

        let remote = self.fetch(url).await?;
        if let (Some(recorded), Some(current)) = (recorded_etag, remote.etag.as_deref())
            && recorded == current
        {
            debug!("fingerprint up to date");
            return Ok(false);
        }

        let Some(remote_modified) = remote.last_modified else {
            debug!("fingerprint differs and remote has no modification time");
            return Ok(true);
        };
        let local_modified = tokio::fs::metadata(dest)
            .await
            .and_then(|meta| meta.modified())
            .map_err(|e| DownloadError::io(dest.to_path_buf(), e))?;

        let stale = local_modified < remote_modified;
        debug!(stale, "fell back to modification-time comparison");
        Ok(stale)
    }
}
