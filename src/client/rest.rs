//! HTTP snapshot provider.
//!
//! This module provides [`RestSnapshotProvider`], which fetches an
//! authoritative book with `GET {base}/book/{symbol}` and implements
//! [`SnapshotProvider`] so observations can calibrate against it.
//!
//! # Example
//!
//! ```rust,no_run
//! use book_sync::client::RestSnapshotProvider;
//! use book_sync::config::FeedConfig;
//!
//! # async fn example() -> book_sync::Result<()> {
//! let feed = FeedConfig::new("https://api.example.com/v1/", "wss://stream.example.com/ws");
//! let provider = RestSnapshotProvider::new(&feed)?;
//!
//! let snapshot = provider.get_snapshot("BTC-USD").await?;
//! println!("{} levels at {}", snapshot.asks.len() + snapshot.bids.len(), snapshot.sequence);
//! # Ok(())
//! # }
//! ```

use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::config::FeedConfig;
use crate::error::{ApiError, Error};
use crate::provider::SnapshotProvider;
use crate::types::Snapshot;

/// HTTP client for the snapshot endpoint
#[derive(Debug, Clone)]
pub struct RestSnapshotProvider {
    client: Client,
    base_url: Url,
}

impl RestSnapshotProvider {
    /// Create a new snapshot provider
    ///
    /// # Arguments
    ///
    /// * `config` - Feed endpoints and HTTP timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be initialized.
    pub fn new(config: &FeedConfig) -> Result<Self, Error> {
        let base_url = Url::parse(config.rest_base_url())?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "REST base URL cannot carry a path: {base_url}"
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self { client, base_url })
    }

    /// URL of the snapshot of `symbol`; the symbol is percent-encoded as one
    /// path segment
    pub fn snapshot_url(&self, symbol: &str) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("REST base URL cannot carry a path: {}", self.base_url)))?
            .pop_if_empty()
            .push("book")
            .push(symbol);
        Ok(url)
    }

    /// Fetch the snapshot of `symbol`
    ///
    /// # Errors
    ///
    /// [`Error::Network`] on transport failure, [`Error::RateLimited`] on 429,
    /// [`Error::Api`] on other non-success statuses, [`Error::Json`] on a
    /// malformed body.
    pub async fn get_snapshot(&self, symbol: &str) -> Result<Snapshot, Error> {
        let url = self.snapshot_url(symbol)?;
        fetch(self.client.clone(), url).await
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }
}

impl SnapshotProvider for RestSnapshotProvider {
    fn fetch_snapshot(&self, symbol: &str) -> BoxFuture<'static, crate::Result<Snapshot>> {
        let client = self.client.clone();
        let url = self.snapshot_url(symbol);
        Box::pin(async move { fetch(client, url?).await })
    }
}

async fn fetch(client: Client, url: Url) -> Result<Snapshot, Error> {
    debug!(%url, "fetching snapshot");
    let response = client.get(url).send().await?;
    handle_response(response).await
}

/// Handle the HTTP response, checking for errors
async fn handle_response<T>(response: reqwest::Response) -> Result<T, Error>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();

    // Retry-After is in seconds
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000));

        return Err(Error::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Api(parse_api_error(status.as_u16(), &body)));
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(Error::from)
}

/// Decode an error body, falling back to the raw text
fn parse_api_error(status: u16, body: &str) -> ApiError {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return ApiError::new(status, body);
    };

    let message = value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(|v| v.as_str())
        .unwrap_or(body)
        .to_string();

    let code = value.get("code").and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    ApiError {
        status,
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(base: &str) -> RestSnapshotProvider {
        RestSnapshotProvider::new(&FeedConfig::new(base, "wss://stream.example.com/ws")).unwrap()
    }

    #[test]
    fn test_snapshot_url() {
        let with_slash = provider("https://api.example.com/v1/");
        assert_eq!(
            with_slash.snapshot_url("BTC-USD").unwrap().as_str(),
            "https://api.example.com/v1/book/BTC-USD"
        );

        let without_slash = provider("https://api.example.com/v1");
        assert_eq!(
            without_slash.snapshot_url("BTC/USD").unwrap().as_str(),
            "https://api.example.com/v1/book/BTC%2FUSD"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let config = FeedConfig::new("not a url", "wss://stream.example.com/ws");
        assert!(matches!(RestSnapshotProvider::new(&config), Err(Error::Config(_))));

        let config = FeedConfig::new("mailto:desk@example.com", "wss://stream.example.com/ws");
        assert!(matches!(RestSnapshotProvider::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_api_error() {
        let err = parse_api_error(404, r#"{"code":"not_found","message":"unknown symbol"}"#);
        assert_eq!(err.status, 404);
        assert_eq!(err.code.as_deref(), Some("not_found"));
        assert_eq!(err.message, "unknown symbol");

        let err = parse_api_error(502, "bad gateway");
        assert!(err.is_server_error());
        assert_eq!(err.message, "bad gateway");
        assert!(err.code.is_none());
    }

    #[test]
    fn test_unreachable_host_is_transient() {
        // nothing listens on port 9 of loopback
        let provider = provider("http://127.0.0.1:9/");
        let err = tokio_test::block_on(provider.fetch_snapshot("BTC-USD")).unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_transient());
    }
}
