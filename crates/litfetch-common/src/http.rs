use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use reqwest::{redirect, Client, ClientBuilder};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use url::Url;

use crate::error::{LitfetchError, Result};

/// Desktop Chrome user agent; several publishers refuse obvious bot agents.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub requests_per_second: u32,
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            requests_per_second: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A shared HTTP client that throttles requests per host.
///
/// Resolvers and the fetcher share one instance so that a burst of lookups
/// against the same publisher is spread out instead of tripping bot defences.
#[derive(Clone)]
pub struct PoliteClient {
    client: Client,
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
}

impl PoliteClient {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| LitfetchError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let rps = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::keyed(Quota::per_second(rps)));

        Ok(Self { client, limiter })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(&HttpSettings::default())
    }

    /// Validates that a URL is absolute http(s) and returns its host.
    pub fn host_of(url: &str) -> Result<String> {
        let parsed = Url::parse(url).map_err(|e| LitfetchError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LitfetchError::InvalidUrl(format!("unsupported scheme in {url}")));
        }
        parsed
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| LitfetchError::InvalidUrl(format!("no host in {url}")))
    }

    /// Waits until the per-host budget allows another request.
    pub async fn throttle(&self, host: &str) {
        self.limiter.until_key_ready(&host.to_string()).await;
        trace!(host, "rate limiter released request");
    }

    /// Throttled GET. The returned builder can still be customised (headers, timeout).
    pub async fn get(&self, url: &str) -> Result<reqwest::RequestBuilder> {
        let host = Self::host_of(url)?;
        self.throttle(&host).await;
        Ok(self.client.get(url))
    }

}

impl std::fmt::Debug for PoliteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoliteClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of_accepts_http_urls() {
        assert_eq!(PoliteClient::host_of("https://API.Unpaywall.org/v2/x").unwrap(), "api.unpaywall.org");
        assert_eq!(PoliteClient::host_of("http://example.com").unwrap(), "example.com");
    }

    #[test]
    fn test_host_of_rejects_other_schemes() {
        assert!(PoliteClient::host_of("ftp://example.com/file.pdf").is_err());
        assert!(PoliteClient::host_of("file:///etc/passwd").is_err());
        assert!(PoliteClient::host_of("not a url").is_err());
    }

    #[tokio::test]
    async fn test_get_rejects_invalid_url_without_network() {
        let client = PoliteClient::with_defaults().unwrap();
        assert!(matches!(client.get("mailto:someone@example.com").await, Err(LitfetchError::InvalidUrl(_))));
    }
}
