//! Turns a `DownloadRef` into bytes: plain HTTP first, a real browser when the
//! publisher blocks automated clients.

pub mod browser;
pub mod challenge;
#[cfg(feature = "browser")]
pub mod chromium;
pub mod http;

use async_trait::async_trait;
use litfetch_common::PoliteClient;
use litfetch_config::AcquisitionConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{FetchError, FetchErrorKind};
use crate::models::{DownloadRef, FetchResult};

pub use browser::{BrowserBackend, BrowserFetcher, BrowserSession};
pub use http::{HttpFailure, HttpFetcher};

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        download_ref: &DownloadRef,
        prefer_browser: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError>;
}

/// The browser backend compiled into this build, if any.
#[cfg(feature = "browser")]
pub fn default_backend() -> Option<Arc<dyn BrowserBackend>> {
    Some(Arc::new(chromium::ChromiumBackend::default()))
}

#[cfg(not(feature = "browser"))]
pub fn default_backend() -> Option<Arc<dyn BrowserBackend>> {
    None
}

/// HTTP with optional browser fallback.
#[derive(Clone)]
pub struct FallbackFetcher {
    http: HttpFetcher,
    browser: Option<BrowserFetcher>,
    /// Fallback was requested but no backend is available.
    browser_missing: bool,
}

impl FallbackFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http, browser: None, browser_missing: false }
    }

    pub fn with_browser(mut self, browser: BrowserFetcher) -> Self {
        self.browser = Some(browser);
        self.browser_missing = false;
        self
    }

    pub fn from_config(config: &AcquisitionConfig, client: &PoliteClient) -> Self {
        let fetcher = Self::new(HttpFetcher::new(client.clone(), config.max_pdf_bytes));
        if !config.use_browser_fallback {
            return fetcher;
        }
        match default_backend() {
            Some(backend) => fetcher.with_browser(BrowserFetcher::new(
                backend,
                config.browser_headless,
                config.browser_timeout(),
            )),
            None => {
                warn!("Browser fallback requested but this build has no browser support");
                Self { browser_missing: true, ..fetcher }
            }
        }
    }

    async fn via_browser(&self, url: &str, cancel: &CancellationToken) -> Result<FetchResult, FetchError> {
        match &self.browser {
            Some(browser) => browser.fetch(url, cancel).await,
            None if self.browser_missing => Err(FetchError::new(
                FetchErrorKind::BrowserUnavailable,
                "built without browser support",
            )),
            None => Err(FetchError::new(FetchErrorKind::BrowserUnavailable, "browser fallback disabled")),
        }
    }
}

#[async_trait]
impl Fetcher for FallbackFetcher {
    #[instrument(skip(self, download_ref, cancel), fields(target = %download_ref))]
    async fn fetch(
        &self,
        download_ref: &DownloadRef,
        prefer_browser: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let Some(url) = download_ref.pdf_url() else {
            return Err(FetchError::new(FetchErrorKind::Unusable, "reference has no downloadable location"));
        };

        if prefer_browser && self.browser.is_some() {
            match self.via_browser(url, cancel).await {
                Ok(result) => return Ok(result),
                Err(e) if e.kind == FetchErrorKind::Cancelled => return Err(e),
                Err(e) => warn!(error = %e, "Browser-first fetch failed, trying plain HTTP"),
            }
        }

        let failure = match self.http.fetch(url, timeout, cancel).await {
            Ok(result) => return Ok(result),
            Err(failure) => failure,
        };
        if !failure.blocked || (self.browser.is_none() && !self.browser_missing) {
            return failure.into_result();
        }

        info!(error = %failure.error, "HTTP blocked, retrying in browser");
        match self.via_browser(url, cancel).await {
            Ok(result) => Ok(result),
            Err(e) if e.kind == FetchErrorKind::Cancelled => Err(e),
            Err(e) if failure.served.is_some() => {
                debug!(error = %e, "Browser fallback failed, passing the HTML response on");
                failure.into_result()
            }
            // The HTTP error says more about why the document is unreachable.
            Err(e) => Err(FetchError::new(
                failure.error.kind,
                format!("{}; browser fallback failed: {}", failure.error.detail, e),
            )),
        }
    }
}
