//! Scoped headless-browser sessions.
//!
//! A session is opened per fetch and always torn down before `fetch` returns:
//! a graceful close gets [`TEARDOWN_GRACE`], then the process is killed.
//! Sessions must also kill their process when dropped, which covers callers
//! that abandon the future mid-flight.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FetchError, FetchErrorKind};
use crate::models::FetchResult;

pub const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Starts browser processes.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn launch(&self, headless: bool) -> Result<Box<dyn BrowserSession>, FetchError>;
}

/// One running browser.
#[async_trait]
pub trait BrowserSession: Send {
    /// Navigate to `url` and return the first PDF the page delivers, whether
    /// served directly or reached after a challenge or redirect.
    async fn capture_pdf(&mut self, url: &str) -> Result<FetchResult, FetchError>;

    async fn close(&mut self) -> Result<(), FetchError>;

    /// Forced termination. Must not wait on the browser.
    async fn kill(&mut self);
}

#[derive(Clone)]
pub struct BrowserFetcher {
    backend: Arc<dyn BrowserBackend>,
    headless: bool,
    timeout: Duration,
}

impl BrowserFetcher {
    pub fn new(backend: Arc<dyn BrowserBackend>, headless: bool, timeout: Duration) -> Self {
        Self { backend, headless, timeout }
    }

    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<FetchResult, FetchError> {
        info!(url, headless = self.headless, "Opening browser session");
        let launch = tokio::time::timeout(self.timeout, self.backend.launch(self.headless));
        let mut session = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::cancelled()),
            r = launch => match r {
                Ok(session) => session?,
                Err(_) => return Err(FetchError::new(FetchErrorKind::BrowserUnavailable, "browser did not start in time")),
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::cancelled()),
            r = tokio::time::timeout(self.timeout, session.capture_pdf(url)) => match r {
                Ok(result) => result,
                Err(_) => Err(FetchError::new(
                    FetchErrorKind::Timeout,
                    format!("browser session exceeded {}s", self.timeout.as_secs()),
                )),
            },
        };

        teardown(session.as_mut()).await;
        result
    }
}

async fn teardown(session: &mut dyn BrowserSession) {
    match tokio::time::timeout(TEARDOWN_GRACE, session.close()).await {
        Ok(Ok(())) => debug!("Browser session closed"),
        Ok(Err(e)) => {
            warn!(error = %e, "Browser close failed, killing process");
            session.kill().await;
        }
        Err(_) => {
            warn!("Browser did not close within grace period, killing process");
            session.kill().await;
        }
    }
}
