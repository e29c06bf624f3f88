//! Chromium backend over the DevTools protocol.
//!
//! PDFs are captured by watching network responses rather than waiting for
//! navigation to finish: Chrome turns PDF navigations into viewer pages or
//! downloads, and either way the response body is still retrievable.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, GetResponseBodyParams};
use chromiumoxide::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::browser::{BrowserBackend, BrowserSession};
use crate::error::{FetchError, FetchErrorKind};
use crate::models::{FetchResult, FetchVia};

/// How often the landing page is checked for a PDF link while waiting.
const LINK_POLL: Duration = Duration::from_secs(2);
const PDF_LINK_JS: &str =
    "(() => { const m = document.querySelector('meta[name=\"citation_pdf_url\"]'); return m ? m.content : null; })()";

#[derive(Debug, Clone, Default)]
pub struct ChromiumBackend {
    executable: Option<PathBuf>,
}

impl ChromiumBackend {
    pub fn with_executable(path: impl Into<PathBuf>) -> Self {
        Self { executable: Some(path.into()) }
    }
}

fn unavailable(e: impl std::fmt::Display) -> FetchError {
    FetchError::new(FetchErrorKind::BrowserUnavailable, e.to_string())
}

fn protocol(e: impl std::fmt::Display) -> FetchError {
    FetchError::new(FetchErrorKind::Network, format!("browser: {e}"))
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn launch(&self, headless: bool) -> Result<Box<dyn BrowserSession>, FetchError> {
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(unavailable)?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(unavailable)?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(ChromiumSession { browser, handler_task }))
    }
}

struct ChromiumSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl ChromiumSession {
    async fn read_body(page: &Page, event: &EventResponseReceived) -> Result<Vec<u8>, FetchError> {
        let body = page
            .execute(GetResponseBodyParams::new(event.request_id.clone()))
            .await
            .map_err(protocol)?;
        if body.result.base64_encoded {
            STANDARD.decode(&body.result.body).map_err(protocol)
        } else {
            Ok(body.result.body.clone().into_bytes())
        }
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn capture_pdf(&mut self, url: &str) -> Result<FetchResult, FetchError> {
        let page = self.browser.new_page("about:blank").await.map_err(protocol)?;
        let mut responses = page.event_listener::<EventResponseReceived>().await.map_err(protocol)?;

        let nav_page = page.clone();
        let target = url.to_string();
        let navigation = tokio::spawn(async move { nav_page.goto(target).await.map(|_| ()) });
        let mut followed_link = false;
        let mut poll = tokio::time::interval(LINK_POLL);

        let result = loop {
            tokio::select! {
                event = responses.next() => {
                    let Some(event) = event else {
                        break Err(FetchError::new(FetchErrorKind::Unusable, "page closed without serving a PDF"));
                    };
                    if !event.response.mime_type.to_ascii_lowercase().contains("application/pdf") {
                        continue;
                    }
                    debug!(url = %event.response.url, "PDF response observed");
                    match Self::read_body(&page, &event).await {
                        Ok(bytes) => break Ok(FetchResult {
                            bytes,
                            content_type: Some(event.response.mime_type.clone()),
                            via: FetchVia::Browser,
                            source_url: event.response.url.clone(),
                        }),
                        Err(e) => warn!(error = %e, "Could not read PDF response body"),
                    }
                }
                _ = poll.tick(), if !followed_link => {
                    // Landing pages behind a challenge only expose the PDF link once it passes.
                    let link = page
                        .evaluate(PDF_LINK_JS)
                        .await
                        .ok()
                        .and_then(|r| r.into_value::<Option<String>>().ok())
                        .flatten()
                        .filter(|l| !l.trim().is_empty());
                    if let Some(link) = link {
                        debug!(%link, "Following citation_pdf_url in browser");
                        followed_link = true;
                        if let Err(e) = page.goto(link).await {
                            debug!(error = %e, "Navigation to citation_pdf_url failed");
                        }
                    }
                }
            }
        };

        navigation.abort();
        result
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        self.browser.close().await.map_err(protocol)?;
        self.browser.wait().await.map_err(protocol)?;
        self.handler_task.abort();
        Ok(())
    }

    async fn kill(&mut self) {
        if let Some(Err(e)) = self.browser.kill().await {
            warn!(error = %e, "Failed to kill browser process");
        }
        self.handler_task.abort();
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        // The child is spawned with kill_on_drop; only the event loop needs stopping.
        self.handler_task.abort();
    }
}
