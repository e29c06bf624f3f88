//! Plain HTTP download with a size cap and response classification.

use litfetch_common::PoliteClient;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::challenge::{is_challenge_page, is_paywalled_domain, looks_like_html, looks_like_pdf};
use crate::error::{FetchError, FetchErrorKind};
use crate::models::{FetchResult, FetchVia};

const PDF_ACCEPT: &str = "application/pdf,text/html;q=0.9,*/*;q=0.8";
/// How much of an error body is kept for challenge detection.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// An HTTP failure plus whether a real browser might get past it.
#[derive(Debug, Clone)]
pub struct HttpFailure {
    pub error: FetchError,
    pub blocked: bool,
    /// A 2xx body that was not a PDF. If nothing better turns up it goes to
    /// verification, which rejects it into quarantine.
    pub served: Option<FetchResult>,
}

impl HttpFailure {
    fn blocked(kind: FetchErrorKind, detail: impl Into<String>) -> Self {
        Self { error: FetchError::new(kind, detail), blocked: true, served: None }
    }

    fn terminal(error: FetchError) -> Self {
        Self { error, blocked: false, served: None }
    }

    /// The served body if there was one, otherwise the error.
    pub fn into_result(self) -> Result<FetchResult, FetchError> {
        match self.served {
            Some(served) => Ok(served),
            None => Err(self.error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: PoliteClient,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(client: PoliteClient, max_bytes: u64) -> Self {
        Self { client, max_bytes }
    }

    #[instrument(skip(self, cancel))]
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, HttpFailure> {
        let request = self
            .client
            .get(url)
            .await
            .map_err(|e| HttpFailure::terminal(FetchError::new(FetchErrorKind::Unusable, e.to_string())))?
            .header(ACCEPT, PDF_ACCEPT)
            .timeout(timeout);

        let mut resp = tokio::select! {
            _ = cancel.cancelled() => return Err(HttpFailure::terminal(FetchError::cancelled())),
            r = request.send() => r.map_err(|e| HttpFailure::terminal(transport_error(&e, timeout)))?,
        };

        let status = resp.status();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = read_capped(&mut resp, ERROR_BODY_LIMIT as u64, cancel, true).await.unwrap_or_default();
            return Err(classify_status(status, &final_url, &body));
        }

        if let Some(len) = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if len > self.max_bytes {
                return Err(HttpFailure::terminal(oversized(self.max_bytes)));
            }
        }

        let bytes = read_capped(&mut resp, self.max_bytes, cancel, false)
            .await
            .map_err(|e| HttpFailure::terminal(transport_or(e, timeout)))?;
        debug!(bytes = bytes.len(), %final_url, "HTTP download complete");

        if !looks_like_pdf(&bytes) {
            if is_challenge_page(&bytes) {
                return Err(HttpFailure::blocked(
                    FetchErrorKind::Forbidden,
                    format!("bot challenge served by {final_url}"),
                ));
            }
            if looks_like_html(&bytes, content_type.as_deref()) {
                let mut failure = HttpFailure::blocked(
                    FetchErrorKind::Unusable,
                    format!("{final_url} returned an HTML page instead of a PDF"),
                );
                failure.served = Some(FetchResult { bytes, content_type, via: FetchVia::Http, source_url: final_url });
                return Err(failure);
            }
        }

        Ok(FetchResult { bytes, content_type, via: FetchVia::Http, source_url: final_url })
    }
}

/// Any non-2xx is worth a browser attempt; the kind decides what happens after.
fn classify_status(status: StatusCode, url: &str, body: &[u8]) -> HttpFailure {
    if is_challenge_page(body) {
        return HttpFailure::blocked(FetchErrorKind::Forbidden, format!("bot challenge (HTTP {status}) at {url}"));
    }
    let kind = match status.as_u16() {
        401 | 402 | 403 | 451 => FetchErrorKind::Forbidden,
        408 => FetchErrorKind::Timeout,
        429 => FetchErrorKind::Network,
        s if s >= 500 => FetchErrorKind::Network,
        _ => FetchErrorKind::Unusable,
    };
    let mut detail = format!("HTTP {status} from {url}");
    if kind == FetchErrorKind::Forbidden && is_paywalled_domain(url) {
        detail.push_str(" (subscription publisher)");
    }
    HttpFailure::blocked(kind, detail)
}

fn oversized(max_bytes: u64) -> FetchError {
    FetchError::new(
        FetchErrorKind::Oversized,
        format!("response exceeds {} MiB limit", max_bytes / (1024 * 1024)),
    )
}

fn transport_error(err: &reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::new(FetchErrorKind::Timeout, format!("no response within {}s", timeout.as_secs()))
    } else if err.is_redirect() {
        FetchError::new(FetchErrorKind::Unusable, format!("redirect limit exceeded: {err}"))
    } else {
        FetchError::new(FetchErrorKind::Network, err.to_string())
    }
}

enum ReadError {
    Transport(reqwest::Error),
    Fetch(FetchError),
}

fn transport_or(err: ReadError, timeout: Duration) -> FetchError {
    match err {
        ReadError::Transport(e) => transport_error(&e, timeout),
        ReadError::Fetch(e) => e,
    }
}

/// Streams the body, stopping at `limit`. With `truncate` the excess is
/// dropped silently; otherwise exceeding the limit is an `Oversized` error.
async fn read_capped(
    resp: &mut reqwest::Response,
    limit: u64,
    cancel: &CancellationToken,
    truncate: bool,
) -> Result<Vec<u8>, ReadError> {
    let mut bytes = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ReadError::Fetch(FetchError::cancelled())),
            c = resp.chunk() => c.map_err(ReadError::Transport)?,
        };
        let Some(chunk) = chunk else { break };
        if (bytes.len() + chunk.len()) as u64 > limit {
            if truncate {
                let room = (limit as usize).saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..room.min(chunk.len())]);
                break;
            }
            return Err(ReadError::Fetch(oversized(limit)));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let forbidden = classify_status(StatusCode::FORBIDDEN, "https://www.sciencedirect.com/x", b"");
        assert_eq!(forbidden.error.kind, FetchErrorKind::Forbidden);
        assert!(forbidden.blocked);
        assert!(forbidden.error.detail.contains("subscription publisher"));

        assert_eq!(classify_status(StatusCode::NOT_FOUND, "https://x.org", b"").error.kind, FetchErrorKind::Unusable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY, "https://x.org", b"").error.kind, FetchErrorKind::Network);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS, "https://x.org", b"").error.kind, FetchErrorKind::Network);
    }

    #[test]
    fn test_challenge_on_503_is_forbidden() {
        let body = b"<html><title>Just a moment...</title></html>";
        let failure = classify_status(StatusCode::SERVICE_UNAVAILABLE, "https://x.org", body);
        assert_eq!(failure.error.kind, FetchErrorKind::Forbidden);
        assert!(failure.blocked);
    }

    #[tokio::test]
    async fn test_invalid_url_is_unusable_without_network() {
        let fetcher = HttpFetcher::new(PoliteClient::with_defaults().unwrap(), 1024);
        let failure = fetcher
            .fetch("file:///etc/passwd", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind, FetchErrorKind::Unusable);
        assert!(!failure.blocked);
    }

    #[tokio::test]
    #[ignore = "Hits external arXiv server"]
    async fn test_live_pdf_download() {
        let fetcher = HttpFetcher::new(PoliteClient::with_defaults().unwrap(), 50 * 1024 * 1024);
        let result = fetcher
            .fetch("https://arxiv.org/pdf/1706.03762", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();
        assert!(looks_like_pdf(&result.bytes));
    }
}
