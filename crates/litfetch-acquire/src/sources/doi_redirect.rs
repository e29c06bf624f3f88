//! Follows https://doi.org/{doi} to the publisher and looks for a PDF link
//! on the landing page (Highwire `citation_pdf_url` meta tags, PDF alternates).

use async_trait::async_trait;
use litfetch_common::{IdentifierField, IdentifierSet, PoliteClient};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::{get_with_retry, requires, Resolver};
use crate::models::{DownloadRef, FoundMetadata, ResolutionOutcome, SourceKind};

const DOI_RESOLVER: &str = "https://doi.org";

pub struct DoiRedirectResolver {
    client: PoliteClient,
}

impl DoiRedirectResolver {
    pub fn new(client: PoliteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Resolver for DoiRedirectResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::DoiRedirect
    }

    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String> {
        ids.doi().is_none().then(|| requires(IdentifierField::Doi))
    }

    #[instrument(skip(self, ids), fields(doc_id = ids.doc_id()))]
    async fn resolve(&self, ids: &IdentifierSet, timeout: Duration) -> ResolutionOutcome {
        let Some(doi) = ids.doi() else {
            return ResolutionOutcome::skipped(self.kind(), requires(IdentifierField::Doi));
        };

        let resp = match get_with_retry(&self.client, &format!("{DOI_RESOLVER}/{doi}"), &[], timeout).await {
            Ok(r) => r,
            Err(e) => return ResolutionOutcome::error(self.kind(), e),
        };

        let status = resp.status();
        let landing = resp.url().to_string();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            debug!(%landing, "DOI did not resolve");
            return ResolutionOutcome::not_found(self.kind());
        }
        if !status.is_success() {
            // Publishers often refuse plain HTTP clients; let the fetcher try (and fall back).
            debug!(%landing, %status, "Publisher refused landing page");
            return landing_page(self.kind(), landing, format!("landing page returned HTTP {status}"));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if content_type.contains("application/pdf") {
            return ResolutionOutcome::found(self.kind(), DownloadRef::url(landing), 0.85, FoundMetadata::default());
        }

        let html = match resp.text().await {
            Ok(t) => t,
            Err(e) => return ResolutionOutcome::error(self.kind(), format!("failed to read landing page: {e}")),
        };

        match find_pdf_link(&html, &landing) {
            Some(pdf_url) => {
                debug!(%pdf_url, "PDF link found on landing page");
                ResolutionOutcome::found(self.kind(), DownloadRef::url(pdf_url), 0.8, FoundMetadata::default())
            }
            None => landing_page(self.kind(), landing, "no PDF link on landing page".to_string()),
        }
    }
}

/// Low-confidence reference to the landing page itself.
fn landing_page(source: SourceKind, url: String, note: String) -> ResolutionOutcome {
    ResolutionOutcome::found(
        source,
        DownloadRef::url(url),
        0.4,
        FoundMetadata { note: Some(note), ..FoundMetadata::default() },
    )
}

/// Absolute URL of the PDF advertised by a landing page, if any.
pub fn find_pdf_link(html: &str, base_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selectors = [
        ("meta[name='citation_pdf_url']", "content"),
        ("link[rel='alternate'][type='application/pdf']", "href"),
        ("a[data-article-pdf]", "href"),
    ];

    let raw = selectors.iter().find_map(|(css, attr)| {
        let selector = Selector::parse(css).ok()?;
        document
            .select(&selector)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    })?;

    let base = Url::parse(base_url).ok()?;
    let resolved = base.join(&raw).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_citation_pdf_url_meta() {
        let html = r#"<html><head>
            <meta name="citation_title" content="Effects of X on Y">
            <meta name="citation_pdf_url" content="https://publisher.org/doi/pdf/10.1/x">
        </head><body></body></html>"#;
        assert_eq!(
            find_pdf_link(html, "https://publisher.org/doi/10.1/x").as_deref(),
            Some("https://publisher.org/doi/pdf/10.1/x")
        );
    }

    #[test]
    fn test_relative_links_resolved_against_landing_page() {
        let html = r#"<html><head><link rel="alternate" type="application/pdf" href="/content/x.full.pdf"></head></html>"#;
        assert_eq!(
            find_pdf_link(html, "https://journal.org/content/x").as_deref(),
            Some("https://journal.org/content/x.full.pdf")
        );
    }

    #[test]
    fn test_no_link() {
        assert_eq!(find_pdf_link("<html><body><p>Subscribe</p></body></html>", "https://journal.org/x"), None);
        let js = r#"<meta name="citation_pdf_url" content="javascript:void(0)">"#;
        assert_eq!(find_pdf_link(js, "https://journal.org/x"), None);
    }

    #[test]
    fn test_landing_page_is_low_confidence() {
        match landing_page(SourceKind::DoiRedirect, "https://journal.org/x".into(), "HTTP 403".into()) {
            ResolutionOutcome::Found { confidence, metadata, .. } => {
                assert!(confidence < 0.5);
                assert_eq!(metadata.note.as_deref(), Some("HTTP 403"));
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    #[ignore = "Hits external doi.org resolver"]
    async fn test_live_doi_redirect() {
        let resolver = DoiRedirectResolver::new(PoliteClient::with_defaults().unwrap());
        let ids = IdentifierSet::new(1).with_doi("10.1371/journal.pone.0000001");
        assert!(resolver.resolve(&ids, Duration::from_secs(30)).await.is_found());
    }
}
