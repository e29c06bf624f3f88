//! Unpaywall open-access lookup by DOI.
//!
//! API: https://api.unpaywall.org/v2/{doi}?email=...
//! See https://unpaywall.org/data-format

use async_trait::async_trait;
use litfetch_common::{IdentifierField, IdentifierSet, PoliteClient};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{get_with_retry, requires, Resolver};
use crate::models::{DownloadRef, FoundMetadata, ResolutionOutcome, SourceKind};

const UNPAYWALL_API: &str = "https://api.unpaywall.org/v2";

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    is_oa: bool,
    #[serde(default)]
    oa_locations: Vec<OaLocation>,
}

#[derive(Debug, Deserialize)]
struct OaLocation {
    url_for_pdf: Option<String>,
    url_for_landing_page: Option<String>,
    version: Option<Version>,
    host_type: Option<String>,
}

/// Manuscript stage, ordered from least to most authoritative.
#[derive(Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
enum Version {
    #[serde(rename = "submittedVersion")]
    Submitted,
    #[serde(rename = "acceptedVersion")]
    Accepted,
    #[serde(rename = "publishedVersion")]
    Published,
}

pub struct UnpaywallResolver {
    client: PoliteClient,
    email: Option<String>,
}

impl UnpaywallResolver {
    pub fn new(client: PoliteClient, email: Option<String>) -> Self {
        Self { client, email: email.filter(|e| !e.trim().is_empty()) }
    }
}

#[async_trait]
impl Resolver for UnpaywallResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Unpaywall
    }

    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String> {
        if self.email.is_none() {
            return Some("no contact email configured".to_string());
        }
        ids.doi().is_none().then(|| requires(IdentifierField::Doi))
    }

    #[instrument(skip(self, ids), fields(doc_id = ids.doc_id()))]
    async fn resolve(&self, ids: &IdentifierSet, timeout: Duration) -> ResolutionOutcome {
        let (Some(doi), Some(email)) = (ids.doi(), self.email.as_deref()) else {
            return ResolutionOutcome::skipped(self.kind(), "requires doi and contact email");
        };

        let url = format!("{UNPAYWALL_API}/{doi}");
        let resp = match get_with_retry(&self.client, &url, &[("email", email)], timeout).await {
            Ok(r) => r,
            Err(e) => return ResolutionOutcome::error(self.kind(), e),
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return ResolutionOutcome::not_found(self.kind());
        }
        if !resp.status().is_success() {
            return ResolutionOutcome::error(self.kind(), format!("Unpaywall returned HTTP {}", resp.status()));
        }
        let body: Response = match resp.json().await {
            Ok(b) => b,
            Err(e) => return ResolutionOutcome::error(self.kind(), format!("invalid Unpaywall response: {e}")),
        };

        match best_location(body) {
            Some((pdf_url, version, note)) => {
                debug!(%pdf_url, ?version, "Unpaywall OA location");
                ResolutionOutcome::found(
                    self.kind(),
                    DownloadRef::url(pdf_url),
                    confidence_for(version),
                    FoundMetadata { note, ..FoundMetadata::default() },
                )
            }
            None => ResolutionOutcome::not_found(self.kind()),
        }
    }
}

/// Picks the most authoritative location that links a PDF directly.
/// Publisher-hosted copies win ties over repositories.
fn best_location(response: Response) -> Option<(String, Option<Version>, Option<String>)> {
    if !response.is_oa {
        return None;
    }
    let published_landing = response
        .oa_locations
        .iter()
        .find(|loc| loc.version == Some(Version::Published) && loc.url_for_pdf.is_none())
        .and_then(|loc| loc.url_for_landing_page.clone());

    let best = response
        .oa_locations
        .into_iter()
        .filter(|loc| loc.url_for_pdf.as_deref().is_some_and(|u| !u.trim().is_empty()))
        .max_by_key(|loc| (loc.version, loc.host_type.as_deref() == Some("publisher")))?;

    let note = match (best.version, published_landing) {
        (Some(Version::Published), _) => None,
        (_, Some(landing)) => Some(format!("published version only available at {landing}")),
        _ => Some("published version not openly available".to_string()),
    };
    Some((best.url_for_pdf?, best.version, note))
}

fn confidence_for(version: Option<Version>) -> f64 {
    match version {
        Some(Version::Published) => 0.9,
        Some(Version::Accepted)  => 0.8,
        Some(Version::Submitted) => 0.7,
        None                     => 0.6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: serde_json::Value) -> Response {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_prefers_published_version() {
        let response = parse(serde_json::json!({
            "is_oa": true,
            "oa_locations": [
                { "url_for_pdf": "https://arxiv.org/pdf/1.pdf", "version": "submittedVersion", "host_type": "repository" },
                { "url_for_pdf": "https://publisher.org/1.pdf", "version": "publishedVersion", "host_type": "publisher" },
                { "url_for_pdf": null, "url_for_landing_page": "https://repo.org/1", "version": "acceptedVersion" }
            ]
        }));
        let (url, version, note) = best_location(response).unwrap();
        assert_eq!(url, "https://publisher.org/1.pdf");
        assert_eq!(version, Some(Version::Published));
        assert_eq!(note, None);
    }

    #[test]
    fn test_notes_when_only_preprint_has_pdf() {
        let response = parse(serde_json::json!({
            "is_oa": true,
            "oa_locations": [
                { "url_for_pdf": "https://arxiv.org/pdf/1.pdf", "version": "submittedVersion" },
                { "url_for_pdf": null, "url_for_landing_page": "https://publisher.org/1", "version": "publishedVersion" }
            ]
        }));
        let (url, _, note) = best_location(response).unwrap();
        assert_eq!(url, "https://arxiv.org/pdf/1.pdf");
        assert!(note.unwrap().contains("https://publisher.org/1"));
    }

    #[test]
    fn test_closed_access_is_not_found() {
        let response = parse(serde_json::json!({ "is_oa": false, "oa_locations": [] }));
        assert!(best_location(response).is_none());
    }

    #[test]
    fn test_skips_without_email() {
        let client = PoliteClient::with_defaults().unwrap();
        let ids = IdentifierSet::new(1).with_doi("10.1/x");
        assert!(UnpaywallResolver::new(client.clone(), None).skip_reason(&ids).is_some());
        assert!(UnpaywallResolver::new(client.clone(), Some("a@b.org".into())).skip_reason(&ids).is_none());
        assert!(UnpaywallResolver::new(client, Some("a@b.org".into())).skip_reason(&IdentifierSet::new(1)).is_some());
    }

    #[tokio::test]
    #[ignore = "Hits external Unpaywall API"]
    async fn test_live_lookup() {
        let resolver = UnpaywallResolver::new(PoliteClient::with_defaults().unwrap(), Some("test@example.org".into()));
        let ids = IdentifierSet::new(1).with_doi("10.1038/nature14539");
        let _ = resolver.resolve(&ids, Duration::from_secs(30)).await;
    }
}
