//! PubMed Central resolver.
//!
//! Maps PMID/DOI to a PMCID via the NCBI ID converter, then pulls the
//! open-access JATS body from Europe PMC and points at its PDF rendition.
//!
//! APIs:
//!   https://www.ncbi.nlm.nih.gov/pmc/utils/idconv/v1.0/
//!   https://www.ebi.ac.uk/europepmc/webservices/rest/{PMCID}/fullTextXML

use async_trait::async_trait;
use litfetch_common::{IdentifierSet, PoliteClient};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{get_with_retry, Resolver};
use crate::models::{DownloadRef, FoundMetadata, ResolutionOutcome, SourceKind};

const IDCONV_URL:  &str = "https://www.ncbi.nlm.nih.gov/pmc/utils/idconv/v1.0/";
const EPMC_REST:   &str = "https://www.ebi.ac.uk/europepmc/webservices/rest";
const EPMC_RENDER: &str = "https://europepmc.org/backend/ptpmcrender.fcgi";
const TOOL_NAME:   &str = "litfetch";

static PMCID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bPMC(\d{4,})").unwrap_or_else(|e| panic!("invalid PMCID pattern: {e}"))
});

pub struct PmcResolver {
    client: PoliteClient,
    email: Option<String>,
}

impl PmcResolver {
    pub fn new(client: PoliteClient, email: Option<String>) -> Self {
        Self { client, email }
    }

    /// Look up the PMCID for a PMID or DOI. `Ok(None)` means PMC has no copy.
    #[instrument(skip(self, timeout))]
    async fn convert_id(&self, id: &str, timeout: Duration) -> Result<Option<String>, String> {
        let mut query = vec![("ids", id), ("format", "json"), ("tool", TOOL_NAME)];
        if let Some(email) = self.email.as_deref() {
            query.push(("email", email));
        }
        let resp = get_with_retry(&self.client, IDCONV_URL, &query, timeout).await?;
        if !resp.status().is_success() {
            return Err(format!("ID converter returned HTTP {}", resp.status()));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| format!("invalid ID converter response: {e}"))?;
        Ok(pmcid_from_idconv(&body))
    }

    /// Body text of the open-access JATS XML, when Europe PMC has it.
    async fn fetch_body_text(&self, pmcid: &str, timeout: Duration) -> Option<String> {
        let url = format!("{EPMC_REST}/{pmcid}/fullTextXML");
        let resp = match get_with_retry(&self.client, &url, &[], timeout).await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(pmcid, status = %r.status(), "No Europe PMC full text");
                return None;
            }
            Err(e) => {
                warn!(pmcid, error = %e, "Europe PMC full text request failed");
                return None;
            }
        };
        let xml = resp.text().await.ok()?;
        extract_body_text(&xml)
    }
}

#[async_trait]
impl Resolver for PmcResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Pmc
    }

    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String> {
        let has_pmcid_url = ids.known_url().and_then(extract_pmcid).is_some();
        (ids.pmid().is_none() && ids.doi().is_none() && !has_pmcid_url)
            .then(|| "requires pmid or doi".to_string())
    }

    #[instrument(skip(self, ids), fields(doc_id = ids.doc_id()))]
    async fn resolve(&self, ids: &IdentifierSet, timeout: Duration) -> ResolutionOutcome {
        let pmcid = match ids.known_url().and_then(extract_pmcid) {
            Some(id) => Some(id),
            None => {
                let Some(lookup) = ids.pmid().or(ids.doi()) else {
                    return ResolutionOutcome::skipped(self.kind(), "requires pmid or doi");
                };
                match self.convert_id(lookup, timeout).await {
                    Ok(found) => found,
                    Err(e) => return ResolutionOutcome::error(self.kind(), e),
                }
            }
        };

        let Some(pmcid) = pmcid else {
            return ResolutionOutcome::not_found(self.kind());
        };

        let full_text = self.fetch_body_text(&pmcid, timeout).await;
        let confidence = if full_text.is_some() { 0.9 } else { 0.7 };
        debug!(%pmcid, has_text = full_text.is_some(), "PMC record found");

        ResolutionOutcome::found(
            self.kind(),
            DownloadRef::Package {
                pdf_url: Some(render_pdf_url(&pmcid)),
                handle: pmcid,
                full_text,
            },
            confidence,
            FoundMetadata::default(),
        )
    }
}

/// Finds a PMCID in a URL or free text and returns it in canonical `PMC1234` form.
pub fn extract_pmcid(text: &str) -> Option<String> {
    PMCID_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("PMC{}", m.as_str()))
}

pub fn render_pdf_url(pmcid: &str) -> String {
    format!("{EPMC_RENDER}?accid={pmcid}&blobtype=pdf")
}

fn pmcid_from_idconv(body: &serde_json::Value) -> Option<String> {
    body["records"]
        .as_array()?
        .iter()
        .filter(|r| r["status"].as_str() != Some("error"))
        .find_map(|r| r["pmcid"].as_str())
        .and_then(extract_pmcid)
}

// ── JATS body extraction ─────────────────────────────────────────────────────

/// Plain text of the `<body>` element, one line per paragraph or heading.
fn extract_body_text(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut text = String::new();
    let mut body_depth = 0usize;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"body" || body_depth > 0 {
                    body_depth += 1;
                }
            }
            Ok(Event::Text(ref e)) if body_depth > 0 => {
                let fragment = e.unescape().unwrap_or_default();
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push(' ');
                }
                text.push_str(fragment.trim());
            }
            Ok(Event::End(ref e)) if body_depth > 0 => {
                body_depth -= 1;
                if matches!(e.name().as_ref(), b"p" | b"title" | b"sec" | b"body") && !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("JATS parse error: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_pmcid_from_urls() {
        assert_eq!(
            extract_pmcid("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC3531190/").as_deref(),
            Some("PMC3531190")
        );
        assert_eq!(extract_pmcid("pmc123456").as_deref(), Some("PMC123456"));
        assert_eq!(extract_pmcid("https://example.org/paper.pdf"), None);
    }

    #[test]
    fn test_idconv_parsing() {
        let ok = serde_json::json!({
            "status": "ok",
            "records": [{ "pmcid": "PMC3531190", "pmid": "23193287" }]
        });
        assert_eq!(pmcid_from_idconv(&ok).as_deref(), Some("PMC3531190"));

        let missing = serde_json::json!({
            "status": "ok",
            "records": [{ "pmid": "1", "status": "error", "errmsg": "invalid article id" }]
        });
        assert_eq!(pmcid_from_idconv(&missing), None);
    }

    #[test]
    fn test_body_text_skips_front_matter() {
        let xml = r#"<article>
            <front><article-meta><title-group><article-title>Front title</article-title></title-group></article-meta></front>
            <body>
              <sec><title>Introduction</title><p>KRAS is <italic>frequently</italic> mutated &amp; studied.</p></sec>
              <sec><title>Methods</title><p>We did things.</p></sec>
            </body>
        </article>"#;
        let text = extract_body_text(xml).unwrap();
        assert!(!text.contains("Front title"));
        assert!(text.starts_with("Introduction\n"));
        assert!(text.contains("KRAS is frequently mutated & studied."));
        assert!(text.contains("We did things."));
    }

    #[test]
    fn test_body_text_absent() {
        assert_eq!(extract_body_text("<article><front/></article>"), None);
    }

    #[test]
    fn test_skip_without_lookup_ids() {
        let resolver = PmcResolver::new(PoliteClient::with_defaults().unwrap(), None);
        assert!(resolver.skip_reason(&IdentifierSet::new(1).with_title("T")).is_some());
        assert!(resolver
            .skip_reason(&IdentifierSet::new(1).with_known_url("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC3531190/"))
            .is_none());
    }

    #[tokio::test]
    #[ignore = "Hits external NCBI and Europe PMC APIs"]
    async fn test_live_pmid_lookup() {
        let resolver = PmcResolver::new(PoliteClient::with_defaults().unwrap(), None);
        let ids = IdentifierSet::new(1).with_pmid("23193287");
        assert!(resolver.resolve(&ids, Duration::from_secs(30)).await.is_found());
    }
}
