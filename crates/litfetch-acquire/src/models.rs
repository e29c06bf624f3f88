//! Data models shared by resolvers, the fetcher and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Where a download reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "crossref_title")]
    CrossRefTitle,
    #[serde(rename = "pmc")]
    Pmc,
    #[serde(rename = "unpaywall")]
    Unpaywall,
    #[serde(rename = "doi_redirect")]
    DoiRedirect,
    #[serde(rename = "direct_url")]
    DirectUrl,
    #[serde(rename = "openathens_proxy")]
    OpenAthensProxy,
    /// Synthetic source reported when the whole chain is exhausted.
    #[serde(rename = "chain")]
    Chain,
}

impl SourceKind {
    /// Default resolver order, open-access sources before subscription routes.
    pub const PRIORITY: [SourceKind; 6] = [
        SourceKind::CrossRefTitle,
        SourceKind::Pmc,
        SourceKind::Unpaywall,
        SourceKind::DoiRedirect,
        SourceKind::DirectUrl,
        SourceKind::OpenAthensProxy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::CrossRefTitle   => "crossref_title",
            SourceKind::Pmc             => "pmc",
            SourceKind::Unpaywall       => "unpaywall",
            SourceKind::DoiRedirect     => "doi_redirect",
            SourceKind::DirectUrl       => "direct_url",
            SourceKind::OpenAthensProxy => "openathens_proxy",
            SourceKind::Chain           => "chain",
        }
    }

    /// Name shown in progress messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            SourceKind::CrossRefTitle   => "CrossRef",
            SourceKind::Pmc             => "PubMed Central",
            SourceKind::Unpaywall       => "Unpaywall",
            SourceKind::DoiRedirect     => "DOI resolver",
            SourceKind::DirectUrl       => "known URL",
            SourceKind::OpenAthensProxy => "OpenAthens proxy",
            SourceKind::Chain           => "resolver chain",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::PRIORITY
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown resolver: {s}"))
    }
}

/// Something the fetcher can turn into bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadRef {
    Url { url: String },
    /// An archive-specific handle (e.g. a PMCID) with an optional PDF rendition
    /// and optional inline full text.
    Package {
        handle: String,
        pdf_url: Option<String>,
        full_text: Option<String>,
    },
}

impl DownloadRef {
    pub fn url(url: impl Into<String>) -> Self {
        DownloadRef::Url { url: url.into() }
    }

    /// A reference that cannot yield any content.
    pub fn is_blank(&self) -> bool {
        match self {
            DownloadRef::Url { url } => url.trim().is_empty(),
            DownloadRef::Package { handle, pdf_url, full_text } => {
                handle.trim().is_empty()
                    || (pdf_url.as_deref().is_none_or(|u| u.trim().is_empty())
                        && full_text.as_deref().is_none_or(|t| t.trim().is_empty()))
            }
        }
    }

    /// The location a PDF should be downloaded from, if any.
    pub fn pdf_url(&self) -> Option<&str> {
        match self {
            DownloadRef::Url { url } => Some(url.as_str()),
            DownloadRef::Package { pdf_url, .. } => pdf_url.as_deref().filter(|u| !u.trim().is_empty()),
        }
    }

    /// Full text delivered alongside the reference.
    pub fn inline_text(&self) -> Option<&str> {
        match self {
            DownloadRef::Url { .. } => None,
            DownloadRef::Package { full_text, .. } => full_text.as_deref().filter(|t| !t.trim().is_empty()),
        }
    }
}

impl fmt::Display for DownloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadRef::Url { url } => f.write_str(url),
            DownloadRef::Package { handle, pdf_url, .. } => match pdf_url {
                Some(pdf) => write!(f, "{handle} ({pdf})"),
                None => write!(f, "{handle} (text only)"),
            },
        }
    }
}

/// Extra facts a resolver learned on the way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoundMetadata {
    pub discovered_doi: Option<String>,
    /// The location only works in a real browser session (proxy login, SSO).
    pub prefer_browser: bool,
    pub note: Option<String>,
}

/// Result of asking one resolver about one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Found {
        source: SourceKind,
        download_ref: DownloadRef,
        confidence: f64,
        metadata: FoundMetadata,
    },
    NotFound { source: SourceKind },
    Error { source: SourceKind, detail: String },
    Skipped { source: SourceKind, reason: String },
}

impl ResolutionOutcome {
    /// Builds a `Found`, degrading to `NotFound` when the reference is empty.
    pub fn found(
        source: SourceKind,
        download_ref: DownloadRef,
        confidence: f64,
        metadata: FoundMetadata,
    ) -> Self {
        if download_ref.is_blank() {
            warn!(source = %source, "Resolver produced an empty download reference, treating as not found");
            return ResolutionOutcome::NotFound { source };
        }
        ResolutionOutcome::Found {
            source,
            download_ref,
            confidence: confidence.clamp(0.0, 1.0),
            metadata,
        }
    }

    pub fn not_found(source: SourceKind) -> Self {
        ResolutionOutcome::NotFound { source }
    }

    pub fn error(source: SourceKind, detail: impl Into<String>) -> Self {
        ResolutionOutcome::Error { source, detail: detail.into() }
    }

    pub fn skipped(source: SourceKind, reason: impl Into<String>) -> Self {
        ResolutionOutcome::Skipped { source, reason: reason.into() }
    }

    pub fn source(&self) -> SourceKind {
        match self {
            ResolutionOutcome::Found { source, .. }
            | ResolutionOutcome::NotFound { source }
            | ResolutionOutcome::Error { source, .. }
            | ResolutionOutcome::Skipped { source, .. } => *source,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ResolutionOutcome::Found { .. })
    }

    /// One-line summary for logs and progress.
    pub fn describe(&self) -> String {
        match self {
            ResolutionOutcome::Found { source, download_ref, confidence, .. } => {
                format!("{}: found {download_ref} (confidence {confidence:.2})", source.display_name())
            }
            ResolutionOutcome::NotFound { source } => format!("{}: not found", source.display_name()),
            ResolutionOutcome::Error { source, detail } => format!("{}: error ({detail})", source.display_name()),
            ResolutionOutcome::Skipped { source, reason } => format!("{}: skipped ({reason})", source.display_name()),
        }
    }
}

/// Every non-`Found` outcome of a chain run, in the order resolvers were tried.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptLog {
    entries: Vec<ResolutionOutcome>,
}

impl AttemptLog {
    pub fn push(&mut self, outcome: ResolutionOutcome) {
        self.entries.push(outcome);
    }

    pub fn entries(&self) -> &[ResolutionOutcome] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn skipped(&self) -> Vec<SourceKind> {
        self.entries
            .iter()
            .filter(|o| matches!(o, ResolutionOutcome::Skipped { .. }))
            .map(ResolutionOutcome::source)
            .collect()
    }

    pub fn errors(&self) -> impl Iterator<Item = (SourceKind, &str)> {
        self.entries.iter().filter_map(|o| match o {
            ResolutionOutcome::Error { source, detail } => Some((*source, detail.as_str())),
            _ => None,
        })
    }

    /// True when resolvers that actually ran all failed with errors.
    /// Skipped entries do not count either way.
    pub fn only_errors(&self) -> bool {
        let mut ran = self
            .entries
            .iter()
            .filter(|o| !matches!(o, ResolutionOutcome::Skipped { .. }))
            .peekable();
        ran.peek().is_some() && ran.all(|o| matches!(o, ResolutionOutcome::Error { .. }))
    }

    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(ResolutionOutcome::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchVia {
    Http,
    Browser,
}

/// Raw bytes obtained from a download reference.
#[derive(Clone, PartialEq)]
pub struct FetchResult {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub via: FetchVia,
    /// Final URL after redirects.
    pub source_url: String,
}

impl fmt::Debug for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResult")
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .field("content_type", &self.content_type)
            .field("via", &self.via)
            .field("source_url", &self.source_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub accepted: bool,
    pub warnings: Vec<String>,
    pub similarity_score: f64,
    /// Best guess at the downloaded document's own title, for review prompts.
    pub detected_title: Option<String>,
}

impl VerificationResult {
    pub fn accept(similarity_score: f64) -> Self {
        Self { accepted: true, warnings: Vec::new(), similarity_score, detected_title: None }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self { accepted: false, warnings: vec![reason.into()], similarity_score: 0.0, detected_title: None }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// A stored PDF and how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    pub doc_id: i64,
    /// Absolute location on disk.
    pub file_path: PathBuf,
    /// Location relative to the storage base, as written to the catalog.
    pub relative_path: String,
    /// Hex sha256 of the file contents.
    pub file_hash: String,
    /// `None` when the file predates this run.
    pub source: Option<SourceKind>,
    pub verified: bool,
    pub full_text: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_round_trips_config_names() {
        for kind in SourceKind::PRIORITY {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("chain".parse::<SourceKind>().is_err());
        assert!("scihub".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_blank_refs_degrade_to_not_found() {
        let outcome = ResolutionOutcome::found(SourceKind::Unpaywall, DownloadRef::url("  "), 0.9, FoundMetadata::default());
        assert_eq!(outcome, ResolutionOutcome::not_found(SourceKind::Unpaywall));

        let empty_package = DownloadRef::Package { handle: "PMC1".into(), pdf_url: None, full_text: Some(" ".into()) };
        assert!(empty_package.is_blank());
    }

    #[test]
    fn test_text_only_package_is_not_blank() {
        let package = DownloadRef::Package { handle: "PMC1".into(), pdf_url: None, full_text: Some("Body".into()) };
        assert!(!package.is_blank());
        assert_eq!(package.pdf_url(), None);
        assert_eq!(package.inline_text(), Some("Body"));
    }

    #[test]
    fn test_confidence_is_clamped() {
        match ResolutionOutcome::found(SourceKind::DirectUrl, DownloadRef::url("https://x.org/a.pdf"), 1.7, FoundMetadata::default()) {
            ResolutionOutcome::Found { confidence, .. } => assert_eq!(confidence, 1.0),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn test_only_errors_ignores_skips() {
        let mut log = AttemptLog::default();
        log.push(ResolutionOutcome::skipped(SourceKind::CrossRefTitle, "requires title"));
        assert!(!log.only_errors());
        log.push(ResolutionOutcome::error(SourceKind::Pmc, "HTTP 503"));
        log.push(ResolutionOutcome::error(SourceKind::Unpaywall, "timed out"));
        assert!(log.only_errors());
        log.push(ResolutionOutcome::not_found(SourceKind::DoiRedirect));
        assert!(!log.only_errors());
        assert_eq!(log.skipped(), vec![SourceKind::CrossRefTitle]);
        assert_eq!(log.errors().count(), 2);
    }
}
