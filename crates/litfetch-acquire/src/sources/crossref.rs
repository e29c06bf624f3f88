//! CrossRef bibliographic search: finds a DOI for a document known only by title.
//!
//! API: https://api.crossref.org/works?query.bibliographic=...
//! Polite pool: a mailto parameter is sent when a contact email is configured.

use async_trait::async_trait;
use litfetch_common::{IdentifierField, IdentifierSet, PoliteClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{get_with_retry, requires, Resolver};
use crate::models::{DownloadRef, FoundMetadata, ResolutionOutcome, SourceKind};
use crate::similarity::title_similarity;

const CR_SEARCH_URL: &str = "https://api.crossref.org/works";
const CANDIDATE_ROWS: usize = 5;

/// One search hit from a bibliographic index.
#[derive(Debug, Clone, PartialEq)]
pub struct TitleCandidate {
    pub doi: String,
    pub title: String,
    pub year: Option<i32>,
}

/// Title search backend. CrossRef in production, a stub in tests.
#[async_trait]
pub trait TitleIndex: Send + Sync {
    async fn search(&self, title: &str, rows: usize, timeout: Duration) -> Result<Vec<TitleCandidate>, String>;
}

pub struct CrossRefIndex {
    client: PoliteClient,
    mailto: Option<String>,
}

impl CrossRefIndex {
    pub fn new(client: PoliteClient, mailto: Option<String>) -> Self {
        Self { client, mailto }
    }
}

#[async_trait]
impl TitleIndex for CrossRefIndex {
    #[instrument(skip(self))]
    async fn search(&self, title: &str, rows: usize, timeout: Duration) -> Result<Vec<TitleCandidate>, String> {
        let rows = rows.to_string();
        let mut query = vec![
            ("query.bibliographic", title),
            ("rows", rows.as_str()),
            ("select", "DOI,title,published,issued"),
        ];
        if let Some(mailto) = self.mailto.as_deref() {
            query.push(("mailto", mailto));
        }

        let resp = get_with_retry(&self.client, CR_SEARCH_URL, &query, timeout).await?;
        if !resp.status().is_success() {
            return Err(format!("CrossRef returned HTTP {}", resp.status()));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| format!("invalid CrossRef response: {e}"))?;
        let items = body["message"]["items"].as_array().cloned().unwrap_or_default();
        debug!(n = items.len(), "CrossRef search results");
        Ok(items.iter().filter_map(work_to_candidate).collect())
    }
}

pub struct CrossRefTitleResolver {
    index: Arc<dyn TitleIndex>,
    min_similarity: f64,
}

impl CrossRefTitleResolver {
    pub fn new(index: Arc<dyn TitleIndex>, min_similarity: f64) -> Self {
        Self { index, min_similarity }
    }
}

#[async_trait]
impl Resolver for CrossRefTitleResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::CrossRefTitle
    }

    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String> {
        if ids.doi().is_some() {
            return Some("DOI already known".to_string());
        }
        (ids.title().is_none()).then(|| requires(IdentifierField::Title))
    }

    #[instrument(skip(self, ids), fields(doc_id = ids.doc_id()))]
    async fn resolve(&self, ids: &IdentifierSet, timeout: Duration) -> ResolutionOutcome {
        let Some(title) = ids.title() else {
            return ResolutionOutcome::skipped(self.kind(), requires(IdentifierField::Title));
        };

        let candidates = match self.index.search(title, CANDIDATE_ROWS, timeout).await {
            Ok(c) => c,
            Err(e) => return ResolutionOutcome::error(self.kind(), e),
        };

        match best_match(&candidates, title, ids.year(), self.min_similarity) {
            Some((candidate, score)) => {
                debug!(doi = %candidate.doi, score, "CrossRef title match");
                ResolutionOutcome::found(
                    self.kind(),
                    DownloadRef::url(format!("https://doi.org/{}", candidate.doi)),
                    score,
                    FoundMetadata {
                        discovered_doi: Some(candidate.doi.clone()),
                        ..FoundMetadata::default()
                    },
                )
            }
            None => ResolutionOutcome::not_found(self.kind()),
        }
    }
}

/// Highest-scoring candidate at or above `min_similarity`.
/// Candidates published more than a year away from the known year are ignored.
pub fn best_match<'a>(
    candidates: &'a [TitleCandidate],
    title: &str,
    year: Option<i32>,
    min_similarity: f64,
) -> Option<(&'a TitleCandidate, f64)> {
    candidates
        .iter()
        .filter(|c| match (year, c.year) {
            (Some(expected), Some(actual)) => (expected - actual).abs() <= 1,
            _ => true,
        })
        .map(|c| (c, title_similarity(title, &c.title)))
        .filter(|(_, score)| *score >= min_similarity)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

// ── Conversion ─────────────────────────────────────────────────────────────

fn work_to_candidate(work: &serde_json::Value) -> Option<TitleCandidate> {
    let doi = litfetch_common::identifiers::normalise_doi(work["DOI"].as_str()?)?;

    let title = work["title"]
        .as_array()
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())?
        .to_string();

    let year = ["published", "issued"].iter().find_map(|key| {
        work[*key]["date-parts"]
            .as_array()
            .and_then(|dp| dp.first())
            .and_then(|dp| dp.as_array())
            .and_then(|parts| parts.first()?.as_i64())
            .map(|y| y as i32)
    });

    Some(TitleCandidate { doi, title, year })
}
