//! Scripted resolvers, fetchers and catalogs.

use anyhow::bail;
use async_trait::async_trait;
use litfetch_acquire::{
    CatalogEntry, CatalogGateway, DocumentMeta, DownloadRef, FetchError, FetchErrorKind,
    FetchResult, FetchVia, Fetcher, FoundMetadata, InMemoryCatalog, ResolutionOutcome, Resolver,
    SourceKind,
};
use litfetch_common::{IdentifierField, IdentifierSet};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ── Resolver ─────────────────────────────────────────────────────────────────

/// Returns a fixed outcome and counts how often it ran.
pub struct MockResolver {
    kind: SourceKind,
    outcome: ResolutionOutcome,
    requires: Vec<IdentifierField>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn new(kind: SourceKind, outcome: ResolutionOutcome) -> Self {
        Self { kind, outcome, requires: Vec::new(), delay: None, calls: AtomicUsize::new(0) }
    }

    /// `Found` with a plain URL.
    pub fn found(kind: SourceKind, url: &str) -> Self {
        Self::new(kind, ResolutionOutcome::found(kind, DownloadRef::url(url), 0.8, FoundMetadata::default()))
    }

    pub fn found_with(kind: SourceKind, download_ref: DownloadRef, metadata: FoundMetadata) -> Self {
        Self::new(kind, ResolutionOutcome::found(kind, download_ref, 0.8, metadata))
    }

    pub fn not_found(kind: SourceKind) -> Self {
        Self::new(kind, ResolutionOutcome::not_found(kind))
    }

    pub fn failing(kind: SourceKind, detail: &str) -> Self {
        Self::new(kind, ResolutionOutcome::error(kind, detail))
    }

    /// Skip, as the real resolver would, when `field` is missing.
    pub fn requiring(mut self, field: IdentifierField) -> Self {
        self.requires.push(field);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String> {
        self.requires
            .iter()
            .find(|f| !ids.has(**f))
            .map(|f| format!("requires {}", f.as_str()))
    }

    async fn resolve(&self, _ids: &IdentifierSet, _timeout: Duration) -> ResolutionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }
}

// ── Fetcher ──────────────────────────────────────────────────────────────────

enum Script {
    Always(Result<FetchResult, FetchError>),
    /// Consumed front to back; the last entry repeats.
    Sequence(Vec<Result<FetchResult, FetchError>>),
}

/// Serves canned responses keyed by the PDF URL of the download reference.
/// Unknown URLs fail with `Unusable`.
#[derive(Default)]
pub struct MockFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serving(self, url: &str, bytes: Vec<u8>, content_type: &str) -> Self {
        let result = FetchResult {
            bytes,
            content_type: Some(content_type.to_string()),
            via: FetchVia::Http,
            source_url: url.to_string(),
        };
        self.script(url, Script::Always(Ok(result)))
    }

    pub fn pdf(self, url: &str, bytes: Vec<u8>) -> Self {
        self.serving(url, bytes, "application/pdf")
    }

    pub fn failing(self, url: &str, kind: FetchErrorKind, detail: &str) -> Self {
        self.script(url, Script::Always(Err(FetchError::new(kind, detail))))
    }

    /// Successive calls for `url` get successive results.
    pub fn sequence(self, url: &str, results: Vec<Result<FetchResult, FetchError>>) -> Self {
        self.script(url, Script::Sequence(results))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn script(self, url: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
        self
    }

    fn next_result(&self, url: &str) -> Result<FetchResult, FetchError> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(Script::Always(result)) => result.clone(),
            Some(Script::Sequence(results)) if results.len() > 1 => results.remove(0),
            Some(Script::Sequence(results)) => results
                .first()
                .cloned()
                .unwrap_or_else(|| Err(FetchError::new(FetchErrorKind::Unusable, "empty script"))),
            None => Err(FetchError::new(FetchErrorKind::Unusable, format!("HTTP 404 from {url}"))),
        }
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        download_ref: &DownloadRef,
        _prefer_browser: bool,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let Some(url) = download_ref.pdf_url() else {
            return Err(FetchError::new(FetchErrorKind::Unusable, "no PDF location"));
        };
        self.requests.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(FetchError::cancelled());
        }
        self.next_result(url)
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// In-memory catalog whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyCatalog {
    inner: InMemoryCatalog,
    fail_pdf_path: bool,
    fail_full_text: bool,
    fail_doi: bool,
    doi_writes: AtomicUsize,
}

impl FlakyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_pdf_path(mut self) -> Self {
        self.fail_pdf_path = true;
        self
    }

    pub fn failing_full_text(mut self) -> Self {
        self.fail_full_text = true;
        self
    }

    pub fn failing_doi(mut self) -> Self {
        self.fail_doi = true;
        self
    }

    pub async fn insert(&self, doc_id: i64, meta: DocumentMeta) {
        self.inner.insert(doc_id, meta).await;
    }

    pub async fn entry(&self, doc_id: i64) -> Option<CatalogEntry> {
        self.inner.entry(doc_id).await
    }

    pub async fn snapshot(&self) -> BTreeMap<i64, CatalogEntry> {
        self.inner.snapshot().await
    }

    /// Calls to `update_doi`, successful or not.
    pub fn doi_writes(&self) -> usize {
        self.doi_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogGateway for FlakyCatalog {
    async fn get_document(&self, doc_id: i64) -> anyhow::Result<Option<DocumentMeta>> {
        self.inner.get_document(doc_id).await
    }

    async fn update_pdf_path(&self, doc_id: i64, relative_path: &str) -> anyhow::Result<bool> {
        if self.fail_pdf_path {
            bail!("database is locked");
        }
        self.inner.update_pdf_path(doc_id, relative_path).await
    }

    async fn update_doi(&self, doc_id: i64, doi: &str) -> anyhow::Result<bool> {
        self.doi_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_doi {
            bail!("database is locked");
        }
        self.inner.update_doi(doc_id, doi).await
    }

    async fn update_full_text(&self, doc_id: i64, text: &str) -> anyhow::Result<bool> {
        if self.fail_full_text {
            bail!("database is locked");
        }
        self.inner.update_full_text(doc_id, text).await
    }
}
