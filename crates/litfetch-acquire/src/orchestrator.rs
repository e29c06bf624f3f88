//! Acquisition orchestrator.
//!
//! Drives one document through the stages
//!   Idle → Resolving → Fetching → Verifying → Persisting | Rejected → Done
//!
//! A failed fetch or a rejected download sends the run back to the resolver
//! chain, which resumes after the resolver that produced it. Every
//! per-document failure ends in an [`AcquisitionReport`]; only [`FatalError`]
//! (unusable storage, missing document, broken configuration) is returned as
//! `Err`.
//!
//! At most one run per `doc_id` is in flight. A second caller for the same
//! document joins the running acquisition and receives the same report.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use litfetch_common::{HttpSettings, IdentifierSet, PoliteClient, BROWSER_USER_AGENT};
use litfetch_config::{AcquisitionConfig, AcquisitionMode, Config};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::CatalogGateway;
use crate::chain::{ChainCursor, ResolverChain};
use crate::error::{FatalError, FetchError, FetchErrorKind};
use crate::fetcher::{FallbackFetcher, Fetcher};
use crate::models::{
    AcquisitionRecord, AttemptLog, DownloadRef, FetchResult, ResolutionOutcome, SourceKind,
    VerificationResult,
};
use crate::pdf_parser::extract_full_text;
use crate::progress::{ProgressReporter, Stage};
use crate::storage::{content_hash, StorageLayout};
use crate::verifier::ContentVerifier;

// ── Requests & results ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub identifiers: IdentifierSet,
    /// Re-acquire even when the catalog already points at a file on disk.
    pub force: bool,
    /// Overrides the configured mode for this run.
    pub mode: Option<AcquisitionMode>,
}

impl AcquisitionRequest {
    pub fn new(identifiers: IdentifierSet) -> Self {
        Self { identifiers, force: false, mode: None }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_mode(mut self, mode: AcquisitionMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// A download that failed verification, with what is needed to review it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MismatchReview {
    pub source: SourceKind,
    pub source_url: String,
    pub expected_title: Option<String>,
    pub verification: VerificationResult,
    /// Where the rejected file was kept; `None` when it was discarded.
    pub quarantined: Option<AcquisitionRecord>,
}

/// A location that resolved but could not be downloaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchFailure {
    pub source: SourceKind,
    pub location: String,
    pub error: FetchError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcquisitionOutcome {
    Acquired { record: AcquisitionRecord },
    /// The catalog already pointed at a file on disk; nothing was downloaded.
    AlreadyPresent { record: AcquisitionRecord },
    /// The file is on disk but at least one catalog write failed.
    DownloadedNotRecorded { record: AcquisitionRecord, failures: Vec<String> },
    /// No PDF could be obtained, but a resolver supplied the full text.
    FullTextOnly { source: SourceKind, recorded: bool },
    /// Every download that arrived failed verification. Best match first.
    Mismatch { reviews: Vec<MismatchReview> },
    AccessDenied { detail: String },
    NotFound,
    RetriableFailure { detail: String },
    Cancelled,
}

/// Failure classes shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    AccessDenied,
    TransientNetwork,
    VerificationMismatch,
    CatalogWriteFailure,
}

impl AcquisitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionOutcome::Acquired { .. }              => "acquired",
            AcquisitionOutcome::AlreadyPresent { .. }        => "already_present",
            AcquisitionOutcome::DownloadedNotRecorded { .. } => "downloaded_not_recorded",
            AcquisitionOutcome::FullTextOnly { .. }          => "full_text_only",
            AcquisitionOutcome::Mismatch { .. }              => "mismatch",
            AcquisitionOutcome::AccessDenied { .. }          => "access_denied",
            AcquisitionOutcome::NotFound                     => "not_found",
            AcquisitionOutcome::RetriableFailure { .. }      => "retriable_failure",
            AcquisitionOutcome::Cancelled                    => "cancelled",
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            AcquisitionOutcome::Acquired { .. }
            | AcquisitionOutcome::AlreadyPresent { .. }
            | AcquisitionOutcome::FullTextOnly { .. }
            | AcquisitionOutcome::Cancelled => None,
            AcquisitionOutcome::DownloadedNotRecorded { .. } => Some(ErrorClass::CatalogWriteFailure),
            AcquisitionOutcome::Mismatch { .. }              => Some(ErrorClass::VerificationMismatch),
            AcquisitionOutcome::AccessDenied { .. }          => Some(ErrorClass::AccessDenied),
            AcquisitionOutcome::NotFound                     => Some(ErrorClass::NotFound),
            AcquisitionOutcome::RetriableFailure { .. }      => Some(ErrorClass::TransientNetwork),
        }
    }

    /// The stored PDF, if this run left one at the canonical location.
    pub fn record(&self) -> Option<&AcquisitionRecord> {
        match self {
            AcquisitionOutcome::Acquired { record }
            | AcquisitionOutcome::AlreadyPresent { record }
            | AcquisitionOutcome::DownloadedNotRecorded { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Final result of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionReport {
    pub doc_id: i64,
    pub outcome: AcquisitionOutcome,
    /// `Done`, or `Rejected` when the run ended on a verification mismatch.
    pub final_stage: Stage,
    /// Last working stage the run entered before finishing.
    pub last_active_stage: Stage,
    pub attempts: AttemptLog,
    pub fetch_failures: Vec<FetchFailure>,
    pub discovered_doi: Option<String>,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

impl AcquisitionReport {
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            AcquisitionOutcome::Acquired { .. } | AcquisitionOutcome::AlreadyPresent { .. }
        )
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.outcome.error_class()
    }

    /// One-paragraph summary for the person who asked for the document.
    pub fn user_message(&self) -> String {
        match &self.outcome {
            AcquisitionOutcome::Acquired { record } => {
                format!("Downloaded full text to {}.", record.relative_path)
            }
            AcquisitionOutcome::AlreadyPresent { record } => {
                format!("Full text is already in the library at {}.", record.relative_path)
            }
            AcquisitionOutcome::DownloadedNotRecorded { record, failures } => format!(
                "Downloaded full text to {}, but the library record could not be updated ({}). \
                 The file is kept; re-run the acquisition to record it.",
                record.relative_path,
                failures.join("; ")
            ),
            AcquisitionOutcome::FullTextOnly { source, recorded: true } => format!(
                "No PDF could be downloaded, but the full text was saved from {}.",
                source.display_name()
            ),
            AcquisitionOutcome::FullTextOnly { source, recorded: false } => format!(
                "No PDF could be downloaded. {} supplied the full text, but it could not be saved.",
                source.display_name()
            ),
            AcquisitionOutcome::Mismatch { reviews } => {
                let Some(best) = reviews.first() else {
                    return "The downloaded file did not match the expected document.".to_string();
                };
                let expected = best.expected_title.as_deref().unwrap_or("(no title on record)");
                let detected = best.verification.detected_title.as_deref().unwrap_or("(no readable title)");
                let kept = match &best.quarantined {
                    Some(q) => format!(
                        " It was set aside at {}; accept it to file it anyway, or discard it.",
                        q.relative_path
                    ),
                    None => " It was discarded.".to_string(),
                };
                format!(
                    "The file from {} does not look like the expected document.\n  \
                     expected: {expected}\n  downloaded: {detected} (similarity {:.2}).{kept}",
                    best.source.display_name(),
                    best.verification.similarity_score,
                )
            }
            AcquisitionOutcome::AccessDenied { .. } => {
                "The publisher refused access to the full text. It may require a subscription; \
                 try again through your institution's network or proxy (OpenAthens)."
                    .to_string()
            }
            AcquisitionOutcome::NotFound => {
                "No source offered a downloadable full text for this document.".to_string()
            }
            AcquisitionOutcome::RetriableFailure { detail } => {
                format!("Full-text sources could not be reached ({detail}). Please try again later.")
            }
            AcquisitionOutcome::Cancelled => "Acquisition was cancelled.".to_string(),
        }
    }
}

// ── Per-run state ────────────────────────────────────────────────────────────

struct Run {
    doc_id: i64,
    started: Instant,
    stage: Stage,
    progress: ProgressReporter,
    fetch_failures: Vec<FetchFailure>,
    mismatches: Vec<MismatchReview>,
    warnings: Vec<String>,
    discovered_doi: Option<String>,
    /// Inline full text from the first resolver that offered one.
    text_fallback: Option<(SourceKind, String)>,
    timed_out: bool,
}

impl Run {
    fn new(doc_id: i64, progress: ProgressReporter) -> Self {
        Self {
            doc_id,
            started: Instant::now(),
            stage: Stage::Idle,
            progress,
            fetch_failures: Vec::new(),
            mismatches: Vec::new(),
            warnings: Vec::new(),
            discovered_doi: None,
            text_fallback: None,
            timed_out: false,
        }
    }

    fn enter(&mut self, stage: Stage, status: impl Into<String>) {
        self.stage = stage;
        self.progress.emit(stage, status);
    }

    fn finish(mut self, outcome: AcquisitionOutcome, attempts: AttemptLog) -> AcquisitionReport {
        let final_stage = match outcome {
            AcquisitionOutcome::Mismatch { .. } => Stage::Rejected,
            _ => Stage::Done,
        };
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let mut report = AcquisitionReport {
            doc_id: self.doc_id,
            outcome,
            final_stage,
            last_active_stage: self.stage,
            attempts,
            fetch_failures: std::mem::take(&mut self.fetch_failures),
            discovered_doi: self.discovered_doi.take(),
            warnings: std::mem::take(&mut self.warnings),
            elapsed_ms,
        };
        report.warnings.dedup();
        info!(
            doc_id = report.doc_id,
            outcome = report.outcome.as_str(),
            last_stage = %report.last_active_stage,
            attempts = report.attempts.len(),
            fetch_failures = report.fetch_failures.len(),
            elapsed_ms,
            "Acquisition finished"
        );
        self.progress.emit(final_stage, report.user_message());
        report
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

type RunFuture = Shared<BoxFuture<'static, Result<AcquisitionReport, FatalError>>>;

struct Inner {
    config: AcquisitionConfig,
    chain: ResolverChain,
    fetcher: Arc<dyn Fetcher>,
    verifier: ContentVerifier,
    storage: StorageLayout,
    catalog: Arc<dyn CatalogGateway>,
}

/// Cheap to clone; clones share the in-flight map.
#[derive(Clone)]
pub struct AcquisitionOrchestrator {
    inner: Arc<Inner>,
    in_flight: Arc<Mutex<HashMap<i64, RunFuture>>>,
}

impl AcquisitionOrchestrator {
    /// Fails when the storage directory cannot be created or written.
    pub fn new(
        config: AcquisitionConfig,
        chain: ResolverChain,
        fetcher: Arc<dyn Fetcher>,
        storage: StorageLayout,
        catalog: Arc<dyn CatalogGateway>,
    ) -> Result<Self, FatalError> {
        storage.ensure_ready()?;
        let verifier = ContentVerifier::from_config(&config);
        info!(
            base_dir = %storage.base_dir().display(),
            resolvers = ?chain.order(),
            mode = ?config.mode,
            "Acquisition orchestrator ready"
        );
        Ok(Self {
            inner: Arc::new(Inner { config, chain, fetcher, verifier, storage, catalog }),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Production wiring: shared polite HTTP client, default resolvers and
    /// the HTTP/browser fetcher.
    pub fn from_config(config: &Config, catalog: Arc<dyn CatalogGateway>) -> Result<Self, FatalError> {
        let settings = HttpSettings {
            user_agent: config
                .network
                .user_agent
                .clone()
                .unwrap_or_else(|| BROWSER_USER_AGENT.to_string()),
            requests_per_second: config.network.requests_per_second,
            timeout: config.acquisition.timeout(),
        };
        let client = PoliteClient::new(&settings).map_err(|e| FatalError::Config(e.to_string()))?;
        let chain = ResolverChain::from_config(&config.acquisition, &client)?;
        let fetcher = FallbackFetcher::from_config(&config.acquisition, &client);
        Self::new(
            config.acquisition.clone(),
            chain,
            Arc::new(fetcher),
            StorageLayout::new(&config.storage.base_dir),
            catalog,
        )
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.inner.storage
    }

    /// Number of documents currently being acquired.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.values().filter(|f| f.peek().is_none()).count()
    }

    /// Acquires one document. A concurrent call for the same `doc_id` joins
    /// the running acquisition instead of starting another; progress and
    /// cancellation then belong to the first caller.
    pub async fn acquire(
        &self,
        request: AcquisitionRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionReport, FatalError> {
        let doc_id = request.identifiers.doc_id();
        let run = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&doc_id) {
                Some(running) if running.peek().is_none() => {
                    info!(doc_id, "Acquisition already in flight, joining it");
                    running.clone()
                }
                _ => {
                    let run = self
                        .inner
                        .clone()
                        .run(request, progress.for_doc(doc_id), cancel.clone())
                        .boxed()
                        .shared();
                    in_flight.insert(doc_id, run.clone());
                    run
                }
            }
        };

        let result = run.clone().await;

        let mut in_flight = self.in_flight.lock().await;
        if in_flight.get(&doc_id).is_some_and(|f| f.ptr_eq(&run)) {
            in_flight.remove(&doc_id);
        }
        result
    }

    /// Looks the document up in the catalog and acquires it.
    pub async fn acquire_by_id(
        &self,
        doc_id: i64,
        force: bool,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionReport, FatalError> {
        let meta = self
            .inner
            .catalog
            .get_document(doc_id)
            .await
            .map_err(|e| FatalError::Catalog(format!("{e:#}")))?
            .ok_or(FatalError::UnknownDocument(doc_id))?;
        let mut request = AcquisitionRequest::new(meta.identifiers(doc_id));
        request.force = force;
        self.acquire(request, progress, cancel).await
    }

    /// Files a quarantined download at the canonical location on the
    /// reviewer's say-so. The record stays `verified = false`.
    #[instrument(skip(self, record), fields(doc_id = record.doc_id))]
    pub async fn accept_quarantined(
        &self,
        record: &AcquisitionRecord,
    ) -> Result<AcquisitionOutcome, FatalError> {
        let inner = &self.inner;
        if !inner.storage.is_quarantined(&record.file_path) || !record.file_path.is_file() {
            return Err(FatalError::NotQuarantined(record.file_path.display().to_string()));
        }
        let meta = inner
            .catalog
            .get_document(record.doc_id)
            .await
            .map_err(|e| FatalError::Catalog(format!("{e:#}")))?
            .ok_or(FatalError::UnknownDocument(record.doc_id))?;
        let ids = meta.identifiers(record.doc_id);
        let current = inner.current_pdf(meta.existing_pdf_path.as_deref());
        let target = inner.storage.canonical_path(&ids, current.as_deref());

        let storage = inner.storage.clone();
        let (from, to) = (record.file_path.clone(), target.clone());
        tokio::task::spawn_blocking(move || storage.move_file(&from, &to))
            .await
            .map_err(|e| FatalError::storage(target.display(), e))?
            .map_err(|e| FatalError::storage(target.display(), e))?;
        info!(from = %record.file_path.display(), to = %target.display(), "Quarantined PDF accepted");

        let relative = inner.storage.relative(&target);
        let failures = inner.record_in_catalog(record.doc_id, &relative, None, current.as_deref(), &target).await;
        let accepted = AcquisitionRecord {
            file_path: target,
            relative_path: relative,
            verified: false,
            acquired_at: Utc::now(),
            ..record.clone()
        };
        Ok(if failures.is_empty() {
            AcquisitionOutcome::Acquired { record: accepted }
        } else {
            AcquisitionOutcome::DownloadedNotRecorded { record: accepted, failures }
        })
    }

    /// Rebuilds the record of a file in quarantine, e.g. from a path a
    /// reviewer typed. `stored` may be relative to the storage base.
    pub async fn quarantined_record(&self, doc_id: i64, stored: &str) -> Result<AcquisitionRecord, FatalError> {
        let storage = &self.inner.storage;
        let path = storage.resolve(stored);
        if !storage.is_quarantined(&path) {
            return Err(FatalError::NotQuarantined(path.display().to_string()));
        }
        let sources = SourceKind::PRIORITY.map(|kind| kind.as_str());
        if storage.quarantined_doc_id(&path, sources) != Some(doc_id) {
            return Err(FatalError::QuarantineMismatch { path: storage.relative(&path), doc_id });
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FatalError::storage(path.display(), e))?;
        Ok(AcquisitionRecord {
            doc_id,
            relative_path: storage.relative(&path),
            file_hash: content_hash(&bytes),
            file_path: path,
            source: None,
            verified: false,
            full_text: None,
            acquired_at: Utc::now(),
        })
    }

    /// Files currently awaiting review, as paths relative to the storage base.
    pub async fn quarantined_files(&self) -> Result<Vec<String>, FatalError> {
        let storage = &self.inner.storage;
        let dir = storage.base_dir().join(crate::storage::QUARANTINE_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FatalError::storage(dir.display(), e)),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| FatalError::storage(dir.display(), e))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "pdf") {
                files.push(storage.relative(&path));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Deletes a quarantined download. Already-missing files are fine.
    pub async fn discard_quarantined(&self, record: &AcquisitionRecord) -> Result<(), FatalError> {
        if !self.inner.storage.is_quarantined(&record.file_path) {
            return Err(FatalError::NotQuarantined(record.file_path.display().to_string()));
        }
        match tokio::fs::remove_file(&record.file_path).await {
            Ok(()) => {
                info!(doc_id = record.doc_id, path = %record.file_path.display(), "Quarantined PDF discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FatalError::storage(record.file_path.display(), e)),
        }
    }
}

impl Inner {
    #[instrument(skip_all, fields(doc_id = request.identifiers.doc_id()))]
    async fn run(
        self: Arc<Self>,
        request: AcquisitionRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<AcquisitionReport, FatalError> {
        let mut ids = request.identifiers;
        let doc_id = ids.doc_id();
        let mode = request.mode.unwrap_or(self.config.mode);
        let mut run = Run::new(doc_id, progress);
        info!(doc_id, ids = %ids.label(), ?mode, force = request.force, "Starting acquisition");

        // ── Short-circuit on an existing file ──
        let known_path = match self.catalog.get_document(doc_id).await {
            Ok(meta) => meta.and_then(|m| m.existing_pdf_path),
            Err(e) => {
                warn!(doc_id, error = %e, "Catalog lookup failed, acquiring without it");
                None
            }
        };
        let current = self.current_pdf(known_path.as_deref());
        if let (false, Some(path)) = (request.force, &current) {
            match self.existing_record(doc_id, path).await {
                Ok(record) => {
                    info!(doc_id, path = %record.relative_path, "PDF already present, skipping download");
                    return Ok(run.finish(AcquisitionOutcome::AlreadyPresent { record }, AttemptLog::default()));
                }
                Err(e) => warn!(doc_id, error = %e, "Recorded PDF unreadable, acquiring again"),
            }
        }

        let deadline = run.started + self.config.max_total();
        let mut cursor = ChainCursor::default();
        run.enter(Stage::Resolving, format!("Looking for full text of {}", ids.label()));

        loop {
            if cancel.is_cancelled() {
                return Ok(run.finish(AcquisitionOutcome::Cancelled, cursor.into_log()));
            }
            let now = Instant::now();
            if now >= deadline {
                run.timed_out = true;
                break;
            }

            // ── Resolving ──
            let advanced =
                tokio::time::timeout(deadline - now, self.chain.advance(&mut cursor, &ids, &cancel, &run.progress)).await;
            let outcome = match advanced {
                Ok(outcome) => outcome,
                Err(_) => {
                    run.timed_out = true;
                    break;
                }
            };
            let ResolutionOutcome::Found { source, download_ref, metadata, .. } = outcome else {
                if cancel.is_cancelled() {
                    return Ok(run.finish(AcquisitionOutcome::Cancelled, cursor.into_log()));
                }
                break;
            };

            if let Some(doi) = metadata.discovered_doi.as_deref() {
                self.adopt_doi(&mut run, &mut ids, doi).await;
            }
            if let Some(note) = &metadata.note {
                debug!(doc_id, %source, %note, "Resolver note");
            }
            if let (None, Some(text)) = (&run.text_fallback, download_ref.inline_text()) {
                run.text_fallback = Some((source, text.to_string()));
            }
            if download_ref.pdf_url().is_none() {
                debug!(doc_id, %source, "Text-only result, keeping it as a fallback");
                continue;
            }

            // ── Fetching ──
            run.enter(Stage::Fetching, format!("Downloading from {}", source.display_name()));
            let fetched = match self
                .fetch_with_retry(&download_ref, metadata.prefer_browser, &cancel, deadline, &run.progress)
                .await
            {
                Ok(fetched) => fetched,
                Err(e) if e.kind == FetchErrorKind::Cancelled => {
                    return Ok(run.finish(AcquisitionOutcome::Cancelled, cursor.into_log()));
                }
                Err(e) => {
                    warn!(doc_id, %source, location = %download_ref, error = %e, "Download failed, trying next source");
                    run.fetch_failures.push(FetchFailure { source, location: download_ref.to_string(), error: e });
                    run.enter(Stage::Resolving, "Trying the next source");
                    continue;
                }
            };

            // ── Verifying ──
            run.enter(
                Stage::Verifying,
                format!("Checking the downloaded file ({} KB)", fetched.bytes.len() / 1024),
            );
            let (fetched, verification) = self.verify(fetched, &ids).await;
            if cancel.is_cancelled() {
                return Ok(run.finish(AcquisitionOutcome::Cancelled, cursor.into_log()));
            }

            if verification.accepted {
                // ── Persisting ──
                run.warnings.extend(verification.warnings.iter().cloned());
                run.enter(Stage::Persisting, "Saving the PDF to the library");
                let inline = run.text_fallback.take().map(|(_, text)| text);
                let outcome = self.persist(&ids, source, fetched, inline, current.as_deref()).await?;
                self.drop_superseded_quarantine(&run.mismatches).await;
                return Ok(run.finish(outcome, cursor.into_log()));
            }

            // ── Rejected ──
            run.enter(
                Stage::Rejected,
                format!(
                    "File from {} does not match (similarity {:.2})",
                    source.display_name(),
                    verification.similarity_score
                ),
            );
            let review = self.reject(&ids, source, fetched, verification, mode).await?;
            run.mismatches.push(review);
            run.enter(Stage::Resolving, "Trying the next source");
        }

        let attempts = cursor.into_log();
        let outcome = self.exhausted(&mut run, &attempts).await;
        Ok(run.finish(outcome, attempts))
    }

    /// Absolute path of the catalog's PDF if the file still exists.
    fn current_pdf(&self, stored: Option<&str>) -> Option<PathBuf> {
        let path = self.storage.resolve(stored.filter(|s| !s.trim().is_empty())?);
        path.is_file().then_some(path)
    }

    async fn existing_record(&self, doc_id: i64, path: &Path) -> std::io::Result<AcquisitionRecord> {
        let bytes = tokio::fs::read(path).await?;
        let file_hash = tokio::task::spawn_blocking(move || content_hash(&bytes))
            .await
            .map_err(std::io::Error::other)?;
        Ok(AcquisitionRecord {
            doc_id,
            file_path: path.to_path_buf(),
            relative_path: self.storage.relative(path),
            file_hash,
            source: None,
            verified: true,
            full_text: None,
            acquired_at: Utc::now(),
        })
    }

    /// Enriches the identifiers with a resolver-discovered DOI and records it
    /// in the catalog, once per run.
    async fn adopt_doi(&self, run: &mut Run, ids: &mut IdentifierSet, doi: &str) {
        if ids.doi().is_some() {
            return;
        }
        *ids = ids.with_discovered_doi(doi);
        let Some(doi) = ids.doi().map(str::to_string) else {
            return;
        };
        info!(doc_id = run.doc_id, %doi, "Discovered DOI");
        match self.catalog.update_doi(run.doc_id, &doi).await {
            Ok(true) => {}
            Ok(false) => debug!(doc_id = run.doc_id, "Catalog kept its existing DOI"),
            Err(e) => {
                warn!(doc_id = run.doc_id, error = %e, "Could not record discovered DOI");
                run.warnings.push(format!("discovered DOI {doi} could not be recorded: {e}"));
            }
        }
        run.discovered_doi = Some(doi);
    }

    /// Fetches one location, retrying transient failures with backoff.
    async fn fetch_with_retry(
        &self,
        download_ref: &DownloadRef,
        prefer_browser: bool,
        cancel: &CancellationToken,
        deadline: Instant,
        progress: &ProgressReporter,
    ) -> Result<FetchResult, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self
                .fetcher
                .fetch(download_ref, prefer_browser, self.config.timeout(), cancel)
                .await;
            let err = match result {
                Ok(fetched) => return Ok(fetched),
                Err(e) => e,
            };
            if !err.is_transient() || attempt >= max_attempts {
                return Err(err);
            }
            let delay = self.config.backoff_for(attempt);
            if Instant::now() + delay >= deadline {
                debug!("No time left for another attempt");
                return Err(err);
            }
            warn!(attempt, max_attempts, delay_secs = delay.as_secs(), error = %err, "Transient download failure, retrying");
            progress.emit(
                Stage::Fetching,
                format!("Retrying in {}s (attempt {} of {max_attempts})", delay.as_secs(), attempt + 1),
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Runs the verifier off the async runtime; PDF parsing is CPU-bound.
    async fn verify(&self, fetched: FetchResult, ids: &IdentifierSet) -> (FetchResult, VerificationResult) {
        let fetched = Arc::new(fetched);
        let (verifier, input, ids) = (self.verifier.clone(), fetched.clone(), ids.clone());
        let verification = match tokio::task::spawn_blocking(move || verifier.verify(&input, &ids)).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Verification task failed");
                VerificationResult::reject(format!("verification failed: {e}"))
            }
        };
        let fetched = Arc::try_unwrap(fetched).unwrap_or_else(|shared| (*shared).clone());
        (fetched, verification)
    }

    async fn persist(
        &self,
        ids: &IdentifierSet,
        source: SourceKind,
        fetched: FetchResult,
        inline_text: Option<String>,
        current: Option<&Path>,
    ) -> Result<AcquisitionOutcome, FatalError> {
        let doc_id = ids.doc_id();
        let path = self.storage.canonical_path(ids, current);
        let file_hash = content_hash(&fetched.bytes);

        let full_text = match inline_text {
            Some(text) => Some(text),
            None if self.config.extract_pdf_text => self.extract_text(&fetched.bytes).await,
            None => None,
        };

        self.write_file(&path, fetched.bytes).await?;
        let relative = self.storage.relative(&path);
        info!(doc_id, %source, path = %relative, via = ?fetched.via, "PDF stored");

        let failures = self
            .record_in_catalog(doc_id, &relative, full_text.as_deref(), current, &path)
            .await;
        let record = AcquisitionRecord {
            doc_id,
            file_path: path,
            relative_path: relative,
            file_hash,
            source: Some(source),
            verified: true,
            full_text,
            acquired_at: Utc::now(),
        };
        Ok(if failures.is_empty() {
            AcquisitionOutcome::Acquired { record }
        } else {
            AcquisitionOutcome::DownloadedNotRecorded { record, failures }
        })
    }

    /// Writes the PDF path and full text. Both writes are attempted; the
    /// previous managed file is removed only once the new path is recorded.
    async fn record_in_catalog(
        &self,
        doc_id: i64,
        relative: &str,
        full_text: Option<&str>,
        previous: Option<&Path>,
        stored: &Path,
    ) -> Vec<String> {
        let mut failures = Vec::new();

        let path_recorded = match self.catalog.update_pdf_path(doc_id, relative).await {
            Ok(true) => true,
            Ok(false) => {
                failures.push("the catalog did not accept the PDF path".to_string());
                false
            }
            Err(e) => {
                failures.push(format!("recording the PDF path failed: {e:#}"));
                false
            }
        };

        if let Some(text) = full_text {
            match self.catalog.update_full_text(doc_id, text).await {
                Ok(true) => {}
                Ok(false) => failures.push("the catalog did not accept the full text".to_string()),
                Err(e) => failures.push(format!("recording the full text failed: {e:#}")),
            }
        }

        for failure in &failures {
            warn!(doc_id, %failure, "Catalog write failed");
        }

        if let Some(old) = previous.filter(|old| path_recorded && *old != stored) {
            if old.starts_with(self.storage.base_dir()) && !self.storage.is_quarantined(old) {
                match tokio::fs::remove_file(old).await {
                    Ok(()) => debug!(doc_id, path = %old.display(), "Removed superseded PDF"),
                    Err(e) => warn!(doc_id, path = %old.display(), error = %e, "Could not remove superseded PDF"),
                }
            }
        }
        failures
    }

    async fn reject(
        &self,
        ids: &IdentifierSet,
        source: SourceKind,
        fetched: FetchResult,
        verification: VerificationResult,
        mode: AcquisitionMode,
    ) -> Result<MismatchReview, FatalError> {
        let doc_id = ids.doc_id();
        let discard = self.config.discard_mismatches_in(mode);
        let quarantined = if discard {
            info!(doc_id, %source, "Mismatched download discarded");
            None
        } else {
            let path = self.storage.quarantine_path(ids, source.as_str());
            let file_hash = content_hash(&fetched.bytes);
            self.write_file(&path, fetched.bytes).await?;
            let relative = self.storage.relative(&path);
            info!(doc_id, %source, path = %relative, score = verification.similarity_score, "Mismatched download quarantined");
            Some(AcquisitionRecord {
                doc_id,
                file_path: path,
                relative_path: relative,
                file_hash,
                source: Some(source),
                verified: false,
                full_text: None,
                acquired_at: Utc::now(),
            })
        };
        Ok(MismatchReview {
            source,
            source_url: fetched.source_url,
            expected_title: ids.title().map(str::to_string),
            verification,
            quarantined,
        })
    }

    /// Once a matching PDF is stored, earlier mismatches need no review.
    async fn drop_superseded_quarantine(&self, mismatches: &[MismatchReview]) {
        for record in mismatches.iter().filter_map(|m| m.quarantined.as_ref()) {
            if let Err(e) = tokio::fs::remove_file(&record.file_path).await {
                debug!(path = %record.file_path.display(), error = %e, "Quarantined file already gone");
            }
        }
    }

    /// Decides the outcome once the chain has nothing more to offer.
    async fn exhausted(&self, run: &mut Run, attempts: &AttemptLog) -> AcquisitionOutcome {
        let text_outcome = match run.text_fallback.take() {
            Some((source, text)) => {
                let recorded = match self.catalog.update_full_text(run.doc_id, &text).await {
                    Ok(recorded) => recorded,
                    Err(e) => {
                        warn!(doc_id = run.doc_id, error = %e, "Could not record full text");
                        false
                    }
                };
                info!(doc_id = run.doc_id, %source, recorded, chars = text.len(), "Stored full text without PDF");
                Some(AcquisitionOutcome::FullTextOnly { source, recorded })
            }
            None => None,
        };

        if !run.mismatches.is_empty() {
            let mut reviews = std::mem::take(&mut run.mismatches);
            reviews.sort_by(|a, b| {
                b.verification
                    .similarity_score
                    .total_cmp(&a.verification.similarity_score)
            });
            if text_outcome.is_some() {
                run.warnings.push("full text was saved from a resolver while the PDF awaits review".to_string());
            }
            return AcquisitionOutcome::Mismatch { reviews };
        }
        if let Some(outcome) = text_outcome {
            return outcome;
        }

        if let Some(denied) = run
            .fetch_failures
            .iter()
            .find(|f| f.error.kind == FetchErrorKind::Forbidden)
        {
            return AcquisitionOutcome::AccessDenied {
                detail: format!("{} ({})", denied.error.detail, denied.source.display_name()),
            };
        }

        if run.timed_out {
            return AcquisitionOutcome::RetriableFailure {
                detail: format!("gave up after {}s", self.config.max_total().as_secs()),
            };
        }

        let transient: Vec<String> = run
            .fetch_failures
            .iter()
            .filter(|f| f.error.is_transient())
            .map(|f| format!("{}: {}", f.source.display_name(), f.error))
            .chain(
                attempts
                    .only_errors()
                    .then(|| attempts.errors().map(|(s, d)| format!("{}: {d}", s.display_name())))
                    .into_iter()
                    .flatten(),
            )
            .collect();
        if !transient.is_empty() {
            return AcquisitionOutcome::RetriableFailure { detail: transient.join("; ") };
        }

        AcquisitionOutcome::NotFound
    }

    async fn extract_text(&self, bytes: &[u8]) -> Option<String> {
        let bytes = bytes.to_vec();
        match tokio::task::spawn_blocking(move || extract_full_text(&bytes)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                debug!(error = %e, "No text extracted from PDF");
                None
            }
            Err(e) => {
                warn!(error = %e, "Text extraction task failed");
                None
            }
        }
    }

    async fn write_file(&self, path: &Path, bytes: Vec<u8>) -> Result<(), FatalError> {
        let (storage, target) = (self.storage.clone(), path.to_path_buf());
        tokio::task::spawn_blocking(move || storage.write_atomic(&target, &bytes))
            .await
            .map_err(|e| FatalError::storage(path.display(), e))?
            .map_err(|e| FatalError::storage(path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DocumentMeta, InMemoryCatalog};
    use crate::models::FetchVia;
    use std::time::Duration;

    fn record(path: &str) -> AcquisitionRecord {
        AcquisitionRecord {
            doc_id: 1,
            file_path: PathBuf::from(path),
            relative_path: path.trim_start_matches('/').to_string(),
            file_hash: "abc".into(),
            source: Some(SourceKind::Unpaywall),
            verified: true,
            full_text: None,
            acquired_at: Utc::now(),
        }
    }

    fn report(outcome: AcquisitionOutcome) -> AcquisitionReport {
        AcquisitionReport {
            doc_id: 1,
            outcome,
            final_stage: Stage::Done,
            last_active_stage: Stage::Fetching,
            attempts: AttemptLog::default(),
            fetch_failures: Vec::new(),
            discovered_doi: None,
            warnings: Vec::new(),
            elapsed_ms: 0,
        }
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(AcquisitionOutcome::NotFound.error_class(), Some(ErrorClass::NotFound));
        assert_eq!(
            AcquisitionOutcome::AccessDenied { detail: "403".into() }.error_class(),
            Some(ErrorClass::AccessDenied)
        );
        assert_eq!(
            AcquisitionOutcome::RetriableFailure { detail: "reset".into() }.error_class(),
            Some(ErrorClass::TransientNetwork)
        );
        assert_eq!(
            AcquisitionOutcome::DownloadedNotRecorded { record: record("/lib/a.pdf"), failures: vec![] }
                .error_class(),
            Some(ErrorClass::CatalogWriteFailure)
        );
        assert_eq!(AcquisitionOutcome::Acquired { record: record("/lib/a.pdf") }.error_class(), None);
        assert_eq!(AcquisitionOutcome::Cancelled.error_class(), None);
    }

    #[test]
    fn test_access_denied_message_mentions_institution() {
        let msg = report(AcquisitionOutcome::AccessDenied { detail: "HTTP 403".into() }).user_message();
        assert!(msg.contains("institution"));
    }

    #[test]
    fn test_mismatch_message_shows_both_titles() {
        let mut verification = VerificationResult::reject("title similarity 0.20 is below threshold 0.50");
        verification.similarity_score = 0.2;
        verification.detected_title = Some("Soil microbiome responses".into());
        let review = MismatchReview {
            source: SourceKind::Unpaywall,
            source_url: "https://repo.example/x.pdf".into(),
            expected_title: Some("Effects of X on Y".into()),
            verification,
            quarantined: Some(record("/lib/_quarantine/effects_of_x_on_y_1_unpaywall.pdf")),
        };
        let msg = report(AcquisitionOutcome::Mismatch { reviews: vec![review] }).user_message();
        assert!(msg.contains("Effects of X on Y"));
        assert!(msg.contains("Soil microbiome responses"));
        assert!(msg.contains("0.20"));
        assert!(msg.contains("_quarantine"));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(AcquisitionOutcome::NotFound).unwrap();
        assert_eq!(json["status"], "not_found");
        let json = serde_json::to_value(AcquisitionOutcome::AccessDenied { detail: "x".into() }).unwrap();
        assert_eq!(json["status"], "access_denied");
        assert_eq!(json["detail"], "x");
    }

    #[test]
    fn test_request_builders() {
        let req = AcquisitionRequest::new(IdentifierSet::new(3))
            .forced()
            .with_mode(AcquisitionMode::Unattended);
        assert!(req.force);
        assert_eq!(req.mode, Some(AcquisitionMode::Unattended));
    }

    struct NeverFetch;

    #[async_trait::async_trait]
    impl Fetcher for NeverFetch {
        async fn fetch(
            &self,
            _: &DownloadRef,
            _: bool,
            _: Duration,
            _: &CancellationToken,
        ) -> Result<FetchResult, FetchError> {
            Ok(FetchResult {
                bytes: Vec::new(),
                content_type: None,
                via: FetchVia::Http,
                source_url: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_existing_file_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayout::new(dir.path());
        let existing = dir.path().join("2021/paper.pdf");
        storage.write_atomic(&existing, b"%PDF-1.4 stored").unwrap();

        let catalog = Arc::new(InMemoryCatalog::new());
        catalog
            .insert(1, DocumentMeta { title: Some("Paper".into()), existing_pdf_path: Some("2021/paper.pdf".into()), ..Default::default() })
            .await;

        let chain = ResolverChain::new(Vec::new(), Duration::from_secs(1));
        let orchestrator = AcquisitionOrchestrator::new(
            AcquisitionConfig::default(),
            chain,
            Arc::new(NeverFetch),
            storage,
            catalog,
        )
        .unwrap();

        let report = orchestrator
            .acquire_by_id(1, false, &ProgressReporter::silent(), &CancellationToken::new())
            .await
            .unwrap();
        let AcquisitionOutcome::AlreadyPresent { record } = &report.outcome else {
            panic!("expected AlreadyPresent, got {:?}", report.outcome);
        };
        assert_eq!(record.relative_path, "2021/paper.pdf");
        assert_eq!(record.file_hash, content_hash(b"%PDF-1.4 stored"));
        assert!(report.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_document_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(
            AcquisitionConfig::default(),
            ResolverChain::new(Vec::new(), Duration::from_secs(1)),
            Arc::new(NeverFetch),
            StorageLayout::new(dir.path()),
            Arc::new(InMemoryCatalog::new()),
        )
        .unwrap();
        let err = orchestrator
            .acquire_by_id(99, false, &ProgressReporter::silent(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FatalError::UnknownDocument(99)));
    }

    #[tokio::test]
    async fn test_empty_chain_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(
            AcquisitionConfig::default(),
            ResolverChain::new(Vec::new(), Duration::from_secs(1)),
            Arc::new(NeverFetch),
            StorageLayout::new(dir.path()),
            Arc::new(InMemoryCatalog::new()),
        )
        .unwrap();
        let report = orchestrator
            .acquire(
                AcquisitionRequest::new(IdentifierSet::new(5).with_title("Nothing")),
                &ProgressReporter::silent(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, AcquisitionOutcome::NotFound);
        assert_eq!(report.final_stage, Stage::Done);
        assert_eq!(orchestrator.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_from_config_prepares_library() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.base_dir = dir.path().join("library");
        config.acquisition.use_browser_fallback = false;

        let orchestrator = AcquisitionOrchestrator::from_config(&config, Arc::new(InMemoryCatalog::new())).unwrap();

        assert_eq!(orchestrator.storage().base_dir(), dir.path().join("library"));
        assert!(dir.path().join("library").is_dir());
        assert!(orchestrator.quarantined_files().await.unwrap().is_empty());
    }
}
