//! litfetch-acquire — Full-text discovery and acquisition.
//! Covers the path from a bibliographic record to a verified local PDF:
//! - Resolver chain (CrossRef title search, PMC, Unpaywall, DOI redirect, direct URL, OpenAthens)
//! - HTTP fetching with headless-browser fallback
//! - Content verification against the expected title
//! - Year-partitioned storage with quarantine for mismatches
//! - Catalog write-back through the `CatalogGateway` contract

pub mod catalog;
pub mod chain;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod orchestrator;
pub mod pdf_parser;
pub mod progress;
pub mod similarity;
pub mod sources;
pub mod storage;
pub mod verifier;

pub use catalog::{CatalogEntry, CatalogGateway, DocumentMeta, InMemoryCatalog};
pub use chain::{ChainCursor, ChainResolution, ResolverChain};
pub use error::{FatalError, FetchError, FetchErrorKind};
pub use fetcher::{FallbackFetcher, Fetcher};
pub use models::{
    AcquisitionRecord, AttemptLog, DownloadRef, FetchResult, FetchVia, FoundMetadata,
    ResolutionOutcome, SourceKind, VerificationResult,
};
pub use orchestrator::{
    AcquisitionOrchestrator, AcquisitionOutcome, AcquisitionReport, AcquisitionRequest,
    ErrorClass, FetchFailure, MismatchReview,
};
pub use progress::{ProgressEvent, ProgressReporter, Stage};
pub use sources::Resolver;
pub use storage::StorageLayout;
pub use verifier::ContentVerifier;
