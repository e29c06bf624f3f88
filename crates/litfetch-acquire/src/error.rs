use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a download attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Connection failures, 5xx and 429. Worth retrying.
    Network,
    /// 401/403/451 or a bot challenge that could not be passed.
    Forbidden,
    Timeout,
    BrowserUnavailable,
    /// The response exceeded the configured size cap.
    Oversized,
    /// The location answered, but not with a document (404, landing page, bad URL).
    Unusable,
    Cancelled,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Network            => "network",
            FetchErrorKind::Forbidden          => "forbidden",
            FetchErrorKind::Timeout            => "timeout",
            FetchErrorKind::BrowserUnavailable => "browser_unavailable",
            FetchErrorKind::Oversized          => "oversized",
            FetchErrorKind::Unusable           => "unusable",
            FetchErrorKind::Cancelled          => "cancelled",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind}: {detail}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub detail: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn cancelled() -> Self {
        Self::new(FetchErrorKind::Cancelled, "cancelled by caller")
    }

    /// Transient failures are retried with backoff at the same location.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, FetchErrorKind::Network | FetchErrorKind::Timeout)
    }
}

/// Failures that stop the pipeline regardless of the document.
#[derive(Debug, Clone, Error)]
pub enum FatalError {
    #[error("Storage directory {path} is not usable: {detail}")]
    Storage { path: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Document {0} is not in the catalog")]
    UnknownDocument(i64),

    #[error("Catalog unavailable: {0}")]
    Catalog(String),

    #[error("{0} is not a quarantined download")]
    NotQuarantined(String),

    #[error("{path} was not downloaded for document {doc_id}")]
    QuarantineMismatch { path: String, doc_id: i64 },
}

impl FatalError {
    pub fn storage(path: impl fmt::Display, err: impl fmt::Display) -> Self {
        FatalError::Storage { path: path.to_string(), detail: err.to_string() }
    }

    /// Generic message for end users; details belong in the log.
    pub fn user_message(&self) -> String {
        match self {
            FatalError::UnknownDocument(id) => format!("Document {id} is not in the library."),
            FatalError::NotQuarantined(_) | FatalError::QuarantineMismatch { .. } => self.to_string(),
            _ => "Full-text acquisition is unavailable because of a configuration or storage problem. \
                  See the log for details."
                .to_string(),
        }
    }
}
