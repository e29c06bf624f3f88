//! Checks that downloaded bytes are a PDF of the expected document.
//!
//! Structural checks (PDF magic, page count) always run. The title check is
//! a token overlap between the expected title and the text of the first pages,
//! with a small bonus when the first author's surname also appears.

use litfetch_common::IdentifierSet;
use litfetch_config::AcquisitionConfig;
use tracing::{debug, warn};

use crate::fetcher::challenge::{looks_like_html, looks_like_pdf};
use crate::models::{FetchResult, VerificationResult};
use crate::pdf_parser::parse_pdf;
use crate::similarity::{mentions_author, token_overlap};

const AUTHOR_BONUS: f64 = 0.1;
const SCAN_PAGES: usize = 2;

#[derive(Debug, Clone)]
pub struct ContentVerifier {
    enabled: bool,
    threshold: f64,
}

impl ContentVerifier {
    pub fn new(threshold: f64) -> Self {
        Self { enabled: true, threshold }
    }

    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self { enabled: config.verify_content, threshold: config.title_similarity_threshold }
    }

    /// Skip the title comparison; structural checks still apply.
    pub fn without_title_check(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn verify(&self, fetched: &FetchResult, ids: &IdentifierSet) -> VerificationResult {
        if !looks_like_pdf(&fetched.bytes) {
            let reason = if looks_like_html(&fetched.bytes, fetched.content_type.as_deref()) {
                format!("received an HTML page instead of a PDF from {}", fetched.source_url)
            } else {
                format!(
                    "content is not a PDF (content-type {})",
                    fetched.content_type.as_deref().unwrap_or("unknown")
                )
            };
            debug!(%reason, "Verification rejected non-PDF content");
            return VerificationResult::reject(reason);
        }

        let parsed = match parse_pdf(&fetched.bytes, SCAN_PAGES) {
            Ok(p) => p,
            Err(e) if self.enabled && ids.title().is_some() => {
                // Pages and title cannot be checked; a human decides from quarantine.
                warn!(error = %e, "PDF structure unreadable, rejecting");
                return VerificationResult::reject(format!(
                    "could not read PDF structure ({e}); page count and title not checked"
                ));
            }
            Err(e) => {
                warn!(error = %e, "PDF structure unreadable, accepting without content check");
                return VerificationResult::accept(0.0)
                    .with_warning(format!("could not read PDF structure ({e}); content not checked"));
            }
        };

        if parsed.page_count == 0 {
            return VerificationResult::reject("PDF has no pages");
        }

        let mut result = VerificationResult::accept(0.0);
        result.detected_title = parsed.title.clone();
        if parsed.page_count == 1 {
            result = result.with_warning("single-page PDF; may be a cover sheet or abstract only");
        }

        if !self.enabled {
            result.similarity_score = 1.0;
            return result.with_warning("content verification disabled");
        }

        let Some(title) = ids.title() else {
            return result.with_warning("no title on record; accepted without content match");
        };

        if parsed.leading_text.trim().is_empty() {
            return result.with_warning("no extractable text on first pages (scanned PDF?); title not checked");
        }

        let mut score = token_overlap(title, &parsed.leading_text);
        if ids.first_author().is_some_and(|a| mentions_author(a, &parsed.leading_text)) {
            score += AUTHOR_BONUS;
        }
        let score = score.min(1.0);
        result.similarity_score = score;
        debug!(score, threshold = self.threshold, "Title similarity");

        if score < self.threshold {
            result.accepted = false;
            return result.with_warning(format!(
                "title similarity {score:.2} is below threshold {:.2}",
                self.threshold
            ));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchVia;
    use litfetch_test_utils::pdf::minimal_pdf;

    fn fetched(bytes: Vec<u8>, content_type: &str) -> FetchResult {
        FetchResult {
            bytes,
            content_type: Some(content_type.to_string()),
            via: FetchVia::Http,
            source_url: "https://example.org/x.pdf".into(),
        }
    }

    fn ids() -> IdentifierSet {
        IdentifierSet::new(1).with_title("Effects of X on Y").with_first_author("Doe, Jane")
    }

    #[test]
    fn test_html_is_rejected_even_when_disabled() {
        let verifier = ContentVerifier::new(0.5).without_title_check();
        let result = verifier.verify(&fetched(b"<!DOCTYPE html><html>Login</html>".to_vec(), "text/html"), &ids());
        assert!(!result.accepted);
        assert!(result.warnings[0].contains("HTML"));
    }

    #[test]
    fn test_matching_title_accepted() {
        let pdf = minimal_pdf(&["Effects of X on Y", "Jane Doe", "Abstract. We study effects."]);
        let result = ContentVerifier::new(0.5).verify(&fetched(pdf, "application/pdf"), &ids());
        assert!(result.accepted, "{result:?}");
        assert!(result.similarity_score >= 0.5);
    }

    #[test]
    fn test_unrelated_title_rejected() {
        let pdf = minimal_pdf(&["Soil microbiome responses to drought", "A. Nother"]);
        let result = ContentVerifier::new(0.5).verify(&fetched(pdf, "application/pdf"), &ids());
        assert!(!result.accepted);
        assert!(result.similarity_score < 0.5);
        assert_eq!(result.detected_title.as_deref(), Some("Soil microbiome responses to drought"));
    }

    #[test]
    fn test_no_title_accepts_with_warning() {
        let pdf = minimal_pdf(&["Whatever this is about"]);
        let result = ContentVerifier::new(0.5).verify(&fetched(pdf, "application/pdf"), &IdentifierSet::new(1));
        assert!(result.accepted);
        assert!(result.warnings.iter().any(|w| w.contains("no title")));
    }

    #[test]
    fn test_unreadable_pdf_rejected_when_title_known() {
        let disguised = b"%PDF-1.4\n<html>Access denied</html> truncated".to_vec();
        let result = ContentVerifier::new(0.5).verify(&fetched(disguised.clone(), "application/pdf"), &ids());
        assert!(!result.accepted);
        assert!(result.warnings[0].contains("could not read PDF structure"));

        let untitled = ContentVerifier::new(0.5).verify(&fetched(disguised, "application/pdf"), &IdentifierSet::new(1));
        assert!(untitled.accepted);
        assert!(untitled.warnings.iter().any(|w| w.contains("content not checked")));
    }

    #[test]
    fn test_author_bonus() {
        // Two of three title tokens present: 0.67 alone, 0.77 with the author.
        let ids = IdentifierSet::new(1).with_title("Kinase signalling networks").with_first_author("Nakamura");
        let pdf = minimal_pdf(&["Kinase signalling review", "K. Nakamura"]);
        let result = ContentVerifier::new(0.75).verify(&fetched(pdf, "application/pdf"), &ids);
        assert!(result.accepted, "{result:?}");
    }
}
