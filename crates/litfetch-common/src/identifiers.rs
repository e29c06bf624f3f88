//! What is known about a document before acquisition starts.
//!
//! An `IdentifierSet` is never mutated once built. Resolvers that discover new
//! identifiers (CrossRef title search) produce a fresh set via
//! [`IdentifierSet::with_discovered_doi`].

use serde::{Deserialize, Serialize};

/// Bibliographic identifiers for one catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierSet {
    doc_id: i64,
    doi: Option<String>,
    pmid: Option<String>,
    title: Option<String>,
    year: Option<i32>,
    known_url: Option<String>,
    first_author: Option<String>,
}

/// Identifier fields a resolver may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierField {
    Doi,
    Pmid,
    Title,
    KnownUrl,
}

impl IdentifierField {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierField::Doi      => "doi",
            IdentifierField::Pmid     => "pmid",
            IdentifierField::Title    => "title",
            IdentifierField::KnownUrl => "known_url",
        }
    }
}

impl IdentifierSet {
    pub fn new(doc_id: i64) -> Self {
        Self {
            doc_id,
            doi: None,
            pmid: None,
            title: None,
            year: None,
            known_url: None,
            first_author: None,
        }
    }

    pub fn with_doi(mut self, doi: impl AsRef<str>) -> Self {
        self.doi = normalise_doi(doi.as_ref());
        self
    }

    pub fn with_pmid(mut self, pmid: impl AsRef<str>) -> Self {
        self.pmid = normalise_pmid(pmid.as_ref());
        self
    }

    pub fn with_title(mut self, title: impl AsRef<str>) -> Self {
        self.title = non_blank(title.as_ref());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = (year > 0).then_some(year);
        self
    }

    pub fn with_known_url(mut self, url: impl AsRef<str>) -> Self {
        self.known_url = non_blank(url.as_ref());
        self
    }

    pub fn with_first_author(mut self, author: impl AsRef<str>) -> Self {
        self.first_author = non_blank(author.as_ref());
        self
    }

    /// Returns a new set carrying a DOI found by a resolver.
    /// A DOI that is already known always wins over a discovered one.
    pub fn with_discovered_doi(&self, doi: &str) -> Self {
        if self.doi.is_some() {
            return self.clone();
        }
        self.clone().with_doi(doi)
    }

    pub fn doc_id(&self) -> i64 { self.doc_id }
    pub fn doi(&self) -> Option<&str> { self.doi.as_deref() }
    pub fn pmid(&self) -> Option<&str> { self.pmid.as_deref() }
    pub fn title(&self) -> Option<&str> { self.title.as_deref() }
    pub fn year(&self) -> Option<i32> { self.year }
    pub fn known_url(&self) -> Option<&str> { self.known_url.as_deref() }
    pub fn first_author(&self) -> Option<&str> { self.first_author.as_deref() }

    pub fn has(&self, field: IdentifierField) -> bool {
        match field {
            IdentifierField::Doi      => self.doi.is_some(),
            IdentifierField::Pmid     => self.pmid.is_some(),
            IdentifierField::Title    => self.title.is_some(),
            IdentifierField::KnownUrl => self.known_url.is_some(),
        }
    }

    /// Short human label used in log lines and progress messages.
    pub fn label(&self) -> String {
        if let Some(doi) = &self.doi {
            format!("doi:{doi}")
        } else if let Some(pmid) = &self.pmid {
            format!("pmid:{pmid}")
        } else if let Some(title) = &self.title {
            let short: String = title.chars().take(60).collect();
            format!("\"{short}\"")
        } else {
            format!("doc #{}", self.doc_id)
        }
    }
}

/// Strip resolver prefixes (`https://doi.org/`, `doi:`) and whitespace.
pub fn normalise_doi(raw: &str) -> Option<String> {
    let mut doi = raw.trim();
    let lower = doi.to_ascii_lowercase();
    for prefix in ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/", "doi:"] {
        if lower.starts_with(prefix) {
            doi = doi[prefix.len()..].trim();
            break;
        }
    }
    if doi.starts_with("10.") && doi.contains('/') {
        Some(doi.to_string())
    } else {
        None
    }
}

fn normalise_pmid(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("PMID:")
        .or_else(|| trimmed.strip_prefix("pmid:"))
        .unwrap_or(trimmed)
        .trim();
    (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())).then(|| digits.to_string())
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
