//! The catalog contract: the document store that owns bibliographic records.
//!
//! Acquisition reads metadata through [`CatalogGateway::get_document`] and
//! writes back three things: the stored PDF path, a discovered DOI, and full
//! text. Each write reports whether the catalog accepted it.

use async_trait::async_trait;
use litfetch_common::IdentifierSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub title: Option<String>,
    pub doi: Option<String>,
    pub pmid: Option<String>,
    pub year: Option<i32>,
    pub first_author: Option<String>,
    pub known_url: Option<String>,
    /// Relative to the storage base directory.
    pub existing_pdf_path: Option<String>,
}

impl DocumentMeta {
    pub fn identifiers(&self, doc_id: i64) -> IdentifierSet {
        let mut ids = IdentifierSet::new(doc_id);
        if let Some(title) = &self.title { ids = ids.with_title(title); }
        if let Some(doi) = &self.doi { ids = ids.with_doi(doi); }
        if let Some(pmid) = &self.pmid { ids = ids.with_pmid(pmid); }
        if let Some(year) = self.year { ids = ids.with_year(year); }
        if let Some(author) = &self.first_author { ids = ids.with_first_author(author); }
        if let Some(url) = &self.known_url { ids = ids.with_known_url(url); }
        ids
    }
}

#[async_trait]
pub trait CatalogGateway: Send + Sync {
    async fn get_document(&self, doc_id: i64) -> anyhow::Result<Option<DocumentMeta>>;

    async fn update_pdf_path(&self, doc_id: i64, relative_path: &str) -> anyhow::Result<bool>;

    /// Must leave an existing DOI untouched and return `false`.
    async fn update_doi(&self, doc_id: i64, doi: &str) -> anyhow::Result<bool>;

    async fn update_full_text(&self, doc_id: i64, text: &str) -> anyhow::Result<bool>;
}

/// One catalog row, including fields only acquisition writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
}

/// Catalog held in memory. Backs the CLI's JSON catalog and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<BTreeMap<i64, CatalogEntry>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<i64, CatalogEntry>) -> Self {
        Self { entries: RwLock::new(entries) }
    }

    pub async fn insert(&self, doc_id: i64, meta: DocumentMeta) {
        self.entries.write().await.insert(doc_id, CatalogEntry { meta, full_text: None });
    }

    pub async fn entry(&self, doc_id: i64) -> Option<CatalogEntry> {
        self.entries.read().await.get(&doc_id).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<i64, CatalogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl CatalogGateway for InMemoryCatalog {
    async fn get_document(&self, doc_id: i64) -> anyhow::Result<Option<DocumentMeta>> {
        Ok(self.entries.read().await.get(&doc_id).map(|e| e.meta.clone()))
    }

    async fn update_pdf_path(&self, doc_id: i64, relative_path: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(match entries.get_mut(&doc_id) {
            Some(entry) => {
                entry.meta.existing_pdf_path = Some(relative_path.to_string());
                true
            }
            None => false,
        })
    }

    async fn update_doi(&self, doc_id: i64, doi: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(match entries.get_mut(&doc_id) {
            Some(entry) if entry.meta.doi.is_none() => {
                entry.meta.doi = Some(doi.to_string());
                true
            }
            _ => false,
        })
    }

    async fn update_full_text(&self, doc_id: i64, text: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(match entries.get_mut(&doc_id) {
            Some(entry) => {
                entry.full_text = Some(text.to_string());
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_doi_never_overwrites() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(1, DocumentMeta { doi: Some("10.1/known".into()), ..Default::default() }).await;
        catalog.insert(2, DocumentMeta::default()).await;

        assert!(!catalog.update_doi(1, "10.1/other").await.unwrap());
        assert!(catalog.update_doi(2, "10.1/new").await.unwrap());
        assert!(!catalog.update_doi(2, "10.1/newer").await.unwrap());
        assert_eq!(catalog.get_document(2).await.unwrap().unwrap().doi.as_deref(), Some("10.1/new"));
    }

    #[tokio::test]
    async fn test_unknown_document_writes_are_refused() {
        let catalog = InMemoryCatalog::new();
        assert!(!catalog.update_pdf_path(9, "2021/a.pdf").await.unwrap());
        assert!(!catalog.update_full_text(9, "text").await.unwrap());
        assert!(catalog.get_document(9).await.unwrap().is_none());
    }

    #[test]
    fn test_meta_to_identifiers() {
        let meta = DocumentMeta {
            title: Some("Effects of X on Y".into()),
            doi: Some("https://doi.org/10.1/x".into()),
            year: Some(2021),
            ..Default::default()
        };
        let ids = meta.identifiers(3);
        assert_eq!(ids.doc_id(), 3);
        assert_eq!(ids.doi(), Some("10.1/x"));
        assert_eq!(ids.year(), Some(2021));
        assert_eq!(ids.pmid(), None);
    }

    #[test]
    fn test_entry_json_is_flat() {
        let entry = CatalogEntry {
            meta: DocumentMeta { title: Some("T".into()), ..Default::default() },
            full_text: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["title"], "T");
        assert!(json.get("full_text").is_none());
    }
}
