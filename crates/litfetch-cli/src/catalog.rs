//! Catalog persisted as a single JSON file, rewritten after every change.

use anyhow::{Context, Result};
use async_trait::async_trait;
use litfetch_acquire::{CatalogEntry, CatalogGateway, DocumentMeta, InMemoryCatalog};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

pub struct JsonFileCatalog {
    path: PathBuf,
    entries: InMemoryCatalog,
    /// Serialises file rewrites.
    write_lock: Mutex<()>,
}

impl JsonFileCatalog {
    /// Opens the catalog; a missing file is an empty catalog.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: BTreeMap<i64, CatalogEntry> = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Catalog {} is not valid JSON", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).with_context(|| format!("Cannot read catalog {}", path.display())),
        };
        debug!(path = %path.display(), documents = entries.len(), "Catalog loaded");
        Ok(Self { path, entries: InMemoryCatalog::from_entries(entries), write_lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a document under the next free id.
    pub async fn add(&self, meta: DocumentMeta) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let next = self.entries.snapshot().await.keys().next_back().map_or(1, |id| id + 1);
        self.entries.insert(next, meta).await;
        self.save().await?;
        Ok(next)
    }

    pub async fn list(&self) -> BTreeMap<i64, CatalogEntry> {
        self.entries.snapshot().await
    }

    async fn save(&self) -> Result<()> {
        let snapshot = self.entries.snapshot().await;
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json)).await??;
        Ok(())
    }

    /// Runs a write against the in-memory entries and persists on success.
    async fn write_through<F, Fut>(&self, op: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let _guard = self.write_lock.lock().await;
        let changed = op().await?;
        if changed {
            self.save().await?;
        }
        Ok(changed)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Cannot write catalog {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl CatalogGateway for JsonFileCatalog {
    async fn get_document(&self, doc_id: i64) -> Result<Option<DocumentMeta>> {
        self.entries.get_document(doc_id).await
    }

    async fn update_pdf_path(&self, doc_id: i64, relative_path: &str) -> Result<bool> {
        self.write_through(|| self.entries.update_pdf_path(doc_id, relative_path)).await
    }

    async fn update_doi(&self, doc_id: i64, doi: &str) -> Result<bool> {
        self.write_through(|| self.entries.update_doi(doc_id, doi)).await
    }

    async fn update_full_text(&self, doc_id: i64, text: &str) -> Result<bool> {
        self.write_through(|| self.entries.update_full_text(doc_id, text)).await
    }
}
