//! On-disk layout of acquired PDFs.
//!
//! ```text
//! <base>/<year>/<slug>.pdf            canonical location
//! <base>/unknown_year/<slug>.pdf      when the year is not known
//! <base>/_quarantine/<slug>_<id>_<source>.pdf  rejected downloads kept for review
//! ```

use litfetch_common::IdentifierSet;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::FatalError;

pub const QUARANTINE_DIR: &str = "_quarantine";
pub const UNKNOWN_YEAR_DIR: &str = "unknown_year";
const MAX_SLUG_CHARS: usize = 80;
const MAX_SLUG_WORDS: usize = 10;

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Creates the base directory and proves it is writable.
    pub fn ensure_ready(&self) -> Result<(), FatalError> {
        let base = self.base_dir.display();
        std::fs::create_dir_all(&self.base_dir).map_err(|e| FatalError::storage(&base, e))?;
        let mut check = NamedTempFile::new_in(&self.base_dir).map_err(|e| FatalError::storage(&base, e))?;
        check.write_all(b"ok").map_err(|e| FatalError::storage(&base, e))?;
        Ok(())
    }

    /// Where the document's PDF belongs. `current` is the path the catalog
    /// already holds for this document; that file may be overwritten, any
    /// other file at the target name is not.
    pub fn canonical_path(&self, ids: &IdentifierSet, current: Option<&Path>) -> PathBuf {
        let dir = match ids.year() {
            Some(year) => self.base_dir.join(year.to_string()),
            None => self.base_dir.join(UNKNOWN_YEAR_DIR),
        };
        let stem = derive_stem(ids);
        let candidate = dir.join(format!("{stem}.pdf"));
        if !candidate.exists() || current == Some(candidate.as_path()) {
            return candidate;
        }
        dir.join(format!("{stem}_{}.pdf", ids.doc_id()))
    }

    /// One file per document and source, so several rejected copies can await review.
    pub fn quarantine_path(&self, ids: &IdentifierSet, source: &str) -> PathBuf {
        self.base_dir
            .join(QUARANTINE_DIR)
            .join(format!("{}_{}_{source}.pdf", derive_stem(ids), ids.doc_id()))
    }

    /// The document a quarantine file was downloaded for, read back from its
    /// `{stem}_{doc_id}_{source}.pdf` name. `sources` lists the possible source names.
    pub fn quarantined_doc_id<'a>(&self, path: &Path, sources: impl IntoIterator<Item = &'a str>) -> Option<i64> {
        let stem = path.file_stem()?.to_str()?;
        sources.into_iter().find_map(|source| {
            let rest = stem.strip_suffix(source)?.strip_suffix('_')?;
            rest.rsplit('_').next()?.parse().ok()
        })
    }

    pub fn is_quarantined(&self, path: &Path) -> bool {
        path.starts_with(self.base_dir.join(QUARANTINE_DIR))
    }

    /// Path as stored in the catalog: relative to the base, forward slashes.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.base_dir).unwrap_or(path);
        rel.components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Inverse of [`StorageLayout::relative`]. Absolute paths are kept as they are.
    pub fn resolve(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Writes via a temp file in the target directory and renames into place,
    /// so readers never see a partial PDF.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or(&self.base_dir);
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), bytes = bytes.len(), "PDF written");
        Ok(())
    }

    /// Moves a file, copying across filesystems when rename is not possible.
    pub fn move_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        if let Some(dir) = to.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if std::fs::rename(from, to).is_ok() {
            return Ok(());
        }
        let bytes = std::fs::read(from)?;
        self.write_atomic(to, &bytes)?;
        std::fs::remove_file(from)
    }
}

/// Hex-encoded sha256 of the file contents.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Filename stem: title slug, else DOI, else PMID, else the document id.
pub fn derive_stem(ids: &IdentifierSet) -> String {
    if let Some(slug) = ids.title().map(slugify).filter(|s| !s.is_empty()) {
        return slug;
    }
    if let Some(doi) = ids.doi() {
        let safe: String = doi
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        return safe;
    }
    if let Some(pmid) = ids.pmid() {
        return format!("pmid_{pmid}");
    }
    format!("doc_{}", ids.doc_id())
}

fn slugify(title: &str) -> String {
    let words: Vec<String> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(MAX_SLUG_WORDS)
        .map(|w| w.to_lowercase())
        .collect();
    let mut slug = words.join("_");
    if slug.chars().count() > MAX_SLUG_CHARS {
        slug = slug.chars().take(MAX_SLUG_CHARS).collect();
        slug = slug.trim_end_matches('_').to_string();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_partitioned_paths() {
        let layout = StorageLayout::new("/lib");
        let ids = IdentifierSet::new(9).with_title("Effects of X on Y").with_year(2021);
        assert_eq!(layout.canonical_path(&ids, None), PathBuf::from("/lib/2021/effects_of_x_on_y.pdf"));

        let undated = IdentifierSet::new(9).with_doi("10.1/abc");
        assert_eq!(layout.canonical_path(&undated, None), PathBuf::from("/lib/unknown_year/10.1_abc.pdf"));
    }

    #[test]
    fn test_collision_suffixes_doc_id() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let ids = IdentifierSet::new(42).with_title("Review").with_year(2020);
        let taken = layout.canonical_path(&ids, None);
        layout.write_atomic(&taken, b"%PDF-other").unwrap();

        assert_eq!(layout.canonical_path(&ids, None), dir.path().join("2020/review_42.pdf"));
        // our own file at that name is simply replaced
        assert_eq!(layout.canonical_path(&ids, Some(&taken)), taken);
    }

    #[test]
    fn test_quarantine_is_separate() {
        let layout = StorageLayout::new("/lib");
        let ids = IdentifierSet::new(5).with_title("Effects of X on Y");
        let path = layout.quarantine_path(&ids, "unpaywall");
        assert_eq!(path, PathBuf::from("/lib/_quarantine/effects_of_x_on_y_5_unpaywall.pdf"));
        assert!(layout.is_quarantined(&path));
        assert!(!layout.is_quarantined(Path::new("/lib/2021/effects_of_x_on_y.pdf")));
    }

    #[test]
    fn test_quarantined_doc_id_from_file_name() {
        let layout = StorageLayout::new("/lib");
        let ids = IdentifierSet::new(42).with_title("Protocol 2 results");
        let path = layout.quarantine_path(&ids, "doi_redirect");
        let sources = ["unpaywall", "doi_redirect", "direct_url"];
        assert_eq!(layout.quarantined_doc_id(&path, sources), Some(42));
        assert_eq!(layout.quarantined_doc_id(Path::new("/lib/_quarantine/stray.pdf"), sources), None);
        assert_eq!(layout.quarantined_doc_id(Path::new("/lib/_quarantine/a_x_unpaywall.pdf"), sources), None);
    }

    #[test]
    fn test_relative_round_trip() {
        let layout = StorageLayout::new("/lib");
        let rel = layout.relative(Path::new("/lib/2021/a.pdf"));
        assert_eq!(rel, "2021/a.pdf");
        assert_eq!(layout.resolve(&rel), PathBuf::from("/lib/2021/a.pdf"));
    }

    #[test]
    fn test_stem_fallbacks() {
        assert_eq!(derive_stem(&IdentifierSet::new(1).with_pmid("123")), "pmid_123");
        assert_eq!(derive_stem(&IdentifierSet::new(77)), "doc_77");
        let long = "word ".repeat(40);
        assert!(derive_stem(&IdentifierSet::new(1).with_title(long)).len() <= MAX_SLUG_CHARS);
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_ensure_ready_creates_base() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("nested/library"));
        layout.ensure_ready().unwrap();
        assert!(layout.base_dir().is_dir());
    }
}
