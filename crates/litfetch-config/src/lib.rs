//! Configuration loading for litfetch.
//! Reads litfetch.toml from the current directory or the path in the LITFETCH_CONFIG env var.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Resolver names accepted in `skip_resolvers`.
pub const KNOWN_RESOLVERS: &[&str] = &[
    "crossref_title",
    "pmc",
    "unpaywall",
    "doi_redirect",
    "direct_url",
    "openathens_proxy",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Whether a human is around to review mismatched downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// A reviewer will be prompted; mismatches are always quarantined.
    #[default]
    Interactive,
    /// Background/batch driver; `delete_on_mismatch` is honoured.
    Unattended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_timeout_secs", alias = "timeout")]
    pub timeout_secs: u64,
    #[serde(default = "bool_true")]
    pub prefer_open_access: bool,
    #[serde(default)]
    pub skip_resolvers: Vec<String>,
    #[serde(default = "bool_true")]
    pub use_browser_fallback: bool,
    #[serde(default = "bool_true")]
    pub browser_headless: bool,
    #[serde(default = "default_browser_timeout_ms")]
    pub browser_timeout_ms: u64,
    #[serde(default = "bool_true")]
    pub verify_content: bool,
    #[serde(default)]
    pub delete_on_mismatch: bool,
    #[serde(default = "default_crossref_min_similarity")]
    pub crossref_min_similarity: f64,
    #[serde(default = "default_title_similarity_threshold")]
    pub title_similarity_threshold: f64,
    pub openathens_proxy_url: Option<String>,
    #[serde(default)]
    pub openathens_enabled: bool,
    pub unpaywall_email: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    #[serde(default = "default_max_total_secs")]
    pub max_total_secs: u64,
    #[serde(default = "default_max_pdf_bytes")]
    pub max_pdf_bytes: u64,
    #[serde(default)]
    pub extract_pdf_text: bool,
    #[serde(default)]
    pub mode: AcquisitionMode,
}

fn default_timeout_secs()               -> u64      { 30 }
fn default_browser_timeout_ms()         -> u64      { 45_000 }
fn default_crossref_min_similarity()    -> f64      { 0.85 }
fn default_title_similarity_threshold() -> f64      { 0.5 }
fn default_max_attempts()               -> u32      { 3 }
fn default_backoff_secs()               -> Vec<u64> { vec![1, 3, 9] }
fn default_max_total_secs()             -> u64      { 300 }
fn default_max_pdf_bytes()              -> u64      { 50 * 1024 * 1024 }
fn bool_true()                          -> bool     { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
}

fn default_base_dir()     -> PathBuf { PathBuf::from("./library") }
fn default_catalog_path() -> PathBuf { PathBuf::from("./library/catalog.json") }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
    pub user_agent: Option<String>,
}

fn default_rps() -> u32 { 3 }

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            prefer_open_access: true,
            skip_resolvers: Vec::new(),
            use_browser_fallback: true,
            browser_headless: true,
            browser_timeout_ms: default_browser_timeout_ms(),
            verify_content: true,
            delete_on_mismatch: false,
            crossref_min_similarity: default_crossref_min_similarity(),
            title_similarity_threshold: default_title_similarity_threshold(),
            openathens_proxy_url: None,
            openathens_enabled: false,
            unpaywall_email: None,
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            max_total_secs: default_max_total_secs(),
            max_pdf_bytes: default_max_pdf_bytes(),
            extract_pdf_text: false,
            mode: AcquisitionMode::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { base_dir: default_base_dir(), catalog_path: default_catalog_path() }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { requests_per_second: default_rps(), user_agent: None }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl AcquisitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_timeout_ms)
    }

    pub fn max_total(&self) -> Duration {
        Duration::from_secs(self.max_total_secs)
    }

    /// Delay before retry `n` (1-based). Past the end of the schedule the last entry repeats.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) - 1) as usize;
        self.backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .map(|s| Duration::from_secs(*s))
            .unwrap_or_default()
    }

    /// True when the OpenAthens resolver may run at all.
    pub fn openathens_active(&self) -> bool {
        self.openathens_enabled
            && self.openathens_proxy_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Whether a rejected download should be deleted instead of quarantined
    /// in the configured mode.
    pub fn discard_mismatches(&self) -> bool {
        self.discard_mismatches_in(self.mode)
    }

    /// Same, for a run whose mode overrides the configured one.
    pub fn discard_mismatches_in(&self, mode: AcquisitionMode) -> bool {
        mode == AcquisitionMode::Unattended && self.delete_on_mismatch
    }
}

#[cfg(test)]
mod tests;

impl Config {
    /// Load configuration from litfetch.toml.
    /// Checks LITFETCH_CONFIG env var first, then current directory.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("LITFETCH_CONFIG")
            .unwrap_or_else(|_| "litfetch.toml".to_string());

        if !Path::new(&path).exists() {
            return Err(ConfigError::NotFound(format!(
                "{path} (copy litfetch.example.toml to litfetch.toml and edit it)"
            )));
        }
        Self::load_from(Path::new(&path))
    }

    /// Like [`Config::load`], but falls back to defaults when no file exists.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::load() {
            Err(ConfigError::NotFound(path)) => {
                tracing::debug!(%path, "No config file, using defaults");
                let mut config = Config::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Contact email and proxy settings are usually kept out of the TOML file.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(email) = lookup("LITFETCH_UNPAYWALL_EMAIL").filter(|v| !v.trim().is_empty()) {
            self.acquisition.unpaywall_email = Some(email);
        }
        if let Some(proxy) = lookup("LITFETCH_OPENATHENS_PROXY_URL").filter(|v| !v.trim().is_empty()) {
            self.acquisition.openathens_proxy_url = Some(proxy);
        }
        if let Some(dir) = lookup("LITFETCH_BASE_DIR").filter(|v| !v.trim().is_empty()) {
            self.storage.base_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let acq = &self.acquisition;
        for (name, value) in [
            ("crossref_min_similarity", acq.crossref_min_similarity),
            ("title_similarity_threshold", acq.title_similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if acq.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".to_string()));
        }
        if acq.browser_timeout_ms == 0 {
            return Err(ConfigError::Invalid("browser_timeout_ms must be positive".to_string()));
        }
        if acq.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if acq.openathens_enabled && !acq.openathens_active() {
            return Err(ConfigError::Invalid(
                "openathens_enabled is set but openathens_proxy_url is missing".to_string(),
            ));
        }
        if let Some(unknown) = acq
            .skip_resolvers
            .iter()
            .find(|name| !KNOWN_RESOLVERS.contains(&name.as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "unknown resolver in skip_resolvers: {unknown} (expected one of {})",
                KNOWN_RESOLVERS.join(", ")
            )));
        }
        if self.network.requests_per_second == 0 {
            return Err(ConfigError::Invalid("requests_per_second must be positive".to_string()));
        }
        Ok(())
    }
}
