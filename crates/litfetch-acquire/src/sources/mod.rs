//! Resolvers: strategies that turn an `IdentifierSet` into a download reference.

pub mod crossref;
pub mod direct_url;
pub mod doi_redirect;
pub mod openathens;
pub mod pmc;
pub mod unpaywall;

use async_trait::async_trait;
use litfetch_common::{IdentifierField, IdentifierSet, PoliteClient};
use litfetch_config::AcquisitionConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::models::{ResolutionOutcome, SourceKind};

pub use crossref::{CrossRefIndex, CrossRefTitleResolver, TitleCandidate, TitleIndex};
pub use direct_url::DirectUrlResolver;
pub use doi_redirect::DoiRedirectResolver;
pub use openathens::OpenAthensResolver;
pub use pmc::PmcResolver;
pub use unpaywall::UnpaywallResolver;

/// Common interface for all resolvers.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Why this resolver cannot run for `ids`, or `None` when it can.
    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String>;

    /// Look the document up. Transport failures come back as `Error`,
    /// never as a panic or an `Err`.
    async fn resolve(&self, ids: &IdentifierSet, timeout: Duration) -> ResolutionOutcome;
}

/// Builds one instance of every resolver from configuration.
pub fn default_resolvers(config: &AcquisitionConfig, client: &PoliteClient) -> Vec<Arc<dyn Resolver>> {
    vec![
        Arc::new(CrossRefTitleResolver::new(
            Arc::new(CrossRefIndex::new(client.clone(), config.unpaywall_email.clone())),
            config.crossref_min_similarity,
        )),
        Arc::new(PmcResolver::new(client.clone(), config.unpaywall_email.clone())),
        Arc::new(UnpaywallResolver::new(client.clone(), config.unpaywall_email.clone())),
        Arc::new(DoiRedirectResolver::new(client.clone())),
        Arc::new(DirectUrlResolver),
        Arc::new(OpenAthensResolver::from_config(config)),
    ]
}

pub(crate) fn requires(field: IdentifierField) -> String {
    format!("requires {}", field.as_str())
}

// ── Shared HTTP helper ───────────────────────────────────────────────────────

/// Extra attempts made for 5xx and connection failures before giving up.
const API_RETRIES: u32 = 2;
const API_RETRY_DELAY: Duration = Duration::from_millis(500);

/// GET a metadata endpoint. Any non-5xx response is returned to the caller;
/// connection failures, timeouts and 5xx are retried and finally reported as `Err`.
pub(crate) async fn get_with_retry(
    client: &PoliteClient,
    url: &str,
    query: &[(&str, &str)],
    timeout: Duration,
) -> Result<reqwest::Response, String> {
    let mut last_error = String::new();
    for attempt in 0..=API_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(API_RETRY_DELAY * attempt).await;
        }
        let request = client.get(url).await.map_err(|e| e.to_string())?;
        match request.query(query).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_server_error() => {
                last_error = format!("HTTP {} from {}", resp.status(), url);
            }
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_timeout() => {
                last_error = format!("timed out after {}s", timeout.as_secs());
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }
        debug!(url, attempt, error = %last_error, "Metadata request failed");
    }
    Err(last_error)
}
