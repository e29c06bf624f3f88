//! Institutional access through an OpenAthens (or EZproxy-style) proxy.
//!
//! The proxy setting is either a prefix (`https://go.openathens.net/redirector/uni.edu?url=`)
//! or a template containing `{url}`. Proxied locations need a logged-in browser session.

use async_trait::async_trait;
use litfetch_common::IdentifierSet;
use litfetch_config::AcquisitionConfig;
use std::time::Duration;

use super::Resolver;
use crate::models::{DownloadRef, FoundMetadata, ResolutionOutcome, SourceKind};

pub struct OpenAthensResolver {
    /// `None` when the proxy is not configured or not enabled.
    proxy: Option<String>,
}

impl OpenAthensResolver {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy: proxy.filter(|p| !p.trim().is_empty()) }
    }

    pub fn from_config(config: &AcquisitionConfig) -> Self {
        if config.openathens_active() {
            Self::new(config.openathens_proxy_url.clone())
        } else {
            Self::new(None)
        }
    }

    fn target(ids: &IdentifierSet) -> Option<String> {
        ids.doi()
            .map(|doi| format!("https://doi.org/{doi}"))
            .or_else(|| ids.known_url().map(str::to_string))
    }
}

/// Rewrites `target` to go through the proxy.
pub fn proxied_url(proxy: &str, target: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    if proxy.contains("{url}") {
        proxy.replace("{url}", &encoded)
    } else {
        format!("{proxy}{encoded}")
    }
}

#[async_trait]
impl Resolver for OpenAthensResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::OpenAthensProxy
    }

    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String> {
        if self.proxy.is_none() {
            return Some("institutional proxy not configured".to_string());
        }
        Self::target(ids).is_none().then(|| "requires doi or known_url".to_string())
    }

    async fn resolve(&self, ids: &IdentifierSet, _timeout: Duration) -> ResolutionOutcome {
        let (Some(proxy), Some(target)) = (self.proxy.as_deref(), Self::target(ids)) else {
            return ResolutionOutcome::skipped(self.kind(), "institutional proxy not configured");
        };
        ResolutionOutcome::found(
            self.kind(),
            DownloadRef::url(proxied_url(proxy, &target)),
            0.6,
            FoundMetadata { prefer_browser: true, ..FoundMetadata::default() },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_template_proxies() {
        assert_eq!(
            proxied_url("https://go.openathens.net/redirector/uni.edu?url=", "https://doi.org/10.1/x"),
            "https://go.openathens.net/redirector/uni.edu?url=https%3A%2F%2Fdoi.org%2F10.1%2Fx"
        );
        assert_eq!(
            proxied_url("https://proxy.uni.edu/login?qurl={url}&x=1", "https://doi.org/10.1/x"),
            "https://proxy.uni.edu/login?qurl=https%3A%2F%2Fdoi.org%2F10.1%2Fx&x=1"
        );
    }

    #[test]
    fn test_inactive_unless_enabled() {
        let mut config = AcquisitionConfig {
            openathens_proxy_url: Some("https://proxy.uni.edu/login?url=".into()),
            ..AcquisitionConfig::default()
        };
        let ids = IdentifierSet::new(1).with_doi("10.1/x");
        assert!(OpenAthensResolver::from_config(&config).skip_reason(&ids).is_some());

        config.openathens_enabled = true;
        assert!(OpenAthensResolver::from_config(&config).skip_reason(&ids).is_none());
        assert!(OpenAthensResolver::from_config(&config).skip_reason(&IdentifierSet::new(1)).is_some());
    }

    #[tokio::test]
    async fn test_found_prefers_browser() {
        let resolver = OpenAthensResolver::new(Some("https://proxy.uni.edu/login?url=".into()));
        let ids = IdentifierSet::new(1).with_known_url("https://journal.org/x");
        match resolver.resolve(&ids, Duration::from_secs(1)).await {
            ResolutionOutcome::Found { metadata, .. } => assert!(metadata.prefer_browser),
            other => panic!("expected Found, got {other:?}"),
        }
    }
}
