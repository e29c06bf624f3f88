//! Uses a URL already recorded in the catalog.

use async_trait::async_trait;
use litfetch_common::{IdentifierField, IdentifierSet, PoliteClient};
use std::time::Duration;

use super::{requires, Resolver};
use crate::models::{DownloadRef, FoundMetadata, ResolutionOutcome, SourceKind};

pub struct DirectUrlResolver;

#[async_trait]
impl Resolver for DirectUrlResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::DirectUrl
    }

    fn skip_reason(&self, ids: &IdentifierSet) -> Option<String> {
        let url = match ids.known_url() {
            Some(u) => u,
            None => return Some(requires(IdentifierField::KnownUrl)),
        };
        PoliteClient::host_of(url)
            .err()
            .map(|e| format!("known_url is not usable: {e}"))
    }

    async fn resolve(&self, ids: &IdentifierSet, _timeout: Duration) -> ResolutionOutcome {
        match ids.known_url() {
            Some(url) => {
                let confidence = if url.to_ascii_lowercase().ends_with(".pdf") { 0.7 } else { 0.5 };
                ResolutionOutcome::found(self.kind(), DownloadRef::url(url), confidence, FoundMetadata::default())
            }
            None => ResolutionOutcome::skipped(self.kind(), requires(IdentifierField::KnownUrl)),
        }
    }
}
