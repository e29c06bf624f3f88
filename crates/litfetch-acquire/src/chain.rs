//! Ordered resolver chain with per-resolver timeout and cancellation.
//!
//! The chain stops at the first `Found`. A [`ChainCursor`] remembers how far
//! the chain got, so the orchestrator can resume with the next resolver when a
//! found location later fails to download or verify.

use litfetch_common::{IdentifierSet, PoliteClient};
use litfetch_config::AcquisitionConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::FatalError;
use crate::models::{AttemptLog, ResolutionOutcome, SourceKind};
use crate::progress::{ProgressReporter, Stage};
use crate::sources::{default_resolvers, Resolver};

/// Position in a chain run plus everything tried so far.
#[derive(Debug, Default)]
pub struct ChainCursor {
    next: usize,
    log: AttemptLog,
}

impl ChainCursor {
    pub fn log(&self) -> &AttemptLog {
        &self.log
    }

    pub fn into_log(self) -> AttemptLog {
        self.log
    }

    pub fn exhausted(&self, chain: &ResolverChain) -> bool {
        self.next >= chain.resolvers.len()
    }
}

/// Outcome of a one-shot chain run.
#[derive(Debug, Clone)]
pub struct ChainResolution {
    pub outcome: ResolutionOutcome,
    pub log: AttemptLog,
}

pub struct ResolverChain {
    resolvers: Vec<Arc<dyn Resolver>>,
    skip: HashSet<SourceKind>,
    timeout: Duration,
}

impl ResolverChain {
    /// Resolvers run in the default priority order regardless of the order given.
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>, timeout: Duration) -> Self {
        let mut chain = Self { resolvers, skip: HashSet::new(), timeout };
        chain.sort_by(&SourceKind::PRIORITY);
        chain
    }

    /// Production chain built from configuration.
    pub fn from_config(config: &AcquisitionConfig, client: &PoliteClient) -> Result<Self, FatalError> {
        let skip = config
            .skip_resolvers
            .iter()
            .map(|name| name.parse::<SourceKind>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(FatalError::Config)?;

        let chain = Self::new(default_resolvers(config, client), config.timeout())
            .with_priority(&priority_order(config.prefer_open_access))
            .with_skip_set(skip);
        info!(order = ?chain.order(), "Resolver chain ready");
        Ok(chain)
    }

    /// Reorders resolvers; kinds missing from `order` keep their place at the end.
    pub fn with_priority(mut self, order: &[SourceKind]) -> Self {
        self.sort_by(order);
        self
    }

    pub fn with_skip_set(mut self, skip: impl IntoIterator<Item = SourceKind>) -> Self {
        self.skip.extend(skip);
        self
    }

    pub fn order(&self) -> Vec<SourceKind> {
        self.resolvers.iter().map(|r| r.kind()).collect()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn sort_by(&mut self, order: &[SourceKind]) {
        let rank = |kind: SourceKind| order.iter().position(|k| *k == kind).unwrap_or(order.len());
        self.resolvers.sort_by_key(|r| rank(r.kind()));
    }

    /// Runs the chain from the start and stops at the first `Found`.
    /// When nothing is found the outcome is `NotFound { source: Chain }`.
    pub async fn resolve_first_success(
        &self,
        ids: &IdentifierSet,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> ChainResolution {
        let mut cursor = ChainCursor::default();
        let outcome = self.advance(&mut cursor, ids, cancel, progress).await;
        ChainResolution { outcome, log: cursor.into_log() }
    }

    /// Continues from `cursor` until a resolver finds something or the chain ends.
    /// Non-`Found` outcomes are appended to the cursor's log. Cancellation
    /// returns the synthetic `NotFound` without logging the interrupted resolver.
    #[instrument(skip_all, fields(doc_id = ids.doc_id()))]
    pub async fn advance(
        &self,
        cursor: &mut ChainCursor,
        ids: &IdentifierSet,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> ResolutionOutcome {
        while let Some(resolver) = self.resolvers.get(cursor.next) {
            cursor.next += 1;
            if cancel.is_cancelled() {
                break;
            }
            let kind = resolver.kind();

            let outcome = if self.skip.contains(&kind) {
                ResolutionOutcome::skipped(kind, "disabled by configuration")
            } else if let Some(reason) = resolver.skip_reason(ids) {
                ResolutionOutcome::skipped(kind, reason)
            } else {
                progress.emit(Stage::Resolving, format!("Trying {}…", kind.display_name()));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = tokio::time::timeout(self.timeout, resolver.resolve(ids, self.timeout)) => match result {
                        Ok(outcome) => outcome,
                        Err(_) => ResolutionOutcome::error(kind, format!("timed out after {}s", self.timeout.as_secs())),
                    },
                }
            };

            match outcome {
                ResolutionOutcome::Found { ref download_ref, .. } if download_ref.is_blank() => {
                    warn!(source = %kind, "Empty download reference, continuing");
                    cursor.log.push(ResolutionOutcome::not_found(kind));
                }
                ResolutionOutcome::Found { .. } => {
                    info!(outcome = %outcome.describe(), "Resolver found full text");
                    progress.emit(Stage::Resolving, outcome.describe());
                    return outcome;
                }
                other => {
                    debug!(outcome = %other.describe(), "Resolver did not find full text");
                    if !matches!(other, ResolutionOutcome::Skipped { .. }) {
                        progress.emit(Stage::Resolving, other.describe());
                    }
                    cursor.log.push(other);
                }
            }
        }
        ResolutionOutcome::not_found(SourceKind::Chain)
    }
}

/// Resolver order. Without open-access preference the institutional proxy
/// runs straight after title search.
pub fn priority_order(prefer_open_access: bool) -> Vec<SourceKind> {
    if prefer_open_access {
        return SourceKind::PRIORITY.to_vec();
    }
    let mut order = SourceKind::PRIORITY.to_vec();
    order.retain(|k| *k != SourceKind::OpenAthensProxy);
    order.insert(1, SourceKind::OpenAthensProxy);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::{DownloadRef, FoundMetadata};

    struct Scripted {
        kind: SourceKind,
        outcome: ResolutionOutcome,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(kind: SourceKind, outcome: ResolutionOutcome) -> Arc<Self> {
            Arc::new(Self { kind, outcome, calls: AtomicUsize::new(0), delay: Duration::ZERO })
        }

        fn slow(kind: SourceKind, delay: Duration) -> Arc<Self> {
            Arc::new(Self { kind, outcome: ResolutionOutcome::not_found(kind), calls: AtomicUsize::new(0), delay })
        }
    }

    #[async_trait]
    impl Resolver for Scripted {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn skip_reason(&self, _ids: &IdentifierSet) -> Option<String> {
            None
        }

        async fn resolve(&self, _ids: &IdentifierSet, _timeout: Duration) -> ResolutionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    fn found(kind: SourceKind, url: &str) -> ResolutionOutcome {
        ResolutionOutcome::found(kind, DownloadRef::url(url), 0.9, FoundMetadata::default())
    }

    #[test]
    fn test_priority_order_promotes_proxy() {
        let order = priority_order(false);
        assert_eq!(order[0], SourceKind::CrossRefTitle);
        assert_eq!(order[1], SourceKind::OpenAthensProxy);
        assert_eq!(order.len(), SourceKind::PRIORITY.len());
        assert_eq!(priority_order(true).last(), Some(&SourceKind::OpenAthensProxy));
    }

    #[tokio::test]
    async fn test_stops_at_first_found_in_priority_order() {
        let unpaywall = Scripted::new(SourceKind::Unpaywall, found(SourceKind::Unpaywall, "https://oa.org/x.pdf"));
        let pmc = Scripted::new(SourceKind::Pmc, ResolutionOutcome::not_found(SourceKind::Pmc));
        let direct = Scripted::new(SourceKind::DirectUrl, found(SourceKind::DirectUrl, "https://x.org/y.pdf"));
        // deliberately out of order
        let chain = ResolverChain::new(vec![direct.clone(), unpaywall.clone(), pmc.clone()], Duration::from_secs(5));

        let result = chain
            .resolve_first_success(&IdentifierSet::new(1), &CancellationToken::new(), &ProgressReporter::silent())
            .await;

        assert_eq!(result.outcome.source(), SourceKind::Unpaywall);
        assert_eq!(result.log.entries(), &[ResolutionOutcome::not_found(SourceKind::Pmc)]);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skip_set_is_logged_and_not_called() {
        let pmc = Scripted::new(SourceKind::Pmc, found(SourceKind::Pmc, "https://pmc.org/x.pdf"));
        let chain = ResolverChain::new(vec![pmc.clone()], Duration::from_secs(5)).with_skip_set([SourceKind::Pmc]);

        let result = chain
            .resolve_first_success(&IdentifierSet::new(1), &CancellationToken::new(), &ProgressReporter::silent())
            .await;

        assert_eq!(result.outcome, ResolutionOutcome::not_found(SourceKind::Chain));
        assert_eq!(result.log.skipped(), vec![SourceKind::Pmc]);
        assert_eq!(pmc.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_resolver_times_out_as_error() {
        let slow = Scripted::slow(SourceKind::DoiRedirect, Duration::from_secs(60));
        let chain = ResolverChain::new(vec![slow], Duration::from_secs(2));

        let result = chain
            .resolve_first_success(&IdentifierSet::new(1), &CancellationToken::new(), &ProgressReporter::silent())
            .await;

        assert!(matches!(
            result.log.entries(),
            [ResolutionOutcome::Error { source: SourceKind::DoiRedirect, .. }]
        ));
        assert!(result.log.only_errors());
    }

    #[tokio::test]
    async fn test_cursor_resumes_after_found() {
        let pmc = Scripted::new(SourceKind::Pmc, found(SourceKind::Pmc, "https://pmc.org/x.pdf"));
        let unpaywall = Scripted::new(SourceKind::Unpaywall, found(SourceKind::Unpaywall, "https://oa.org/x.pdf"));
        let chain = ResolverChain::new(vec![pmc, unpaywall], Duration::from_secs(5));
        let ids = IdentifierSet::new(1);
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::silent();

        let mut cursor = ChainCursor::default();
        assert_eq!(chain.advance(&mut cursor, &ids, &cancel, &progress).await.source(), SourceKind::Pmc);
        assert_eq!(chain.advance(&mut cursor, &ids, &cancel, &progress).await.source(), SourceKind::Unpaywall);
        assert_eq!(chain.advance(&mut cursor, &ids, &cancel, &progress).await.source(), SourceKind::Chain);
        assert!(cursor.exhausted(&chain));
    }

    #[tokio::test]
    async fn test_cancelled_chain_stops_immediately() {
        let pmc = Scripted::new(SourceKind::Pmc, found(SourceKind::Pmc, "https://pmc.org/x.pdf"));
        let chain = ResolverChain::new(vec![pmc.clone()], Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = chain.resolve_first_success(&IdentifierSet::new(1), &cancel, &ProgressReporter::silent()).await;
        assert_eq!(result.outcome.source(), SourceKind::Chain);
        assert!(result.log.is_empty());
        assert_eq!(pmc.calls.load(Ordering::SeqCst), 0);
    }
}
