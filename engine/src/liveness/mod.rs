//! Liveness aggregation.
//!
//! Each [`LivenessProvider`] asserts that some identifiers are in use. The
//! aggregator unions their facts into a [`LiveSet`], remembering which
//! sources asserted each identifier.

mod providers;

pub use providers::{
    ReferenceFieldProvider, StaticProvider, UsageRecord, UsageReportProvider,
    WorkloadReportProvider,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use regsweep_core::error::{Result, SweepError};
use regsweep_core::filter::IdentifierFilter;
use regsweep_core::identifier::Identifier;
use serde::{Deserialize, Serialize};

/// An identifier some source considers in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessFact {
    pub identifier: Identifier,
    /// Last recorded use, if the source tracks recency
    pub last_used: Option<DateTime<Utc>>,
}

impl LivenessFact {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            last_used: None,
        }
    }

    pub fn used_at(identifier: Identifier, last_used: DateTime<Utc>) -> Self {
        Self {
            identifier,
            last_used: Some(last_used),
        }
    }
}

/// A source of liveness facts.
#[async_trait]
pub trait LivenessProvider: Send + Sync {
    /// Name used to tag facts in the live set.
    fn name(&self) -> &str;

    /// Identifiers this source considers live.
    ///
    /// The filter is informational. Facts outside it must still be
    /// returned, since any live alias protects an image.
    async fn live_identifiers(&self, filter: Option<&IdentifierFilter>) -> Result<Vec<LivenessFact>>;
}

/// Deduplicated live identifiers with the sources that asserted them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveSet {
    sources: BTreeMap<Identifier, BTreeSet<String>>,
}

impl LiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: Identifier, source: impl Into<String>) {
        self.sources
            .entry(identifier)
            .or_default()
            .insert(source.into());
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.sources.contains_key(identifier)
    }

    pub fn sources_of(&self, identifier: &Identifier) -> Option<&BTreeSet<String>> {
        self.sources.get(identifier)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &Identifier> {
        self.sources.keys()
    }

    /// Live identifier count per source.
    pub fn source_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for sources in self.sources.values() {
            for source in sources {
                *counts.entry(source.clone()).or_default() += 1;
            }
        }
        counts
    }
}

/// Unions the facts of every provider.
pub struct LivenessAggregator {
    providers: Vec<Arc<dyn LivenessProvider>>,
    unused_since: Option<DateTime<Utc>>,
}

impl LivenessAggregator {
    pub fn new(providers: Vec<Arc<dyn LivenessProvider>>) -> Self {
        Self {
            providers,
            unused_since: None,
        }
    }

    /// Facts carrying a last-used time older than `threshold` stop counting.
    /// Facts without a time always count.
    pub fn unused_since(mut self, threshold: Option<DateTime<Utc>>) -> Self {
        self.unused_since = threshold;
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Query all providers concurrently. Any provider error aborts.
    pub async fn aggregate(&self, filter: Option<&IdentifierFilter>) -> Result<LiveSet> {
        let queries = self.providers.iter().map(|provider| async move {
            let facts = provider
                .live_identifiers(filter)
                .await
                .map_err(|e| match e {
                    SweepError::Provider { .. } => e,
                    other => SweepError::Provider {
                        provider: provider.name().to_string(),
                        message: other.to_string(),
                    },
                })?;
            Ok::<_, SweepError>((provider.name().to_string(), facts))
        });
        let results = try_join_all(queries).await?;

        let mut live = LiveSet::new();
        for (source, facts) in results {
            let mut counted = 0usize;
            let mut stale = 0usize;
            for fact in facts {
                if self.is_stale(&fact) {
                    stale += 1;
                    continue;
                }
                live.insert(fact.identifier, source.clone());
                counted += 1;
            }
            tracing::info!(provider = %source, live = counted, stale, "Collected liveness facts");
        }

        tracing::info!(live_identifiers = live.len(), "Liveness aggregated");
        Ok(live)
    }

    fn is_stale(&self, fact: &LivenessFact) -> bool {
        match (self.unused_since, fact.last_used) {
            (Some(threshold), Some(last_used)) => last_used < threshold,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const A: &str = "5f1e9c2a7b3d4e6f8a9b0c1d";
    const B: &str = "0123456789abcdef01234567";

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    struct Fixed(&'static str, Vec<LivenessFact>);

    #[async_trait]
    impl LivenessProvider for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn live_identifiers(&self, _filter: Option<&IdentifierFilter>) -> Result<Vec<LivenessFact>> {
            Ok(self.1.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl LivenessProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn live_identifiers(&self, _filter: Option<&IdentifierFilter>) -> Result<Vec<LivenessFact>> {
            Err(SweepError::Other("backend down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_union_tags_sources() {
        let aggregator = LivenessAggregator::new(vec![
            Arc::new(Fixed("runs", vec![LivenessFact::new(id(A))])),
            Arc::new(Fixed("workloads", vec![LivenessFact::new(id(A)), LivenessFact::new(id(B))])),
            Arc::new(Fixed("empty", vec![])),
        ]);
        let live = aggregator.aggregate(None).await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live.sources_of(&id(A)).unwrap().len(), 2);
        assert_eq!(live.source_counts()["workloads"], 2);
        assert!(!live.source_counts().contains_key("empty"));
    }

    #[tokio::test]
    async fn test_threshold_drops_only_stale_recency_facts() {
        let now = Utc::now();
        let aggregator = LivenessAggregator::new(vec![
            Arc::new(Fixed(
                "runs",
                vec![LivenessFact::used_at(id(A), now - Duration::days(400))],
            )),
            Arc::new(Fixed("projects", vec![LivenessFact::new(id(B))])),
        ])
        .unused_since(Some(now - Duration::days(180)));

        let live = aggregator.aggregate(None).await.unwrap();
        assert!(!live.contains(&id(A)));
        assert!(live.contains(&id(B)));
    }

    #[tokio::test]
    async fn test_recent_fact_survives_threshold() {
        let now = Utc::now();
        let aggregator = LivenessAggregator::new(vec![Arc::new(Fixed(
            "runs",
            vec![
                LivenessFact::used_at(id(A), now - Duration::days(400)),
                LivenessFact::used_at(id(A), now - Duration::days(2)),
            ],
        ))])
        .unused_since(Some(now - Duration::days(30)));
        assert!(aggregator.aggregate(None).await.unwrap().contains(&id(A)));
    }

    #[tokio::test]
    async fn test_without_threshold_old_facts_are_live() {
        let aggregator = LivenessAggregator::new(vec![Arc::new(Fixed(
            "runs",
            vec![LivenessFact::used_at(id(A), Utc::now() - Duration::days(4000))],
        ))]);
        assert!(aggregator.aggregate(None).await.unwrap().contains(&id(A)));
    }

    #[tokio::test]
    async fn test_provider_error_aborts() {
        let aggregator = LivenessAggregator::new(vec![
            Arc::new(Fixed("runs", vec![LivenessFact::new(id(A))])),
            Arc::new(Broken),
        ]);
        let err = aggregator.aggregate(None).await.unwrap_err();
        match err {
            SweepError::Provider { provider, .. } => assert_eq!(provider, "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
