//! Analysis pass: build the graph, aggregate liveness, select candidates.

use chrono::Utc;
use regsweep_core::error::Result;
use regsweep_core::filter::IdentifierFilter;

use crate::graph::GraphBuilder;
use crate::liveness::LivenessAggregator;
use crate::report::AnalysisReport;
use crate::selector::select;

/// Read-only pipeline feeding the deletion coordinator.
pub struct Analyzer {
    registry: String,
    builder: GraphBuilder,
    aggregator: LivenessAggregator,
    filter: Option<IdentifierFilter>,
    unused_since: Option<chrono::DateTime<Utc>>,
    repositories: Vec<String>,
}

impl Analyzer {
    pub fn new(
        registry: impl Into<String>,
        repositories: Vec<String>,
        builder: GraphBuilder,
        aggregator: LivenessAggregator,
    ) -> Self {
        Self {
            registry: registry.into(),
            builder,
            aggregator,
            filter: None,
            unused_since: None,
            repositories,
        }
    }

    pub fn filter(mut self, filter: Option<IdentifierFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Recorded in the report; the aggregator applies the threshold itself.
    pub fn unused_since(mut self, threshold: Option<chrono::DateTime<Utc>>) -> Self {
        self.unused_since = threshold;
        self
    }

    pub async fn run(&self) -> Result<AnalysisReport> {
        let build = self.builder.build().await?;
        let live = self.aggregator.aggregate(self.filter.as_ref()).await?;
        let selection = select(&build.graph, &live, self.filter.as_ref());

        let mut warnings = build.warnings;
        if !build.failed.is_empty() {
            warnings.push(format!(
                "{} image(s) could not be inspected; their identifiers stay protected and no layer is counted as freed",
                build.failed.len()
            ));
        }
        if !selection.withheld.is_empty() {
            warnings.push(format!(
                "{} unreferenced image(s) withheld because a retained tag shares their manifest",
                selection.withheld.len()
            ));
        }

        Ok(AnalysisReport {
            generated_at: Utc::now(),
            registry: self.registry.clone(),
            repositories: self.repositories.clone(),
            filter: self
                .filter
                .as_ref()
                .map(|f| f.entries().cloned().collect())
                .unwrap_or_default(),
            unused_since: self.unused_since,
            graph: build.graph.summary(),
            providers: self.aggregator.provider_names(),
            live_identifiers: live.len(),
            live_sources: live.source_counts(),
            warnings,
            failed_images: build.failed,
            selection,
        })
    }
}
