//! Wires configuration into engine components.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regsweep_core::{IdentifierFilter, SweepConfig, SweepError};
use regsweep_engine::liveness::{
    LivenessAggregator, LivenessProvider, ReferenceFieldProvider, StaticProvider,
    UsageReportProvider, WorkloadReportProvider,
};
use regsweep_engine::{
    Analyzer, CheckpointManager, DeletionCoordinator, GovernedStore, Governor, GraphBuilder,
    ImageStore, JsonMetadataStore, MetadataStore, OciLayoutBackup, RegistryClient,
    DELETE_OPERATION,
};

/// Loaded configuration plus the shared registry client and governor.
pub struct Context {
    pub config: SweepConfig,
    governor: Arc<Governor>,
    registry: Arc<RegistryClient>,
    store: Arc<dyn ImageStore>,
}

impl Context {
    pub fn load(config_path: Option<&Path>) -> Result<Self, SweepError> {
        let config = SweepConfig::load(config_path)?;
        Self::from_config(config)
    }

    pub fn from_config(config: SweepConfig) -> Result<Self, SweepError> {
        let governor = Arc::new(Governor::new(&config.rate_limit, &config.retry));
        let registry = Arc::new(RegistryClient::new(
            &config.registry,
            config.delete_toggle.clone(),
        )?);
        let raw: Arc<dyn ImageStore> = registry.clone();
        let store: Arc<dyn ImageStore> = Arc::new(GovernedStore::new(raw, governor.clone()));
        Ok(Self {
            config,
            governor,
            registry,
            store,
        })
    }

    pub fn store(&self) -> Arc<dyn ImageStore> {
        self.store.clone()
    }

    pub fn metadata_store(&self) -> Result<Arc<dyn MetadataStore>, SweepError> {
        let path = self.config.metadata.path.as_deref().ok_or_else(|| {
            SweepError::Config("metadata.path must point at the metadata store directory".to_string())
        })?;
        Ok(Arc::new(JsonMetadataStore::new(path)?))
    }

    /// Every configured liveness source.
    pub fn providers(&self, metadata: Arc<dyn MetadataStore>) -> Vec<Arc<dyn LivenessProvider>> {
        let liveness = &self.config.liveness;
        let mut providers: Vec<Arc<dyn LivenessProvider>> = Vec::new();

        if !liveness.default_identifiers.is_empty() {
            providers.push(Arc::new(StaticProvider::new(
                "defaults",
                liveness.default_identifiers.clone(),
            )));
        }
        if !liveness.overrides.is_empty() {
            providers.push(Arc::new(StaticProvider::new(
                "overrides",
                liveness.overrides.clone(),
            )));
        }
        for path in &liveness.usage_reports {
            providers.push(Arc::new(UsageReportProvider::new(path.clone())));
        }
        for path in &liveness.workload_reports {
            providers.push(Arc::new(WorkloadReportProvider::new(path.clone())));
        }
        if !liveness.reference_fields.is_empty() {
            providers.push(Arc::new(ReferenceFieldProvider::new(
                metadata,
                liveness.reference_fields.clone(),
            )));
        }
        tracing::info!(
            providers = providers.len(),
            usage_reports = liveness.usage_reports.len(),
            workload_reports = liveness.workload_reports.len(),
            "Liveness sources configured"
        );
        providers
    }

    pub fn analyzer(
        &self,
        metadata: Arc<dyn MetadataStore>,
        filter: Option<IdentifierFilter>,
        unused_since: Option<DateTime<Utc>>,
    ) -> Analyzer {
        let repositories = self.config.registry.repositories();
        let paths = repositories.iter().map(|r| r.path.clone()).collect();
        let builder = GraphBuilder::new(self.store(), repositories)
            .max_workers(self.config.analysis.max_workers)
            .skip_tags(self.config.analysis.skip_tags.clone())
            .filter(filter.clone());
        let aggregator =
            LivenessAggregator::new(self.providers(metadata)).unused_since(unused_since);
        Analyzer::new(self.config.registry.url.clone(), paths, builder, aggregator)
            .filter(filter)
            .unused_since(unused_since)
    }

    pub fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(self.config.checkpoint_dir(), DELETE_OPERATION)
    }

    pub fn report_dir(&self) -> PathBuf {
        self.config.report_dir()
    }

    pub fn coordinator(&self, metadata: Arc<dyn MetadataStore>) -> DeletionCoordinator {
        DeletionCoordinator::new(
            self.store(),
            metadata,
            self.config.metadata.clone(),
            self.checkpoints(),
        )
    }

    pub fn backup(&self, dir: &Path) -> OciLayoutBackup {
        OciLayoutBackup::new(self.registry.clone(), self.governor.clone(), dir)
    }
}
