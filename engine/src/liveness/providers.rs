//! Concrete liveness sources.
//!
//! Providers report every identifier their source considers live. The
//! filter is not used to prune facts: an aliased tag outside the filter can
//! protect an image the filter names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regsweep_core::config::ReferenceField;
use regsweep_core::error::{Result, SweepError};
use regsweep_core::filter::IdentifierFilter;
use regsweep_core::identifier::Identifier;
use serde::Deserialize;
use serde_json::Value;

use super::{LivenessFact, LivenessProvider};
use crate::metadata::{lookup_path, value_as_id_str, MetadataStore, RecordMatcher};

/// Fixed identifiers from configuration (platform defaults, pins).
pub struct StaticProvider {
    name: String,
    identifiers: Vec<Identifier>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>, identifiers: Vec<Identifier>) -> Self {
        Self {
            name: name.into(),
            identifiers,
        }
    }
}

#[async_trait]
impl LivenessProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn live_identifiers(&self, _filter: Option<&IdentifierFilter>) -> Result<Vec<LivenessFact>> {
        Ok(self
            .identifiers
            .iter()
            .cloned()
            .map(LivenessFact::new)
            .collect())
    }
}

/// One entry of a usage report.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Image tags (or full references) the record used
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

fn read_json<T: for<'de> Deserialize<'de>>(provider: &str, path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path).map_err(|e| SweepError::Provider {
        provider: provider.to_string(),
        message: format!("Failed to read {}: {}", path.display(), e),
    })?;
    serde_json::from_str(&data).map_err(|e| SweepError::Provider {
        provider: provider.to_string(),
        message: format!("Malformed report {}: {}", path.display(), e),
    })
}

/// Historical usage (runs, workspaces, model APIs) exported as JSON records.
pub struct UsageReportProvider {
    name: String,
    path: PathBuf,
}

impl UsageReportProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| format!("usage:{}", s.to_string_lossy()))
            .unwrap_or_else(|| "usage".to_string());
        Self { name, path }
    }
}

#[async_trait]
impl LivenessProvider for UsageReportProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn live_identifiers(&self, _filter: Option<&IdentifierFilter>) -> Result<Vec<LivenessFact>> {
        let records: Vec<UsageRecord> = read_json(&self.name, &self.path)?;
        let mut facts = Vec::new();

        for record in records {
            let mut ids: Vec<Identifier> = Vec::new();
            for raw in &record.identifiers {
                match Identifier::parse(raw) {
                    Ok(id) => ids.push(id),
                    Err(e) => tracing::warn!(provider = %self.name, error = %e, "Ignoring malformed identifier"),
                }
            }
            for tag in &record.tags {
                ids.extend(Identifier::extract_all(tag));
            }
            for id in ids {
                facts.push(LivenessFact {
                    identifier: id,
                    last_used: record.last_used,
                });
            }
        }
        Ok(facts)
    }
}

/// Images referenced by running workloads.
///
/// The report is either a JSON array of image references or an object
/// keyed by image reference (values are ignored).
pub struct WorkloadReportProvider {
    name: String,
    path: PathBuf,
}

impl WorkloadReportProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            name: "workloads".to_string(),
            path: path.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkloadReport {
    List(Vec<String>),
    Keyed(BTreeMap<String, Value>),
}

#[async_trait]
impl LivenessProvider for WorkloadReportProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn live_identifiers(&self, _filter: Option<&IdentifierFilter>) -> Result<Vec<LivenessFact>> {
        let report: WorkloadReport = read_json(&self.name, &self.path)?;
        let images: Vec<String> = match report {
            WorkloadReport::List(images) => images,
            WorkloadReport::Keyed(map) => map.into_keys().collect(),
        };
        Ok(images
            .iter()
            .flat_map(|image| Identifier::extract_all(image))
            .map(LivenessFact::new)
            .collect())
    }
}

/// Identifiers referenced from metadata records (project overrides,
/// scheduled jobs, organization defaults, app versions).
pub struct ReferenceFieldProvider {
    store: Arc<dyn MetadataStore>,
    fields: Vec<ReferenceField>,
}

impl ReferenceFieldProvider {
    pub fn new(store: Arc<dyn MetadataStore>, fields: Vec<ReferenceField>) -> Self {
        Self { store, fields }
    }
}

fn collect_ids(value: &Value, out: &mut Vec<Identifier>) {
    if let Value::Array(items) = value {
        for item in items {
            collect_ids(item, out);
        }
        return;
    }
    if let Some(raw) = value_as_id_str(value) {
        if let Ok(id) = Identifier::parse(raw) {
            out.push(id);
        }
    }
}

#[async_trait]
impl LivenessProvider for ReferenceFieldProvider {
    fn name(&self) -> &str {
        "metadata-references"
    }

    async fn live_identifiers(&self, _filter: Option<&IdentifierFilter>) -> Result<Vec<LivenessFact>> {
        let mut ids = Vec::new();
        for field in &self.fields {
            let records = self
                .store
                .find_records(&field.collection, &RecordMatcher::All)
                .await?;
            let before = ids.len();
            for record in &records {
                if let Some(value) = lookup_path(record, &field.field) {
                    collect_ids(value, &mut ids);
                }
            }
            tracing::debug!(
                collection = %field.collection,
                field = %field.field,
                references = ids.len() - before,
                "Scanned reference field"
            );
        }
        Ok(ids.into_iter().map(LivenessFact::new).collect())
    }
}
