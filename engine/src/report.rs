//! Report artifacts written to the state directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regsweep_core::error::{Result, SweepError};
use regsweep_core::filter::FilterEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::coordinator::DeletionReport;
use crate::graph::GraphSummary;
use crate::selector::Selection;
use crate::store::ImageKey;

/// Everything needed to review or replay a deletion without re-scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub registry: String,
    pub repositories: Vec<String>,
    #[serde(default)]
    pub filter: Vec<FilterEntry>,
    pub unused_since: Option<DateTime<Utc>>,
    pub graph: GraphSummary,
    pub providers: Vec<String>,
    pub live_identifiers: usize,
    /// Live identifiers asserted per provider
    pub live_sources: BTreeMap<String, usize>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub failed_images: Vec<ImageKey>,
    pub selection: Selection,
}

impl AnalysisReport {
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        save_json(dir, "analysis", &self.generated_at, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

impl DeletionReport {
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        save_json(dir, "deletion", &self.generated_at, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

/// Write `<dir>/<prefix>-<timestamp>.json` atomically.
fn save_json<T: Serialize>(dir: &Path, prefix: &str, at: &DateTime<Utc>, value: &T) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}-{}.json", prefix, at.format("%Y%m%d-%H%M%S-%3f")));
    let data = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &data)?;
    std::fs::rename(&tmp_path, &path)?;
    tracing::info!(path = %path.display(), "Report saved");
    Ok(path)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        SweepError::Config(format!("Failed to read report {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&data)
        .map_err(|e| SweepError::Serialization(format!("Malformed report {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report() -> AnalysisReport {
        AnalysisReport {
            generated_at: Utc::now(),
            registry: "docker-registry:5000".to_string(),
            repositories: vec!["dominodatalab/environment".to_string()],
            filter: Vec::new(),
            unused_since: None,
            graph: GraphSummary::default(),
            providers: vec!["defaults".to_string()],
            live_identifiers: 0,
            live_sources: BTreeMap::new(),
            warnings: Vec::new(),
            failed_images: Vec::new(),
            selection: Selection::default(),
        }
    }

    #[test]
    fn test_analysis_report_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let original = report();
        let path = original.save(tmp.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("analysis-"));
        let loaded = AnalysisReport::load(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_malformed_report() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("analysis-bad.json");
        std::fs::write(&path, "{\"registry\": 1}").unwrap();
        assert!(matches!(
            AnalysisReport::load(&path).unwrap_err(),
            SweepError::Serialization(_)
        ));
    }
}
