use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};
use crate::identifier::Identifier;

/// Top-level regsweep configuration.
///
/// Every section defaults independently so an empty YAML file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub registry: RegistryConfig,
    pub analysis: AnalysisConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub metadata: MetadataConfig,
    pub liveness: LivenessConfig,

    /// External commands that flip the registry's delete switch
    pub delete_toggle: Option<DeleteToggleConfig>,

    /// Checkpoints and reports live under this directory
    pub state_dir: PathBuf,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            analysis: AnalysisConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            metadata: MetadataConfig::default(),
            liveness: LivenessConfig::default(),
            delete_toggle: None,
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".regsweep"))
        .unwrap_or_else(|| PathBuf::from(".regsweep"))
}

impl SweepConfig {
    /// Parse a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load from a file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    SweepError::Config(format!(
                        "Failed to read config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_yaml(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.analysis.max_workers == 0 {
            return Err(SweepError::Config(
                "analysis.max_workers must be at least 1".to_string(),
            ));
        }
        if self.analysis.max_workers > 100 {
            tracing::warn!(
                max_workers = self.analysis.max_workers,
                "Very high worker count may overwhelm the registry"
            );
        }

        let rps = self.rate_limit.requests_per_second;
        if !rps.is_finite() || rps <= 0.0 {
            return Err(SweepError::Config(format!(
                "rate_limit.requests_per_second must be a positive number, got {rps}"
            )));
        }
        if self.rate_limit.burst_size == 0 {
            return Err(SweepError::Config(
                "rate_limit.burst_size must be at least 1".to_string(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(SweepError::Config(format!(
                "retry.max_delay_ms ({}) is smaller than retry.initial_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.initial_delay_ms
            )));
        }
        let base = self.retry.exponential_base;
        if !base.is_finite() || base < 1.0 {
            return Err(SweepError::Config(format!(
                "retry.exponential_base must be >= 1.0, got {base}"
            )));
        }
        if self.retry.max_retries > 10 {
            tracing::warn!(
                max_retries = self.retry.max_retries,
                "High retry count can stall a run for a long time"
            );
        }

        if self.registry.image_types.is_empty() && self.registry.legacy_repositories.is_empty() {
            return Err(SweepError::Config(
                "registry.image_types lists no repositories to scan".to_string(),
            ));
        }

        if let Some(toggle) = &self.delete_toggle {
            if toggle.enable_command.is_empty() || toggle.disable_command.is_empty() {
                return Err(SweepError::Config(
                    "delete_toggle needs both enable_command and disable_command".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.state_dir.join("reports")
    }
}

/// A repository to scan and the image type its tags belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub image_type: String,
    /// Repository path relative to the registry host
    pub path: String,
}

/// Registry connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host (and port)
    pub url: String,

    /// Namespace that holds one repository per image type
    pub repository: String,

    pub image_types: Vec<String>,

    /// Use plain HTTP
    pub insecure: bool,

    /// Older namespacing conventions scanned in addition to the defaults
    pub legacy_repositories: Vec<RepositorySpec>,

    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "docker-registry:5000".to_string(),
            repository: "dominodatalab".to_string(),
            image_types: vec!["environment".to_string(), "model".to_string()],
            insecure: true,
            legacy_repositories: Vec::new(),
            username: None,
            password: None,
        }
    }
}

impl RegistryConfig {
    /// All repositories to scan: `<repository>/<type>` for each image type,
    /// followed by the legacy namespaces.
    pub fn repositories(&self) -> Vec<RepositorySpec> {
        let mut specs: Vec<RepositorySpec> = self
            .image_types
            .iter()
            .map(|image_type| RepositorySpec {
                image_type: image_type.clone(),
                path: if self.repository.is_empty() {
                    image_type.clone()
                } else {
                    format!("{}/{}", self.repository, image_type)
                },
            })
            .collect();
        for legacy in &self.legacy_repositories {
            if !specs.contains(legacy) {
                specs.push(legacy.clone());
            }
        }
        specs
    }

    /// Credentials from the config file, else `REGISTRY_USERNAME` /
    /// `REGISTRY_PASSWORD`, else anonymous.
    pub fn credentials(&self) -> Option<(String, String)> {
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            return Some((user.clone(), pass.clone()));
        }
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(user), Ok(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    /// Base URL for direct HTTP calls.
    pub fn base_url(&self) -> String {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            return self.url.trim_end_matches('/').to_string();
        }
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}", scheme, self.url.trim_end_matches('/'))
    }

    /// Host part without scheme, as used in image references.
    pub fn host(&self) -> &str {
        self.url
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
    }
}

/// Graph build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Concurrent manifest fetches
    pub max_workers: usize,

    /// Tags never considered part of the graph
    pub skip_tags: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            skip_tags: vec!["buildcache".to_string()],
        }
    }
}

/// Retry/backoff settings for registry calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    /// Spread delays by +/-10%
    pub jitter: bool,
    /// Extra wait after a "too many requests" response
    pub rate_limit_cooldown_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            rate_limit_cooldown_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }
}

/// Token bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst_size: 20,
        }
    }
}

/// Metadata document store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Directory holding one `<collection>.json` per collection
    pub path: Option<PathBuf>,

    /// Collections cleaned per image type, tried in order
    pub collections: BTreeMap<String, Vec<String>>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        let mut collections = BTreeMap::new();
        collections.insert(
            "environment".to_string(),
            vec![
                "environment_revisions".to_string(),
                "environments_v2".to_string(),
            ],
        );
        collections.insert(
            "model".to_string(),
            vec!["model_versions".to_string(), "models".to_string()],
        );
        Self {
            path: None,
            collections,
        }
    }
}

impl MetadataConfig {
    /// Collections for an image type, empty if the type has none.
    pub fn collections_for(&self, image_type: &str) -> &[String] {
        self.collections
            .get(image_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A metadata field whose values reference identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceField {
    pub collection: String,
    /// Dotted path into the record, e.g. `jobDataPlain.overrideEnvironmentId`
    pub field: String,
}

impl ReferenceField {
    fn new(collection: &str, field: &str) -> Self {
        Self {
            collection: collection.to_string(),
            field: field.to_string(),
        }
    }
}

/// Liveness sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// JSON usage reports (run/workspace/model API history)
    pub usage_reports: Vec<PathBuf>,

    /// JSON dumps of image tags used by running workloads
    pub workload_reports: Vec<PathBuf>,

    pub reference_fields: Vec<ReferenceField>,

    /// Platform default environments, always live
    pub default_identifiers: Vec<Identifier>,

    /// Operator-pinned identifiers, always live
    pub overrides: Vec<Identifier>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            usage_reports: Vec::new(),
            workload_reports: Vec::new(),
            reference_fields: vec![
                ReferenceField::new("projects", "overrideV2EnvironmentId"),
                ReferenceField::new("scheduler_jobs", "jobDataPlain.overrideEnvironmentId"),
                ReferenceField::new("organizations", "defaultEnvironmentId"),
                ReferenceField::new("app_versions", "environmentId"),
            ],
            default_identifiers: Vec::new(),
            overrides: Vec::new(),
        }
    }
}

/// Commands toggling the registry's delete switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteToggleConfig {
    /// argv of the command enabling deletes
    pub enable_command: Vec<String>,

    /// argv of the command disabling deletes
    pub disable_command: Vec<String>,

    /// How long to wait for the registry to answer after a toggle
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_ready_timeout() -> u64 {
    120
}
