//! Image store abstraction.
//!
//! The engine talks to the registry only through [`ImageStore`], so the
//! governor, graph builder and deletion coordinator can be exercised
//! against in-memory fakes.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use regsweep_core::error::{Result, SweepError};
use serde::{Deserialize, Serialize};

/// Identity of one image: repository path plus tag.
///
/// Serialized as `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageKey {
    pub repository: String,
    pub tag: String,
}

impl ImageKey {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageKey {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        // Tags cannot contain '/', so the last ':' after the last '/' splits.
        let name_start = s.rfind('/').map_or(0, |i| i + 1);
        match s[name_start..].rfind(':') {
            Some(offset) => {
                let split = name_start + offset;
                let (repository, tag) = (&s[..split], &s[split + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return Err(SweepError::Other(format!("Invalid image key '{s}'")));
                }
                Ok(Self::new(repository, tag))
            }
            None => Err(SweepError::Other(format!(
                "Invalid image key '{s}': missing tag"
            ))),
        }
    }
}

impl TryFrom<String> for ImageKey {
    type Error = SweepError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ImageKey> for String {
    fn from(key: ImageKey) -> Self {
        key.to_string()
    }
}

/// One layer as listed in an image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub digest: String,
    pub size: u64,
}

/// What `inspect` returns for a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifestInfo {
    /// Manifest digest
    pub digest: String,
    /// Layers in manifest order; digests may repeat
    pub layers: Vec<LayerInfo>,
}

/// Operations the engine needs from the image store.
///
/// Implementations must report an absent repository or tag as
/// [`SweepError::NotFound`], distinct from transient failures.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// All tags in a repository.
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Manifest digest and layers for one tag.
    async fn inspect(&self, repository: &str, tag: &str) -> Result<ImageManifestInfo>;

    /// Delete the manifest a tag points to.
    async fn delete(&self, repository: &str, tag: &str) -> Result<()>;

    /// Flip the store-wide delete switch.
    async fn set_delete_enabled(&self, enabled: bool) -> Result<()>;

    /// Block until the store answers requests again.
    async fn wait_ready(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = ImageKey::new("dominodatalab/environment", "5f1e9c2a7b3d4e6f8a9b0c1d-3");
        assert_eq!(key.to_string(), "dominodatalab/environment:5f1e9c2a7b3d4e6f8a9b0c1d-3");
        let parsed: ImageKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_parse_with_registry_port() {
        let key: ImageKey = "registry:5000/team/model:v1".parse().unwrap();
        assert_eq!(key.repository, "registry:5000/team/model");
        assert_eq!(key.tag, "v1");
    }

    #[test]
    fn test_key_parse_rejects_missing_tag() {
        assert!("registry:5000/team/model".parse::<ImageKey>().is_err());
        assert!("model:".parse::<ImageKey>().is_err());
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key = ImageKey::new("repo/env", "tag");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"repo/env:tag\"");
        let back: ImageKey = serde_json::from_str("\"repo/env:tag\"").unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_keys_order_by_repository_then_tag() {
        let mut keys = vec![
            ImageKey::new("b", "1"),
            ImageKey::new("a", "2"),
            ImageKey::new("a", "1"),
        ];
        keys.sort();
        assert_eq!(keys[0], ImageKey::new("a", "1"));
        assert_eq!(keys[2], ImageKey::new("b", "1"));
    }
}
