//! Image backup before deletion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regsweep_core::error::{Result, SweepError};

use crate::governor::Governor;
use crate::registry::RegistryClient;

/// Saves a copy of an image somewhere it can be restored from.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    async fn backup(&self, repository: &str, tag: &str) -> Result<()>;
}

/// Pulls images into OCI image layouts under
/// `<dir>/<repository>/<tag>/`.
pub struct OciLayoutBackup {
    registry: Arc<RegistryClient>,
    governor: Arc<Governor>,
    dir: PathBuf,
}

impl OciLayoutBackup {
    pub fn new(registry: Arc<RegistryClient>, governor: Arc<Governor>, dir: &Path) -> Self {
        Self {
            registry,
            governor,
            dir: dir.to_path_buf(),
        }
    }

    /// Target directory for one image.
    pub fn target_dir(&self, repository: &str, tag: &str) -> PathBuf {
        let mut path = self.dir.clone();
        for segment in repository.split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(segment);
        }
        path.join(tag)
    }
}

#[async_trait]
impl BackupProvider for OciLayoutBackup {
    async fn backup(&self, repository: &str, tag: &str) -> Result<()> {
        let target = self.target_dir(repository, tag);
        let registry = &self.registry;
        let target_ref = &target;

        let digest = self
            .governor
            .call("backup", move || registry.pull_layout(repository, tag, target_ref))
            .await
            .map_err(|e| match e {
                SweepError::Backup(_) => e,
                other => SweepError::Backup(format!("{}:{}: {}", repository, tag, other)),
            })?;

        tracing::info!(
            repository,
            tag,
            digest = %digest,
            target = %target.display(),
            "Image backed up"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsweep_core::config::RegistryConfig;

    #[test]
    fn test_target_dir_nests_repository() {
        let registry = Arc::new(RegistryClient::new(&RegistryConfig::default(), None).unwrap());
        let backup = OciLayoutBackup::new(registry, Arc::new(Governor::unlimited()), Path::new("/backups"));
        assert_eq!(
            backup.target_dir("dominodatalab/environment", "abc-1"),
            PathBuf::from("/backups/dominodatalab/environment/abc-1")
        );
        assert_eq!(
            backup.target_dir("../escape", "t"),
            PathBuf::from("/backups/escape/t")
        );
    }
}
