//! Registry client backed by the OCI distribution API.
//!
//! Tag listing and manifest reads use the `oci-distribution` crate. Manifest
//! deletion and readiness probes go through plain `reqwest` calls since the
//! distribution client does not expose them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use regsweep_core::config::{DeleteToggleConfig, RegistryConfig};
use regsweep_core::error::{Result, SweepError};
use sha2::{Digest, Sha256};

use crate::store::{ImageManifestInfo, ImageStore, LayerInfo};

/// Page size requested when listing tags.
const TAG_PAGE_SIZE: usize = 1000;

/// Interval between readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Accept header for manifest deletion lookups.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.index.v1+json";

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from the config file, then `REGISTRY_USERNAME` /
    /// `REGISTRY_PASSWORD`, then anonymous.
    pub fn from_config(config: &RegistryConfig) -> Self {
        match config.credentials() {
            Some((username, password)) => Self::basic(username, password),
            None => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => request.basic_auth(u, Some(p)),
            _ => request,
        }
    }
}

/// [`ImageStore`] implementation for a Docker/OCI distribution registry.
pub struct RegistryClient {
    client: Client,
    http: reqwest::Client,
    auth: RegistryAuth,
    host: String,
    base_url: String,
    toggle: Option<DeleteToggleConfig>,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig, toggle: Option<DeleteToggleConfig>) -> Result<Self> {
        let protocol = if config.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        });
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SweepError::Registry {
                registry: config.host().to_string(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            http,
            auth: RegistryAuth::from_config(config),
            host: config.host().to_string(),
            base_url: config.base_url(),
            toggle,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn reference(&self, repository: &str, tag: &str) -> Result<Reference> {
        let ref_str = format!("{}/{}:{}", self.host, repository, tag);
        ref_str.parse::<Reference>().map_err(|e| {
            SweepError::Other(format!("Invalid image reference '{}': {}", ref_str, e))
        })
    }

    fn map_oci_error(&self, context: &str, err: OciDistributionError) -> SweepError {
        SweepError::classify(context, &format!("{} ({:?})", err, err))
    }

    /// Resolve a tag to the manifest digest the registry stores for it.
    pub async fn manifest_digest(&self, repository: &str, tag: &str) -> Result<String> {
        let reference = self.reference(repository, tag)?;
        self.client
            .fetch_manifest_digest(&reference, &self.auth.to_oci_auth())
            .await
            .map_err(|e| self.map_oci_error(&format!("resolve {}:{}", repository, tag), e))
    }

    /// Pull an image and write it as an OCI image layout to `target_dir`.
    ///
    /// Every blob is checked against its sha256 digest before it is written.
    /// Returns the manifest digest.
    pub async fn pull_layout(
        &self,
        repository: &str,
        tag: &str,
        target_dir: &Path,
    ) -> Result<String> {
        let reference = self.reference(repository, tag)?;
        let auth = self.auth.to_oci_auth();
        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            SweepError::Backup(format!(
                "Failed to create blobs directory {}: {}",
                blobs_dir.display(),
                e
            ))
        })?;

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&reference, &auth)
            .await
            .map_err(|e| self.map_oci_error(&format!("pull manifest {}:{}", repository, tag), e))?;

        let manifest_json = serde_json::to_vec(&manifest)?;
        write_blob(&blobs_dir, &manifest_digest, &manifest_json, false)?;

        self.pull_blob_verified(&reference, &manifest.config, &blobs_dir)
            .await?;
        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Backing up layer");
            self.pull_blob_verified(&reference, layer, &blobs_dir).await?;
        }

        std::fs::write(
            target_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": manifest
                    .media_type
                    .clone()
                    .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string()),
                "digest": manifest_digest,
                "size": manifest_json.len(),
                "annotations": {
                    "org.opencontainers.image.ref.name": tag,
                }
            }]
        });
        std::fs::write(
            target_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )?;

        Ok(manifest_digest)
    }

    async fn pull_blob_verified(
        &self,
        reference: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
    ) -> Result<PathBuf> {
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(reference, descriptor, &mut data)
            .await
            .map_err(|e| self.map_oci_error(&format!("pull blob {}", descriptor.digest), e))?;
        write_blob(blobs_dir, &descriptor.digest, &data, true)
    }

    async fn run_toggle_command(&self, argv: &[String], enabled: bool) -> Result<()> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            SweepError::DeleteToggle("Delete toggle command is empty".to_string())
        })?;
        tracing::info!(command = %argv.join(" "), enabled, "Toggling registry deletes");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| SweepError::DeleteToggle(format!("Failed to run {}: {}", program, e)))?;
        if !output.status.success() {
            return Err(SweepError::DeleteToggle(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Check `data` against a `sha256:` digest (when `verify`) and store it.
fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8], verify: bool) -> Result<PathBuf> {
    let expected = digest.strip_prefix("sha256:").unwrap_or(digest);
    if verify && digest.starts_with("sha256:") {
        let actual = hex::encode(Sha256::digest(data));
        if actual != expected {
            return Err(SweepError::Backup(format!(
                "Digest mismatch for {}: got sha256:{}",
                digest, actual
            )));
        }
    }
    let path = blobs_dir.join(expected);
    std::fs::write(&path, data).map_err(|e| {
        SweepError::Backup(format!("Failed to write blob {}: {}", path.display(), e))
    })?;
    Ok(path)
}

fn status_error(context: &str, status: reqwest::StatusCode, body: &str) -> SweepError {
    let message = format!("{}: HTTP {} {}", context, status, body.trim());
    match status.as_u16() {
        404 => SweepError::NotFound(message),
        429 => SweepError::RateLimited(message),
        500..=599 => SweepError::Transient(message),
        405 => SweepError::Registry {
            registry: context.to_string(),
            message: "deletes are disabled on this registry (HTTP 405)".to_string(),
        },
        _ => SweepError::Registry {
            registry: context.to_string(),
            message,
        },
    }
}

fn request_error(context: &str, err: reqwest::Error) -> SweepError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SweepError::Transient(format!("{}: {}", context, err))
    } else {
        SweepError::classify(context, &err.to_string())
    }
}

#[async_trait]
impl ImageStore for RegistryClient {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let reference = self.reference(repository, "latest")?;
        let auth = self.auth.to_oci_auth();
        let mut tags: Vec<String> = Vec::new();
        let mut last: Option<String> = None;

        loop {
            let page = self
                .client
                .list_tags(&reference, &auth, Some(TAG_PAGE_SIZE), last.as_deref())
                .await
                .map_err(|e| self.map_oci_error(&format!("list tags {}", repository), e))?;
            let count = page.tags.len();
            last = page.tags.last().cloned();
            tags.extend(page.tags);
            if count < TAG_PAGE_SIZE || last.is_none() {
                break;
            }
        }

        tracing::debug!(repository, tags = tags.len(), "Listed tags");
        Ok(tags)
    }

    async fn inspect(&self, repository: &str, tag: &str) -> Result<ImageManifestInfo> {
        let reference = self.reference(repository, tag)?;
        let (manifest, digest): (OciImageManifest, String) = self
            .client
            .pull_image_manifest(&reference, &self.auth.to_oci_auth())
            .await
            .map_err(|e| self.map_oci_error(&format!("inspect {}:{}", repository, tag), e))?;

        let layers = manifest
            .layers
            .iter()
            .map(|layer| LayerInfo {
                digest: layer.digest.clone(),
                size: u64::try_from(layer.size).unwrap_or(0),
            })
            .collect();

        Ok(ImageManifestInfo { digest, layers })
    }

    async fn delete(&self, repository: &str, tag: &str) -> Result<()> {
        let context = format!("delete {}:{}", repository, tag);
        let digest = self.manifest_digest(repository, tag).await?;
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, digest);

        let request = self
            .auth
            .apply(self.http.delete(&url))
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT);
        let response = request
            .send()
            .await
            .map_err(|e| request_error(&context, e))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(repository, tag, digest = %digest, "Manifest deleted");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(&context, status, &body))
    }

    async fn set_delete_enabled(&self, enabled: bool) -> Result<()> {
        let Some(toggle) = &self.toggle else {
            tracing::debug!(enabled, "No delete toggle configured");
            return Ok(());
        };
        let argv = if enabled {
            &toggle.enable_command
        } else {
            &toggle.disable_command
        };
        self.run_toggle_command(argv, enabled).await
    }

    async fn wait_ready(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.toggle.as_ref().map_or(30, |t| t.ready_timeout_secs));
        let url = format!("{}/v2/", self.base_url);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.http.get(&url).send().await {
                // 401 means the registry is up and wants credentials.
                Ok(response)
                    if response.status().is_success()
                        || response.status() == reqwest::StatusCode::UNAUTHORIZED =>
                {
                    tracing::debug!(url = %url, "Registry is ready");
                    return Ok(());
                }
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "Registry not ready yet");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Registry not reachable yet");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SweepError::DeleteToggle(format!(
                    "Registry at {} not ready after {}s",
                    self.base_url,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// Platform resolver that prefers linux images matching the host architecture,
/// falling back to the first listed manifest.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .or_else(|| manifests.first())
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RegistryClient {
        RegistryClient::new(&RegistryConfig::default(), None).unwrap()
    }

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert_eq!(auth.username, Some("user".to_string()));
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
    }

    #[test]
    fn test_registry_auth_from_config_prefers_file() {
        let config = RegistryConfig {
            username: Some("svc".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let auth = RegistryAuth::from_config(&config);
        assert_eq!(auth.username.as_deref(), Some("svc"));
    }

    #[test]
    fn test_reference_includes_host_and_repository() {
        let reference = client()
            .reference("dominodatalab/environment", "5f1e9c2a7b3d4e6f8a9b0c1d-3")
            .unwrap();
        assert_eq!(
            reference.to_string(),
            "docker-registry:5000/dominodatalab/environment:5f1e9c2a7b3d4e6f8a9b0c1d-3"
        );
    }

    #[test]
    fn test_status_error_mapping() {
        let ctx = "delete repo:tag";
        assert!(status_error(ctx, reqwest::StatusCode::NOT_FOUND, "").is_not_found());
        assert!(status_error(ctx, reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_rate_limited());
        assert!(matches!(
            status_error(ctx, reqwest::StatusCode::BAD_GATEWAY, ""),
            SweepError::Transient(_)
        ));
        let disabled = status_error(ctx, reqwest::StatusCode::METHOD_NOT_ALLOWED, "");
        assert!(!disabled.is_retryable());
        assert!(disabled.to_string().contains("deletes are disabled"));
    }

    #[test]
    fn test_write_blob_verifies_digest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let data = b"layer contents";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));

        let path = write_blob(tmp.path(), &digest, data, true).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);

        let bad = format!("sha256:{}", "0".repeat(64));
        let err = write_blob(tmp.path(), &bad, data, true).unwrap_err();
        assert!(matches!(err, SweepError::Backup(_)));
    }

    #[tokio::test]
    async fn test_toggle_without_config_is_noop() {
        assert!(client().set_delete_enabled(true).await.is_ok());
        assert!(client().set_delete_enabled(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_toggle_command_failure_reported() {
        let toggle = DeleteToggleConfig {
            enable_command: vec!["false".to_string()],
            disable_command: vec!["true".to_string()],
            ready_timeout_secs: 1,
        };
        let client = RegistryClient::new(&RegistryConfig::default(), Some(toggle)).unwrap();
        let err = client.set_delete_enabled(true).await.unwrap_err();
        assert!(matches!(err, SweepError::DeleteToggle(_)));
        assert!(client.set_delete_enabled(false).await.is_ok());
    }
}
