//! Content graph: images, layers and the membership edges between them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use regsweep_core::config::RepositorySpec;
use regsweep_core::error::Result;
use regsweep_core::filter::IdentifierFilter;
use regsweep_core::identifier::Identifier;
use serde::{Deserialize, Serialize};

use crate::store::{ImageKey, ImageManifestInfo, ImageStore, LayerInfo};

/// Progress is logged every this many inspected images.
const PROGRESS_INTERVAL: usize = 10;

/// One image and the distinct layers it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageNode {
    pub key: ImageKey,
    pub image_type: String,
    pub digest: String,
    /// Embedded identifiers, primary first
    pub identifiers: Vec<Identifier>,
    /// Distinct layer digests in first-seen order
    pub layers: Vec<String>,
}

/// An image that exists but whose manifest could not be read.
///
/// It is never a candidate. It still carries its identifiers, and any layer
/// may belong to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedImage {
    pub key: ImageKey,
    pub image_type: String,
    pub identifiers: Vec<Identifier>,
}

/// Bipartite image/layer graph with layer sizes.
#[derive(Debug, Clone, Default)]
pub struct ContentGraph {
    images: BTreeMap<ImageKey, ImageNode>,
    unresolved: BTreeMap<ImageKey, UnresolvedImage>,
    layer_sizes: HashMap<String, u64>,
}

impl ContentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image from its manifest. Repeated digests count once.
    pub fn insert(
        &mut self,
        key: ImageKey,
        image_type: impl Into<String>,
        identifiers: Vec<Identifier>,
        manifest: &ImageManifestInfo,
    ) {
        let mut seen = HashSet::new();
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for LayerInfo { digest, size } in &manifest.layers {
            self.layer_sizes.insert(digest.clone(), *size);
            if seen.insert(digest.as_str()) {
                layers.push(digest.clone());
            }
        }
        let node = ImageNode {
            key: key.clone(),
            image_type: image_type.into(),
            digest: manifest.digest.clone(),
            identifiers,
            layers,
        };
        self.images.insert(key, node);
    }

    /// Record an image whose layers are unknown.
    pub fn insert_unresolved(
        &mut self,
        key: ImageKey,
        image_type: impl Into<String>,
        identifiers: Vec<Identifier>,
    ) {
        let image = UnresolvedImage {
            key: key.clone(),
            image_type: image_type.into(),
            identifiers,
        };
        self.unresolved.insert(key, image);
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &UnresolvedImage> {
        self.unresolved.values()
    }

    /// Whether some layer memberships are unknown.
    pub fn has_unresolved(&self) -> bool {
        !self.unresolved.is_empty()
    }

    pub fn image(&self, key: &ImageKey) -> Option<&ImageNode> {
        self.images.get(key)
    }

    /// Images in key order.
    pub fn images(&self) -> impl Iterator<Item = &ImageNode> {
        self.images.values()
    }

    /// Size of a layer; unknown layers count as zero.
    pub fn layer_size(&self, digest: &str) -> u64 {
        self.layer_sizes.get(digest).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn layer_count(&self) -> usize {
        self.layer_sizes.len()
    }

    /// Number of distinct images containing each layer.
    pub fn ref_counts(&self) -> HashMap<&str, usize> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for image in self.images.values() {
            for digest in &image.layers {
                *counts.entry(digest.as_str()).or_default() += 1;
            }
        }
        counts
    }

    pub fn summary(&self) -> GraphSummary {
        let counts = self.ref_counts();
        let mut summary = GraphSummary {
            total_images: self.images.len(),
            unresolved_images: self.unresolved.len(),
            total_layers: counts.len(),
            ..Default::default()
        };

        let mut refs_total = 0usize;
        for (digest, refs) in &counts {
            let size = self.layer_size(digest);
            summary.total_bytes += size;
            refs_total += refs;
            if *refs == 1 {
                summary.single_use_layers += 1;
                summary.single_use_bytes += size;
            } else {
                summary.shared_layers += 1;
                summary.shared_bytes += size;
            }
        }

        if summary.total_images > 0 {
            summary.avg_layers_per_image = refs_total as f64 / summary.total_images as f64;
        }
        if summary.total_layers > 0 {
            summary.avg_ref_count = refs_total as f64 / summary.total_layers as f64;
        }
        summary
    }
}

/// Aggregate statistics about a content graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub total_images: usize,
    /// Images whose manifest could not be read
    #[serde(default)]
    pub unresolved_images: usize,
    pub total_layers: usize,
    /// Deduplicated bytes across all layers
    pub total_bytes: u64,
    pub single_use_layers: usize,
    pub single_use_bytes: u64,
    pub shared_layers: usize,
    pub shared_bytes: u64,
    pub avg_layers_per_image: f64,
    pub avg_ref_count: f64,
}

/// Result of a graph build.
#[derive(Debug, Default)]
pub struct GraphBuild {
    pub graph: ContentGraph,
    /// Non-fatal problems (missing repositories, vanished tags)
    pub warnings: Vec<String>,
    /// Images whose manifest could not be read; kept unresolved in the graph
    pub failed: Vec<ImageKey>,
}

/// Enumerates repositories and inspects every image with a bounded pool.
pub struct GraphBuilder {
    store: Arc<dyn ImageStore>,
    repositories: Vec<RepositorySpec>,
    max_workers: usize,
    skip_tags: HashSet<String>,
    filter: Option<IdentifierFilter>,
}

struct InspectJob {
    key: ImageKey,
    image_type: String,
    identifiers: Vec<Identifier>,
}

impl GraphBuilder {
    pub fn new(store: Arc<dyn ImageStore>, repositories: Vec<RepositorySpec>) -> Self {
        Self {
            store,
            repositories,
            max_workers: 4,
            skip_tags: HashSet::new(),
            filter: None,
        }
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn skip_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.skip_tags = tags.into_iter().collect();
        self
    }

    pub fn filter(mut self, filter: Option<IdentifierFilter>) -> Self {
        self.filter = filter.filter(|f| !f.is_empty());
        self
    }

    pub async fn build(&self) -> Result<GraphBuild> {
        let mut result = GraphBuild::default();
        let mut jobs = Vec::new();

        for spec in &self.repositories {
            let tags = match self.store.list_tags(&spec.path).await {
                Ok(tags) => tags,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(repository = %spec.path, "Repository not found, skipping");
                    result
                        .warnings
                        .push(format!("repository {} not found", spec.path));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let listed = tags.len();
            let before = jobs.len();
            for tag in tags {
                if self.skip_tags.contains(&tag) {
                    continue;
                }
                let identifiers = Identifier::extract_all(&tag);
                if self.filter.is_some() && identifiers.is_empty() {
                    tracing::debug!(repository = %spec.path, tag = %tag, "No embedded identifier, excluded by filter");
                    continue;
                }
                jobs.push(InspectJob {
                    key: ImageKey::new(spec.path.clone(), tag),
                    image_type: spec.image_type.clone(),
                    identifiers,
                });
            }
            tracing::info!(
                repository = %spec.path,
                image_type = %spec.image_type,
                listed,
                queued = jobs.len() - before,
                "Enumerated repository"
            );
        }

        let total = jobs.len();
        let layer_sizes: DashMap<String, u64> = DashMap::new();
        let done = AtomicUsize::new(0);

        let inspected: Vec<(InspectJob, Result<ImageManifestInfo>)> = stream::iter(jobs)
            .map(|job| {
                let store = Arc::clone(&self.store);
                let layer_sizes = &layer_sizes;
                let done = &done;
                async move {
                    let outcome = store.inspect(&job.key.repository, &job.key.tag).await;
                    if let Ok(manifest) = &outcome {
                        for layer in &manifest.layers {
                            layer_sizes.insert(layer.digest.clone(), layer.size);
                        }
                    }
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % PROGRESS_INTERVAL == 0 || n == total {
                        tracing::info!(inspected = n, total, "Inspecting images");
                    }
                    (job, outcome)
                }
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        for (job, outcome) in inspected {
            match outcome {
                Ok(manifest) => {
                    result
                        .graph
                        .insert(job.key, job.image_type, job.identifiers, &manifest);
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(image = %job.key, "Tag vanished during scan");
                    result.warnings.push(format!("{} disappeared during scan", job.key));
                }
                Err(e) => {
                    tracing::error!(image = %job.key, error = %e, "Failed to inspect image");
                    result
                        .warnings
                        .push(format!("failed to inspect {}: {}", job.key, e));
                    result.failed.push(job.key.clone());
                    result
                        .graph
                        .insert_unresolved(job.key, job.image_type, job.identifiers);
                }
            }
        }

        // Concurrent writers stored the same size per digest.
        for entry in layer_sizes.iter() {
            result
                .graph
                .layer_sizes
                .insert(entry.key().clone(), *entry.value());
        }

        tracing::info!(
            images = result.graph.len(),
            layers = result.graph.layer_count(),
            failed = result.failed.len(),
            "Content graph built"
        );
        Ok(result)
    }
}
