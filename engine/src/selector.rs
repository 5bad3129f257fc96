//! Candidate selection and reclaimable space estimation.
//!
//! Mark: an image is a candidate when none of its embedded identifiers is
//! live and it matches the filter. Registry deletes remove a manifest, so a
//! candidate sharing its manifest digest with a retained tag of the same
//! repository is withheld. Sweep: a layer is reclaimable only when every
//! image containing it is a candidate; its size is counted once. While any
//! image is unresolved no layer is provably reclaimable.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regsweep_core::filter::IdentifierFilter;
use regsweep_core::identifier::Identifier;
use serde::{Deserialize, Serialize};

use crate::graph::ContentGraph;
use crate::liveness::LiveSet;
use crate::store::ImageKey;

/// An image selected for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub key: ImageKey,
    pub image_type: String,
    pub digest: String,
    pub identifiers: Vec<Identifier>,
    /// Identifiers that put this image in scope
    pub matched_identifiers: Vec<Identifier>,
    pub layer_count: usize,
    /// Bytes only this image references
    pub exclusive_bytes: u64,
}

/// Per-layer accounting for layers touched by candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDelta {
    pub digest: String,
    pub size: u64,
    /// Candidates containing the layer
    pub candidate_refs: usize,
    /// Non-candidate images still containing the layer
    pub remaining_refs: usize,
    /// An unresolved image may also contain the layer
    #[serde(default)]
    pub may_be_shared: bool,
}

impl LayerDelta {
    pub fn reclaimable(&self) -> bool {
        self.remaining_refs == 0 && !self.may_be_shared
    }
}

/// A reclaimable layer and the candidates that hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimableLayer {
    pub size: u64,
    pub holders: BTreeSet<ImageKey>,
}

/// Output of [`select`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Unique candidates in key order
    pub candidates: Vec<Candidate>,
    /// Identifier matches across candidates; aliases count separately
    pub total_matching_tags: usize,
    /// Estimated bytes freed if every candidate is deleted
    pub freed_bytes: u64,
    pub layer_deltas: Vec<LayerDelta>,
    pub reclaimable_layers: BTreeMap<String, ReclaimableLayer>,
    /// Every graph image carrying each candidate identifier, unresolved
    /// images included
    pub identifier_holders: BTreeMap<Identifier, BTreeSet<ImageKey>>,
    /// Unreferenced images kept because a retained tag shares their manifest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub withheld: Vec<ImageKey>,
}

impl Selection {
    pub fn unique_images(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidate(&self, key: &ImageKey) -> Option<&Candidate> {
        self.candidates.iter().find(|c| &c.key == key)
    }

    /// Bytes actually freed once `deleted` are gone: reclaimable layers whose
    /// holders were all deleted.
    pub fn realized_bytes(&self, deleted: &BTreeSet<ImageKey>) -> u64 {
        self.reclaimable_layers
            .values()
            .filter(|layer| layer.holders.is_subset(deleted))
            .map(|layer| layer.size)
            .sum()
    }

    /// Whether every image carrying `identifier` has been deleted, so its
    /// metadata can go.
    pub fn identifier_released(
        &self,
        identifier: &Identifier,
        is_deleted: impl Fn(&ImageKey) -> bool,
    ) -> bool {
        self.identifier_holders
            .get(identifier)
            .map_or(false, |holders| holders.iter().all(|key| is_deleted(key)))
    }
}

/// Select candidates and compute freed space.
pub fn select(graph: &ContentGraph, live: &LiveSet, filter: Option<&IdentifierFilter>) -> Selection {
    let filter = filter.filter(|f| !f.is_empty());
    let mut selection = Selection::default();

    // Mark
    for image in graph.images() {
        if image.identifiers.is_empty() {
            continue;
        }
        if image.identifiers.iter().any(|id| live.contains(id)) {
            continue;
        }
        let matched: Vec<Identifier> = match filter {
            Some(f) => image
                .identifiers
                .iter()
                .filter(|id| f.matches(&image.image_type, id))
                .cloned()
                .collect(),
            None => image.identifiers.clone(),
        };
        if matched.is_empty() {
            continue;
        }
        selection.candidates.push(Candidate {
            key: image.key.clone(),
            image_type: image.image_type.clone(),
            digest: image.digest.clone(),
            identifiers: image.identifiers.clone(),
            matched_identifiers: matched,
            layer_count: image.layers.len(),
            exclusive_bytes: 0,
        });
    }
    withhold_shared_manifests(graph, &mut selection);
    selection.total_matching_tags = selection
        .candidates
        .iter()
        .map(|c| c.matched_identifiers.len())
        .sum();

    // Sweep
    let uncertain = graph.has_unresolved();
    let ref_counts = graph.ref_counts();
    let mut candidate_refs: HashMap<&str, Vec<&ImageKey>> = HashMap::new();
    for candidate in &selection.candidates {
        if let Some(image) = graph.image(&candidate.key) {
            for digest in &image.layers {
                candidate_refs
                    .entry(digest.as_str())
                    .or_default()
                    .push(&image.key);
            }
        }
    }

    let mut deltas: Vec<LayerDelta> = Vec::with_capacity(candidate_refs.len());
    for (digest, holders) in &candidate_refs {
        let size = graph.layer_size(digest);
        let total = ref_counts.get(digest).copied().unwrap_or(0);
        let delta = LayerDelta {
            digest: digest.to_string(),
            size,
            candidate_refs: holders.len(),
            remaining_refs: total.saturating_sub(holders.len()),
            may_be_shared: uncertain,
        };
        if delta.reclaimable() && size > 0 {
            selection.freed_bytes += size;
            selection.reclaimable_layers.insert(
                digest.to_string(),
                ReclaimableLayer {
                    size,
                    holders: holders.iter().map(|k| (*k).clone()).collect(),
                },
            );
        }
        deltas.push(delta);
    }
    deltas.sort_by(|a, b| a.digest.cmp(&b.digest));
    selection.layer_deltas = deltas;

    if !uncertain {
        for candidate in &mut selection.candidates {
            if let Some(image) = graph.image(&candidate.key) {
                candidate.exclusive_bytes = image
                    .layers
                    .iter()
                    .filter(|d| ref_counts.get(d.as_str()).copied() == Some(1))
                    .map(|d| graph.layer_size(d))
                    .sum();
            }
        }
    }

    // Holders span the whole graph, not only candidates.
    let wanted: BTreeSet<&Identifier> = selection
        .candidates
        .iter()
        .flat_map(|c| c.identifiers.iter())
        .collect();
    let carriers = graph
        .images()
        .map(|image| (&image.key, &image.identifiers))
        .chain(graph.unresolved().map(|image| (&image.key, &image.identifiers)));
    for (key, identifiers) in carriers {
        for id in identifiers {
            if wanted.contains(id) {
                selection
                    .identifier_holders
                    .entry(id.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
    }

    tracing::info!(
        candidates = selection.candidates.len(),
        matching_tags = selection.total_matching_tags,
        reclaimable_layers = selection.reclaimable_layers.len(),
        freed_bytes = selection.freed_bytes,
        withheld = selection.withheld.len(),
        "Selected deletion candidates"
    );
    selection
}

/// Drop candidates whose manifest is also referenced by a retained tag.
///
/// Deleting by digest removes every tag of that manifest in the repository,
/// so a shared manifest is deletable only when all of its tags are
/// candidates.
fn withhold_shared_manifests(graph: &ContentGraph, selection: &mut Selection) {
    let chosen: BTreeSet<&ImageKey> = selection.candidates.iter().map(|c| &c.key).collect();
    let mut retained: BTreeSet<(&str, &str)> = BTreeSet::new();
    for image in graph.images() {
        if !chosen.contains(&image.key) && !image.digest.is_empty() {
            retained.insert((image.key.repository.as_str(), image.digest.as_str()));
        }
    }

    let mut withheld = Vec::new();
    selection.candidates.retain(|c| {
        let shared = retained.contains(&(c.key.repository.as_str(), c.digest.as_str()));
        if shared {
            tracing::warn!(image = %c.key, digest = %c.digest, "Manifest shared with a retained tag, not deleting");
            withheld.push(c.key.clone());
        }
        !shared
    });
    selection.withheld = withheld;
}
