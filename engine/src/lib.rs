//! regsweep engine - reference-counted registry garbage collection.
//!
//! Builds the image/layer content graph from a registry, merges liveness
//! facts from independent sources, selects unreferenced images with exact
//! shared-layer accounting, and deletes them across the registry and the
//! metadata store with checkpointed, resumable progress.

pub mod analysis;
pub mod backup;
pub mod checkpoint;
pub mod coordinator;
pub mod governor;
pub mod graph;
pub mod liveness;
pub mod metadata;
pub mod registry;
pub mod report;
pub mod selector;
pub mod store;

// Re-export common types
pub use analysis::Analyzer;
pub use backup::{BackupProvider, OciLayoutBackup};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointSession, ItemMark};
pub use coordinator::{
    DeleteEnableGuard, DeletionCoordinator, DeletionOptions, DeletionOutcome, DeletionReport,
    DeletionSummary, OutcomeState,
};
pub use governor::{GovernedStore, Governor, RetryPolicy, TokenBucket};
pub use graph::{ContentGraph, GraphBuild, GraphBuilder, GraphSummary, ImageNode};
pub use liveness::{LiveSet, LivenessAggregator, LivenessFact, LivenessProvider};
pub use metadata::{JsonMetadataStore, MetadataStore, RecordMatcher};
pub use registry::{RegistryAuth, RegistryClient};
pub use report::AnalysisReport;
pub use selector::{select, Candidate, Selection};
pub use store::{ImageKey, ImageManifestInfo, ImageStore, LayerInfo};

/// regsweep engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operation type recorded in deletion checkpoints.
pub const DELETE_OPERATION: &str = "delete";
