//! regsweep core - foundational types
//!
//! Error taxonomy, configuration, embedded image identifiers and the
//! identifier filter file format shared by the engine and the CLI.

pub mod config;
pub mod error;
pub mod filter;
pub mod identifier;

// Re-export commonly used types
pub use config::{
    AnalysisConfig, DeleteToggleConfig, LivenessConfig, MetadataConfig, RateLimitConfig,
    ReferenceField, RegistryConfig, RepositorySpec, RetryConfig, SweepConfig,
};
pub use error::{Result, SweepError};
pub use filter::{FilterEntry, IdentifierFilter};
pub use identifier::{Identifier, IdentifierKind};

/// regsweep version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
