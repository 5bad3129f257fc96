//! Identifier filter files.
//!
//! One entry per line; blank lines and `#` comments are ignored. An entry is
//! either a bare identifier (all image types) or `<type>:<identifier>`.
//! A single malformed line rejects the whole file.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};
use crate::identifier::{Identifier, IdentifierKind};

/// One typed or untyped filter entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterEntry {
    pub kind: IdentifierKind,
    pub identifier: Identifier,
}

/// Scopes analysis and deletion to images whose embedded identifier matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierFilter {
    entries: BTreeSet<FilterEntry>,
}

impl IdentifierFilter {
    /// Build a filter from already-validated entries.
    pub fn from_entries(entries: impl IntoIterator<Item = FilterEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Parse filter file content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = BTreeSet::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let reject = |message: String| SweepError::FilterParse {
                line: idx + 1,
                content: line.to_string(),
                message,
            };

            let (kind, value) = match line.split_once(':') {
                Some((prefix, rest)) => {
                    let kind = IdentifierKind::parse(prefix.trim())
                        .ok_or_else(|| reject(format!("unknown type '{}'", prefix.trim())))?;
                    (kind, rest.trim())
                }
                None => (IdentifierKind::Any, line),
            };

            let identifier = Identifier::parse(value).map_err(|e| reject(e.to_string()))?;
            entries.insert(FilterEntry { kind, identifier });
        }

        Ok(Self { entries })
    }

    /// Read and parse a filter file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SweepError::Config(format!(
                "Failed to read filter file {}: {}",
                path.display(),
                e
            ))
        })?;
        let filter = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            entries = filter.len(),
            "Loaded identifier filter"
        );
        Ok(filter)
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FilterEntry> {
        self.entries.iter()
    }

    /// Whether an image of `image_type` carrying `identifier` is in scope.
    pub fn matches(&self, image_type: &str, identifier: &Identifier) -> bool {
        self.entries
            .iter()
            .any(|e| &e.identifier == identifier && e.kind.applies_to(image_type))
    }

    /// Whether any of the image's identifiers is in scope.
    pub fn matches_any<'a>(
        &self,
        image_type: &str,
        identifiers: impl IntoIterator<Item = &'a Identifier>,
    ) -> bool {
        identifiers
            .into_iter()
            .any(|id| self.matches(image_type, id))
    }
}

/// `true` when there is no filter or the image matches it.
pub fn in_scope(filter: Option<&IdentifierFilter>, image_type: &str, identifiers: &[Identifier]) -> bool {
    match filter {
        None => true,
        Some(f) => f.matches_any(image_type, identifiers),
    }
}
