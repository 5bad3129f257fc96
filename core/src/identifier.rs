//! Embedded image identifiers.
//!
//! Published images carry the id of the logical entity they were built for
//! (environment, revision, model, model version) inside their tag, e.g.
//! `5f1e9c2a7b3d4e6f8a9b0c1d-3`. The id is a 24-character lowercase hex token.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};

/// Canonical identifier length in characters.
pub const IDENTIFIER_LEN: usize = 24;

/// A validated 24-character lowercase hexadecimal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Parse and validate an identifier.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != IDENTIFIER_LEN {
            return Err(SweepError::InvalidIdentifier(format!(
                "'{}' is {} characters, expected {}",
                value,
                value.chars().count(),
                IDENTIFIER_LEN
            )));
        }
        if !value.bytes().all(is_lower_hex) {
            return Err(SweepError::InvalidIdentifier(format!(
                "'{}' contains non-hexadecimal or uppercase characters",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Every identifier embedded in an image tag, in order of appearance.
    ///
    /// An embedded identifier is a run of exactly 24 lowercase hex characters
    /// bounded by the tag start/end or a non-alphanumeric separator. Longer
    /// hex runs (content digests) are not identifiers.
    pub fn extract_all(tag: &str) -> Vec<Identifier> {
        let mut found: Vec<Identifier> = Vec::new();
        for token in tag.split(|c: char| !c.is_ascii_alphanumeric()) {
            if let Ok(id) = Identifier::parse(token) {
                if !found.contains(&id) {
                    found.push(id);
                }
            }
        }
        found
    }

    /// The primary (first) identifier embedded in a tag.
    pub fn extract(tag: &str) -> Option<Identifier> {
        Self::extract_all(tag).into_iter().next()
    }
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = SweepError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

/// Type qualifier attached to an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentifierKind {
    Environment,
    EnvironmentRevision,
    Model,
    ModelVersion,
    /// Unqualified: applies to every image type
    Any,
}

impl IdentifierKind {
    /// Parse a type qualifier as written in filter files.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "environment" | "env" => Some(Self::Environment),
            "environmentRevision" => Some(Self::EnvironmentRevision),
            "model" => Some(Self::Model),
            "modelVersion" => Some(Self::ModelVersion),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    /// Image type (repository kind) this qualifier scopes to.
    ///
    /// Returns `None` for [`IdentifierKind::Any`].
    pub fn image_type(&self) -> Option<&'static str> {
        match self {
            Self::Environment | Self::EnvironmentRevision => Some("environment"),
            Self::Model | Self::ModelVersion => Some("model"),
            Self::Any => None,
        }
    }

    /// Whether this qualifier applies to images of the given type.
    pub fn applies_to(&self, image_type: &str) -> bool {
        self.image_type().map_or(true, |t| t == image_type)
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Environment => "environment",
            Self::EnvironmentRevision => "environmentRevision",
            Self::Model => "model",
            Self::ModelVersion => "modelVersion",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "5f1e9c2a7b3d4e6f8a9b0c1d";

    #[test]
    fn test_parse_valid() {
        let id = Identifier::parse(ID).unwrap();
        assert_eq!(id.as_str(), ID);
        assert_eq!(id.to_string(), ID);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(Identifier::parse("5f1e9c2a").is_err());
        assert!(Identifier::parse(&format!("{ID}0")).is_err());
        assert!(Identifier::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(Identifier::parse("5f1e9c2a7b3d4e6f8a9b0c1z").is_err());
        assert!(Identifier::parse("5F1E9C2A7B3D4E6F8A9B0C1D").is_err());
    }

    #[test]
    fn test_extract_prefix_convention() {
        let id = Identifier::extract(&format!("{ID}-3")).unwrap();
        assert_eq!(id.as_str(), ID);
    }

    #[test]
    fn test_extract_model_extended_tag() {
        let tag = format!("{ID}-v2-1700000000_abc123");
        assert_eq!(Identifier::extract(&tag).unwrap().as_str(), ID);
    }

    #[test]
    fn test_extract_all_aliases() {
        let other = "0123456789abcdef01234567";
        let tag = format!("{ID}-{other}");
        let ids = Identifier::extract_all(&tag);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].as_str(), ID);
        assert_eq!(ids[1].as_str(), other);
    }

    #[test]
    fn test_extract_ignores_longer_hex_runs() {
        let digest = "a".repeat(64);
        assert!(Identifier::extract(&digest).is_none());
        assert!(Identifier::extract("latest").is_none());
        assert!(Identifier::extract("buildcache").is_none());
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let json = serde_json::to_string(&Identifier::parse(ID).unwrap()).unwrap();
        assert_eq!(json, format!("\"{ID}\""));
        let bad: std::result::Result<Identifier, _> = serde_json::from_str("\"nothex\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_kind_parse_and_scope() {
        assert_eq!(IdentifierKind::parse("env"), Some(IdentifierKind::Environment));
        assert_eq!(
            IdentifierKind::parse("modelVersion"),
            Some(IdentifierKind::ModelVersion)
        );
        assert_eq!(IdentifierKind::parse("workspace"), None);

        assert!(IdentifierKind::EnvironmentRevision.applies_to("environment"));
        assert!(!IdentifierKind::Model.applies_to("environment"));
        assert!(IdentifierKind::Any.applies_to("anything"));
    }
}
