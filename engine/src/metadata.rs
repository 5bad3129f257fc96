//! Metadata document store.
//!
//! The engine deletes metadata records for removed images and reads
//! reference fields for liveness. [`JsonMetadataStore`] keeps each
//! collection as a JSON array of documents in `<dir>/<collection>.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regsweep_core::error::{Result, SweepError};
use regsweep_core::identifier::Identifier;
use parking_lot::Mutex;
use serde_json::Value;

/// Selects records in a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordMatcher {
    All,
    /// `_id` equals the identifier (plain string or `{"$oid": ...}`)
    IdEquals(Identifier),
    /// Dotted field path equals a value
    FieldEquals { field: String, value: Value },
}

impl RecordMatcher {
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            RecordMatcher::All => true,
            RecordMatcher::IdEquals(id) => record
                .get("_id")
                .and_then(value_as_id_str)
                .map_or(false, |v| v == id.as_str()),
            RecordMatcher::FieldEquals { field, value } => {
                lookup_path(record, field).map_or(false, |v| v == value)
            }
        }
    }
}

/// Follow a dotted path (`a.b.c`) into a document.
pub fn lookup_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.get(segment))
}

/// An id stored as a plain string or as an extended-JSON `{"$oid": "..."}`.
pub fn value_as_id_str(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("$oid").and_then(Value::as_str),
        _ => None,
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Records in `collection` matching `matcher`.
    async fn find_records(&self, collection: &str, matcher: &RecordMatcher) -> Result<Vec<Value>>;

    /// Delete matching records, returning how many were removed.
    async fn delete_records(&self, collection: &str, matcher: &RecordMatcher) -> Result<u64>;
}

/// File-backed document store.
pub struct JsonMetadataStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonMetadataStore {
    pub fn new(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(SweepError::Metadata(format!(
                "Metadata directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf> {
        if collection.is_empty()
            || !collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SweepError::Metadata(format!(
                "Invalid collection name '{}'",
                collection
            )));
        }
        Ok(self.dir.join(format!("{}.json", collection)))
    }

    /// Missing collections read as empty.
    fn load(&self, collection: &str) -> Result<Vec<Value>> {
        let path = self.collection_path(collection)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| {
            SweepError::Metadata(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            SweepError::Metadata(format!("Malformed collection {}: {}", path.display(), e))
        })
    }

    /// Write atomically (write to .tmp, then rename).
    fn save(&self, collection: &str, records: &[Value]) -> Result<()> {
        let path = self.collection_path(collection)?;
        let data = serde_json::to_string_pretty(records)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn find_records(&self, collection: &str, matcher: &RecordMatcher) -> Result<Vec<Value>> {
        Ok(self
            .load(collection)?
            .into_iter()
            .filter(|record| matcher.matches(record))
            .collect())
    }

    async fn delete_records(&self, collection: &str, matcher: &RecordMatcher) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let records = self.load(collection)?;
        let before = records.len();
        let kept: Vec<Value> = records
            .into_iter()
            .filter(|record| !matcher.matches(record))
            .collect();
        let removed = (before - kept.len()) as u64;
        if removed > 0 {
            self.save(collection, &kept)?;
            tracing::debug!(collection, removed, "Deleted metadata records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const ID: &str = "5f1e9c2a7b3d4e6f8a9b0c1d";

    fn store_with(collection: &str, records: Value) -> (TempDir, JsonMetadataStore) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(format!("{collection}.json")),
            serde_json::to_string(&records).unwrap(),
        )
        .unwrap();
        let store = JsonMetadataStore::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_lookup_path_nested() {
        let doc = json!({"jobDataPlain": {"overrideEnvironmentId": ID}});
        assert_eq!(
            lookup_path(&doc, "jobDataPlain.overrideEnvironmentId"),
            Some(&json!(ID))
        );
        assert!(lookup_path(&doc, "jobDataPlain.missing").is_none());
    }

    #[test]
    fn test_id_matcher_accepts_oid_form() {
        let id = Identifier::parse(ID).unwrap();
        let matcher = RecordMatcher::IdEquals(id);
        assert!(matcher.matches(&json!({"_id": ID})));
        assert!(matcher.matches(&json!({"_id": {"$oid": ID}})));
        assert!(!matcher.matches(&json!({"_id": "0123456789abcdef01234567"})));
        assert!(!matcher.matches(&json!({"name": "no id"})));
    }

    #[tokio::test]
    async fn test_delete_records_removes_only_matches() {
        let (_tmp, store) = store_with(
            "environment_revisions",
            json!([{"_id": ID}, {"_id": "0123456789abcdef01234567"}]),
        );
        let matcher = RecordMatcher::IdEquals(Identifier::parse(ID).unwrap());

        assert_eq!(store.delete_records("environment_revisions", &matcher).await.unwrap(), 1);
        assert_eq!(store.delete_records("environment_revisions", &matcher).await.unwrap(), 0);

        let rest = store
            .find_records("environment_revisions", &RecordMatcher::All)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = JsonMetadataStore::new(tmp.path()).unwrap();
        let found = store.find_records("models", &RecordMatcher::All).await.unwrap();
        assert!(found.is_empty());
        let matcher = RecordMatcher::IdEquals(Identifier::parse(ID).unwrap());
        assert_eq!(store.delete_records("models", &matcher).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_collection_errors() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("models.json"), "{ not json").unwrap();
        let store = JsonMetadataStore::new(tmp.path()).unwrap();
        let err = store.find_records("models", &RecordMatcher::All).await.unwrap_err();
        assert!(matches!(err, SweepError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_rejects_path_like_collection_names() {
        let tmp = TempDir::new().unwrap();
        let store = JsonMetadataStore::new(tmp.path()).unwrap();
        assert!(store.find_records("../etc", &RecordMatcher::All).await.is_err());
    }

    #[test]
    fn test_missing_directory_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(JsonMetadataStore::new(&tmp.path().join("nope")).is_err());
    }
}
