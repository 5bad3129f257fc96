//! In-memory registry, metadata store and backup target for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use regsweep_core::error::{Result, SweepError};
use regsweep_engine::backup::BackupProvider;
use regsweep_engine::metadata::{MetadataStore, RecordMatcher};
use regsweep_engine::store::{ImageKey, ImageManifestInfo, ImageStore, LayerInfo};
use serde_json::{json, Value};
use tokio::sync::watch;

pub const ENV_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";
pub const ENV_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";
pub const ENV_C: &str = "cccccccccccccccccccccccc";
pub const MODEL_D: &str = "dddddddddddddddddddddddd";

/// Everything the fakes observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ListTags(String),
    Inspect(ImageKey),
    Delete(ImageKey),
    Toggle(bool),
    WaitReady,
    Backup(ImageKey),
    MetadataDelete { collection: String, identifier: String },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Mutating events only; reads are allowed during a dry run.
pub fn mutations(log: &EventLog) -> Vec<Event> {
    log.lock()
        .iter()
        .filter(|e| !matches!(e, Event::ListTags(_) | Event::Inspect(_)))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    NotFound,
    Transient,
}

impl Failure {
    fn error(self, what: &str) -> SweepError {
        match self {
            Failure::NotFound => SweepError::NotFound(what.to_string()),
            Failure::Transient => SweepError::Transient(what.to_string()),
        }
    }
}

/// Registry double: repositories of tags with fixed manifests.
pub struct FakeStore {
    repos: Mutex<BTreeMap<String, BTreeMap<String, ImageManifestInfo>>>,
    log: EventLog,
    inspect_failures: Mutex<HashMap<ImageKey, Failure>>,
    delete_failures: Mutex<HashMap<ImageKey, Failure>>,
    toggle_fails: bool,
    cancel_after_deletes: Mutex<Option<(usize, watch::Sender<bool>)>>,
}

impl FakeStore {
    pub fn new(log: EventLog) -> Self {
        Self {
            repos: Mutex::new(BTreeMap::new()),
            log,
            inspect_failures: Mutex::new(HashMap::new()),
            delete_failures: Mutex::new(HashMap::new()),
            toggle_fails: false,
            cancel_after_deletes: Mutex::new(None),
        }
    }

    pub fn failing_toggle(mut self) -> Self {
        self.toggle_fails = true;
        self
    }

    /// Add an image whose layers are `(digest, size)` pairs.
    pub fn with_image(self, repository: &str, tag: &str, layers: &[(&str, u64)]) -> Self {
        let manifest = ImageManifestInfo {
            digest: format!("sha256:manifest-{}-{}", repository.replace('/', "-"), tag),
            layers: layers
                .iter()
                .map(|(digest, size)| LayerInfo {
                    digest: digest.to_string(),
                    size: *size,
                })
                .collect(),
        };
        self.repos
            .lock()
            .entry(repository.to_string())
            .or_default()
            .insert(tag.to_string(), manifest);
        self
    }

    pub fn fail_inspect(&self, key: ImageKey, failure: Failure) {
        self.inspect_failures.lock().insert(key, failure);
    }

    pub fn fail_delete(&self, key: ImageKey, failure: Failure) {
        self.delete_failures.lock().insert(key, failure);
    }

    /// Flip `cancel` to true once `count` deletes have succeeded.
    pub fn cancel_after_deletes(&self, count: usize, cancel: watch::Sender<bool>) {
        *self.cancel_after_deletes.lock() = Some((count, cancel));
    }

    pub fn contains(&self, key: &ImageKey) -> bool {
        self.repos
            .lock()
            .get(&key.repository)
            .map_or(false, |tags| tags.contains_key(&key.tag))
    }

    pub fn delete_count(&self, key: &ImageKey) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Delete(k) if k == key))
            .count()
    }
}

#[async_trait]
impl ImageStore for FakeStore {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.log.lock().push(Event::ListTags(repository.to_string()));
        self.repos
            .lock()
            .get(repository)
            .map(|tags| tags.keys().cloned().collect())
            .ok_or_else(|| SweepError::NotFound(format!("repository {}", repository)))
    }

    async fn inspect(&self, repository: &str, tag: &str) -> Result<ImageManifestInfo> {
        let key = ImageKey::new(repository, tag);
        self.log.lock().push(Event::Inspect(key.clone()));
        if let Some(failure) = self.inspect_failures.lock().get(&key) {
            return Err(failure.error(&key.to_string()));
        }
        self.repos
            .lock()
            .get(repository)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or_else(|| SweepError::NotFound(key.to_string()))
    }

    async fn delete(&self, repository: &str, tag: &str) -> Result<()> {
        let key = ImageKey::new(repository, tag);
        self.log.lock().push(Event::Delete(key.clone()));
        if let Some(failure) = self.delete_failures.lock().get(&key) {
            return Err(failure.error(&key.to_string()));
        }
        let removed = self
            .repos
            .lock()
            .get_mut(repository)
            .and_then(|tags| tags.remove(tag));
        if removed.is_none() {
            return Err(SweepError::NotFound(key.to_string()));
        }

        let mut cancel = self.cancel_after_deletes.lock();
        if let Some((remaining, sender)) = cancel.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                let _ = sender.send(true);
            }
        }
        Ok(())
    }

    async fn set_delete_enabled(&self, enabled: bool) -> Result<()> {
        self.log.lock().push(Event::Toggle(enabled));
        if self.toggle_fails && enabled {
            return Err(SweepError::DeleteToggle("restart failed".to_string()));
        }
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        self.log.lock().push(Event::WaitReady);
        Ok(())
    }
}

/// Metadata double keyed by collection, records shaped `{"_id": ...}`.
pub struct FakeMetadata {
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    log: EventLog,
    failing: BTreeSet<String>,
}

impl FakeMetadata {
    pub fn new(log: EventLog) -> Self {
        Self {
            collections: Mutex::new(BTreeMap::new()),
            log,
            failing: BTreeSet::new(),
        }
    }

    pub fn with_record(self, collection: &str, record: Value) -> Self {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(record);
        self
    }

    pub fn with_id(self, collection: &str, id: &str) -> Self {
        self.with_record(collection, json!({ "_id": id }))
    }

    pub fn failing_collection(mut self, collection: &str) -> Self {
        self.failing.insert(collection.to_string());
        self
    }

    pub fn has_id(&self, collection: &str, id: &str) -> bool {
        self.collections
            .lock()
            .get(collection)
            .map_or(false, |records| {
                records.iter().any(|r| r.get("_id") == Some(&json!(id)))
            })
    }
}

#[async_trait]
impl MetadataStore for FakeMetadata {
    async fn find_records(&self, collection: &str, matcher: &RecordMatcher) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| matcher.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_records(&self, collection: &str, matcher: &RecordMatcher) -> Result<u64> {
        if let RecordMatcher::IdEquals(id) = matcher {
            self.log.lock().push(Event::MetadataDelete {
                collection: collection.to_string(),
                identifier: id.to_string(),
            });
        }
        if self.failing.contains(collection) {
            return Err(SweepError::Metadata(format!("{} unavailable", collection)));
        }
        let mut collections = self.collections.lock();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| !matcher.matches(r));
        Ok((before - records.len()) as u64)
    }
}

/// Backup target that fails for selected images.
pub struct FakeBackup {
    log: EventLog,
    failing: BTreeSet<ImageKey>,
}

impl FakeBackup {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            failing: BTreeSet::new(),
        }
    }

    pub fn failing_for(mut self, key: ImageKey) -> Self {
        self.failing.insert(key);
        self
    }
}

#[async_trait]
impl BackupProvider for FakeBackup {
    async fn backup(&self, repository: &str, tag: &str) -> Result<()> {
        let key = ImageKey::new(repository, tag);
        self.log.lock().push(Event::Backup(key.clone()));
        if self.failing.contains(&key) {
            return Err(SweepError::Backup(format!("{}: disk full", key)));
        }
        Ok(())
    }
}
