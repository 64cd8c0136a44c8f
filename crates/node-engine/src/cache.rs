//! Content-addressed result cache
//!
//! Every node's cache key is a blake3 hash over its interface identity and
//! its fully resolved inputs. Entries are append-only: a changed input yields
//! a different key, and an existing key is never rewritten. The one
//! exception is a damaged entry, which is evicted so the next store for that
//! key can replace it.
//!
//! Two stores are provided:
//!
//! - [`MemoryCache`]: process-local, used in tests and for `--no-cache` runs
//!   that still want deduplication within the run.
//! - [`DiskCache`]: one directory per key, survives restarts and can be
//!   shared read-only between concurrent runs.
//!
//! # Disk layout
//!
//! ```text
//! <root>/
//!   <key[..2]>/<key>/outputs.json   serialized output mapping
//!   <key[..2]>/<key>/status.json    status marker, presence means complete
//!   .tmp/<uuid>/                    staging area, renamed into place
//! ```
//!
//! Evicted entries are renamed into `.tmp/` before removal, so a reader never
//! sees a half-deleted entry directory.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::descriptor::Interface;
use crate::error::CacheError;
use crate::types::PortValues;

const OUTPUTS_FILE: &str = "outputs.json";
const STATUS_FILE: &str = "status.json";
const STAGING_DIR: &str = ".tmp";

/// Deterministic key for one node invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for an interface and its resolved inputs
    ///
    /// Inputs are hashed sorted by name, and JSON objects inside values are
    /// hashed with sorted keys, so construction order never matters.
    pub fn derive(interface: &Interface, inputs: &PortValues) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(interface.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(interface.fingerprint().as_bytes());
        hasher.update(&[0]);

        let sorted: BTreeMap<&String, &serde_json::Value> = inputs.iter().collect();
        let mut buf = String::new();
        for (name, value) in sorted {
            buf.clear();
            write_canonical(value, &mut buf);
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(buf.as_bytes());
            hasher.update(&[0]);
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value with object keys sorted
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, value)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on a Value::String yields a quoted, escaped literal
                let _ = write!(out, "{}", Value::String(key.clone()));
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}

/// A completed, immutable cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Interface that produced the outputs
    pub interface: String,
    pub outputs: PortValues,
    /// Exit status of the step (0 for success)
    pub status: i32,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry for a successful step
    pub fn succeeded(key: CacheKey, interface: impl Into<String>, outputs: PortValues) -> Self {
        Self {
            key,
            interface: interface.into(),
            outputs,
            status: 0,
            created_at: Utc::now(),
        }
    }
}

/// Status marker persisted next to the outputs
#[derive(Debug, Serialize, Deserialize)]
struct StatusMarker {
    interface: String,
    status: i32,
    created_at: DateTime<Utc>,
}

/// Storage backend for cache entries
///
/// Implementations must make `store` idempotent per key: storing a key that
/// already exists succeeds without changing the existing entry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry; `Ok(None)` is a miss
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Persist an entry
    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Drop an entry that can no longer be served
    ///
    /// Evicting a missing key is not an error.
    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local cache store
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.write().entry(entry.key.clone()).or_insert(entry);
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// =============================================================================
// On-disk store
// =============================================================================

/// Directory-per-key cache store
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Use `root` as the cache directory (created on first store)
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entry for a key
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        let prefix = key.as_str().get(..2).unwrap_or("00");
        self.root.join(prefix).join(key.as_str())
    }

    fn staging_dir(&self) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Move an entry directory out of the keyed tree, then delete it
    async fn quarantine(&self, dir: &Path) -> Result<(), CacheError> {
        let target = self.staging_dir();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(dir, &target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = tokio::fs::remove_dir_all(&target).await {
            log::warn!("Failed to remove evicted cache entry {:?}: {}", target, e);
        }
        Ok(())
    }

    async fn read_entry(&self, key: &CacheKey, dir: &Path) -> Result<CacheEntry, CacheError> {
        let corrupt = |reason: String| CacheError::Corrupt {
            key: key.to_string(),
            reason,
        };

        let status = tokio::fs::read_to_string(dir.join(STATUS_FILE)).await?;
        let marker: StatusMarker = serde_json::from_str(&status)
            .map_err(|e| corrupt(format!("unreadable status marker: {}", e)))?;

        let outputs = tokio::fs::read_to_string(dir.join(OUTPUTS_FILE))
            .await
            .map_err(|e| corrupt(format!("missing outputs: {}", e)))?;
        let outputs: PortValues = serde_json::from_str(&outputs)
            .map_err(|e| corrupt(format!("unreadable outputs: {}", e)))?;

        Ok(CacheEntry {
            key: key.clone(),
            interface: marker.interface,
            outputs,
            status: marker.status,
            created_at: marker.created_at,
        })
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.entry_dir(key);
        if !tokio::fs::try_exists(dir.join(STATUS_FILE)).await? {
            return Ok(None);
        }
        match self.read_entry(key, &dir).await {
            Ok(entry) => Ok(Some(entry)),
            Err(err @ CacheError::Corrupt { .. }) => {
                log::warn!("Evicting corrupt cache entry {}", key);
                self.quarantine(&dir).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let dir = self.entry_dir(&entry.key);
        if tokio::fs::try_exists(dir.join(STATUS_FILE)).await? {
            log::debug!("Cache entry {} already present", entry.key);
            return Ok(());
        }
        // Leftover of an interrupted eviction or a foreign writer
        if tokio::fs::try_exists(&dir).await? {
            log::debug!("Replacing incomplete cache entry {}", entry.key);
            self.quarantine(&dir).await?;
        }

        let staging = self.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;

        let outputs = serde_json::to_string_pretty(&entry.outputs)?;
        tokio::fs::write(staging.join(OUTPUTS_FILE), outputs).await?;
        let marker = StatusMarker {
            interface: entry.interface.clone(),
            status: entry.status,
            created_at: entry.created_at,
        };
        tokio::fs::write(staging.join(STATUS_FILE), serde_json::to_string(&marker)?).await?;

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(&staging, &dir).await {
            Ok(()) => {
                log::debug!("Stored cache entry {} at {:?}", entry.key, dir);
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                // Another writer won the race for this key
                if tokio::fs::try_exists(dir.join(STATUS_FILE)).await? {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.quarantine(&self.entry_dir(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PortSpec;
    use crate::types::PortDataType;
    use serde_json::json;

    fn flirt() -> Interface {
        Interface::new("flirt")
            .with_input(PortSpec::required("in_file", PortDataType::Image))
            .with_input(PortSpec::required("reference", PortDataType::Image))
            .with_input(PortSpec::optional("options", PortDataType::Json))
            .with_output(PortSpec::required("out_matrix", PortDataType::Transform))
    }

    fn inputs(pairs: &[(&str, serde_json::Value)]) -> PortValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = inputs(&[
            ("in_file", json!("T1w.nii.gz")),
            ("reference", json!("MNI152.nii.gz")),
            ("options", json!({"dof": 12, "cost": "corratio"})),
        ]);
        let b = inputs(&[
            ("options", json!({"cost": "corratio", "dof": 12})),
            ("reference", json!("MNI152.nii.gz")),
            ("in_file", json!("T1w.nii.gz")),
        ]);
        assert_eq!(CacheKey::derive(&flirt(), &a), CacheKey::derive(&flirt(), &b));
    }

    #[test]
    fn test_key_changes_with_inputs_and_interface() {
        let base = inputs(&[("in_file", json!("T1w.nii.gz")), ("reference", json!("MNI.nii.gz"))]);
        let changed = inputs(&[("in_file", json!("T1w.nii.gz")), ("reference", json!("OASIS.nii.gz"))]);
        let key = CacheKey::derive(&flirt(), &base);

        assert_ne!(key, CacheKey::derive(&flirt(), &changed));

        let renamed = Interface { name: "flirt2".into(), ..flirt() };
        assert_ne!(key, CacheKey::derive(&renamed, &base));

        let widened = flirt().with_output(PortSpec::optional("out_file", PortDataType::Image));
        assert_ne!(key, CacheKey::derive(&widened, &base));
    }

    #[test]
    fn test_key_distinguishes_value_types() {
        let a = inputs(&[("in_file", json!("1"))]);
        let b = inputs(&[("in_file", json!(1))]);
        assert_ne!(CacheKey::derive(&flirt(), &a), CacheKey::derive(&flirt(), &b));
    }

    #[test]
    fn test_canonical_json() {
        let mut out = String::new();
        write_canonical(&json!({"b": [1, {"d": null, "c": "x\"y"}], "a": true}), &mut out);
        assert_eq!(out, r#"{"a":true,"b":[1,{"c":"x\"y","d":null}]}"#);
    }

    #[tokio::test]
    async fn test_memory_cache_is_append_only() {
        let cache = MemoryCache::new();
        let key = CacheKey::derive(&flirt(), &PortValues::new());
        let first = CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("a.mat"))]));
        let second = CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("b.mat"))]));

        assert!(cache.lookup(&key).await.unwrap().is_none());
        cache.store(first).await.unwrap();
        cache.store(second).await.unwrap();

        let hit = cache.lookup(&key).await.unwrap().unwrap();
        assert_eq!(hit.outputs.get("out_matrix").unwrap(), "a.mat");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_disk_cache_round_trip_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let key = CacheKey::derive(&flirt(), &inputs(&[("in_file", json!("T1w.nii.gz"))]));
        let entry = CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("x.mat"))]));

        DiskCache::new(temp.path()).store(entry.clone()).await.unwrap();

        let reopened = DiskCache::new(temp.path());
        let hit = reopened.lookup(&key).await.unwrap().unwrap();
        assert_eq!(hit, entry);
        assert!(reopened.entry_dir(&key).join(OUTPUTS_FILE).exists());
        assert!(reopened.entry_dir(&key).starts_with(temp.path().join(&key.as_str()[..2])));
    }

    #[tokio::test]
    async fn test_disk_cache_store_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(temp.path());
        let key = CacheKey::derive(&flirt(), &PortValues::new());

        cache
            .store(CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("first"))])))
            .await
            .unwrap();
        cache
            .store(CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("second"))])))
            .await
            .unwrap();

        let hit = cache.lookup(&key).await.unwrap().unwrap();
        assert_eq!(hit.outputs.get("out_matrix").unwrap(), "first");
    }

    #[tokio::test]
    async fn test_disk_cache_miss_without_status_marker() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(temp.path());
        let key = CacheKey::derive(&flirt(), &PortValues::new());

        let dir = cache.entry_dir(&key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(OUTPUTS_FILE), "{}").unwrap();

        assert!(cache.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_cache_corrupt_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(temp.path());
        let key = CacheKey::derive(&flirt(), &PortValues::new());
        cache
            .store(CacheEntry::succeeded(key.clone(), "flirt", PortValues::new()))
            .await
            .unwrap();

        std::fs::write(cache.entry_dir(&key).join(OUTPUTS_FILE), "{not json").unwrap();

        let err = cache.lookup(&key).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_disk_cache_corrupt_entry_is_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(temp.path());
        let key = CacheKey::derive(&flirt(), &PortValues::new());
        cache
            .store(CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("old"))])))
            .await
            .unwrap();
        std::fs::write(cache.entry_dir(&key).join(STATUS_FILE), "garbage").unwrap();

        assert!(cache.lookup(&key).await.is_err());
        assert!(!cache.entry_dir(&key).exists());
        assert!(cache.lookup(&key).await.unwrap().is_none());

        cache
            .store(CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("new"))])))
            .await
            .unwrap();
        let hit = cache.lookup(&key).await.unwrap().unwrap();
        assert_eq!(hit.outputs.get("out_matrix").unwrap(), "new");
    }

    #[tokio::test]
    async fn test_disk_cache_store_replaces_incomplete_entry() {
        let temp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(temp.path());
        let key = CacheKey::derive(&flirt(), &PortValues::new());
        let dir = cache.entry_dir(&key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(OUTPUTS_FILE), "{}").unwrap();

        cache
            .store(CacheEntry::succeeded(key.clone(), "flirt", inputs(&[("out_matrix", json!("x.mat"))])))
            .await
            .unwrap();

        let hit = cache.lookup(&key).await.unwrap().unwrap();
        assert_eq!(hit.outputs.get("out_matrix").unwrap(), "x.mat");
    }

    #[tokio::test]
    async fn test_evict_missing_key_is_ok() {
        let temp = tempfile::tempdir().unwrap();
        let key = CacheKey::derive(&flirt(), &PortValues::new());
        DiskCache::new(temp.path()).evict(&key).await.unwrap();

        let memory = MemoryCache::new();
        memory
            .store(CacheEntry::succeeded(key.clone(), "flirt", PortValues::new()))
            .await
            .unwrap();
        memory.evict(&key).await.unwrap();
        assert!(memory.is_empty());
    }
}
