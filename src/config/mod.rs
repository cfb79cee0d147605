//! Configuration store - the latest parsed view of every JSON document
//!
//! All documents live under `~/.clp`. The store keeps one cached snapshot
//! per document, detects external edits by file signature (mtime + size)
//! the same way the request path polls for changes, and persists edits
//! with a temp-file + fsync + rename sequence so readers never observe a
//! partial write.

pub mod loadbalance;
pub mod routing;
pub mod system;
pub mod upstream;

pub use loadbalance::{BalanceMode, LoadBalancePolicy, ServicePolicy};
pub use routing::{RouteMode, RouteTable};
pub use system::SystemSettings;
pub use upstream::{parse_upstreams, Credential, UpstreamConfig, UpstreamSet};

use crate::family::Family;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::watch;

/// The documents the store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigDoc {
    /// Family upstream set: `<family>.json`
    Upstreams(Family),
    /// Redaction rules: `filter.json`
    Filter,
    /// Route table: `routing.json`
    Routing,
    /// Load-balance policy: `loadbalance.json`
    LoadBalance,
    /// System settings: `data/system.json`
    System,
}

impl ConfigDoc {
    fn relative_path(&self) -> PathBuf {
        match self {
            ConfigDoc::Upstreams(family) => {
                PathBuf::from(format!("{}.json", family.service_name()))
            }
            ConfigDoc::Filter => PathBuf::from("filter.json"),
            ConfigDoc::Routing => PathBuf::from("routing.json"),
            ConfigDoc::LoadBalance => PathBuf::from("loadbalance.json"),
            ConfigDoc::System => PathBuf::from("data").join("system.json"),
        }
    }

    /// Seed content for a document that does not exist yet.
    fn default_value(&self) -> Value {
        match self {
            ConfigDoc::Upstreams(_) | ConfigDoc::System => Value::Object(Default::default()),
            ConfigDoc::Filter => Value::Array(Vec::new()),
            ConfigDoc::Routing => serde_json::to_value(RouteTable::default()).unwrap_or_default(),
            ConfigDoc::LoadBalance => {
                serde_json::to_value(LoadBalancePolicy::seeded()).unwrap_or_default()
            }
        }
    }

    fn all() -> Vec<ConfigDoc> {
        let mut docs: Vec<ConfigDoc> = Family::ALL.iter().map(|f| ConfigDoc::Upstreams(*f)).collect();
        docs.extend([
            ConfigDoc::Filter,
            ConfigDoc::Routing,
            ConfigDoc::LoadBalance,
            ConfigDoc::System,
        ]);
        docs
    }
}

/// File change signature: (size, mtime). Cheap to compute, good enough to
/// detect out-of-band edits between requests.
type FileSignature = (u64, Option<SystemTime>);

struct CachedDoc {
    value: Arc<Value>,
    signature: FileSignature,
}

pub struct ConfigStore {
    root: PathBuf,
    cache: Mutex<HashMap<ConfigDoc, CachedDoc>>,
    watchers: Mutex<HashMap<ConfigDoc, watch::Sender<Arc<Value>>>>,
}

impl ConfigStore {
    /// Open a store rooted at an explicit directory (used by tests).
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("data"))
            .with_context(|| format!("Failed to create config directory {}", root.display()))?;
        let store = Self {
            root,
            cache: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        };
        store.seed_missing()?;
        Ok(store)
    }

    /// Open the default store under `~/.clp`.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Self::new(home.join(".clp"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for data files (request logs, system settings).
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn path_for(&self, doc: ConfigDoc) -> PathBuf {
        self.root.join(doc.relative_path())
    }

    /// Create any missing document with its seed content.
    fn seed_missing(&self) -> Result<()> {
        for doc in ConfigDoc::all() {
            let path = self.path_for(doc);
            if !path.exists() {
                write_atomic(&path, &doc.default_value())?;
            }
        }
        Ok(())
    }

    fn signature(path: &Path) -> FileSignature {
        match fs::metadata(path) {
            Ok(meta) => (meta.len(), meta.modified().ok()),
            Err(_) => (0, None),
        }
    }

    /// Immutable snapshot of a document, reloading if the file changed.
    ///
    /// A document that fails to parse keeps serving the last good snapshot
    /// (or the seed value) rather than poisoning the request path.
    pub fn get(&self, doc: ConfigDoc) -> Arc<Value> {
        let path = self.path_for(doc);
        let current = Self::signature(&path);

        let mut cache = self.cache.lock().unwrap();
        if let Some(cached) = cache.get(&doc) {
            if cached.signature == current {
                return cached.value.clone();
            }
        }

        let value = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => Arc::new(value),
                Err(err) => {
                    tracing::warn!("Failed to parse {}: {}", path.display(), err);
                    cache
                        .get(&doc)
                        .map(|c| c.value.clone())
                        .unwrap_or_else(|| Arc::new(doc.default_value()))
                }
            },
            Err(err) => {
                tracing::debug!("Failed to read {}: {}", path.display(), err);
                Arc::new(doc.default_value())
            }
        };

        cache.insert(
            doc,
            CachedDoc {
                value: value.clone(),
                signature: current,
            },
        );
        value
    }

    /// Validate and persist a document from raw JSON text.
    pub fn put(&self, doc: ConfigDoc, content: &str) -> Result<()> {
        let value: Value = serde_json::from_str(content).context("Document is not valid JSON")?;
        self.put_value(doc, &value)
    }

    /// Persist an already-parsed document. The in-memory view is only
    /// updated once the rename succeeds.
    pub fn put_value(&self, doc: ConfigDoc, value: &Value) -> Result<()> {
        let path = self.path_for(doc);
        write_atomic(&path, value)?;

        let snapshot = Arc::new(value.clone());
        {
            let mut cache = self.cache.lock().unwrap();
            cache.insert(
                doc,
                CachedDoc {
                    value: snapshot.clone(),
                    signature: Self::signature(&path),
                },
            );
        }

        let watchers = self.watchers.lock().unwrap();
        if let Some(sender) = watchers.get(&doc) {
            let _ = sender.send(snapshot);
        }
        Ok(())
    }

    /// Subscribe to a document; the receiver observes the snapshot after
    /// every successful put.
    pub fn subscribe(&self, doc: ConfigDoc) -> watch::Receiver<Arc<Value>> {
        let current = self.get(doc);
        let mut watchers = self.watchers.lock().unwrap();
        watchers
            .entry(doc)
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    // ── Typed views ──────────────────────────────────────────────────────

    pub fn upstreams(&self, family: Family) -> UpstreamSet {
        parse_upstreams(&self.get(ConfigDoc::Upstreams(family)))
    }

    pub fn route_table(&self) -> RouteTable {
        serde_json::from_value((*self.get(ConfigDoc::Routing)).clone()).unwrap_or_default()
    }

    pub fn load_balance(&self) -> LoadBalancePolicy {
        serde_json::from_value((*self.get(ConfigDoc::LoadBalance)).clone()).unwrap_or_default()
    }

    pub fn put_load_balance(&self, policy: &LoadBalancePolicy) -> Result<()> {
        let value = serde_json::to_value(policy)?;
        self.put_value(ConfigDoc::LoadBalance, &value)
    }

    pub fn system(&self) -> SystemSettings {
        serde_json::from_value((*self.get(ConfigDoc::System)).clone()).unwrap_or_default()
    }

    /// The name of the config marked active, falling back to the first
    /// entry the way the original selection does.
    pub fn active_upstream(&self, family: Family) -> Option<String> {
        let set = self.upstreams(family);
        set.iter()
            .find(|(_, c)| c.active)
            .or_else(|| set.iter().next())
            .map(|(name, _)| name.clone())
    }
}

/// Write `value` to `path` via temp file + fsync + rename so concurrent
/// readers never see a torn document.
fn write_atomic(path: &Path, value: &Value) -> Result<()> {
    let parent = path
        .parent()
        .context("Config path has no parent directory")?;
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("doc"),
        std::process::id()
    ));

    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("Failed to create temp file {}", tmp.display()))?;
    let text = serde_json::to_string_pretty(value)?;
    file.write_all(text.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path).with_context(|| {
        let _ = fs::remove_file(&tmp);
        format!("Failed to replace {}", path.display())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, ConfigStore) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn seeds_missing_documents() {
        let (dir, store) = store();
        assert!(dir.path().join("claude.json").exists());
        assert!(dir.path().join("data/system.json").exists());
        assert!(store.upstreams(Family::Claude).is_empty());
        assert_eq!(store.load_balance().service(Family::Codex).failure_threshold, 3);
    }

    #[test]
    fn put_rejects_invalid_json_without_touching_state() {
        let (_dir, store) = store();
        store
            .put(ConfigDoc::Filter, r#"[{"source": "a", "op": "remove"}]"#)
            .unwrap();
        assert!(store.put(ConfigDoc::Filter, "{not json").is_err());
        // The previous snapshot is still served
        let doc = store.get(ConfigDoc::Filter);
        assert_eq!(doc.as_array().map(|a| a.len()), Some(1));
    }

    #[test]
    fn external_edits_are_picked_up_by_signature() {
        let (dir, store) = store();
        let _ = store.get(ConfigDoc::Upstreams(Family::Legacy));

        let path = dir.path().join("legacy.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "site-a": {"base_url": "https://a", "auth_token": "t"}
            }))
            .unwrap(),
        )
        .unwrap();
        // Force a distinct mtime/size signature
        let set = store.upstreams(Family::Legacy);
        assert!(set.contains_key("site-a"));
    }

    #[test]
    fn subscribe_sees_snapshot_after_put() {
        let (_dir, store) = store();
        let mut rx = store.subscribe(ConfigDoc::Routing);
        let doc = json!({"mode": "model-mapping"});
        store.put_value(ConfigDoc::Routing, &doc).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(**rx.borrow_and_update(), doc);
    }

    #[test]
    fn unknown_upstream_fields_survive_round_trip() {
        let (_dir, store) = store();
        let doc = json!({
            "main": {
                "base_url": "https://api.example.com",
                "auth_token": "tok",
                "vendor_extension": {"keep": true}
            }
        });
        store.put_value(ConfigDoc::Upstreams(Family::Claude), &doc).unwrap();

        let set = store.upstreams(Family::Claude);
        let rewritten = serde_json::to_value(&set).unwrap();
        let reparsed = parse_upstreams(&rewritten);
        assert_eq!(reparsed, set);
        assert_eq!(
            reparsed["main"].extra.get("vendor_extension"),
            Some(&json!({"keep": true}))
        );
    }
}
