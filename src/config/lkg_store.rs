//! Last-known-good snapshot storage (§6).
//!
//! An async trait plus a thiserror/miette error enum, with an in-memory
//! reference implementation and a file-backed one using a
//! temp-file-then-rename write for atomicity.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;

use super::ConfigSnapshot;

#[derive(Debug, Error, Diagnostic)]
pub enum LkgStoreError {
    #[error("backend error: {message}")]
    #[diagnostic(code(rockestra::config::lkg_backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, LkgStoreError>;

/// Outcome of a load attempt, distinguishing "nothing stored" from
/// "something stored but unreadable" so [`super::PersistedLkgProvider`] can
/// apply the §4.4 fallback policy correctly.
pub enum LkgLoadResult {
    NotFound,
    Loaded(ConfigSnapshot),
    Corrupt,
}

#[async_trait]
pub trait LkgSnapshotStore: Send + Sync {
    async fn load(&self, flow_name: &str) -> Result<LkgLoadResult>;
    async fn persist(&self, flow_name: &str, snapshot: &ConfigSnapshot) -> Result<()>;
}

/// Volatile, process-local store. Suitable for tests and single-process
/// deployments that accept losing the LKG on restart.
#[derive(Default)]
pub struct InMemoryLkgSnapshotStore {
    inner: RwLock<FxHashMap<String, ConfigSnapshot>>,
}

impl InMemoryLkgSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LkgSnapshotStore for InMemoryLkgSnapshotStore {
    async fn load(&self, flow_name: &str) -> Result<LkgLoadResult> {
        let map = self.inner.read().map_err(|e| LkgStoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        Ok(match map.get(flow_name) {
            Some(snapshot) => LkgLoadResult::Loaded(snapshot.clone()),
            None => LkgLoadResult::NotFound,
        })
    }

    async fn persist(&self, flow_name: &str, snapshot: &ConfigSnapshot) -> Result<()> {
        let mut map = self.inner.write().map_err(|e| LkgStoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        map.insert(flow_name.to_string(), snapshot.clone());
        Ok(())
    }
}

/// Durable store backing each flow's LKG snapshot with one JSON file under
/// `base_dir`, written via a temp file + rename so a crash mid-write never
/// leaves a corrupt file in the live path.
pub struct FileLkgSnapshotStore {
    base_dir: PathBuf,
}

impl FileLkgSnapshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, flow_name: &str) -> PathBuf {
        self.base_dir.join(format!("{flow_name}.lkg.json"))
    }
}

#[async_trait]
impl LkgSnapshotStore for FileLkgSnapshotStore {
    async fn load(&self, flow_name: &str) -> Result<LkgLoadResult> {
        let path = self.path_for(flow_name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LkgLoadResult::NotFound),
            Err(e) => {
                return Err(LkgStoreError::Backend {
                    message: format!("reading {}: {e}", path.display()),
                })
            }
        };
        match serde_json::from_slice::<ConfigSnapshot>(&bytes) {
            Ok(snapshot) => Ok(LkgLoadResult::Loaded(snapshot)),
            Err(_) => Ok(LkgLoadResult::Corrupt),
        }
    }

    async fn persist(&self, flow_name: &str, snapshot: &ConfigSnapshot) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir).map_err(|e| LkgStoreError::Backend {
            message: format!("creating {}: {e}", self.base_dir.display()),
        })?;
        let path = self.path_for(flow_name);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(snapshot).map_err(|e| LkgStoreError::Backend {
            message: format!("serializing snapshot: {e}"),
        })?;
        std::fs::write(&tmp_path, &bytes).map_err(|e| LkgStoreError::Backend {
            message: format!("writing {}: {e}", tmp_path.display()),
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| LkgStoreError::Backend {
            message: format!("renaming {} to {}: {e}", tmp_path.display(), path.display()),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LkgEvidence, SnapshotMeta};
    use serde_json::json;

    fn sample_snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            config_version: 1,
            patch: crate::patch::PatchDocument {
                schema_version: "v1".to_string(),
                flows: Default::default(),
                limits: None,
            },
            default_params: Default::default(),
            meta: SnapshotMeta {
                source: "static".to_string(),
                fetched_at: chrono::Utc::now(),
            },
            lkg_evidence: LkgEvidence::default(),
        }
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryLkgSnapshotStore::new();
        assert!(matches!(store.load("demo").await.unwrap(), LkgLoadResult::NotFound));
        store.persist("demo", &sample_snapshot()).await.unwrap();
        assert!(matches!(
            store.load("demo").await.unwrap(),
            LkgLoadResult::Loaded(_)
        ));
    }

    #[tokio::test]
    async fn file_store_round_trips_through_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLkgSnapshotStore::new(dir.path());
        store.persist("demo", &sample_snapshot()).await.unwrap();
        let loaded = store.load("demo").await.unwrap();
        assert!(matches!(loaded, LkgLoadResult::Loaded(_)));
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_payload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo.lkg.json"), b"not json").unwrap();
        let store = FileLkgSnapshotStore::new(dir.path());
        let loaded = store.load("demo").await.unwrap();
        assert!(matches!(loaded, LkgLoadResult::Corrupt));
    }

    #[test]
    fn snapshot_is_json_roundtrippable() {
        let snapshot = sample_snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["meta"]["source"], json!("static"));
    }
}
