use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use bundlegraph_core::{Bundle, BundleError, BundleId, Result};

/// A bundle as persisted, with the storage revision it was saved under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBundle {
    pub data: Bundle,
    pub revision: u64,
}

/// Storage collaborator. Saves never mutate an existing revision; each save
/// supersedes the previous one under a strictly greater revision.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn load_raw_bundle(&self, bundle_id: &str) -> Result<Option<StoredBundle>>;

    async fn save_raw_bundle(&self, bundle_id: &str, data: &Bundle, revision: u64) -> Result<()>;
}

/// In-process store that keeps every revision.
#[derive(Debug, Default)]
pub struct MemoryBundleStore {
    history: DashMap<BundleId, Vec<StoredBundle>>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` as the next revision and returns that revision.
    pub fn put(&self, bundle_id: impl Into<BundleId>, data: Bundle) -> u64 {
        let mut entry = self.history.entry(bundle_id.into()).or_default();
        let revision = entry.last().map(|s| s.revision + 1).unwrap_or(1);
        entry.push(StoredBundle { data, revision });
        revision
    }

    pub fn history(&self, bundle_id: &str) -> Vec<StoredBundle> {
        self.history
            .get(bundle_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    pub fn latest_revision(&self, bundle_id: &str) -> Option<u64> {
        self.history
            .get(bundle_id)
            .and_then(|h| h.last().map(|s| s.revision))
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn load_raw_bundle(&self, bundle_id: &str) -> Result<Option<StoredBundle>> {
        Ok(self.history.get(bundle_id).and_then(|h| h.last().cloned()))
    }

    async fn save_raw_bundle(&self, bundle_id: &str, data: &Bundle, revision: u64) -> Result<()> {
        let mut entry = self.history.entry(bundle_id.to_string()).or_default();
        if let Some(current) = entry.last().map(|s| s.revision) {
            if revision <= current {
                return Err(BundleError::StaleRevision {
                    bundle_id: bundle_id.to_string(),
                    attempted: revision,
                    current,
                });
            }
        }
        entry.push(StoredBundle {
            data: data.clone(),
            revision,
        });
        Ok(())
    }
}

/// One JSON file per bundle: `<dir>/<bundle-id>.json`.
#[derive(Debug, Clone)]
pub struct FileBundleStore {
    dir: PathBuf,
}

impl FileBundleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, bundle_id: &str) -> Result<PathBuf> {
        let valid = !bundle_id.is_empty()
            && bundle_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !bundle_id.starts_with('.');
        if !valid {
            return Err(BundleError::InvalidOperation(format!(
                "bundle id `{bundle_id}` is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{bundle_id}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Option<StoredBundle>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl BundleStore for FileBundleStore {
    async fn load_raw_bundle(&self, bundle_id: &str) -> Result<Option<StoredBundle>> {
        let path = self.path_for(bundle_id)?;
        self.read(&path).await
    }

    async fn save_raw_bundle(&self, bundle_id: &str, data: &Bundle, revision: u64) -> Result<()> {
        let path = self.path_for(bundle_id)?;
        if let Some(current) = self.read(&path).await? {
            if revision <= current.revision {
                return Err(BundleError::StaleRevision {
                    bundle_id: bundle_id.to_string(),
                    attempted: revision,
                    current: current.revision,
                });
            }
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let stored = StoredBundle {
            data: data.clone(),
            revision,
        };
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&stored)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(bundle_id, revision, path = %path.display(), "saved bundle");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(version: &str) -> Bundle {
        Bundle::new(version, "root")
    }

    #[tokio::test]
    async fn memory_store_keeps_history() {
        let store = MemoryBundleStore::new();
        assert_eq!(store.put("site", bundle("1-baseline")), 1);
        store.save_raw_bundle("site", &bundle("2-rename-tag-field"), 2).await.unwrap();

        let latest = store.load_raw_bundle("site").await.unwrap().unwrap();
        assert_eq!(latest.revision, 2);
        assert_eq!(latest.data.version, "2-rename-tag-field");
        assert_eq!(store.history("site").len(), 2);
        assert!(store.load_raw_bundle("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_revision() {
        let store = MemoryBundleStore::new();
        store.put("site", bundle(""));
        let err = store.save_raw_bundle("site", &bundle(""), 1).await.unwrap_err();
        assert!(matches!(err, BundleError::StaleRevision { current: 1, .. }));
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileBundleStore::new(dir.path().join("bundles"));
        assert!(store.load_raw_bundle("site-1").await.unwrap().is_none());

        store.save_raw_bundle("site-1", &bundle("v"), 3).await.unwrap();
        let loaded = store.load_raw_bundle("site-1").await.unwrap().unwrap();
        assert_eq!(loaded.revision, 3);
        assert_eq!(loaded.data, bundle("v"));

        assert!(store.save_raw_bundle("site-1", &bundle("v"), 3).await.is_err());
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileBundleStore::new(dir.path());
        assert!(store.load_raw_bundle("../escape").await.is_err());
        assert!(store.load_raw_bundle("").await.is_err());
    }
}
