//! Sled-backed [`LocalStore`].
//!
//! Each type key maps to its own sled tree (`records/<type_key>`); records are
//! stored as JSON under their id. Partial updates use compare-and-swap so a
//! concurrent writer never loses fields.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sled::{Config as SledConfig, Db, Tree};
use tracing::{debug, warn};

use super::LocalStore;
use crate::error::StoreError;
use crate::record::{FieldPatch, StoredRecord};

/// Prefix of every tree holding records.
const RECORD_TREE_PREFIX: &str = "records/";

/// Crash-safe store persisted in a sled database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    path: PathBuf,
}

impl SledStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories.
                fs::create_dir_all(parent)?;
            }
        }
        let db = sled_config(&path).open()?;
        debug!(path = %path.display(), "opened local record store");
        Ok(Self { db, path })
    }

    /// Opens an in-memory store that disappears with the handle.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        Ok(Self {
            db,
            path: PathBuf::new(),
        })
    }

    /// Returns the filesystem path backing the store (empty when temporary).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tree(&self, type_key: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("{RECORD_TREE_PREFIX}{type_key}"))?)
    }
}

fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new()
        .path(path)
        .cache_capacity(16 * 1024 * 1024)
}

fn decode(bytes: &[u8]) -> Result<StoredRecord, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[async_trait]
impl LocalStore for SledStore {
    async fn fetch_latest(&self, type_key: &str) -> Result<Option<StoredRecord>, StoreError> {
        let tree = self.tree(type_key)?;
        let mut latest: Option<StoredRecord> = None;
        for entry in tree.iter() {
            let (key, value) = entry?;
            let record = match decode(&value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        type_key,
                        id = %String::from_utf8_lossy(&key),
                        error = %err,
                        "skipping undecodable record"
                    );
                    continue;
                }
            };
            let newer = latest
                .as_ref()
                .map_or(true, |current| record.last_updated_at > current.last_updated_at);
            if newer {
                latest = Some(record);
            }
        }
        Ok(latest)
    }

    async fn fetch_by_id(
        &self,
        type_key: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let tree = self.tree(type_key)?;
        tree.get(id.as_bytes())?
            .map(|value| decode(&value))
            .transpose()
    }

    async fn save(&self, type_key: &str, record: StoredRecord) -> Result<(), StoreError> {
        let tree = self.tree(type_key)?;
        let encoded = serde_json::to_vec(&record)?;
        tree.insert(record.id.as_bytes(), encoded)?;
        Ok(())
    }

    async fn update(
        &self,
        type_key: &str,
        id: &str,
        patch: &FieldPatch,
    ) -> Result<bool, StoreError> {
        let tree = self.tree(type_key)?;
        loop {
            let Some(current) = tree.get(id.as_bytes())? else {
                return Ok(false);
            };
            let mut record = decode(&current)?;
            record.apply_patch(patch)?;
            let encoded = serde_json::to_vec(&record)?;
            match tree.compare_and_swap(id.as_bytes(), Some(current), Some(encoded))? {
                Ok(()) => return Ok(true),
                Err(_) => {
                    debug!(type_key, id, "record changed during update; retrying");
                }
            }
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use serde_json::{json, Map};
    use tempfile::TempDir;
    use time::macros::datetime;
    use tracing_test::traced_test;

    /// Records survive closing and reopening the database.
    #[tokio::test]
    async fn records_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("records.db");
        {
            let store = SledStore::open(&path).unwrap();
            store
                .save(
                    "answer",
                    Record::with_timestamp(
                        "q-1",
                        json!({"mine": "A"}),
                        Some(datetime!(2024-05-01 10:00 UTC)),
                    ),
                )
                .await
                .unwrap();
            store.flush().await.unwrap();
        }
        let reopened = SledStore::open(&path).unwrap();
        let record = reopened.fetch_by_id("answer", "q-1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"mine": "A"}));
        assert_eq!(record.last_updated_at, Some(datetime!(2024-05-01 10:00 UTC)));
        assert_eq!(reopened.path(), path.as_path());
    }

    #[tokio::test]
    async fn type_keys_are_isolated() {
        let store = SledStore::open_temporary().unwrap();
        store
            .save("answer", Record::with_timestamp("q-1", json!({}), None))
            .await
            .unwrap();
        assert!(store.fetch_by_id("profile", "q-1").await.unwrap().is_none());
        assert!(store.fetch_latest("profile").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_latest_prefers_newest_timestamp() {
        let store = SledStore::open_temporary().unwrap();
        for (id, at) in [
            ("a", Some(datetime!(2024-05-02 10:00 UTC))),
            ("b", None),
            ("c", Some(datetime!(2024-05-01 10:00 UTC))),
        ] {
            store
                .save("answer", Record::with_timestamp(id, json!({}), at))
                .await
                .unwrap();
        }
        let latest = store.fetch_latest("answer").await.unwrap().unwrap();
        assert_eq!(latest.id, "a");
    }

    #[tokio::test]
    async fn update_patches_only_existing_records() {
        let store = SledStore::open_temporary().unwrap();
        store
            .save(
                "answer",
                Record::with_timestamp("q-1", json!({"mine": "A", "theirs": "B"}), None),
            )
            .await
            .unwrap();

        let mut set = Map::new();
        set.insert("mine".into(), json!("C"));
        let patch = FieldPatch::new(set, Some(datetime!(2024-05-03 10:00 UTC)));

        assert!(store.update("answer", "q-1", &patch).await.unwrap());
        assert!(!store.update("answer", "q-2", &patch).await.unwrap());

        let record = store.fetch_by_id("answer", "q-1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"mine": "C", "theirs": "B"}));
        assert_eq!(record.last_updated_at, Some(datetime!(2024-05-03 10:00 UTC)));
        assert!(store.fetch_by_id("answer", "q-2").await.unwrap().is_none());
    }

    /// A corrupt entry does not hide the readable records of its type.
    #[traced_test]
    #[tokio::test]
    async fn fetch_latest_skips_corrupt_entries() {
        let store = SledStore::open_temporary().unwrap();
        store
            .save(
                "answer",
                Record::with_timestamp("q-1", json!({"mine": "A"}), Some(datetime!(2024-05-01 10:00 UTC))),
            )
            .await
            .unwrap();
        store
            .tree("answer")
            .unwrap()
            .insert("q-0", b"not json".to_vec())
            .unwrap();

        let latest = store.fetch_latest("answer").await.unwrap().unwrap();
        assert_eq!(latest.id, "q-1");
        assert!(logs_contain("skipping undecodable record"));
        assert!(store.fetch_by_id("answer", "q-0").await.is_err());
    }
}
