use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::LocalStore;
use crate::error::StoreError;
use crate::record::{FieldPatch, StoredRecord};

type Table = HashMap<String, StoredRecord>;

/// In-process store; contents are lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held for `type_key`.
    pub async fn len(&self, type_key: &str) -> usize {
        self.tables
            .lock()
            .await
            .get(type_key)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn fetch_latest(&self, type_key: &str) -> Result<Option<StoredRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(type_key).and_then(|table| {
            table
                .values()
                .max_by_key(|record| record.last_updated_at)
                .cloned()
        }))
    }

    async fn fetch_by_id(
        &self,
        type_key: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(type_key).and_then(|table| table.get(id)).cloned())
    }

    async fn save(&self, type_key: &str, record: StoredRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .entry(type_key.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(
        &self,
        type_key: &str,
        id: &str,
        patch: &FieldPatch,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(record) = tables.get_mut(type_key).and_then(|table| table.get_mut(id)) else {
            return Ok(false);
        };
        // Patch a copy so a rejected patch leaves the stored record untouched.
        let mut patched = record.clone();
        patched.apply_patch(patch)?;
        *record = patched;
        Ok(true)
    }
}
