//! Local record store collaborators.
//!
//! The coordinators never keep a second copy of a record: every read and
//! write goes through a [`LocalStore`]. Records are scoped by a type key so
//! "the latest record of this kind" can be answered by recency.

mod memory;
mod sled_store;

pub use self::memory::MemoryStore;
pub use self::sled_store::SledStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::{FieldPatch, StoredRecord};

/// Crash-safe keyed record store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Returns the most recently updated record of `type_key`.
    ///
    /// Records without a timestamp sort oldest.
    async fn fetch_latest(&self, type_key: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Returns the record `id` of `type_key`.
    async fn fetch_by_id(
        &self,
        type_key: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Inserts or replaces a record.
    async fn save(&self, type_key: &str, record: StoredRecord) -> Result<(), StoreError>;

    /// Patches the named fields of an existing record.
    ///
    /// Returns `Ok(false)` without writing anything when the record does not
    /// exist.
    async fn update(
        &self,
        type_key: &str,
        id: &str,
        patch: &FieldPatch,
    ) -> Result<bool, StoreError>;

    /// Persists pending writes.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
