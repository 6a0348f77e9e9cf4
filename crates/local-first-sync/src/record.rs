//! Persisted record shapes.
//!
//! Coordinators work with typed [`Record<T>`] values while the local store
//! keeps the JSON form ([`StoredRecord`]) so that partial updates can address
//! individual payload fields without knowing the resource type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::{StoreError, SyncError};

/// A cached resource owned by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    /// Stable identifier of the resource.
    pub id: String,
    /// Resource body.
    pub payload: T,
    /// When the record was last written (absent for records never stamped).
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated_at: Option<OffsetDateTime>,
}

/// JSON form of a record as persisted by [`crate::store::LocalStore`].
pub type StoredRecord = Record<Value>;

impl<T> Record<T> {
    /// Creates a record stamped with the current time.
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
            last_updated_at: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Creates a record with an explicit (possibly absent) timestamp.
    pub fn with_timestamp(
        id: impl Into<String>,
        payload: T,
        last_updated_at: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            last_updated_at,
        }
    }
}

impl<T: Serialize> Record<T> {
    /// Serialises the payload into its stored JSON form.
    pub fn to_stored(&self) -> Result<StoredRecord, SyncError> {
        Ok(Record {
            id: self.id.clone(),
            payload: serde_json::to_value(&self.payload)?,
            last_updated_at: self.last_updated_at,
        })
    }
}

impl StoredRecord {
    /// Decodes the stored payload into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Record<T>, SyncError> {
        Ok(Record {
            id: self.id.clone(),
            payload: serde_json::from_value(self.payload.clone())?,
            last_updated_at: self.last_updated_at,
        })
    }

    /// Returns a payload field, if the payload is an object carrying it.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.as_object().and_then(|fields| fields.get(name))
    }

    /// Applies a partial update in place.
    ///
    /// Only the fields named by the patch are touched; the timestamp is always
    /// replaced by the patch's timestamp.
    pub fn apply_patch(&mut self, patch: &FieldPatch) -> Result<(), StoreError> {
        let Some(fields) = self.payload.as_object_mut() else {
            return Err(StoreError::InvalidPayload(self.id.clone()));
        };
        for (name, value) in &patch.set {
            fields.insert(name.clone(), value.clone());
        }
        for name in &patch.unset {
            fields.remove(name);
        }
        self.last_updated_at = patch.last_updated_at;
        Ok(())
    }
}

/// Partial update addressed to a single record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    /// Fields to insert or overwrite.
    pub set: Map<String, Value>,
    /// Fields to remove.
    pub unset: Vec<String>,
    /// Timestamp written alongside the patch.
    pub last_updated_at: Option<OffsetDateTime>,
}

impl FieldPatch {
    /// Builds a patch that overwrites `set` and stamps the record with `at`.
    pub fn new(set: Map<String, Value>, at: Option<OffsetDateTime>) -> Self {
        Self {
            set,
            unset: Vec::new(),
            last_updated_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Answer {
        mine: Option<String>,
        theirs: Option<String>,
    }

    #[test]
    fn typed_records_round_trip_through_stored_form() {
        let record = Record::with_timestamp(
            "q-1",
            Answer {
                mine: Some("A".into()),
                theirs: None,
            },
            Some(datetime!(2024-05-01 10:00 UTC)),
        );
        let stored = record.to_stored().unwrap();
        assert_eq!(stored.field("mine"), Some(&json!("A")));
        assert_eq!(stored.decode::<Answer>().unwrap(), record);
    }

    #[test]
    fn timestamps_serialise_as_rfc3339() {
        let record = Record::with_timestamp("q-1", json!({}), Some(datetime!(2024-05-01 10:00 UTC)));
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["last_updated_at"], json!("2024-05-01T10:00:00Z"));

        let missing: StoredRecord =
            serde_json::from_value(json!({"id": "q-2", "payload": {}})).unwrap();
        assert_eq!(missing.last_updated_at, None);
    }

    #[test]
    fn apply_patch_touches_only_named_fields() {
        let mut stored = Record::with_timestamp(
            "q-1",
            json!({"mine": "A", "theirs": "B"}),
            Some(datetime!(2024-05-01 10:00 UTC)),
        );
        let mut set = Map::new();
        set.insert("mine".into(), json!("C"));
        let patch = FieldPatch::new(set, Some(datetime!(2024-05-02 10:00 UTC)));
        stored.apply_patch(&patch).unwrap();

        assert_eq!(stored.payload, json!({"mine": "C", "theirs": "B"}));
        assert_eq!(stored.last_updated_at, Some(datetime!(2024-05-02 10:00 UTC)));

        let removal = FieldPatch {
            unset: vec!["mine".into()],
            ..Default::default()
        };
        stored.apply_patch(&removal).unwrap();
        assert_eq!(stored.payload, json!({"theirs": "B"}));
        assert_eq!(stored.last_updated_at, None);
    }

    #[test]
    fn apply_patch_rejects_scalar_payloads() {
        let mut stored = Record::with_timestamp("n", json!(3), None);
        let err = stored.apply_patch(&FieldPatch::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(id) if id == "n"));
    }
}
