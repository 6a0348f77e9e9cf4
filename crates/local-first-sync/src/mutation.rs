//! Optimistic mutations.
//!
//! [`OptimisticMutationCoordinator::submit`] backs up the fields a mutation
//! is about to change, applies the change to the local store immediately,
//! resolves a token and submits the change remotely. When the remote leg
//! fails the backup is restored and the original error is returned.
//!
//! Submits against the same record are serialized through [`KeyedLocks`], so
//! two concurrent writes to one id can never interleave their backup, apply
//! and rollback steps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::http::{Endpoint, HttpTransport};
use crate::record::{FieldPatch, StoredRecord};
use crate::store::LocalStore;
use crate::telemetry::{NoopTelemetry, SyncTelemetry};
use crate::token::TokenProvider;

/// A user-initiated write.
#[async_trait]
pub trait Mutation: Send + Sync {
    /// Type key of the target record.
    fn type_key(&self) -> &str;

    /// Id of the target record.
    fn target_id(&self) -> &str;

    /// Field values to write, computed from the current record.
    ///
    /// Only the returned fields are applied and backed up; every other field
    /// of the record is left untouched.
    fn changes(&self, current: Option<&StoredRecord>) -> Result<Map<String, Value>, SyncError>;

    /// Submits the change to the backend with an already resolved token.
    async fn submit_remote(&self, transport: &HttpTransport, token: &str)
        -> Result<bool, SyncError>;

    /// Side effect for a failed mutation, invoked after the rollback.
    fn on_failure(&self, error: &SyncError) {
        warn!(
            type_key = %self.type_key(),
            id = %self.target_id(),
            error = %error,
            "mutation failed"
        );
    }
}

/// Prior state of the fields a mutation touches.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationBackup {
    type_key: String,
    id: String,
    existed: bool,
    prior: Map<String, Value>,
    absent: Vec<String>,
    last_updated_at: Option<OffsetDateTime>,
}

impl MutationBackup {
    /// Captures the current value of `fields` (absent fields are remembered
    /// as such) and the record timestamp.
    pub fn capture<'a>(
        type_key: &str,
        id: &str,
        current: Option<&StoredRecord>,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut prior = Map::new();
        let mut absent = Vec::new();
        if let Some(record) = current {
            for name in fields {
                match record.field(name) {
                    Some(value) => {
                        prior.insert(name.to_string(), value.clone());
                    }
                    None => absent.push(name.to_string()),
                }
            }
        }
        Self {
            type_key: type_key.to_string(),
            id: id.to_string(),
            existed: current.is_some(),
            prior,
            absent,
            last_updated_at: current.and_then(|record| record.last_updated_at),
        }
    }

    /// Patch restoring the captured state; `None` when there was no record.
    pub fn restore_patch(&self) -> Option<FieldPatch> {
        self.existed.then(|| FieldPatch {
            set: self.prior.clone(),
            unset: self.absent.clone(),
            last_updated_at: self.last_updated_at,
        })
    }
}

/// Hands out one async mutex per key.
///
/// Entries are dropped from the map once no guard for them is alive.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.clone().lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            mutex,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one key of a [`KeyedLocks`].
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map and ours: nobody else is waiting.
        if Arc::strong_count(&self.mutex) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Applies mutations optimistically and rolls them back on failure.
pub struct OptimisticMutationCoordinator {
    store: Arc<dyn LocalStore>,
    tokens: Arc<dyn TokenProvider>,
    transport: HttpTransport,
    locks: KeyedLocks,
    telemetry: Arc<dyn SyncTelemetry>,
}

impl std::fmt::Debug for OptimisticMutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticMutationCoordinator")
            .field("transport", &self.transport)
            .field("locks", &self.locks)
            .finish()
    }
}

impl OptimisticMutationCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        tokens: Arc<dyn TokenProvider>,
        transport: HttpTransport,
    ) -> Self {
        Self {
            store,
            tokens,
            transport,
            locks: KeyedLocks::new(),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn SyncTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Applies `mutation` locally, submits it, and rolls back on failure.
    ///
    /// A record that does not exist locally is not created: the remote leg
    /// still runs, and rollback is a no-op.
    pub async fn submit<M>(&self, mutation: &M) -> Result<bool, SyncError>
    where
        M: Mutation + ?Sized,
    {
        let type_key = mutation.type_key();
        let id = mutation.target_id();
        let _guard = self.locks.lock(&format!("{type_key}/{id}")).await;

        let current = self
            .store
            .fetch_by_id(type_key, id)
            .await
            .map_err(SyncError::LocalRead)?;
        let changes = mutation.changes(current.as_ref())?;
        let backup = MutationBackup::capture(
            type_key,
            id,
            current.as_ref(),
            changes.keys().map(String::as_str),
        );

        let patch = FieldPatch::new(changes, Some(OffsetDateTime::now_utc()));
        let applied = self
            .store
            .update(type_key, id, &patch)
            .await
            .map_err(SyncError::LocalWrite)?;
        if !applied {
            debug!(type_key, id, "no local record; submitting without optimistic apply");
        }

        let outcome = match self.tokens.id_token().await {
            Ok(token) => mutation.submit_remote(&self.transport, &token).await,
            Err(err) => Err(SyncError::Token(err)),
        };

        match outcome {
            Ok(confirmed) => {
                debug!(type_key, id, confirmed, "mutation confirmed");
                self.telemetry.on_mutation_applied(type_key, id);
                Ok(confirmed)
            }
            Err(err) => {
                self.rollback(&backup).await;
                self.telemetry.on_mutation_rolled_back(type_key, id, &err);
                mutation.on_failure(&err);
                Err(err)
            }
        }
    }

    /// Restores `backup`; failures are logged, never returned.
    async fn rollback(&self, backup: &MutationBackup) {
        let Some(patch) = backup.restore_patch() else {
            debug!(type_key = %backup.type_key, id = %backup.id, "nothing to roll back");
            return;
        };
        match self.store.update(&backup.type_key, &backup.id, &patch).await {
            Ok(true) => {
                debug!(type_key = %backup.type_key, id = %backup.id, "mutation rolled back");
            }
            Ok(false) => {
                warn!(type_key = %backup.type_key, id = %backup.id, "record vanished before rollback");
            }
            Err(err) => {
                warn!(
                    type_key = %backup.type_key,
                    id = %backup.id,
                    error = %err,
                    "rollback failed"
                );
            }
        }
    }
}

/// Mutation writing fixed field values and confirming them against an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointMutation {
    type_key: String,
    id: String,
    fields: Map<String, Value>,
    endpoint: Endpoint,
}

impl EndpointMutation {
    pub fn new(type_key: impl Into<String>, id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            type_key: type_key.into(),
            id: id.into(),
            fields: Map::new(),
            endpoint,
        }
    }

    /// Adds a field to write locally.
    pub fn set<V: Serialize>(mut self, name: impl Into<String>, value: V) -> Result<Self, SyncError> {
        self.fields.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Sends the local fields as the JSON request body.
    pub fn with_fields_as_body(mut self) -> Result<Self, SyncError> {
        self.endpoint = self.endpoint.with_json(&self.fields)?;
        Ok(self)
    }
}

#[async_trait]
impl Mutation for EndpointMutation {
    fn type_key(&self) -> &str {
        &self.type_key
    }

    fn target_id(&self) -> &str {
        &self.id
    }

    fn changes(&self, _current: Option<&StoredRecord>) -> Result<Map<String, Value>, SyncError> {
        Ok(self.fields.clone())
    }

    async fn submit_remote(
        &self,
        transport: &HttpTransport,
        token: &str,
    ) -> Result<bool, SyncError> {
        let endpoint = self.endpoint.clone().with_bearer(token)?;
        Ok(transport.confirm(&endpoint).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NetworkError, StoreError};
    use crate::http::RetryPolicy;
    use crate::record::Record;
    use crate::store::MemoryStore;
    use crate::telemetry::CountingTelemetry;
    use crate::token::TokenFactory;
    use mockito::Server;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use time::macros::datetime;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    const ANSWERS: &str = "answer";

    fn transport() -> HttpTransport {
        HttpTransport::new(
            RetryPolicy {
                max_attempts: 1,
                backoff: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn coordinator(store: Arc<dyn LocalStore>, tokens: TokenFactory) -> OptimisticMutationCoordinator {
        OptimisticMutationCoordinator::new(store, Arc::new(tokens), transport())
    }

    /// Writes one field and answers with a scripted outcome.
    struct SetField {
        id: &'static str,
        field: &'static str,
        value: &'static str,
        outcome: StdMutex<Option<Result<bool, SyncError>>>,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl SetField {
        fn new(field: &'static str, value: &'static str, outcome: Result<bool, SyncError>) -> Self {
            Self {
                id: "q-1",
                field,
                value,
                outcome: StdMutex::new(Some(outcome)),
                gate: None,
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Mutation for SetField {
        fn type_key(&self) -> &str {
            ANSWERS
        }

        fn target_id(&self) -> &str {
            self.id
        }

        fn changes(&self, _current: Option<&StoredRecord>) -> Result<Map<String, Value>, SyncError> {
            let mut fields = Map::new();
            fields.insert(self.field.to_string(), json!(self.value));
            Ok(fields)
        }

        async fn submit_remote(
            &self,
            _transport: &HttpTransport,
            _token: &str,
        ) -> Result<bool, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let outcome = self.outcome.lock().unwrap().take();
            outcome.unwrap_or(Ok(true))
        }

        fn on_failure(&self, _error: &SyncError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn offline() -> SyncError {
        SyncError::Network(NetworkError::Connection("offline".into()))
    }

    async fn seeded(payload: Value) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .save(
                ANSWERS,
                Record::with_timestamp("q-1", payload, Some(datetime!(2024-05-01 10:00 UTC))),
            )
            .await
            .unwrap();
        store
    }

    async fn stored(store: &MemoryStore) -> StoredRecord {
        store.fetch_by_id(ANSWERS, "q-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_mutation_keeps_local_change() {
        let store = seeded(json!({"mine": "A"})).await;
        let mutation = SetField::new("mine", "B", Ok(true));
        let confirmed = coordinator(store.clone(), TokenFactory::new_from_static_token("t"))
            .submit(&mutation)
            .await
            .unwrap();

        assert!(confirmed);
        let record = stored(&store).await;
        assert_eq!(record.payload, json!({"mine": "B"}));
        assert_ne!(record.last_updated_at, Some(datetime!(2024-05-01 10:00 UTC)));
    }

    #[tokio::test]
    async fn failed_mutation_is_rolled_back_and_rethrown() {
        let store = seeded(json!({"mine": "A"})).await;
        let mutation = SetField::new("mine", "B", Err(offline()));
        let telemetry = CountingTelemetry::default();
        let err = coordinator(store.clone(), TokenFactory::new_from_static_token("t"))
            .with_telemetry(Arc::new(telemetry.clone()))
            .submit(&mutation)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Network(NetworkError::Connection(_))));
        let record = stored(&store).await;
        assert_eq!(record.payload, json!({"mine": "A"}));
        assert_eq!(record.last_updated_at, Some(datetime!(2024-05-01 10:00 UTC)));
        assert_eq!(mutation.failures.load(Ordering::SeqCst), 1);
        assert_eq!(telemetry.counters().snapshot().mutations_rolled_back, 1);
    }

    /// A write to `theirs` never disturbs `mine`, applied or rolled back.
    #[tokio::test]
    async fn two_party_fields_are_independent() {
        let store = seeded(json!({"mine": "A", "theirs": "X"})).await;
        let gate = Arc::new(Notify::new());
        let mut mutation = SetField::new("theirs", "Y", Err(offline()));
        mutation.gate = Some(gate.clone());
        let coordinator = coordinator(store.clone(), TokenFactory::new_from_static_token("t"));

        let submit = coordinator.submit(&mutation);
        tokio::pin!(submit);
        // Drive the submit until it waits on the gate, then inspect the
        // optimistic state.
        tokio::select! {
            _ = &mut submit => panic!("submit finished before the gate opened"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        assert_eq!(stored(&store).await.payload, json!({"mine": "A", "theirs": "Y"}));

        gate.notify_one();
        assert!(submit.await.is_err());
        assert_eq!(stored(&store).await.payload, json!({"mine": "A", "theirs": "X"}));
    }

    /// A missing record is neither created nor fabricated on rollback.
    #[tokio::test]
    async fn absent_record_is_not_fabricated() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone(), TokenFactory::new_from_static_token("t"));

        let failing = SetField::new("mine", "B", Err(offline()));
        assert!(coordinator.submit(&failing).await.is_err());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert!(store.fetch_by_id(ANSWERS, "q-1").await.unwrap().is_none());

        let succeeding = SetField::new("mine", "B", Ok(true));
        assert!(coordinator.submit(&succeeding).await.unwrap());
        assert!(store.fetch_by_id(ANSWERS, "q-1").await.unwrap().is_none());
    }

    /// A token failure rolls back without reaching the network.
    #[tokio::test]
    async fn token_failure_rolls_back() {
        let store = seeded(json!({"mine": "A"})).await;
        let mutation = SetField::new("mine", "B", Ok(true));
        let err = coordinator(store.clone(), TokenFactory::SignedOut)
            .submit(&mutation)
            .await
            .unwrap_err();
        assert!(err.is_token());
        assert_eq!(mutation.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stored(&store).await.payload, json!({"mine": "A"}));
    }

    /// Store whose second update fails, so the rollback cannot land.
    struct RollbackFails {
        inner: MemoryStore,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl LocalStore for RollbackFails {
        async fn fetch_latest(&self, type_key: &str) -> Result<Option<StoredRecord>, StoreError> {
            self.inner.fetch_latest(type_key).await
        }

        async fn fetch_by_id(
            &self,
            type_key: &str,
            id: &str,
        ) -> Result<Option<StoredRecord>, StoreError> {
            self.inner.fetch_by_id(type_key, id).await
        }

        async fn save(&self, type_key: &str, record: StoredRecord) -> Result<(), StoreError> {
            self.inner.save(type_key, record).await
        }

        async fn update(
            &self,
            type_key: &str,
            id: &str,
            patch: &FieldPatch,
        ) -> Result<bool, StoreError> {
            if self.updates.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(StoreError::Unavailable("read-only".into()));
            }
            self.inner.update(type_key, id, patch).await
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn rollback_failure_is_logged_not_returned() {
        let inner = MemoryStore::new();
        inner
            .save(ANSWERS, Record::with_timestamp("q-1", json!({"mine": "A"}), None))
            .await
            .unwrap();
        let store = Arc::new(RollbackFails {
            inner,
            updates: AtomicUsize::new(0),
        });
        let mutation = SetField::new("mine", "B", Err(offline()));
        let err = coordinator(store, TokenFactory::new_from_static_token("t"))
            .submit(&mutation)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Network(_)));
        assert!(logs_contain("rollback failed"));
    }

    /// Concurrent submits on one id run one after the other.
    #[tokio::test]
    async fn submits_on_one_id_are_serialized() {
        let store = seeded(json!({"mine": "A"})).await;
        let coordinator = Arc::new(coordinator(
            store.clone(),
            TokenFactory::new_from_static_token("t"),
        ));
        let gate = Arc::new(Notify::new());
        let mut first = SetField::new("mine", "B", Err(offline()));
        first.gate = Some(gate.clone());
        let first = Arc::new(first);
        let second = Arc::new(SetField::new("mine", "C", Ok(true)));

        let first_task = {
            let coordinator = coordinator.clone();
            let first = first.clone();
            tokio::spawn(async move { coordinator.submit(first.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second_task = {
            let coordinator = coordinator.clone();
            let second = second.clone();
            tokio::spawn(async move { coordinator.submit(second.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The second submit is parked behind the first one's lock.
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);

        gate.notify_one();
        assert!(first_task.await.unwrap().is_err());
        assert!(second_task.await.unwrap().unwrap());

        // The second backup was taken after the first rollback, so the final
        // state is the second write.
        assert_eq!(stored(&store).await.payload, json!({"mine": "C"}));
        assert!(coordinator.locks.is_empty());
    }

    #[tokio::test]
    async fn keyed_locks_are_reclaimed() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock("answer/1").await;
            let _b = locks.lock("answer/2").await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn endpoint_mutation_confirms_against_backend() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/answers/q-1")
            .match_header("authorization", "Bearer t")
            .match_body(mockito::Matcher::Json(json!({"mine": "B"})))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let store = seeded(json!({"mine": "A", "theirs": "X"})).await;
        let mutation = EndpointMutation::new(
            ANSWERS,
            "q-1",
            Endpoint::put(server.url(), "/v1/answers/q-1"),
        )
        .set("mine", "B")
        .unwrap()
        .with_fields_as_body()
        .unwrap();

        assert!(coordinator(store.clone(), TokenFactory::new_from_static_token("t"))
            .submit(&mutation)
            .await
            .unwrap());
        assert_eq!(stored(&store).await.payload, json!({"mine": "B", "theirs": "X"}));
        mock.assert_async().await;
    }

    proptest! {
        /// Applying any field changes and restoring the backup yields the
        /// original payload and timestamp.
        #[test]
        fn backup_restores_exact_state(
            initial in proptest::collection::btree_map("[a-d]", "[a-z]{0,3}", 0..4),
            changes in proptest::collection::btree_map("[a-f]", "[a-z]{0,3}", 1..4),
        ) {
            let payload: Map<String, Value> = initial
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let mut record = Record::with_timestamp(
                "q-1",
                Value::Object(payload),
                Some(datetime!(2024-05-01 10:00 UTC)),
            );
            let original = record.clone();

            let set: Map<String, Value> = changes
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let backup = MutationBackup::capture(
                ANSWERS,
                "q-1",
                Some(&record),
                set.keys().map(String::as_str),
            );
            record
                .apply_patch(&FieldPatch::new(set, Some(datetime!(2024-05-02 10:00 UTC))))
                .unwrap();
            record.apply_patch(&backup.restore_patch().unwrap()).unwrap();

            prop_assert_eq!(record, original);
        }
    }
}
