//! Lifecycle wrapper owning one instance of every coordinator.
//!
//! A [`SyncService`] is built explicitly from a [`SyncConfig`] and its
//! collaborators; nothing in the crate is process-wide. [`SyncService::shutdown`]
//! tears down every realtime listener, waits for mirrors to drain and flushes
//! the local store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{RealtimeError, StoreError, SyncError};
use crate::fetch::{
    FetchPlan, FetchSequence, FetchSyncCoordinator, LocalLookup, RecordIdFn, StoreBackedPlan,
};
use crate::http::{Endpoint, HttpTransport, UnauthorizedHook};
use crate::mutation::{Mutation, OptimisticMutationCoordinator};
use crate::realtime::{
    RealtimeProvider, RealtimeSubscription, RealtimeSubscriptionHub, WebsocketProvider,
};
use crate::record::StoredRecord;
use crate::remote::RemoteFetcher;
use crate::store::{LocalStore, MemoryStore, SledStore};
use crate::telemetry::{NoopTelemetry, SyncTelemetry};
use crate::token::TokenProvider;

/// Optional hooks wired into every component of a [`SyncService`].
#[derive(Clone)]
pub struct ServiceOptions {
    pub telemetry: Arc<dyn SyncTelemetry>,
    /// Called once for every HTTP 401 seen by the transport.
    pub unauthorized_hook: Option<UnauthorizedHook>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            telemetry: Arc::new(NoopTelemetry),
            unauthorized_hook: None,
        }
    }
}

impl std::fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("unauthorized_hook", &self.unauthorized_hook.is_some())
            .finish_non_exhaustive()
    }
}

/// Opens the store described by `config`: sled when a path is set, memory otherwise.
pub fn open_store(config: &SyncConfig) -> Result<Arc<dyn LocalStore>, StoreError> {
    match &config.store_path {
        Some(path) => {
            let store = SledStore::open(path)?;
            info!(path = %path.display(), "opened persistent record store");
            Ok(Arc::new(store))
        }
        None => {
            debug!("no store path configured; keeping records in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

struct Mirror {
    path: String,
    type_key: String,
    task: JoinHandle<()>,
}

/// Entry point of the synchronization layer.
pub struct SyncService {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    fetcher: RemoteFetcher,
    fetches: FetchSyncCoordinator,
    mutations: OptimisticMutationCoordinator,
    hub: RealtimeSubscriptionHub,
    mirrors: Mutex<Vec<Mirror>>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        tokens: Arc<dyn TokenProvider>,
        provider: Arc<dyn RealtimeProvider>,
    ) -> Result<Self, SyncError> {
        Self::with_options(config, store, tokens, provider, ServiceOptions::default())
    }

    pub fn with_options(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        tokens: Arc<dyn TokenProvider>,
        provider: Arc<dyn RealtimeProvider>,
        options: ServiceOptions,
    ) -> Result<Self, SyncError> {
        let config = config.sanitise();
        let mut transport = HttpTransport::new(config.retry, config.request_timeout)?
            .with_telemetry(options.telemetry.clone());
        if let Some(hook) = options.unauthorized_hook {
            transport = transport.with_unauthorized_hook(hook);
        }

        let fetcher = RemoteFetcher::new(tokens.clone(), transport.clone());
        let fetches = FetchSyncCoordinator::new(options.telemetry.clone());
        let mutations = OptimisticMutationCoordinator::new(store.clone(), tokens, transport)
            .with_telemetry(options.telemetry.clone());
        let hub = RealtimeSubscriptionHub::with_telemetry(provider, options.telemetry);

        debug!(base_url = %config.base_url, "sync service started");
        Ok(Self {
            config,
            store,
            fetcher,
            fetches,
            mutations,
            hub,
            mirrors: Mutex::new(Vec::new()),
        })
    }

    /// Builds a service from configuration alone.
    ///
    /// The store comes from [`open_store`] and realtime listeners use a
    /// [`WebsocketProvider`] rooted at `realtime_url` (or `base_url`).
    pub fn open(
        config: SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        options: ServiceOptions,
    ) -> Result<Self, SyncError> {
        let store = open_store(&config).map_err(SyncError::LocalRead)?;
        let provider = Arc::new(WebsocketProvider::new(
            config.realtime_base_url(),
            tokens.clone(),
        ));
        Self::with_options(config, store, tokens, provider, options)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &RemoteFetcher {
        &self.fetcher
    }

    pub fn hub(&self) -> &RealtimeSubscriptionHub {
        &self.hub
    }

    /// Endpoint rooted at the configured base URL.
    pub fn endpoint(&self, method: Method, path: impl Into<String>) -> Endpoint {
        Endpoint::new(method, self.config.base_url.clone(), path)
    }

    /// Store-backed plan for a GET of `path`, cached under `type_key`.
    ///
    /// `lookup` selects the cached record shown before the remote answer:
    /// [`LocalLookup::ById`] for a single-record endpoint, or
    /// [`LocalLookup::Latest`] for "newest of the type" feeds.
    pub fn plan<T>(
        &self,
        type_key: &str,
        path: &str,
        lookup: LocalLookup,
        record_id: RecordIdFn<T>,
    ) -> StoreBackedPlan<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        StoreBackedPlan::new(
            self.store.clone(),
            self.fetcher.clone(),
            type_key,
            self.endpoint(Method::GET, path),
            record_id,
        )
        .with_lookup(lookup)
    }

    /// Runs the local-first fetch of `path` with the default freshness rule.
    pub fn fetch<T>(
        &self,
        type_key: &str,
        path: &str,
        lookup: LocalLookup,
        record_id: RecordIdFn<T>,
    ) -> FetchSequence<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.produce(self.plan(type_key, path, lookup, record_id))
    }

    /// Runs the local-first fetch described by `plan`.
    pub fn produce<T, P>(&self, plan: P) -> FetchSequence<T>
    where
        T: Send + 'static,
        P: FetchPlan<T>,
    {
        self.fetches.produce(plan)
    }

    /// Applies `mutation` optimistically; see [`OptimisticMutationCoordinator::submit`].
    pub async fn submit<M>(&self, mutation: &M) -> Result<bool, SyncError>
    where
        M: Mutation + ?Sized,
    {
        self.mutations.submit(mutation).await
    }

    /// Subscribes to JSON updates of `path`.
    pub fn subscribe<T>(&self, path: &str) -> Result<RealtimeSubscription<T>, RealtimeError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.hub.subscribe_json(path)
    }

    /// Writes every record pushed on `path` into the store under `type_key`.
    ///
    /// Pushed payloads are stored records in JSON form; unstamped ones are
    /// stamped on arrival. Undecodable updates and provider errors are
    /// logged and skipped. The mirror runs until [`Self::stop_mirror`],
    /// [`Self::shutdown`] or the end of the listener; mirroring a pair that
    /// is already live is a no-op.
    pub fn mirror(&self, path: &str, type_key: &str) -> Result<(), RealtimeError> {
        let mut mirrors = self.mirrors();
        prune_finished(&mut mirrors);
        if mirrors
            .iter()
            .any(|mirror| mirror.path == path && mirror.type_key == type_key)
        {
            debug!(path, type_key, "mirror already running");
            return Ok(());
        }

        let mut subscription = self.hub.subscribe_json::<StoredRecord>(path)?;
        let store = self.store.clone();
        let task_path = path.to_string();
        let task_type_key = type_key.to_string();

        let task = tokio::spawn(async move {
            while let Some(update) = subscription.next().await {
                let mut record = match update {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(path = %task_path, error = %err, "skipping realtime update");
                        continue;
                    }
                };
                if record.last_updated_at.is_none() {
                    record.last_updated_at = Some(OffsetDateTime::now_utc());
                }
                let id = record.id.clone();
                match store.save(&task_type_key, record).await {
                    Ok(()) => {
                        debug!(path = %task_path, type_key = %task_type_key, id = %id, "mirrored update")
                    }
                    Err(err) => warn!(
                        path = %task_path,
                        type_key = %task_type_key,
                        id = %id,
                        error = %err,
                        "failed to mirror update"
                    ),
                }
            }
            debug!(path = %task_path, "mirror ended");
        });

        mirrors.push(Mirror {
            path: path.to_string(),
            type_key: type_key.to_string(),
            task,
        });
        Ok(())
    }

    /// Stops every live mirror of `path`, returning how many were stopped.
    pub fn stop_mirror(&self, path: &str) -> usize {
        let mut mirrors = self.mirrors();
        prune_finished(&mut mirrors);
        let before = mirrors.len();
        mirrors.retain(|mirror| {
            if mirror.path == path {
                debug!(path, type_key = %mirror.type_key, "stopping mirror");
                mirror.task.abort();
                false
            } else {
                true
            }
        });
        before - mirrors.len()
    }

    /// Paths with a live listener and their consumer counts.
    pub fn active_paths(&self) -> Vec<(String, usize)> {
        self.hub.active_paths()
    }

    /// Live mirrors as `(path, type_key)` pairs, sorted.
    pub fn mirrored_paths(&self) -> Vec<(String, String)> {
        let mut mirrors = self.mirrors();
        prune_finished(&mut mirrors);
        let mut paths: Vec<_> = mirrors
            .iter()
            .map(|mirror| (mirror.path.clone(), mirror.type_key.clone()))
            .collect();
        paths.sort();
        paths
    }

    /// Tears down listeners, drains mirrors and flushes the store.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.hub.shutdown();
        let mirrors: Vec<_> = self.mirrors().drain(..).collect();
        for mirror in mirrors {
            if let Err(err) = mirror.task.await {
                if !err.is_cancelled() {
                    warn!(path = %mirror.path, error = %err, "mirror task failed");
                }
            }
        }
        self.store.flush().await?;
        info!("sync service shut down");
        Ok(())
    }

    fn mirrors(&self) -> MutexGuard<'_, Vec<Mirror>> {
        self.mirrors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forgets mirrors whose task already ended with its listener.
fn prune_finished(mirrors: &mut Vec<Mirror>) {
    mirrors.retain(|mirror| {
        let live = !mirror.task.is_finished();
        if !live {
            debug!(path = %mirror.path, type_key = %mirror.type_key, "pruning finished mirror");
        }
        live
    });
}
