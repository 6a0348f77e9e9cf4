//! Local-first fetch pipeline.
//!
//! [`FetchSyncCoordinator::produce`] runs "emit the cached record if it is
//! fresh, fetch the remote value, persist it, emit it" on a spawned task and
//! hands back a [`FetchSequence`]. The sequence yields at most two
//! snapshots, always local before remote. No failure crosses the boundary as
//! an error: a failing leg truncates the sequence, and the reason is recorded
//! in the [`FetchReport`] available once the sequence is exhausted.
//!
//! Dropping a sequence stops observing the fetch without cancelling it, so a
//! remote value that arrives late is still written through to the store.
//! [`FetchSequence::abort`] cancels explicitly.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::freshness::{FreshnessPredicate, UpdatedToday};
use crate::http::Endpoint;
use crate::record::{Record, StoredRecord};
use crate::remote::RemoteFetcher;
use crate::store::LocalStore;
use crate::telemetry::{NoopTelemetry, SyncTelemetry};

/// One value produced by a fetch sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot<T> {
    /// Cached record that passed the freshness predicate.
    Local(Record<T>),
    /// Value returned by the backend, already persisted locally.
    Remote(T),
}

impl<T> Snapshot<T> {
    /// Returns the payload regardless of origin.
    pub fn payload(&self) -> &T {
        match self {
            Snapshot::Local(record) => &record.payload,
            Snapshot::Remote(value) => value,
        }
    }

    pub fn into_payload(self) -> T {
        match self {
            Snapshot::Local(record) => record.payload,
            Snapshot::Remote(value) => value,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Snapshot::Remote(_))
    }
}

/// Outcome of the local leg.
#[derive(Debug)]
pub enum LocalLeg {
    /// A fresh cached record was emitted.
    Emitted,
    /// A cached record existed but was not fresh.
    Stale,
    /// Nothing was cached (or the fetch was aborted before the read finished).
    Missing,
    /// Reading or decoding the cached record failed.
    Failed(SyncError),
}

/// Outcome of the remote leg.
#[derive(Debug)]
pub enum RemoteLeg {
    /// The remote value was persisted and emitted.
    Emitted,
    /// Token resolution, the network call or decoding failed.
    Failed(SyncError),
    /// The remote value was fetched but could not be written locally.
    PersistFailed(SyncError),
    /// The fetch was cancelled before it finished.
    Abandoned,
}

/// Explicit record of how a fetch sequence ended.
#[derive(Debug)]
pub struct FetchReport {
    pub local: LocalLeg,
    pub remote: RemoteLeg,
}

impl FetchReport {
    /// True when the remote value reached the caller.
    pub fn is_complete(&self) -> bool {
        matches!(self.remote, RemoteLeg::Emitted)
    }

    /// Number of snapshots the sequence produced.
    pub fn emitted(&self) -> usize {
        usize::from(matches!(self.local, LocalLeg::Emitted))
            + usize::from(matches!(self.remote, RemoteLeg::Emitted))
    }

    /// The error that cut the remote leg short, if any.
    pub fn remote_error(&self) -> Option<&SyncError> {
        match &self.remote {
            RemoteLeg::Failed(err) | RemoteLeg::PersistFailed(err) => Some(err),
            RemoteLeg::Emitted | RemoteLeg::Abandoned => None,
        }
    }
}

/// Collaborators of a single fetch.
#[async_trait]
pub trait FetchPlan<T>: Send + Sync + 'static {
    /// Reads the cached record, if any.
    async fn read_local(&self) -> Result<Option<Record<T>>, SyncError>;

    /// Decides whether a cached record may be shown before the network answers.
    fn is_fresh(&self, record: &Record<T>) -> bool;

    /// Resolves a token and fetches the authoritative value.
    async fn fetch_remote(&self) -> Result<T, SyncError>;

    /// Persists the remote value before it is emitted.
    async fn write_local(&self, remote: &T) -> Result<(), SyncError>;

    /// Side effect for a failed remote leg.
    fn on_error(&self, error: &SyncError) {
        warn!(error = %error, "remote leg of fetch failed");
    }
}

/// Runs fetch plans.
#[derive(Clone)]
pub struct FetchSyncCoordinator {
    telemetry: Arc<dyn SyncTelemetry>,
}

impl Default for FetchSyncCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(NoopTelemetry))
    }
}

impl std::fmt::Debug for FetchSyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSyncCoordinator").finish_non_exhaustive()
    }
}

impl FetchSyncCoordinator {
    pub fn new(telemetry: Arc<dyn SyncTelemetry>) -> Self {
        Self { telemetry }
    }

    /// Starts a fetch and returns the sequence observing it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn produce<T, P>(&self, plan: P) -> FetchSequence<T>
    where
        T: Send + 'static,
        P: FetchPlan<T>,
    {
        // Two slots: a sequence never carries more than two values, so the
        // producer never waits on a slow (or vanished) consumer.
        let (tx, rx) = mpsc::channel(2);
        let (report_tx, report_rx) = oneshot::channel();
        let local_slot: LocalSlot = Arc::new(Mutex::new(None));
        let telemetry = self.telemetry.clone();
        let slot = local_slot.clone();

        let task = tokio::spawn(async move {
            run_local_leg(&plan, &tx, &slot).await;
            let remote = run_remote_leg(&plan, &tx).await;
            let local = take_local(&slot);
            let report = FetchReport { local, remote };
            debug!(
                emitted = report.emitted(),
                complete = report.is_complete(),
                "fetch sequence finished"
            );
            telemetry.on_fetch_complete(&report);
            let _ = report_tx.send(report);
        });

        FetchSequence {
            rx,
            report_rx,
            local_slot,
            task,
        }
    }
}

/// Outcome of the local leg, readable after the task is aborted.
type LocalSlot = Arc<Mutex<Option<LocalLeg>>>;

fn set_local(slot: &LocalSlot, leg: LocalLeg) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(leg);
}

fn take_local(slot: &LocalSlot) -> LocalLeg {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or(LocalLeg::Missing)
}

/// Runs the local leg, recording its outcome before any snapshot is sent.
async fn run_local_leg<T, P>(plan: &P, tx: &mpsc::Sender<Snapshot<T>>, slot: &LocalSlot)
where
    P: FetchPlan<T>,
{
    match plan.read_local().await {
        Ok(Some(record)) if plan.is_fresh(&record) => {
            set_local(slot, LocalLeg::Emitted);
            if tx.send(Snapshot::Local(record)).await.is_err() {
                debug!("fetch consumer went away before the local snapshot");
            }
        }
        Ok(Some(_)) => set_local(slot, LocalLeg::Stale),
        Ok(None) => set_local(slot, LocalLeg::Missing),
        Err(err) => {
            warn!(error = %err, "local read failed; continuing with remote fetch");
            set_local(slot, LocalLeg::Failed(err));
        }
    }
}

async fn run_remote_leg<T, P>(plan: &P, tx: &mpsc::Sender<Snapshot<T>>) -> RemoteLeg
where
    P: FetchPlan<T>,
{
    let value = match plan.fetch_remote().await {
        Ok(value) => value,
        Err(err) => {
            plan.on_error(&err);
            return RemoteLeg::Failed(err);
        }
    };
    if let Err(err) = plan.write_local(&value).await {
        plan.on_error(&err);
        return RemoteLeg::PersistFailed(err);
    }
    if tx.send(Snapshot::Remote(value)).await.is_err() {
        debug!("fetch consumer went away; remote value persisted only");
    }
    RemoteLeg::Emitted
}

/// Finite, non-restartable sequence of snapshots produced by one fetch.
pub struct FetchSequence<T> {
    rx: mpsc::Receiver<Snapshot<T>>,
    report_rx: oneshot::Receiver<FetchReport>,
    local_slot: LocalSlot,
    task: JoinHandle<()>,
}

impl<T> std::fmt::Debug for FetchSequence<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchSequence")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl<T> FetchSequence<T> {
    /// Waits for the next snapshot; `None` once the sequence ended.
    pub async fn next(&mut self) -> Option<Snapshot<T>> {
        self.rx.recv().await
    }

    /// Waits for the fetch to finish and returns its report.
    ///
    /// Snapshots not yet consumed are discarded.
    pub async fn report(self) -> FetchReport {
        let Self {
            rx,
            report_rx,
            local_slot,
            task: _,
        } = self;
        drop(rx);
        match report_rx.await {
            Ok(report) => report,
            Err(_) => abandoned(&local_slot),
        }
    }

    /// Drains every snapshot, then returns them with the report.
    pub async fn collect(mut self) -> (Vec<Snapshot<T>>, FetchReport) {
        let mut snapshots = Vec::with_capacity(2);
        while let Some(snapshot) = self.rx.recv().await {
            snapshots.push(snapshot);
        }
        (snapshots, self.report().await)
    }

    /// Cancels the in-flight fetch.
    ///
    /// A write-through that has not happened yet will not happen.
    pub async fn abort(self) -> FetchReport {
        self.task.abort();
        let Self {
            rx,
            mut report_rx,
            local_slot,
            task,
        } = self;
        drop(rx);
        let _ = task.await;
        match report_rx.try_recv() {
            Ok(report) => report,
            Err(_) => abandoned(&local_slot),
        }
    }
}

fn abandoned(local_slot: &LocalSlot) -> FetchReport {
    FetchReport {
        local: take_local(local_slot),
        remote: RemoteLeg::Abandoned,
    }
}

impl<T> Stream for FetchSequence<T> {
    type Item = Snapshot<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Which cached record a [`StoreBackedPlan`] reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalLookup {
    /// Most recently updated record of the type.
    Latest,
    /// A specific record.
    ById(String),
}

/// Derives the record id of a freshly fetched value.
pub type RecordIdFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Fetch plan wiring a [`LocalStore`] and a [`RemoteFetcher`] together.
pub struct StoreBackedPlan<T> {
    store: Arc<dyn LocalStore>,
    fetcher: RemoteFetcher,
    type_key: String,
    endpoint: Endpoint,
    lookup: LocalLookup,
    freshness: Arc<dyn FreshnessPredicate<T>>,
    record_id: RecordIdFn<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StoreBackedPlan<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Builds a plan reading the latest record of `type_key` and treating
    /// records updated today (UTC) as fresh.
    pub fn new(
        store: Arc<dyn LocalStore>,
        fetcher: RemoteFetcher,
        type_key: impl Into<String>,
        endpoint: Endpoint,
        record_id: RecordIdFn<T>,
    ) -> Self {
        Self {
            store,
            fetcher,
            type_key: type_key.into(),
            endpoint,
            lookup: LocalLookup::Latest,
            freshness: Arc::new(UpdatedToday::default()),
            record_id,
            _marker: PhantomData,
        }
    }

    pub fn with_freshness(mut self, freshness: Arc<dyn FreshnessPredicate<T>>) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_lookup(mut self, lookup: LocalLookup) -> Self {
        self.lookup = lookup;
        self
    }
}

#[async_trait]
impl<T> FetchPlan<T> for StoreBackedPlan<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn read_local(&self) -> Result<Option<Record<T>>, SyncError> {
        let stored = match &self.lookup {
            LocalLookup::Latest => self.store.fetch_latest(&self.type_key).await,
            LocalLookup::ById(id) => self.store.fetch_by_id(&self.type_key, id).await,
        }
        .map_err(SyncError::LocalRead)?;
        stored.map(|record| record.decode()).transpose()
    }

    fn is_fresh(&self, record: &Record<T>) -> bool {
        self.freshness.is_fresh(record)
    }

    async fn fetch_remote(&self) -> Result<T, SyncError> {
        self.fetcher.fetch(&self.endpoint).await
    }

    async fn write_local(&self, remote: &T) -> Result<(), SyncError> {
        let stored: StoredRecord = Record::with_timestamp(
            (self.record_id)(remote),
            serde_json::to_value(remote)?,
            Some(OffsetDateTime::now_utc()),
        );
        self.store
            .save(&self.type_key, stored)
            .await
            .map_err(SyncError::LocalWrite)
    }

    fn on_error(&self, error: &SyncError) {
        warn!(
            type_key = %self.type_key,
            path = %self.endpoint.path,
            error = %error,
            "remote leg of fetch failed"
        );
    }
}
