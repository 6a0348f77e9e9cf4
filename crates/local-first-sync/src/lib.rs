//! Local-first synchronization layer for offline-capable clients.
//!
//! The crate combines three coordinators around a local record store:
//! a fetch pipeline emitting cached data before fresh remote data, an
//! optimistic mutation coordinator with rollback, and a hub multiplexing
//! realtime listeners across consumers. [`SyncService`] owns one instance of
//! each and is the usual entry point.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod error;
pub mod fetch;
pub mod freshness;
pub mod http;
pub mod mutation;
pub mod realtime;
pub mod record;
pub mod remote;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod token;

pub use config::{SyncConfig, SyncEnv};
pub use error::{NetworkError, RealtimeError, StoreError, SyncError, TokenError};
pub use fetch::{
    FetchPlan, FetchReport, FetchSequence, FetchSyncCoordinator, LocalLeg, LocalLookup, RemoteLeg,
    Snapshot, StoreBackedPlan,
};
pub use freshness::{AlwaysFresh, FreshnessPredicate, NeverFresh, UpdatedToday, UpdatedWithin};
pub use http::{Endpoint, HttpTransport, RetryPolicy};
pub use mutation::{EndpointMutation, Mutation, MutationBackup, OptimisticMutationCoordinator};
pub use realtime::{
    RealtimeProvider, RealtimeSubscription, RealtimeSubscriptionHub, WebsocketProvider,
};
pub use record::{FieldPatch, Record, StoredRecord};
pub use remote::RemoteFetcher;
pub use service::{open_store, ServiceOptions, SyncService};
pub use store::{LocalStore, MemoryStore, SledStore};
pub use telemetry::{
    CompositeTelemetry, CountingTelemetry, NoopTelemetry, SyncTelemetry, TelemetryCounters,
    TelemetrySnapshot,
};
pub use token::{TokenFactory, TokenProvider};
