//! Telemetry hooks for the synchronization layer.
//!
//! Every coordinator reports through [`SyncTelemetry`]. The trait methods are
//! no-ops by default so embedders only override what they export. The
//! counting implementation is enough for tests and for surfacing metrics
//! through whatever backend the application already uses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SyncError;
use crate::fetch::FetchReport;

/// Observer invoked by the coordinators, the transport and the realtime hub.
pub trait SyncTelemetry: Send + Sync {
    /// Called once per fetch sequence, after its last value was produced.
    fn on_fetch_complete(&self, _report: &FetchReport) {}
    /// Called when an optimistic mutation was confirmed by the backend.
    fn on_mutation_applied(&self, _type_key: &str, _id: &str) {}
    /// Called after a failed mutation was rolled back.
    fn on_mutation_rolled_back(&self, _type_key: &str, _id: &str, _error: &SyncError) {}
    /// Called when the hub registers an underlying listener for a path.
    fn on_listener_registered(&self, _path: &str) {}
    /// Called when the hub deregisters the listener of a path.
    fn on_listener_removed(&self, _path: &str) {}
    /// Called before the transport sleeps ahead of another attempt.
    fn on_retry(&self, _attempt: u32) {}
    /// Called when the backend answered 401.
    fn on_authentication_failed(&self) {}
}

/// Telemetry implementation that ignores every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl SyncTelemetry for NoopTelemetry {}

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    fetch_complete: AtomicU64,
    fetch_truncated: AtomicU64,
    mutations_applied: AtomicU64,
    mutations_rolled_back: AtomicU64,
    listeners_registered: AtomicU64,
    listeners_removed: AtomicU64,
    retries: AtomicU64,
    authentication_failed: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fetch_complete: self.fetch_complete.load(Ordering::Relaxed),
            fetch_truncated: self.fetch_truncated.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            mutations_rolled_back: self.mutations_rolled_back.load(Ordering::Relaxed),
            listeners_registered: self.listeners_registered.load(Ordering::Relaxed),
            listeners_removed: self.listeners_removed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            authentication_failed: self.authentication_failed.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Fetch sequences that ended with a remote value.
    pub fetch_complete: u64,
    /// Fetch sequences whose remote leg did not emit.
    pub fetch_truncated: u64,
    pub mutations_applied: u64,
    pub mutations_rolled_back: u64,
    pub listeners_registered: u64,
    pub listeners_removed: u64,
    /// Transport retries after connectivity failures.
    pub retries: u64,
    /// 401 answers observed by the transport.
    pub authentication_failed: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetch_complete={}, fetch_truncated={}, mutations_applied={}, mutations_rolled_back={}, listeners_registered={}, listeners_removed={}, retries={}, authentication_failed={}",
            self.fetch_complete,
            self.fetch_truncated,
            self.mutations_applied,
            self.mutations_rolled_back,
            self.listeners_registered,
            self.listeners_removed,
            self.retries,
            self.authentication_failed
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every signal.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    /// Creates a new telemetry instance backed by the provided counter set.
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl SyncTelemetry for CountingTelemetry {
    fn on_fetch_complete(&self, report: &FetchReport) {
        if report.is_complete() {
            self.counters.fetch_complete.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.fetch_truncated.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_mutation_applied(&self, _type_key: &str, _id: &str) {
        self.counters
            .mutations_applied
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_mutation_rolled_back(&self, _type_key: &str, _id: &str, _error: &SyncError) {
        self.counters
            .mutations_rolled_back
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_listener_registered(&self, _path: &str) {
        self.counters
            .listeners_registered
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_listener_removed(&self, _path: &str) {
        self.counters
            .listeners_removed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_retry(&self, _attempt: u32) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn on_authentication_failed(&self) {
        self.counters
            .authentication_failed
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Telemetry implementation that forwards events to multiple observers.
#[derive(Default)]
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn SyncTelemetry>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a telemetry observer to the dispatcher.
    pub fn with_observer(mut self, telemetry: Arc<dyn SyncTelemetry>) -> Self {
        self.observers.push(telemetry);
        self
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl SyncTelemetry for CompositeTelemetry {
    fn on_fetch_complete(&self, report: &FetchReport) {
        for observer in &self.observers {
            observer.on_fetch_complete(report);
        }
    }

    fn on_mutation_applied(&self, type_key: &str, id: &str) {
        for observer in &self.observers {
            observer.on_mutation_applied(type_key, id);
        }
    }

    fn on_mutation_rolled_back(&self, type_key: &str, id: &str, error: &SyncError) {
        for observer in &self.observers {
            observer.on_mutation_rolled_back(type_key, id, error);
        }
    }

    fn on_listener_registered(&self, path: &str) {
        for observer in &self.observers {
            observer.on_listener_registered(path);
        }
    }

    fn on_listener_removed(&self, path: &str) {
        for observer in &self.observers {
            observer.on_listener_removed(path);
        }
    }

    fn on_retry(&self, attempt: u32) {
        for observer in &self.observers {
            observer.on_retry(attempt);
        }
    }

    fn on_authentication_failed(&self) {
        for observer in &self.observers {
            observer.on_authentication_failed();
        }
    }
}
