//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use local_first_sync::realtime::{Listener, ListenerGuard};
use local_first_sync::{
    CountingTelemetry, RealtimeError, RealtimeProvider, RetryPolicy, ServiceOptions, SyncConfig,
    SyncService, TokenFactory,
};
use local_first_sync::{LocalStore, MemoryStore};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const TOKEN: &str = "id-token-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    pub text: String,
}

impl Answer {
    pub fn new(id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            text: text.to_string(),
        }
    }
}

type Feed = mpsc::UnboundedSender<Result<Bytes, RealtimeError>>;

/// In-process realtime provider: tests push payloads per path.
#[derive(Default)]
pub struct ChannelProvider {
    feeds: Arc<Mutex<HashMap<String, Feed>>>,
    registered: AtomicUsize,
    removed: Arc<AtomicUsize>,
}

impl ChannelProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `payload` to the listener of `path`; false when none is registered.
    pub fn push(&self, path: &str, payload: &str) -> bool {
        self.send(path, Ok(Bytes::from(payload.to_string())))
    }

    pub fn fail(&self, path: &str, error: RealtimeError) -> bool {
        self.send(path, Err(error))
    }

    /// Ends the listener of `path` as if the backend closed it.
    pub fn close(&self, path: &str) {
        self.feeds.lock().unwrap().remove(path);
    }

    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    fn send(&self, path: &str, delivery: Result<Bytes, RealtimeError>) -> bool {
        match self.feeds.lock().unwrap().get(path) {
            Some(feed) => feed.send(delivery).is_ok(),
            None => false,
        }
    }
}

impl RealtimeProvider for ChannelProvider {
    fn add_listener(&self, path: &str) -> Result<Listener, RealtimeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(path.to_string(), tx);
        self.registered.fetch_add(1, Ordering::SeqCst);

        let feeds = self.feeds.clone();
        let removed = self.removed.clone();
        let key = path.to_string();
        let guard = ListenerGuard::new(move || {
            feeds.lock().unwrap().remove(&key);
            removed.fetch_add(1, Ordering::SeqCst);
        });
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Listener::new(Box::pin(stream), guard))
    }
}

/// Config pointing at `base_url` with a single fast attempt.
pub fn config(base_url: &str) -> SyncConfig {
    SyncConfig {
        base_url: base_url.to_string(),
        retry: RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(10),
        },
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub struct Harness {
    pub service: SyncService,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ChannelProvider>,
    pub telemetry: CountingTelemetry,
}

pub fn harness(base_url: &str) -> Harness {
    harness_with(base_url, TokenFactory::new_from_static_token(TOKEN), ServiceOptions::default())
}

pub fn harness_with(base_url: &str, tokens: TokenFactory, options: ServiceOptions) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let provider = ChannelProvider::new();
    let telemetry = CountingTelemetry::default();
    let options = ServiceOptions {
        telemetry: Arc::new(telemetry.clone()),
        ..options
    };
    let service = SyncService::with_options(
        config(base_url),
        store.clone() as Arc<dyn LocalStore>,
        Arc::new(tokens),
        provider.clone(),
        options,
    )
    .expect("service builds");
    Harness {
        service,
        store,
        provider,
        telemetry,
    }
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
