//! Reference-counted fan-out of realtime listeners.
//!
//! The hub keeps one registry entry per path, guarded by a single lock. The
//! first subscriber of a path registers the underlying listener and spawns a
//! pump task that forwards every raw message to each consumer's queue; later
//! subscribers only attach a queue. Dropping the last
//! [`RealtimeSubscription`] of a path deregisters the listener and removes
//! the entry, so the next subscribe starts from scratch.
//!
//! Consumer queues are unbounded: a slow consumer holds on to its backlog
//! instead of losing deliveries, and every consumer sees every delivery in
//! arrival order.
//!
//! The registry lock is only held for lookup, insertion and removal, plus the
//! non-blocking queue sends done by the pump (which keeps the late-join cache
//! and the queues consistent). It is never held across an await.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::provider::{ListenerGuard, ListenerStream, RealtimeProvider};
use crate::error::{RealtimeError, SyncError};
use crate::telemetry::{NoopTelemetry, SyncTelemetry};

type Delivery = Result<Bytes, RealtimeError>;

/// Decoder applied by each consumer to raw deliveries.
pub type Decoder<T> = Arc<dyn Fn(&[u8]) -> Result<T, SyncError> + Send + Sync>;

/// Decoder parsing JSON payloads into `T`.
pub fn json_decoder<T: DeserializeOwned + 'static>() -> Decoder<T> {
    Arc::new(|bytes: &[u8]| serde_json::from_slice(bytes).map_err(SyncError::decode))
}

struct Entry {
    generation: u64,
    next_consumer: u64,
    consumers: HashMap<u64, mpsc::UnboundedSender<Delivery>>,
    /// Last successful raw payload, replayed to late joiners.
    latest: Option<Bytes>,
    pump: JoinHandle<()>,
    guard: ListenerGuard,
}

impl Entry {
    fn attach(&mut self, queue: mpsc::UnboundedSender<Delivery>) -> u64 {
        let consumer = self.next_consumer;
        self.next_consumer += 1;
        self.consumers.insert(consumer, queue);
        consumer
    }
}

struct HubInner {
    entries: Mutex<HashMap<String, Entry>>,
    provider: Arc<dyn RealtimeProvider>,
    telemetry: Arc<dyn SyncTelemetry>,
    next_generation: AtomicU64,
}

impl HubInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detaches one consumer; tears the listener down after the last one.
    fn release(&self, path: &str, generation: u64, consumer: u64) {
        let removed = {
            let mut entries = self.entries();
            match entries.get_mut(path) {
                Some(entry) if entry.generation == generation => {
                    entry.consumers.remove(&consumer);
                    if entry.consumers.is_empty() {
                        entries.remove(path)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(entry) = removed {
            self.teardown(path, entry);
        }
    }

    fn teardown(&self, path: &str, entry: Entry) {
        entry.pump.abort();
        entry.guard.cancel();
        debug!(path, "realtime listener removed");
        self.telemetry.on_listener_removed(path);
    }
}

/// Multiplexes realtime listeners across consumers.
#[derive(Clone)]
pub struct RealtimeSubscriptionHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for RealtimeSubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSubscriptionHub")
            .field("active_paths", &self.active_paths())
            .finish()
    }
}

impl RealtimeSubscriptionHub {
    pub fn new(provider: Arc<dyn RealtimeProvider>) -> Self {
        Self::with_telemetry(provider, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        provider: Arc<dyn RealtimeProvider>,
        telemetry: Arc<dyn SyncTelemetry>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                entries: Mutex::new(HashMap::new()),
                provider,
                telemetry,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to `path`, decoding every delivery with `decode`.
    ///
    /// Must be called from within a tokio runtime. Fails only when the
    /// provider refuses to register a new listener.
    pub fn subscribe<T, F>(
        &self,
        path: &str,
        decode: F,
    ) -> Result<RealtimeSubscription<T>, RealtimeError>
    where
        T: Send + 'static,
        F: Fn(&[u8]) -> Result<T, SyncError> + Send + Sync + 'static,
    {
        self.subscribe_with(path, Arc::new(decode))
    }

    /// Subscribes to `path`, decoding deliveries as JSON.
    pub fn subscribe_json<T>(&self, path: &str) -> Result<RealtimeSubscription<T>, RealtimeError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.subscribe_with(path, json_decoder())
    }

    pub fn subscribe_with<T>(
        &self,
        path: &str,
        decode: Decoder<T>,
    ) -> Result<RealtimeSubscription<T>, RealtimeError>
    where
        T: Send + 'static,
    {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (generation, consumer, cached) = {
            let mut entries = self.inner.entries();
            match entries.get_mut(path) {
                Some(entry) => {
                    let consumer = entry.attach(queue);
                    debug!(path, consumers = entry.consumers.len(), "joined realtime listener");
                    (entry.generation, consumer, entry.latest.clone())
                }
                None => {
                    let listener = self.inner.provider.add_listener(path)?;
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let pump = tokio::spawn(pump(
                        Arc::downgrade(&self.inner),
                        path.to_string(),
                        generation,
                        listener.stream,
                    ));
                    let mut entry = Entry {
                        generation,
                        next_consumer: 0,
                        consumers: HashMap::new(),
                        latest: None,
                        pump,
                        guard: listener.guard,
                    };
                    let consumer = entry.attach(queue);
                    entries.insert(path.to_string(), entry);
                    debug!(path, "registered realtime listener");
                    self.inner.telemetry.on_listener_registered(path);
                    (generation, consumer, None)
                }
            }
        };

        Ok(RealtimeSubscription {
            path: path.to_string(),
            generation,
            consumer,
            hub: Arc::downgrade(&self.inner),
            stream: consumer_stream(cached, receiver, decode),
        })
    }

    /// Paths with a live listener and their consumer counts, sorted by path.
    pub fn active_paths(&self) -> Vec<(String, usize)> {
        let mut paths: Vec<_> = self
            .inner
            .entries()
            .iter()
            .map(|(path, entry)| (path.clone(), entry.consumers.len()))
            .collect();
        paths.sort();
        paths
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.inner.entries().contains_key(path)
    }

    /// Tears down every listener; consumer streams end.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.entries().drain().collect();
        for (path, entry) in drained {
            self.inner.teardown(&path, entry);
        }
    }
}

/// Forwards raw messages of one listener to every consumer queue of the path.
async fn pump(hub: Weak<HubInner>, path: String, generation: u64, mut source: ListenerStream) {
    while let Some(delivery) = source.next().await {
        let Some(inner) = hub.upgrade() else {
            return;
        };
        let mut entries = inner.entries();
        let Some(entry) = entries
            .get_mut(&path)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };
        match &delivery {
            Ok(bytes) => entry.latest = Some(bytes.clone()),
            Err(err) => warn!(path = %path, error = %err, "realtime provider error"),
        }
        for queue in entry.consumers.values() {
            // A closed queue belongs to a consumer that is releasing itself.
            let _ = queue.send(delivery.clone());
        }
    }

    debug!(path = %path, "realtime listener ended");
    let Some(inner) = hub.upgrade() else {
        return;
    };
    let removed = {
        let mut entries = inner.entries();
        match entries.get(&path) {
            Some(entry) if entry.generation == generation => entries.remove(&path),
            _ => None,
        }
    };
    if let Some(entry) = removed {
        // Dropping the queues ends every consumer stream.
        entry.guard.cancel();
        inner.telemetry.on_listener_removed(&path);
    }
}

type ConsumerStream<T> = Pin<Box<dyn Stream<Item = Result<T, SyncError>> + Send>>;

fn consumer_stream<T: Send + 'static>(
    cached: Option<Bytes>,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    decode: Decoder<T>,
) -> ConsumerStream<T> {
    Box::pin(stream::unfold(
        (cached, receiver, decode),
        |(mut cached, mut receiver, decode)| async move {
            if let Some(bytes) = cached.take() {
                let item = decode(&bytes);
                return Some((item, (cached, receiver, decode)));
            }
            let item = match receiver.recv().await? {
                Ok(bytes) => decode(&bytes),
                Err(err) => Err(SyncError::Realtime(err)),
            };
            Some((item, (cached, receiver, decode)))
        },
    ))
}

/// One consumer's view of a path.
///
/// Yields decoded values and errors in arrival order; a decode or provider
/// error does not end the stream. Dropping the subscription detaches the
/// consumer.
pub struct RealtimeSubscription<T> {
    path: String,
    generation: u64,
    consumer: u64,
    hub: Weak<HubInner>,
    stream: ConsumerStream<T>,
}

impl<T> RealtimeSubscription<T> {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<T> std::fmt::Debug for RealtimeSubscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSubscription")
            .field("path", &self.path)
            .field("generation", &self.generation)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl<T> Stream for RealtimeSubscription<T> {
    type Item = Result<T, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl<T> Drop for RealtimeSubscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.release(&self.path, self.generation, self.consumer);
        }
    }
}
