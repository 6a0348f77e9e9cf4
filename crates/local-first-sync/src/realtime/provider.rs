use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::RealtimeError;

/// Raw push messages (or provider errors) of one listener.
pub type ListenerStream = Pin<Box<dyn Stream<Item = Result<Bytes, RealtimeError>> + Send>>;

/// Push channel keyed by resource path.
pub trait RealtimeProvider: Send + Sync {
    /// Registers one listener for `path`.
    ///
    /// Registration must not block: providers spawn whatever connection work
    /// they need and report failures through the returned stream.
    fn add_listener(&self, path: &str) -> Result<Listener, RealtimeError>;
}

/// A registered listener: its message stream plus the handle deregistering it.
pub struct Listener {
    pub stream: ListenerStream,
    pub guard: ListenerGuard,
}

impl Listener {
    pub fn new(stream: ListenerStream, guard: ListenerGuard) -> Self {
        Self { stream, guard }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

/// Deregisters the underlying listener when dropped (or cancelled).
pub struct ListenerGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Guard with nothing to deregister.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}
