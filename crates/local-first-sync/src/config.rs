//! Environment-driven configuration.
//!
//! [`SyncEnv`] captures the raw `SYNC_*` variables; [`SyncConfig`] is the
//! runtime view consumed by [`crate::service::SyncService`]. Out-of-range
//! values are clamped by [`SyncConfig::sanitise`] with a warning instead of
//! failing startup.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::http::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_BACKOFF};

/// Backend base URL.
const ENV_BASE_URL: &str = "SYNC_BASE_URL";
/// Total attempts for connectivity failures.
const ENV_MAX_ATTEMPTS: &str = "SYNC_MAX_ATTEMPTS";
/// Fixed delay between attempts, in milliseconds.
const ENV_RETRY_BACKOFF_MS: &str = "SYNC_RETRY_BACKOFF_MS";
/// Per-request timeout, in milliseconds.
const ENV_REQUEST_TIMEOUT_MS: &str = "SYNC_REQUEST_TIMEOUT_MS";
/// Directory of the persistent store; unset means in-memory.
const ENV_STORE_PATH: &str = "SYNC_STORE_PATH";
/// Websocket base URL for realtime listeners.
const ENV_REALTIME_URL: &str = "SYNC_REALTIME_URL";

pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 10;
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Raw settings read from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncEnv {
    pub base_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub store_path: Option<PathBuf>,
    pub realtime_url: Option<String>,
}

impl SyncEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self {
            base_url: non_empty(&map, ENV_BASE_URL),
            max_attempts: parse_number(&map, ENV_MAX_ATTEMPTS),
            retry_backoff_ms: parse_number(&map, ENV_RETRY_BACKOFF_MS),
            request_timeout_ms: parse_number(&map, ENV_REQUEST_TIMEOUT_MS),
            store_path: non_empty(&map, ENV_STORE_PATH).map(PathBuf::from),
            realtime_url: non_empty(&map, ENV_REALTIME_URL),
        }
    }

    /// Applies the captured values over the defaults and sanitises the result.
    pub fn into_config(self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            base_url: self.base_url.unwrap_or(defaults.base_url),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.unwrap_or(defaults.retry.max_attempts),
                backoff: self
                    .retry_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.backoff),
            },
            request_timeout: self
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            store_path: self.store_path,
            realtime_url: self.realtime_url,
        }
        .sanitise()
    }
}

fn non_empty(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_number<N: std::str::FromStr>(map: &HashMap<String, String>, key: &str) -> Option<N> {
    let raw = non_empty(map, key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {key}={raw}: not a valid number");
            None
        }
    }
}

/// Runtime settings of the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL every endpoint is resolved against.
    pub base_url: String,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Persistent store location; `None` keeps records in memory.
    pub store_path: Option<PathBuf>,
    /// Websocket base URL; `None` falls back to `base_url` (see
    /// [`SyncConfig::realtime_base_url`]).
    pub realtime_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            retry: RetryPolicy {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                backoff: DEFAULT_RETRY_BACKOFF,
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            store_path: None,
            realtime_url: None,
        }
    }
}

impl SyncConfig {
    /// Base URL of realtime listeners, `realtime_url` or else `base_url`.
    pub fn realtime_base_url(&self) -> &str {
        self.realtime_url.as_deref().unwrap_or(&self.base_url)
    }

    /// Clamps values that would make the layer misbehave.
    pub fn sanitise(mut self) -> Self {
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&self.retry.max_attempts) {
            let clamped = self.retry.max_attempts.clamp(MIN_ATTEMPTS, MAX_ATTEMPTS);
            warn!(
                "max attempts {} outside range {}-{}; using {}",
                self.retry.max_attempts, MIN_ATTEMPTS, MAX_ATTEMPTS, clamped
            );
            self.retry.max_attempts = clamped;
        }

        if self.retry.backoff > MAX_RETRY_BACKOFF {
            warn!(
                "retry backoff {:?} exceeds {:?}; clamping",
                self.retry.backoff, MAX_RETRY_BACKOFF
            );
            self.retry.backoff = MAX_RETRY_BACKOFF;
        }

        if self.request_timeout.is_zero() {
            warn!(
                "request timeout must be positive; using {:?}",
                DEFAULT_REQUEST_TIMEOUT
            );
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }

        self
    }
}
