//! Round-robin key selection with per-key rate limiting
//!
//! The pool owns an ordered, fixed set of keys. Each selection sweeps at most
//! every key once, starting at the rotation cursor, and returns the first key
//! whose token bucket admits the request. Keys with an empty bucket are skipped
//! inside the sweep rather than waited on.
//!
//! Locking: the cursor sits behind a `RwLock`. A sweep holds the write half so
//! cursor advancement is linearizable, which means sweeps run one at a time;
//! stats readers share the read half. Each
//! bucket has its own mutex and a sweep holds at most one of them at a time.
//! Usage counters are plain atomics.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::limiter::TokenBucket;

/// One upstream API key with its own bucket and usage counters.
#[derive(Debug)]
pub struct ApiKey {
    secret: Secret<String>,
    masked: String,
    limiter: TokenBucket,
    last_used_millis: AtomicI64,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl ApiKey {
    fn new(secret: Secret<String>, rate_limit: u32) -> Self {
        let masked = secret.masked();
        Self {
            secret,
            masked,
            limiter: TokenBucket::new(rate_limit),
            last_used_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// The raw key, for building the upstream Authorization header only.
    pub fn secret(&self) -> &str {
        self.secret.expose()
    }

    /// Masked rendering safe for logs and stats.
    pub fn masked(&self) -> &str {
        &self.masked
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn available_tokens(&self) -> u32 {
        self.limiter.available_tokens()
    }

    /// Time this key was last handed out (creation time if never selected).
    pub fn last_used(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_used_millis.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    pub fn limiter(&self) -> &TokenBucket {
        &self.limiter
    }

    fn record_selection(&self) {
        self.last_used_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time usage of one key, in pool order.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub key_prefix: String,
    pub request_count: u64,
    pub error_count: u64,
    pub available_tokens: u32,
    pub last_used: DateTime<Utc>,
}

/// Rate-limited pool of upstream API keys.
#[derive(Debug)]
pub struct Pool {
    keys: Vec<Arc<ApiKey>>,
    cursor: RwLock<usize>,
    rate_limit: u32,
}

impl Pool {
    /// Build a pool with one full bucket of `rate_limit` tokens per key.
    ///
    /// Key order is preserved and defines the rotation order.
    pub fn new(secrets: Vec<Secret<String>>, rate_limit: u32) -> Result<Self> {
        if secrets.is_empty() {
            return Err(Error::NoKeys);
        }
        if rate_limit == 0 {
            return Err(Error::InvalidRateLimit);
        }
        let keys: Vec<Arc<ApiKey>> = secrets
            .into_iter()
            .map(|secret| Arc::new(ApiKey::new(secret, rate_limit)))
            .collect();
        info!(keys = keys.len(), rate_limit, "key pool initialized");
        Ok(Self {
            keys,
            cursor: RwLock::new(0),
            rate_limit,
        })
    }

    /// Number of keys in the pool. Never zero.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Per-key requests per minute.
    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    /// Keys in rotation order.
    pub fn keys(&self) -> &[Arc<ApiKey>] {
        &self.keys
    }

    /// Select the next key with a free token, round-robin.
    ///
    /// On success the cursor moves one past the chosen key and the key's usage
    /// counters are updated. When no key admits the request the cursor is left
    /// where it was and `RateLimited` is returned.
    pub async fn select(&self) -> Result<Arc<ApiKey>> {
        let mut cursor = self.cursor.write().await;
        let n = self.keys.len();

        for offset in 0..n {
            let idx = (*cursor + offset) % n;
            let key = &self.keys[idx];
            if key.limiter.try_acquire() {
                *cursor = (idx + 1) % n;
                key.record_selection();
                metrics::counter!("key_pool_selections_total").increment(1);
                debug!(key = %key.masked(), index = idx, "API key selected");
                return Ok(Arc::clone(key));
            }
        }

        metrics::counter!("key_pool_exhausted_total").increment(1);
        warn!(keys = n, "all API keys are rate limited");
        Err(Error::RateLimited)
    }

    /// Call [`Pool::select`] up to `max_attempts` times.
    ///
    /// After failed attempt `i` (zero-based) the caller sleeps `i + 1` seconds,
    /// except after the last attempt. A budget of zero is treated as one.
    pub async fn select_with_retry(&self, max_attempts: u32) -> Result<Arc<ApiKey>> {
        let attempts = max_attempts.max(1);
        let mut last_err = Error::RateLimited;

        for attempt in 0..attempts {
            match self.select().await {
                Ok(key) => return Ok(key),
                Err(e) => last_err = e,
            }
            if attempt + 1 < attempts {
                let backoff = Duration::from_secs(u64::from(attempt) + 1);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    backoff_secs = backoff.as_secs(),
                    "no API key available, backing off"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(Error::Exhausted {
            attempts,
            source: Box::new(last_err),
        })
    }

    /// Count an upstream failure against `key`. Buckets and request counters
    /// are unaffected.
    pub fn mark_error(&self, key: &ApiKey) {
        let errors = key.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(key = %key.masked(), errors, "API key error recorded");
    }

    /// Shortest wait until any key accrues a token. Zero if one is free now.
    pub fn retry_after(&self) -> Duration {
        self.keys
            .iter()
            .map(|key| key.limiter.time_until_next_token())
            .min()
            .unwrap_or_default()
    }

    /// Usage snapshot of every key, in pool order.
    ///
    /// Selections running on other tasks may land between the per-key reads.
    pub async fn stats(&self) -> Vec<KeyStats> {
        let _cursor = self.cursor.read().await;
        self.keys
            .iter()
            .map(|key| KeyStats {
                key_prefix: key.masked.clone(),
                request_count: key.request_count(),
                error_count: key.error_count(),
                available_tokens: key.available_tokens(),
                last_used: key.last_used(),
            })
            .collect()
    }
}
