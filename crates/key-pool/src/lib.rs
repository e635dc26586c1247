//! Rate-limited pool of upstream API keys
//!
//! Holds a fixed, ordered set of keys, each with its own token bucket sized to
//! the configured requests-per-minute. Requests draw keys round-robin; a key
//! whose bucket is empty is skipped for that sweep.
//!
//! Request lifecycle:
//! 1. Caller asks for a key via `select` (single sweep) or `select_with_retry`
//!    (sweeps with linear backoff in between)
//! 2. The chosen key loses one token and its request counter goes up
//! 3. Upstream failures are reported back with `mark_error`
//! 4. Buckets refill lazily as time passes; `stats` reports per-key usage

pub mod error;
pub mod limiter;
pub mod pool;

pub use error::{Error, Result};
pub use limiter::TokenBucket;
pub use pool::{ApiKey, KeyStats, Pool};
