//! TTL cache over the persistent store.
//!
//! Entries live under the `cache_` namespace as JSON `{data, timestamp, expiry}`
//! with millisecond timestamps. Entries written by older builds under
//! `api_cache_` (`{data, timestamp, expiresAt}`) are still readable and are
//! removed by `remove`/`clear`.
//!
//! Expiry is lazy: an expired entry is deleted the next time it is read, or
//! when a write needs room. Cache failures never reach callers; they are logged
//! and treated as a miss or a no-op.

mod entry;
mod key;
mod store;

pub use entry::CacheEntry;
pub use key::request_cache_key;
pub use store::{CacheStats, CacheStore, DEFAULT_MAX_SIZE, DEFAULT_TTL};
