//! Counter store protocol.
//!
//! A limiter never keeps window state in process memory. Every trial goes
//! through the four primitives of [`CounterStore`], so any number of
//! processes sharing one store and one key namespace see the same windows.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// The key expires after this duration.
    Expires(Duration),
    /// The key exists but carries no expiry.
    NoExpiry,
    /// The key does not exist.
    Absent,
}

/// Primitive operations a backing key-value store must provide.
///
/// Each operation must be atomic with respect to the single key it touches.
/// No multi-key transactions or server-side scripting are assumed.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Set `key` to `initial` with the given lifetime, only if it does not exist.
    ///
    /// Returns `true` if the value was written.
    async fn create_if_absent(&self, key: &str, initial: i64, ttl: Duration) -> Result<bool>;

    /// Increment the integer stored at `key` and return the new value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Read how long `key` has left to live.
    async fn remaining_lifetime(&self, key: &str) -> Result<Lifetime>;

    /// Set a lifetime on an existing key.
    ///
    /// Returns `false` if the key no longer exists.
    async fn set_lifetime(&self, key: &str, ttl: Duration) -> Result<bool>;
}
