//! Redis-backed counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, trace};

use super::{CounterStore, Lifetime};
use crate::error::Result;

/// A [`CounterStore`] speaking to a Redis-compatible server.
///
/// The primitives map one-to-one onto `SET NX PX`, `INCR`, `PTTL` and
/// `PEXPIRE`, each of which is atomic on the server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Open a managed connection to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counter store");
        Ok(Self::new(conn))
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by the server
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn create_if_absent(&self, key: &str, initial: i64, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(initial)
            .arg("PX")
            .arg(millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        trace!(key = %key, created = reply.is_some(), "SET NX PX");
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn remaining_lifetime(&self, key: &str) -> Result<Lifetime> {
        let mut conn = self.conn.clone();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        let lifetime = match pttl {
            -2 => Lifetime::Absent,
            -1 => Lifetime::NoExpiry,
            ms => Lifetime::Expires(Duration::from_millis(ms.max(0) as u64)),
        };
        Ok(lifetime)
    }

    async fn set_lifetime(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let status: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(status == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_test_store() -> Option<RedisStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        RedisStore::connect(&url).await.ok()
    }

    fn unique_key(label: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("tollgate_test:{}:{}", label, nanos)
    }

    #[tokio::test]
    async fn test_redis_primitives() {
        let store = match get_test_store().await {
            Some(s) => s,
            None => return,
        };
        let key = unique_key("primitives");
        let period = Duration::from_millis(1000);

        assert!(store.create_if_absent(&key, 1, period).await.unwrap());
        assert!(!store.create_if_absent(&key, 1, period).await.unwrap());
        assert_eq!(store.increment(&key).await.unwrap(), 2);

        match store.remaining_lifetime(&key).await.unwrap() {
            Lifetime::Expires(left) => assert!(left <= period),
            other => panic!("unexpected lifetime {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redis_stray_key_lifetime() {
        let store = match get_test_store().await {
            Some(s) => s,
            None => return,
        };
        let key = unique_key("stray");

        assert_eq!(store.increment(&key).await.unwrap(), 1);
        assert_eq!(
            store.remaining_lifetime(&key).await.unwrap(),
            Lifetime::NoExpiry
        );
        assert!(store
            .set_lifetime(&key, Duration::from_millis(500))
            .await
            .unwrap());
        assert_eq!(
            store.remaining_lifetime(&unique_key("missing")).await.unwrap(),
            Lifetime::Absent
        );
    }
}
