//! Best-effort Redis shadow store.
//!
//! Every component mirrors a slice of its state here for warm starts and
//! external observability. The store is never authoritative: all methods
//! swallow errors (logged at debug) and return a fallback so that KV
//! trouble can never block an admission decision.

use redis::aio::ConnectionManager;
use tracing::debug;

/// Cloneable handle over an auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    /// Connect to Redis. Failure here is reported to the caller once;
    /// afterwards individual operations degrade silently.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(v) => v,
            Err(e) => {
                debug!(key, error = %e, "kv get failed");
                None
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: usize) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            debug!(key, error = %e, "kv setex failed");
        }
    }

    pub async fn del(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            debug!(key, error = %e, "kv del failed");
        }
    }

    /// EXISTS with a `None` result when the store is unreachable, so callers
    /// can distinguish "absent" from "unknown".
    pub async fn exists(&self, key: &str) -> Option<bool> {
        let mut conn = self.conn.clone();
        match redis::cmd("EXISTS").arg(key).query_async::<_, i64>(&mut conn).await {
            Ok(n) => Some(n > 0),
            Err(e) => {
                debug!(key, error = %e, "kv exists failed");
                None
            }
        }
    }

    /// Add a member to a sorted set scored by timestamp and refresh the key
    /// TTL in the same pipeline.
    pub async fn zadd_with_ttl(&self, key: &str, member: &str, score: f64, ttl_secs: usize) -> bool {
        let mut conn = self.conn.clone();
        let res: Result<(), redis::RedisError> = redis::pipe()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await;
        match res {
            Ok(()) => true,
            Err(e) => {
                debug!(key, error = %e, "kv zadd failed");
                false
            }
        }
    }

    /// Drop members scored at or below `cutoff` and return the remaining
    /// cardinality. `None` when the store is unreachable.
    pub async fn prune_and_count(&self, key: &str, cutoff: f64) -> Option<u64> {
        let mut conn = self.conn.clone();
        let res: Result<(u64,), redis::RedisError> = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await;
        match res {
            Ok((card,)) => Some(card),
            Err(e) => {
                debug!(key, error = %e, "kv prune failed");
                None
            }
        }
    }

    /// Count members with scores in `(min, max]`-ish range (Redis ZCOUNT is
    /// inclusive on both ends; callers pass an open bound via `"(x"`).
    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> Option<u64> {
        let mut conn = self.conn.clone();
        match redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async::<_, u64>(&mut conn)
            .await
        {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(key, error = %e, "kv zcount failed");
                None
            }
        }
    }

    /// Score of the oldest member of a sorted set, if any.
    pub async fn zoldest_score(&self, key: &str) -> Option<f64> {
        let mut conn = self.conn.clone();
        match redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async::<_, Vec<(String, f64)>>(&mut conn)
            .await
        {
            Ok(entries) => entries.first().map(|(_, score)| *score),
            Err(e) => {
                debug!(key, error = %e, "kv zrange failed");
                None
            }
        }
    }

    pub async fn zremrangebyscore(&self, key: &str, cutoff: f64) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .query_async::<_, u64>(&mut conn)
            .await
        {
            debug!(key, error = %e, "kv zremrangebyscore failed");
        }
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let mut conn = self.conn.clone();
        match redis::cmd("KEYS")
            .arg(pattern)
            .query_async::<_, Vec<String>>(&mut conn)
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                debug!(pattern, error = %e, "kv keys failed");
                Vec::new()
            }
        }
    }

    /// `connected_clients` gauge from INFO, used by the process monitor.
    pub async fn connected_clients(&self) -> Option<u64> {
        let mut conn = self.conn.clone();
        let info: String = match redis::cmd("INFO")
            .arg("clients")
            .query_async(&mut conn)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "kv info failed");
                return None;
            }
        };
        info.lines()
            .find_map(|line| line.strip_prefix("connected_clients:"))
            .and_then(|v| v.trim().parse().ok())
    }
}
